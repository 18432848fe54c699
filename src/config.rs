use std::env;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub db_type: String,
    pub name: String,
}

impl DatabaseConfig {
    fn from_env() -> Result<Self> {
        let db_type = env::var("DB_TYPE").unwrap_or_else(|_| "sqlite".to_string());
        if db_type != "sqlite" {
            return Err(Error::invalid(format!(
                "unsupported DB_TYPE '{db_type}' (only 'sqlite' is available)"
            )));
        }
        Ok(Self {
            db_type,
            name: env::var("DB_NAME").unwrap_or_else(|_| "gatewatch".to_string()),
        })
    }

    /// Path of the SQLite file; `DB_NAME` may or may not carry the extension.
    pub fn sqlite_path(&self) -> String {
        if self.name.ends_with(".db") {
            self.name.clone()
        } else {
            format!("{}.db", self.name)
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub ports: Vec<u16>,
    pub interface: Option<String>,
    pub bpf_filter: Option<String>,
    pub snapshot_length: i32,
}

impl CaptureConfig {
    fn from_env() -> Result<Self> {
        let ports = match env::var("CAPTURE_PORTS") {
            Ok(s) if !s.trim().is_empty() => s
                .split(',')
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .map(|p| {
                    p.parse::<u16>()
                        .map_err(|_| Error::invalid(format!("bad port in CAPTURE_PORTS: '{p}'")))
                })
                .collect::<Result<Vec<_>>>()?,
            _ => Vec::new(),
        };
        let snapshot_length = match env::var("CAPTURE_SNAPSHOT_LENGTH") {
            Ok(s) => s
                .parse::<i32>()
                .map_err(|_| Error::invalid("CAPTURE_SNAPSHOT_LENGTH must be an integer"))?,
            Err(_) => 65535,
        };
        Ok(Self {
            ports,
            interface: env::var("CAPTURE_INTERFACE").ok().filter(|s| !s.is_empty()),
            bpf_filter: env::var("CAPTURE_BPF_FILTER").ok().filter(|s| !s.is_empty()),
            snapshot_length,
        })
    }

    /// BPF filter string. An explicit expression wins; otherwise configured
    /// ports are OR'd together with `port 53` always included; with neither,
    /// no filter is applied.
    pub fn build_bpf_filter(&self) -> Option<String> {
        if let Some(expr) = &self.bpf_filter {
            return Some(expr.clone());
        }
        if self.ports.is_empty() {
            return None;
        }
        let mut parts: Vec<String> = vec!["port 53".to_string()];
        parts.extend(self.ports.iter().map(|p| format!("port {p}")));
        Some(parts.join(" or "))
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub cookie_key_hex: Option<String>,
    pub admin_username: String,
    pub admin_password: Option<String>,
}

impl ApiConfig {
    fn from_env() -> Result<Self> {
        let port = match env::var("APP_PORT") {
            Ok(s) => s
                .parse::<u16>()
                .map_err(|_| Error::invalid("APP_PORT must be a port number"))?,
            Err(_) => 8080,
        };
        Ok(Self {
            host: env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port,
            cookie_key_hex: env::var("COOKIE_KEY_HEX").ok().filter(|s| !s.is_empty()),
            admin_username: env::var("ADMIN_USERNAME").unwrap_or_else(|_| "admin".to_string()),
            admin_password: env::var("ADMIN_PASSWORD").ok().filter(|s| !s.is_empty()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub capture: CaptureConfig,
    pub api: ApiConfig,
    pub log_level: String,
    pub orphaned_ip_days: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let orphaned_ip_days = match env::var("ORPHANED_IP_DAYS") {
            Ok(s) => s
                .parse::<i64>()
                .map_err(|_| Error::invalid("ORPHANED_IP_DAYS must be an integer"))?,
            Err(_) => 7,
        };
        Ok(Self {
            database: DatabaseConfig::from_env()?,
            capture: CaptureConfig::from_env()?,
            api: ApiConfig::from_env()?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            orphaned_ip_days,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bpf_filter_from_ports_always_includes_dns() {
        let cfg = CaptureConfig {
            ports: vec![443, 8443],
            interface: None,
            bpf_filter: None,
            snapshot_length: 65535,
        };
        assert_eq!(
            cfg.build_bpf_filter().as_deref(),
            Some("port 53 or port 443 or port 8443")
        );
    }

    #[test]
    fn explicit_bpf_expression_wins() {
        let cfg = CaptureConfig {
            ports: vec![443],
            interface: None,
            bpf_filter: Some("udp and port 53".to_string()),
            snapshot_length: 65535,
        };
        assert_eq!(cfg.build_bpf_filter().as_deref(), Some("udp and port 53"));
    }

    #[test]
    fn no_ports_no_filter() {
        let cfg = CaptureConfig {
            ports: Vec::new(),
            interface: None,
            bpf_filter: None,
            snapshot_length: 65535,
        };
        assert!(cfg.build_bpf_filter().is_none());
    }
}
