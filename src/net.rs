use std::net::IpAddr;

/// True for addresses on the LAN side of the gateway: RFC1918, loopback,
/// link-local and multicast, plus their IPv6 counterparts (loopback,
/// fe80::/10, fc00::/7, multicast).
pub fn is_lan_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_multicast()
        }
        IpAddr::V6(v6) => {
            let seg0 = v6.segments()[0];
            v6.is_loopback()
                || (seg0 & 0xffc0) == 0xfe80
                || (seg0 & 0xfe00) == 0xfc00
                || v6.is_multicast()
        }
    }
}

pub fn is_public_ip(ip: &IpAddr) -> bool {
    !is_lan_ip(ip)
}

/// Parses `s` as an address and reports whether it is public. Unparseable
/// strings are not public.
pub fn is_public_ip_str(s: &str) -> bool {
    s.parse::<IpAddr>().map(|ip| is_public_ip(&ip)).unwrap_or(false)
}

/// Ports a client would not listen on; used by the LAN-internal tie-break.
pub fn is_ephemeral_port(port: u16) -> bool {
    port >= 49152
}

const WELL_KNOWN_PORTS: [u16; 14] = [
    80, 443, 22, 21, 25, 53, 110, 143, 993, 995, 3306, 5432, 8080, 8443,
];

pub fn is_well_known_port(port: u16) -> bool {
    WELL_KNOWN_PORTS.contains(&port)
}

pub fn is_privileged_port(port: u16) -> bool {
    port < 1024
}
