//! Live capture front end: one pcap loop decoding frames and fanning out
//! DNS events and L4 records to the ingest pipelines. The capture thread
//! never blocks on downstream; full channels drop with a counter.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use etherparse::{IpHeader, PacketHeaders, TransportHeader};
use log::{debug, error, info, warn};

use crate::config::CaptureConfig;
use crate::dns::{extract, wire};
use crate::error::{Error, Result};
use crate::model::{DnsEventRecord, L4Record, Protocol};

#[derive(Default)]
pub struct CaptureMetrics {
    pub dropped_dns_events: AtomicU64,
    pub dropped_l4_records: AtomicU64,
    pub malformed_frames: AtomicU64,
}

/// Interface to capture on: the configured one, else the first
/// non-loopback device pcap knows about.
pub fn pick_interface(cfg: &CaptureConfig) -> Result<String> {
    if let Some(iface) = &cfg.interface {
        return Ok(iface.clone());
    }
    let devices = pcap::Device::list().map_err(|e| Error::Internal(e.to_string()))?;
    devices
        .into_iter()
        .map(|d| d.name)
        .find(|name| name != "lo")
        .ok_or_else(|| Error::Internal("no capture device available".into()))
}

pub fn spawn(
    cfg: CaptureConfig,
    dns_tx: SyncSender<DnsEventRecord>,
    flow_tx: SyncSender<L4Record>,
    running: Arc<AtomicBool>,
    metrics: Arc<CaptureMetrics>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        if let Err(e) = run_capture(&cfg, &dns_tx, &flow_tx, &running, &metrics) {
            error!("packet capture stopped: {e}");
        }
    })
}

fn run_capture(
    cfg: &CaptureConfig,
    dns_tx: &SyncSender<DnsEventRecord>,
    flow_tx: &SyncSender<L4Record>,
    running: &AtomicBool,
    metrics: &CaptureMetrics,
) -> Result<()> {
    let iface = pick_interface(cfg)?;
    let mut cap = pcap::Capture::from_device(iface.as_str())
        .map_err(|e| Error::Internal(e.to_string()))?
        .promisc(true)
        .snaplen(cfg.snapshot_length)
        .timeout(1000)
        .open()
        .map_err(|e| Error::Internal(format!("cannot open {iface}: {e}")))?;

    let filter = cfg.build_bpf_filter();
    if let Some(expr) = &filter {
        cap.filter(expr, true)
            .map_err(|e| Error::Internal(format!("bad capture filter '{expr}': {e}")))?;
    }
    info!(
        "capturing on {iface} (filter: {})",
        filter.as_deref().unwrap_or("none")
    );

    while running.load(Ordering::Relaxed) {
        match cap.next_packet() {
            Ok(packet) => {
                let ts = packet_time(packet.header);
                let wire_len = u64::from(packet.header.len);
                handle_frame(packet.data, wire_len, ts, cfg, dns_tx, flow_tx, metrics);
            }
            // read timeout; just poll the stop flag again
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                warn!("capture read error: {e}");
                break;
            }
        }
    }
    info!("packet capture stopped");
    Ok(())
}

fn packet_time(header: &pcap::PacketHeader) -> DateTime<Utc> {
    let secs = header.ts.tv_sec as i64;
    let nanos = (header.ts.tv_usec as i64).clamp(0, 999_999) as u32 * 1000;
    DateTime::from_timestamp(secs, nanos).unwrap_or_else(Utc::now)
}

fn handle_frame(
    data: &[u8],
    wire_len: u64,
    ts: DateTime<Utc>,
    cfg: &CaptureConfig,
    dns_tx: &SyncSender<DnsEventRecord>,
    flow_tx: &SyncSender<L4Record>,
    metrics: &CaptureMetrics,
) {
    let headers = match PacketHeaders::from_ethernet_slice(data)
        .or_else(|_| PacketHeaders::from_ip_slice(data))
    {
        Ok(headers) => headers,
        Err(_) => {
            metrics.malformed_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let (src_ip, dst_ip): (IpAddr, IpAddr) = match &headers.ip {
        Some(IpHeader::Version4(h, _)) => (h.source.into(), h.destination.into()),
        Some(IpHeader::Version6(h, _)) => (h.source.into(), h.destination.into()),
        None => return,
    };
    let (protocol, src_port, dst_port) = match &headers.transport {
        Some(TransportHeader::Tcp(t)) => (Protocol::Tcp, t.source_port, t.destination_port),
        Some(TransportHeader::Udp(u)) => (Protocol::Udp, u.source_port, u.destination_port),
        _ => return,
    };

    if protocol == Protocol::Udp && (src_port == 53 || dst_port == 53) {
        match wire::parse_message(headers.payload) {
            Ok(msg) => {
                for event in extract::extract(&msg, src_ip, dst_ip, ts) {
                    match dns_tx.try_send(event) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            metrics.dropped_dns_events.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TrySendError::Disconnected(_)) => return,
                    }
                }
            }
            Err(e) => {
                debug!("undecodable dns payload from {src_ip}: {e}");
                metrics.malformed_frames.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // With explicit ports configured only those conversations are
    // accounted; port 53 rides along in the BPF filter for the DNS
    // pipeline alone.
    if !cfg.ports.is_empty() && !cfg.ports.contains(&dst_port) && !cfg.ports.contains(&src_port) {
        return;
    }

    let record = L4Record {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol,
        size: wire_len,
        ts,
    };
    match flow_tx.try_send(record) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            metrics.dropped_l4_records.fetch_add(1, Ordering::Relaxed);
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}
