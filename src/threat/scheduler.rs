use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::info;

use super::intel::ThreatIntel;

const WARMUP: Duration = Duration::from_secs(30);
const CADENCE: Duration = Duration::from_secs(24 * 3600);

/// Daily feed refresh thread: short warm-up so capture comes first, an
/// immediate pass, then one pass per day. The stop flag is polled while
/// sleeping so shutdown is not stuck behind the cadence.
pub fn spawn(intel: Arc<ThreatIntel>, running: Arc<AtomicBool>) -> JoinHandle<()> {
    thread::spawn(move || {
        info!("threat feed scheduler started (daily updates)");
        if !sleep_while_running(&running, WARMUP) {
            return;
        }
        loop {
            intel.update_all_enabled();
            if !sleep_while_running(&running, CADENCE) {
                break;
            }
        }
        info!("threat feed scheduler stopped");
    })
}

/// Sleeps in one-second steps; false once the flag drops.
fn sleep_while_running(running: &AtomicBool, total: Duration) -> bool {
    let mut remaining = total;
    while !remaining.is_zero() {
        if !running.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(Duration::from_secs(1));
        thread::sleep(step);
        remaining -= step;
    }
    running.load(Ordering::Relaxed)
}
