//! System sampling seam for the change detector.
//!
//! The detector composes [`SystemStatus`] snapshots from a host-gauge sampler
//! plus the registry's live connection count, so tests can script samples
//! without touching timers or /proc.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Host gauges, percentages in `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostSample {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub online: bool,
}

/// Request throughput counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStats {
    pub total: u64,
    pub per_second: f64,
}

/// A source of raw samples. Returning `None` means "no sample this tick";
/// the detector treats that as no change rather than stalling.
pub trait SystemSampler: Send + Sync {
    fn host(&self) -> Option<HostSample>;
    fn requests(&self) -> Option<RequestStats>;
}

/// Production sampler: /proc gauges on Linux, plus the hub's inbound frame
/// counter for request throughput.
pub struct HubSampler {
    requests: Arc<AtomicU64>,
    window: Mutex<(u64, Instant)>,
}

impl HubSampler {
    pub fn new(requests: Arc<AtomicU64>) -> Self {
        Self {
            requests,
            window: Mutex::new((0, Instant::now())),
        }
    }
}

impl SystemSampler for HubSampler {
    fn host(&self) -> Option<HostSample> {
        host_sample()
    }

    fn requests(&self) -> Option<RequestStats> {
        let total = self.requests.load(Ordering::Relaxed);
        let mut window = self.window.lock().expect("sampler window lock poisoned");
        let (last_total, last_at) = *window;
        let elapsed = last_at.elapsed().as_secs_f64();
        let per_second = if elapsed > 0.0 {
            #[allow(clippy::cast_precision_loss)]
            let delta = total.saturating_sub(last_total) as f64;
            delta / elapsed
        } else {
            0.0
        };
        *window = (total, Instant::now());
        Some(RequestStats { total, per_second })
    }
}

#[cfg(target_os = "linux")]
fn host_sample() -> Option<HostSample> {
    let cpu = read_load_percent()?;
    let memory = read_memory_percent()?;
    // Disk usage has no /proc gauge; reported flat.
    Some(HostSample {
        cpu,
        memory,
        disk: 0.0,
        online: true,
    })
}

#[cfg(not(target_os = "linux"))]
fn host_sample() -> Option<HostSample> {
    None
}

#[cfg(target_os = "linux")]
fn read_load_percent() -> Option<f64> {
    let text = std::fs::read_to_string("/proc/loadavg").ok()?;
    let load1: f64 = text.split_whitespace().next()?.parse().ok()?;
    let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    #[allow(clippy::cast_precision_loss)]
    Some((load1 / cores as f64 * 100.0).clamp(0.0, 100.0))
}

#[cfg(target_os = "linux")]
fn read_memory_percent() -> Option<f64> {
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;
    let field = |name: &str| -> Option<f64> {
        text.lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total * 100.0).clamp(0.0, 100.0))
}
