//! Host load sampling for the watchdog.
//!
//! CPU load is measured over a fixed window (two refreshes separated by a
//! sleep) so a single spike does not dominate the reading.

use std::future::Future;
use std::time::Duration;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

/// One snapshot of host load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSample {
    /// System-wide CPU load, 0.0..=100.0.
    pub cpu_load_percent: f32,
    pub used_memory_bytes: u64,
    pub total_memory_bytes: u64,
}

impl MetricsSample {
    pub fn used_memory_mb(&self) -> u64 {
        self.used_memory_bytes / (1024 * 1024)
    }

    pub fn total_memory_mb(&self) -> u64 {
        self.total_memory_bytes / (1024 * 1024)
    }
}

/// The host metrics could not be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsUnavailable {
    /// sysinfo has no backend for this platform.
    UnsupportedPlatform,
    /// The platform answered but reported nothing usable.
    NoData(&'static str),
}

impl std::fmt::Display for MetricsUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricsUnavailable::UnsupportedPlatform => {
                write!(f, "system metrics are not supported on this platform")
            }
            MetricsUnavailable::NoData(what) => write!(f, "no data reported for {what}"),
        }
    }
}

impl std::error::Error for MetricsUnavailable {}

/// Source of load samples consumed once per watchdog tick.
///
/// Implementations must return within a bounded time; the watchdog awaits
/// the sample inline on its polling task.
pub trait MetricsSource: Send + 'static {
    fn sample(&mut self) -> impl Future<Output = Result<MetricsSample, MetricsUnavailable>> + Send;
}

/// Production probe backed by `sysinfo`.
pub struct SystemProbe {
    system: System,
    window: Duration,
}

impl SystemProbe {
    /// Create a probe measuring CPU over `window` (clamped to sysinfo's minimum).
    pub fn new(window: Duration) -> Self {
        let refresh = RefreshKind::nothing()
            .with_cpu(CpuRefreshKind::nothing().with_cpu_usage())
            .with_memory(MemoryRefreshKind::nothing().with_ram());
        Self {
            system: System::new_with_specifics(refresh),
            window: window.max(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL),
        }
    }
}

impl MetricsSource for SystemProbe {
    async fn sample(&mut self) -> Result<MetricsSample, MetricsUnavailable> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(MetricsUnavailable::UnsupportedPlatform);
        }

        self.system.refresh_cpu_usage();
        tokio::time::sleep(self.window).await;
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total_memory_bytes = self.system.total_memory();
        if total_memory_bytes == 0 {
            return Err(MetricsUnavailable::NoData("total memory"));
        }

        let cpu_load_percent = self.system.global_cpu_usage();
        if !cpu_load_percent.is_finite() {
            return Err(MetricsUnavailable::NoData("cpu load"));
        }

        Ok(MetricsSample {
            cpu_load_percent,
            used_memory_bytes: self.system.used_memory(),
            total_memory_bytes,
        })
    }
}
