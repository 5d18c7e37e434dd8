//! Host metrics read from `/proc`.

use std::sync::{Arc, Mutex};
use ter_core::model::{CpuInfo, HostInfo, MemoryInfo};
use tracing::debug;

/// Aggregate CPU counters from the first line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuSample {
    pub idle: u64,
    pub total: u64,
}

impl CpuSample {
    /// Busy share between two samples, one decimal, clamped to 0..=100.
    pub fn usage_since(&self, previous: &CpuSample) -> Option<f64> {
        let total = self.total.checked_sub(previous.total)?;
        if total == 0 {
            return None;
        }
        let idle = self.idle.saturating_sub(previous.idle) as f64;
        let busy = (1.0 - idle / total as f64) * 100.0;
        Some(round_tenth(busy).clamp(0.0, 100.0))
    }
}

/// Format: `cpu  user nice system idle iowait irq softirq steal ...`
pub fn parse_proc_stat(raw: &str) -> Option<CpuSample> {
    let line = raw.lines().find(|line| line.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|field| field.parse().unwrap_or(0))
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    // guest time is already folded into user/nice
    let total = fields.iter().take(8).sum();
    Some(CpuSample { idle, total })
}

/// Total and available memory in bytes. `MemAvailable` is preferred over
/// `MemFree` when the kernel reports it.
pub fn parse_meminfo(raw: &str) -> Option<(u64, u64)> {
    let field = |name: &str| -> Option<u64> {
        raw.lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|kib| kib.parse::<u64>().ok())
            .map(|kib| kib * 1024)
    };
    let total = field("MemTotal")?;
    let free = field("MemAvailable").or_else(|| field("MemFree"))?;
    Some((total, free.min(total)))
}

pub fn parse_loadavg(raw: &str) -> Vec<f64> {
    raw.split_whitespace()
        .take(3)
        .filter_map(|field| field.parse().ok())
        .collect()
}

pub fn parse_uptime(raw: &str) -> Option<u64> {
    raw.split_whitespace()
        .next()?
        .parse::<f64>()
        .ok()
        .map(|secs| secs.max(0.0) as u64)
}

/// CPU model and logical core count.
pub fn parse_cpuinfo(raw: &str) -> (Option<String>, usize) {
    let mut model = None;
    let mut cores = 0;
    for line in raw.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "processor" => cores += 1,
            "model name" | "Model" | "Hardware" if model.is_none() => {
                let value = value.trim();
                if !value.is_empty() {
                    model = Some(value.to_string());
                }
            }
            _ => {}
        }
    }
    (model, cores)
}

pub fn memory_info(total: u64, free: u64) -> MemoryInfo {
    let used = total.saturating_sub(free);
    let used_percent = if total > 0 {
        round_tenth(used as f64 / total as f64 * 100.0)
    } else {
        0.0
    };
    MemoryInfo {
        total,
        free,
        used,
        used_percent,
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

async fn read_proc(name: &str) -> String {
    match tokio::fs::read_to_string(format!("/proc/{name}")).await {
        Ok(raw) => raw,
        Err(err) => {
            debug!(event = "proc_read_failed", file = name, error = %err);
            String::new()
        }
    }
}

/// Samples host metrics. CPU usage needs two samples, so the first call
/// reports none.
#[derive(Clone, Default)]
pub struct HostProbe {
    last_cpu: Arc<Mutex<Option<CpuSample>>>,
}

impl HostProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> HostInfo {
        let (stat, meminfo, cpuinfo, loadavg, uptime, release) = tokio::join!(
            read_proc("stat"),
            read_proc("meminfo"),
            read_proc("cpuinfo"),
            read_proc("loadavg"),
            read_proc("uptime"),
            read_proc("sys/kernel/osrelease"),
        );

        let usage = parse_proc_stat(&stat).and_then(|sample| self.record_cpu(sample));
        let (model, mut cores) = parse_cpuinfo(&cpuinfo);
        if cores == 0 {
            cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
        }
        let (total, free) = parse_meminfo(&meminfo).unwrap_or((0, 0));

        HostInfo {
            hostname: hostname::get()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            platform: std::env::consts::OS.to_string(),
            release: release.trim().to_string(),
            arch: std::env::consts::ARCH.to_string(),
            uptime: parse_uptime(&uptime).unwrap_or(0),
            load: parse_loadavg(&loadavg),
            cpu: CpuInfo {
                model,
                cores,
                usage,
            },
            memory: memory_info(total, free),
        }
    }

    fn record_cpu(&self, sample: CpuSample) -> Option<f64> {
        let mut last = self
            .last_cpu
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let usage = last.as_ref().and_then(|previous| sample.usage_since(previous));
        *last = Some(sample);
        usage
    }
}
