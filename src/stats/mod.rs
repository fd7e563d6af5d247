//! Resource usage collection: periodic samples of the whole supervised
//! process tree, aggregated plus broken down per pid.

pub mod cpu;
pub mod snapshot;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::execution::supervisor::ExitSignal;
use crate::isolation::cgroup::Cgroup;
use cpu::CpuTracker;
use snapshot::{collect_pids, sample_pid};

/// Default sampling interval
pub const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Stat names actually measured when an accounting group backs the sample
pub const CGROUP_MEASURED_MEM: &[&str] = &["RSS", "Cache", "Swap", "Usage", "Max Usage"];
pub const CGROUP_MEASURED_CPU: &[&str] =
    &["Total Ticks", "Throttled Periods", "Throttled Time", "Percent"];
/// Stat names measured by the host-table scan fallback
pub const SCAN_MEASURED_MEM: &[&str] = &["RSS", "Swap"];
pub const SCAN_MEASURED_CPU: &[&str] = &["Total Ticks", "Percent", "User Mode", "System Mode"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryStats {
    pub rss: u64,
    pub cache: u64,
    pub swap: u64,
    pub usage: u64,
    pub max_usage: u64,
    /// Which of the fields above were actually measured
    pub measured: Vec<&'static str>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuStats {
    pub percent: f64,
    pub user_mode: f64,
    pub system_mode: f64,
    /// Cumulative CPU time, milliseconds
    pub total_ms: u64,
    pub throttled_periods: u64,
    pub throttled_ns: u64,
    pub measured: Vec<&'static str>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceUsage {
    pub memory: MemoryStats,
    pub cpu: CpuStats,
}

/// One sample: the aggregate plus a per-pid breakdown
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResourceUsage {
    pub timestamp: DateTime<Utc>,
    pub aggregate: ResourceUsage,
    pub pids: BTreeMap<i32, ResourceUsage>,
}

/// Consumer handle for the sampling loop. Dropping it (or calling
/// `cancel`) stops the loop; the task itself is never touched.
pub struct StatsStream {
    rx: Receiver<TaskResourceUsage>,
    cancel: Arc<AtomicBool>,
}

impl StatsStream {
    pub fn recv_timeout(&self, timeout: Duration) -> Option<TaskResourceUsage> {
        match self.rx.recv_timeout(timeout) {
            Ok(sample) => Some(sample),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = TaskResourceUsage> + '_ {
        self.rx.iter()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

impl Drop for StatsStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

// rolling trackers for one pid
#[derive(Default)]
struct PidTrackers {
    total: CpuTracker,
    user: CpuTracker,
    system: CpuTracker,
}

/// Start the sampling loop for a supervised pid. The first sample is taken
/// immediately, then one per interval until the consumer cancels, the task
/// exits, or the receiver is dropped.
pub(crate) fn start(
    root_pid: i32,
    cgroup: Option<Cgroup>,
    exit: Arc<ExitSignal>,
    interval: Option<Duration>,
) -> StatsStream {
    let interval = interval.unwrap_or(STATS_INTERVAL);
    let cancel = Arc::new(AtomicBool::new(false));
    let (tx, rx) = channel();

    let loop_cancel = cancel.clone();
    std::thread::spawn(move || {
        let mut trackers: BTreeMap<i32, PidTrackers> = BTreeMap::new();
        let mut aggregate_tracker = CpuTracker::new();
        loop {
            if loop_cancel.load(Ordering::Relaxed) {
                break;
            }
            let sample = sample_once(
                root_pid,
                cgroup.as_ref(),
                &mut trackers,
                &mut aggregate_tracker,
            );
            if tx.send(sample).is_err() {
                break;
            }
            if exit.peek().is_some() {
                break;
            }
            if !sleep_cancellable(interval, &loop_cancel) {
                break;
            }
        }
    });

    StatsStream { rx, cancel }
}

// sleep in slices so cancellation is noticed promptly
fn sleep_cancellable(total: Duration, cancel: &AtomicBool) -> bool {
    let mut remaining = total;
    let slice = Duration::from_millis(100);
    while !remaining.is_zero() {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
    !cancel.load(Ordering::Relaxed)
}

fn sample_once(
    root_pid: i32,
    cgroup: Option<&Cgroup>,
    trackers: &mut BTreeMap<i32, PidTrackers>,
    aggregate_tracker: &mut CpuTracker,
) -> TaskResourceUsage {
    let live = collect_pids(root_pid, cgroup);

    // vanished pids are dropped silently; new ones start at zero percent
    trackers.retain(|pid, _| live.contains(pid));

    let mut pids = BTreeMap::new();
    for pid in &live {
        let Some(sample) = sample_pid(*pid) else {
            continue;
        };
        let t = trackers.entry(*pid).or_default();
        pids.insert(
            *pid,
            ResourceUsage {
                memory: MemoryStats {
                    rss: sample.rss_bytes,
                    swap: sample.swap_bytes,
                    measured: SCAN_MEASURED_MEM.to_vec(),
                    ..Default::default()
                },
                cpu: CpuStats {
                    percent: t.total.percent(sample.total_ms()),
                    user_mode: t.user.percent(sample.utime_ms),
                    system_mode: t.system.percent(sample.stime_ms),
                    total_ms: sample.total_ms() as u64,
                    measured: SCAN_MEASURED_CPU.to_vec(),
                    ..Default::default()
                },
            },
        );
    }

    let aggregate = match cgroup {
        Some(cg) if cg.exists() => {
            let mem = cg.memory_accounting();
            let cpu = cg.cpu_accounting();
            ResourceUsage {
                memory: MemoryStats {
                    rss: mem.rss,
                    cache: mem.cache,
                    swap: mem.swap,
                    usage: mem.usage,
                    max_usage: mem.max_usage,
                    measured: CGROUP_MEASURED_MEM.to_vec(),
                },
                cpu: CpuStats {
                    percent: aggregate_tracker.percent(cpu.usage_ms as f64),
                    total_ms: cpu.usage_ms,
                    throttled_periods: cpu.throttled_periods,
                    throttled_ns: cpu.throttled_ns,
                    measured: CGROUP_MEASURED_CPU.to_vec(),
                    ..Default::default()
                },
            }
        }
        _ => {
            let mut agg = ResourceUsage {
                memory: MemoryStats {
                    measured: SCAN_MEASURED_MEM.to_vec(),
                    ..Default::default()
                },
                cpu: CpuStats {
                    measured: SCAN_MEASURED_CPU.to_vec(),
                    ..Default::default()
                },
            };
            for usage in pids.values() {
                agg.memory.rss += usage.memory.rss;
                agg.memory.swap += usage.memory.swap;
                agg.cpu.percent += usage.cpu.percent;
                agg.cpu.user_mode += usage.cpu.user_mode;
                agg.cpu.system_mode += usage.cpu.system_mode;
                agg.cpu.total_ms += usage.cpu.total_ms;
            }
            agg
        }
    };

    TaskResourceUsage {
        timestamp: Utc::now(),
        aggregate,
        pids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_sample_includes_own_process() {
        let pid = std::process::id() as i32;
        let mut trackers = BTreeMap::new();
        let mut agg = CpuTracker::new();
        let sample = sample_once(pid, None, &mut trackers, &mut agg);
        assert!(sample.pids.contains_key(&pid));
        assert!(sample.aggregate.memory.rss > 0);
        assert_eq!(sample.aggregate.memory.measured, SCAN_MEASURED_MEM);
        assert_eq!(sample.aggregate.cpu.measured, SCAN_MEASURED_CPU);
    }

    #[test]
    fn test_vanished_pids_drop_their_trackers() {
        let pid = std::process::id() as i32;
        let mut trackers = BTreeMap::new();
        trackers.insert(i32::MAX - 3, PidTrackers::default());
        let mut agg = CpuTracker::new();
        sample_once(pid, None, &mut trackers, &mut agg);
        assert!(!trackers.contains_key(&(i32::MAX - 3)));
        assert!(trackers.contains_key(&pid));
    }

    #[test]
    fn test_stream_emits_immediately_and_stops_on_cancel() {
        let exit = Arc::new(ExitSignal::new());
        let stream = start(
            std::process::id() as i32,
            None,
            exit,
            Some(Duration::from_secs(60)),
        );
        let first = stream.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(first.pids.contains_key(&(std::process::id() as i32)));
        stream.cancel();
        // loop is parked in its interval sleep; cancellation means no
        // further samples arrive
        assert!(stream.recv_timeout(Duration::from_millis(400)).is_none());
    }
}
