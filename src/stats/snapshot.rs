//! Process-tree snapshots from /proc.
//!
//! The pid set comes from the task's accounting group when one exists
//! (authoritative, catches reparented descendants); otherwise the whole
//! host process table is scanned and descendants absorbed iteratively
//! from the supervised root pid.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use log::trace;

use crate::isolation::cgroup::Cgroup;

/// One process's usage at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PidSample {
    pub rss_bytes: u64,
    pub swap_bytes: u64,
    pub utime_ms: f64,
    pub stime_ms: f64,
}

impl PidSample {
    pub fn total_ms(&self) -> f64 {
        self.utime_ms + self.stime_ms
    }
}

/// Pids currently belonging to the task
pub fn collect_pids(root: i32, cgroup: Option<&Cgroup>) -> Vec<i32> {
    if let Some(cg) = cgroup {
        if cg.exists() {
            match cg.member_pids() {
                Ok(pids) if !pids.is_empty() => return pids,
                Ok(_) => {}
                Err(e) => trace!("cgroup member listing failed, scanning: {}", e),
            }
        }
    }
    absorb_tree(root, &host_parent_table())
}

/// Iteratively absorb every process whose ancestor chain reaches `root`.
/// Handles reparenting observed mid-scan by looping to a fixed point.
pub fn absorb_tree(root: i32, parents: &BTreeMap<i32, i32>) -> Vec<i32> {
    let mut members: BTreeSet<i32> = BTreeSet::new();
    members.insert(root);
    loop {
        let before = members.len();
        for (pid, ppid) in parents {
            if members.contains(ppid) {
                members.insert(*pid);
            }
        }
        if members.len() == before {
            break;
        }
    }
    members.into_iter().collect()
}

/// ppid of every live process on the host
pub fn host_parent_table() -> BTreeMap<i32, i32> {
    let mut table = BTreeMap::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return table;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|n| n.parse::<i32>().ok())
        else {
            continue;
        };
        let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if let Some((ppid, _, _)) = parse_stat_cpu(&stat) {
            table.insert(pid, ppid);
        }
    }
    table
}

/// Usage of one process; `None` when it vanished between listing and read
pub fn sample_pid(pid: i32) -> Option<PidSample> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let (_, utime, stime) = parse_stat_cpu(&stat)?;
    let tck = clk_tck();
    let status = fs::read_to_string(format!("/proc/{}/status", pid)).unwrap_or_default();
    Some(PidSample {
        rss_bytes: status_kb(&status, "VmRSS") * 1024,
        swap_bytes: status_kb(&status, "VmSwap") * 1024,
        utime_ms: utime as f64 * 1000.0 / tck,
        stime_ms: stime as f64 * 1000.0 / tck,
    })
}

// (ppid, utime ticks, stime ticks) from /proc/<pid>/stat; fields counted
// past the parenthesized comm
fn parse_stat_cpu(stat: &str) -> Option<(i32, u64, u64)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    Some((
        fields.get(1)?.parse().ok()?,
        fields.get(11)?.parse().ok()?,
        fields.get(12)?.parse().ok()?,
    ))
}

fn status_kb(status: &str, key: &str) -> u64 {
    status
        .lines()
        .find_map(|line| line.strip_prefix(key)?.strip_prefix(':'))
        .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse().ok())
        .unwrap_or(0)
}

fn clk_tck() -> f64 {
    let tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if tck > 0 {
        tck as f64
    } else {
        100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorb_direct_and_transitive_children() {
        let mut parents = BTreeMap::new();
        parents.insert(10, 1);
        parents.insert(20, 10);
        parents.insert(30, 20);
        parents.insert(40, 2);
        assert_eq!(absorb_tree(10, &parents), vec![10, 20, 30]);
    }

    #[test]
    fn test_absorb_reaches_fixed_point_regardless_of_order() {
        // child listed before its parent joins the set
        let mut parents = BTreeMap::new();
        parents.insert(5, 50);
        parents.insert(50, 100);
        assert_eq!(absorb_tree(100, &parents), vec![5, 50, 100]);
    }

    #[test]
    fn test_root_alone_when_no_children() {
        assert_eq!(absorb_tree(7, &BTreeMap::new()), vec![7]);
    }

    #[test]
    fn test_parse_stat_with_odd_comm() {
        let stat = "42 (a (weird) name) S 7 42 42 0 -1 4194560 1 0 0 0 13 8 0 0 \
                    20 0 1 0 1000 10000 50 18446744073709551615";
        let (ppid, utime, stime) = parse_stat_cpu(stat).unwrap();
        assert_eq!(ppid, 7);
        assert_eq!(utime, 13);
        assert_eq!(stime, 8);
    }

    #[test]
    fn test_status_kb_extraction() {
        let status = "Name:\tsleep\nVmRSS:\t    1234 kB\nVmSwap:\t       0 kB\n";
        assert_eq!(status_kb(status, "VmRSS"), 1234);
        assert_eq!(status_kb(status, "VmSwap"), 0);
        assert_eq!(status_kb(status, "VmPeak"), 0);
    }

    #[test]
    fn test_sample_own_process() {
        let sample = sample_pid(std::process::id() as i32).unwrap();
        assert!(sample.rss_bytes > 0);
    }

    #[test]
    fn test_host_scan_contains_own_process() {
        let pid = std::process::id() as i32;
        let table = host_parent_table();
        assert!(table.contains_key(&pid));
        assert!(collect_pids(pid, None).contains(&pid));
    }
}
