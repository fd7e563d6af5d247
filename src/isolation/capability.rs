//! Linux capability sets granted to the task process

use std::io;
use std::str::FromStr;

use caps::{CapSet, Capability, CapsHashSet};

use crate::error::{ExecutorError, Result};

/// The capabilities a task is allowed to hold
#[derive(Debug, Clone)]
pub struct CapabilitySet {
    allow: CapsHashSet,
}

impl CapabilitySet {
    /// Parse capability names, e.g. `CAP_NET_BIND_SERVICE`
    pub fn from_names(names: &[String]) -> Result<Self> {
        let mut allow = CapsHashSet::new();
        for name in names {
            let cap = Capability::from_str(name).map_err(|_| {
                ExecutorError::Configuration(format!("unknown capability: {}", name))
            })?;
            allow.insert(cap);
        }
        Ok(Self { allow })
    }

    /// Every capability the running kernel supports
    pub fn all_supported() -> Self {
        Self {
            allow: caps::runtime::thread_all_supported(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.allow.is_empty()
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.allow.contains(&cap)
    }

    /// Capability names in sorted order
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.allow.iter().map(|c| c.to_string()).collect();
        names.sort();
        names
    }

    /// Restrict the calling thread to exactly this set. Runs in the child
    /// before execve; errors surface as `io::Error` to cross `pre_exec`.
    ///
    /// Ordering matters: the bounding drops and the inheritable write need
    /// CAP_SETPCAP effective, and the ambient raises need each capability
    /// in both the permitted and inheritable sets. The permitted and
    /// effective sets therefore shrink to the target last.
    pub(crate) fn apply(&self) -> io::Result<()> {
        let to_io = |e: caps::errors::CapsError| {
            io::Error::new(io::ErrorKind::Other, format!("capabilities: {}", e))
        };
        let mut staging = self.allow.clone();
        staging.insert(Capability::CAP_SETPCAP);
        caps::set(None, CapSet::Effective, &staging).map_err(to_io)?;
        // bounding set shrinks one capability at a time
        for cap in caps::runtime::thread_all_supported() {
            if !self.allow.contains(&cap) {
                caps::drop(None, CapSet::Bounding, cap).map_err(to_io)?;
            }
        }
        caps::set(None, CapSet::Inheritable, &self.allow).map_err(to_io)?;
        for cap in &self.allow {
            caps::raise(None, CapSet::Ambient, *cap).map_err(to_io)?;
        }
        caps::set(None, CapSet::Permitted, &self.allow).map_err(to_io)?;
        caps::set(None, CapSet::Effective, &self.allow).map_err(to_io)?;
        Ok(())
    }
}

/// Names of the capabilities this host can grant, optionally excluding
/// CAP_NET_RAW.
pub fn supported_caps(allow_net_raw: bool) -> Vec<String> {
    let mut names: Vec<String> = caps::runtime::thread_all_supported()
        .iter()
        .filter(|c| allow_net_raw || **c != Capability::CAP_NET_RAW)
        .map(|c| c.to_string())
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_names_parses_known_caps() {
        let set =
            CapabilitySet::from_names(&["CAP_NET_BIND_SERVICE".to_string()]).unwrap();
        assert!(set.contains(Capability::CAP_NET_BIND_SERVICE));
        assert!(!set.contains(Capability::CAP_SYS_ADMIN));
    }

    #[test]
    fn test_from_names_rejects_unknown() {
        let err = CapabilitySet::from_names(&["CAP_TIME_TRAVEL".to_string()]).unwrap_err();
        assert!(err.to_string().contains("CAP_TIME_TRAVEL"));
    }

    #[test]
    fn test_empty_set() {
        let set = CapabilitySet::from_names(&[]).unwrap();
        assert!(set.is_empty());
        assert!(!CapabilitySet::all_supported().is_empty());
    }

    #[test]
    fn test_names_are_sorted() {
        let set = CapabilitySet::from_names(&[
            "CAP_SYS_ADMIN".to_string(),
            "CAP_CHOWN".to_string(),
        ])
        .unwrap();
        assert_eq!(set.names(), vec!["CAP_CHOWN", "CAP_SYS_ADMIN"]);
    }

    #[test]
    fn test_supported_caps_net_raw_filter() {
        let with = supported_caps(true);
        let without = supported_caps(false);
        assert!(with.contains(&"CAP_NET_RAW".to_string()));
        assert!(!without.contains(&"CAP_NET_RAW".to_string()));
        assert_eq!(with.len(), without.len() + 1);
    }
}
