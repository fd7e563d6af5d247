//! Isolation layer: namespaces, accounting groups, mount tables and
//! capability sets that a launch request resolves to.

pub mod capability;
pub mod cgroup;
pub mod mount;
pub mod profile;

pub use capability::{supported_caps, CapabilitySet};
pub use cgroup::{detect_version, Cgroup, CgroupVersion};
pub use mount::{mandatory_mounts, MountEntry};
pub use profile::{build_profile, IsolationProfile, NamespaceSet};
