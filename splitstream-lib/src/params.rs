//! Input model delivered by the surrounding daemon.
//!
//! [`FirewallParams`] carries the network scan and the two app lists,
//! [`TunnelParams`] the tunnel device data. Both may be partially empty
//! while the tunnel is (re)connecting; the engine treats empty fields as
//! "not available" rather than as errors.

use serde::Deserialize;

use std::path::{Path, PathBuf};

/// Current best information about the physical uplink, supplied by the
/// external network monitor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NetworkScan {
    pub interface_name: String,
    pub ip_address: String,
    pub gateway_ip: String,
}

impl NetworkScan {
    /// A scan is usable only when all three fields are known.
    pub fn is_valid(&self) -> bool {
        !self.interface_name.is_empty() && !self.ip_address.is_empty() && !self.gateway_ip.is_empty()
    }
}

/// Per-connection firewall inputs: uplink scan plus the user's app rules.
///
/// The app lists are ordered sequences of absolute executable paths;
/// duplicates are tolerated, the effective semantics is set membership.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FirewallParams {
    pub net_scan: NetworkScan,
    pub exclude_apps: Vec<String>,
    pub vpn_only_apps: Vec<String>,
}

/// Tunnel device data from the external tunnel manager.
/// Fields may be empty while a connection is being established.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TunnelParams {
    pub device_name: String,
    pub local_address: String,
    pub remote_address: String,
}

/// Locations of the two specialized net_cls cgroups and their shared parent.
///
/// The hierarchy itself is provisioned by the packaging layer; the engine
/// only ever writes PIDs into the `cgroup.procs` files below these
/// directories. Writing a PID to the parent transfers it out of a
/// specialized cgroup.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CgroupPaths {
    pub exclusions: PathBuf,
    pub vpn_only: PathBuf,
    pub parent: PathBuf,
}

const PROCS_FILE: &str = "cgroup.procs";

impl CgroupPaths {
    pub fn exclusions_procs(&self) -> PathBuf {
        self.exclusions.join(PROCS_FILE)
    }

    pub fn vpn_only_procs(&self) -> PathBuf {
        self.vpn_only.join(PROCS_FILE)
    }

    pub fn parent_procs(&self) -> PathBuf {
        self.parent.join(PROCS_FILE)
    }
}

impl Default for CgroupPaths {
    fn default() -> Self {
        let parent = Path::new("/sys/fs/cgroup/net_cls");
        Self {
            exclusions: parent.join("splitstream.bypass"),
            vpn_only: parent.join("splitstream.vpnonly"),
            parent: parent.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_valid_only_when_complete() {
        let mut scan = NetworkScan {
            interface_name: "eth0".into(),
            ip_address: "192.168.1.7".into(),
            gateway_ip: "192.168.1.1".into(),
        };
        assert!(scan.is_valid());

        scan.gateway_ip.clear();
        assert!(!scan.is_valid());
        assert!(!NetworkScan::default().is_valid());
    }

    #[test]
    fn cgroup_procs_paths() {
        let paths = CgroupPaths::default();
        assert_eq!(
            paths.exclusions_procs(),
            PathBuf::from("/sys/fs/cgroup/net_cls/splitstream.bypass/cgroup.procs")
        );
        assert_eq!(paths.parent_procs(), PathBuf::from("/sys/fs/cgroup/net_cls/cgroup.procs"));
    }
}
