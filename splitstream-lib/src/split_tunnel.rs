//! The split-tunnel reconciler.
//!
//! [`SplitTunnel`] owns the two app maps, the previous network state and
//! the session, and coordinates every kernel-state change: cgroup
//! membership through [`CgroupOps`], anchors and policy routing through
//! [`RuleController`], and the process-event subscription.
//!
//! Session lifecycle:
//!
//! ```text
//!   [Idle] --initiate_connection--> [Active]
//!   [Active] --update_split_tunnel--> [Active]   (reconfigure)
//!   [Active] --initiate_connection--> [Active]   (implicit shutdown + restart)
//!   [Active] --shutdown_connection--> [Idle]
//! ```
//!
//! All methods run on the daemon's single-threaded event loop; the
//! listener task never mutates the maps itself, it only feeds events back
//! through the loop.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::cgroup::{CgroupOps, CgroupWriter};
use crate::firewall::{FirewallOps, IptablesAnchors};
use crate::params::{CgroupPaths, FirewallParams, NetworkScan, TunnelParams};
use crate::proc_events::{self, ProcEvent, ProcEventSocket};
use crate::procfs::{Pid, ProcFs, ProcOps};
use crate::route_cmds::{RealRouteCmdOps, RouteCmdOps};
use crate::rules::{BYPASS_TABLE, RuleController, VPN_ONLY_TABLE};

#[derive(Debug, Error)]
pub enum Error {
    #[error("process event subscription failed: {0}")]
    ProcEvents(#[from] proc_events::Error),
    #[error(transparent)]
    Firewall(#[from] crate::firewall::Error),
}

/// Apps of one traffic class and the PIDs currently known to run them.
///
/// PIDs are weak references: the kernel may reap a process at any moment,
/// and a stale entry is harmless because a dead PID written to a cgroup
/// file is a logged no-op.
#[derive(Debug, Default)]
pub struct TrackedAppMap {
    apps: HashMap<String, HashSet<Pid>>,
}

impl TrackedAppMap {
    pub fn contains_path(&self, path: &str) -> bool {
        self.apps.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.apps.keys()
    }

    pub fn pids_of(&self, path: &str) -> Option<&HashSet<Pid>> {
        self.apps.get(path)
    }

    pub fn all_pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.apps.values().flatten().copied()
    }

    fn insert_path(&mut self, path: &str) {
        self.apps.entry(path.to_string()).or_default();
    }

    fn remove_path(&mut self, path: &str) -> Option<HashSet<Pid>> {
        self.apps.remove(path)
    }

    fn add_pid(&mut self, path: &str, pid: Pid) {
        self.apps.entry(path.to_string()).or_default().insert(pid);
    }

    /// Drop `pid` from every path set. The PID can only actually live in
    /// one of them, but removing it everywhere avoids a leak when the
    /// original insertion path is unknown.
    fn remove_pid_everywhere(&mut self, pid: Pid) {
        for pids in self.apps.values_mut() {
            pids.remove(&pid);
        }
    }

    fn clear(&mut self) {
        self.apps.clear();
    }
}

/// Resources of one active session.
struct Session {
    cancel: CancellationToken,
    listener: JoinHandle<()>,
}

/// The reconciler. Generic over its kernel seams so tests can run the
/// full lifecycle against stateful mocks.
pub struct SplitTunnel<P: ProcOps, C: CgroupOps, F: FirewallOps, S: RouteCmdOps> {
    proc: P,
    cgroup: C,
    rules: RuleController<F, S>,
    cgroups: CgroupPaths,
    exclusions: TrackedAppMap,
    vpn_only: TrackedAppMap,
    prev_scan: NetworkScan,
    prev_tunnel_local: String,
    session: Option<Session>,
}

/// Production reconciler wired to the real kernel interfaces.
pub type Engine = SplitTunnel<ProcFs, CgroupWriter<ProcFs>, IptablesAnchors, RealRouteCmdOps>;

impl Engine {
    pub fn new(cgroups: CgroupPaths) -> Result<Self, Error> {
        let proc = ProcFs::default();
        Ok(Self::with_ops(
            proc.clone(),
            CgroupWriter::new(proc),
            IptablesAnchors::new()?,
            RealRouteCmdOps,
            cgroups,
        ))
    }
}

impl<P: ProcOps, C: CgroupOps, F: FirewallOps, S: RouteCmdOps> SplitTunnel<P, C, F, S> {
    pub fn with_ops(proc: P, cgroup: C, firewall: F, routes: S, cgroups: CgroupPaths) -> Self {
        Self {
            proc,
            cgroup,
            rules: RuleController::new(firewall, routes),
            cgroups,
            exclusions: TrackedAppMap::default(),
            vpn_only: TrackedAppMap::default(),
            prev_scan: NetworkScan::default(),
            prev_tunnel_local: String::new(),
            session: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Start a session: subscribe to process events, bring up the
    /// anchors, apply the initial configuration, loosen reverse-path
    /// filtering, and finally start draining the event socket.
    ///
    /// A second call while active performs a full shutdown first. A
    /// subscription failure aborts without mutating any other state.
    pub async fn initiate_connection(
        &mut self,
        params: &FirewallParams,
        tunnel: &TunnelParams,
        events: mpsc::Sender<ProcEvent>,
    ) -> Result<(), Error> {
        if self.session.is_some() {
            tracing::info!("restarting split tunnel session");
            self.shutdown_connection().await;
        }

        let socket = ProcEventSocket::open_subscribed()?;

        self.activate_session(params, tunnel).await;

        let cancel = CancellationToken::new();
        let listener = proc_events::spawn_listener(socket, events, cancel.clone());
        self.session = Some(Session { cancel, listener });

        tracing::info!("split tunnel session active");
        Ok(())
    }

    /// Steps between the subscription and the listener registration:
    /// anchors up, initial configuration applied, RPF loosened.
    async fn activate_session(&mut self, params: &FirewallParams, tunnel: &TunnelParams) {
        self.rules.enable_anchors();
        self.update_split_tunnel(params, tunnel).await;
        self.rules.enable_loose_rp_filter().await;
    }

    /// Apply a configuration update: network state first, then app
    /// reconciliation, because app gating depends on scan validity.
    pub async fn update_split_tunnel(&mut self, params: &FirewallParams, tunnel: &TunnelParams) {
        self.update_network(&params.net_scan, tunnel).await;
        self.update_apps(&params.exclude_apps, &params.vpn_only_apps);
    }

    /// Reverse everything `initiate_connection` set up.
    pub async fn shutdown_connection(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        session.cancel.cancel();
        if let Err(error) = session.listener.await {
            tracing::warn!(%error, "process event listener ended abnormally");
        }

        self.rules.disable_anchors();

        let parent_procs = self.cgroups.parent_procs();
        for pid in self.exclusions.all_pids().chain(self.vpn_only.all_pids()) {
            self.cgroup.assign_with_descendants(pid, &parent_procs);
        }
        self.exclusions.clear();
        self.vpn_only.clear();

        self.rules.remove_source_ip_rule(&self.prev_scan.ip_address, BYPASS_TABLE).await;
        self.rules.remove_source_ip_rule(&self.prev_tunnel_local, VPN_ONLY_TABLE).await;
        self.rules.restore_rp_filter().await;

        self.prev_scan = NetworkScan::default();
        self.prev_tunnel_local.clear();

        tracing::info!("split tunnel session shut down");
    }

    pub fn handle_proc_event(&mut self, event: ProcEvent) {
        match event {
            ProcEvent::Exec(pid) => self.add_launched_app(pid),
            ProcEvent::Exit(pid) => self.remove_terminated_app(pid),
            ProcEvent::Ack | ProcEvent::Other => {}
        }
    }

    /// Classify a freshly exec'd PID.
    ///
    /// Exec events of a tracked process's children may arrive in any
    /// order relative to the parent's; the descendant recursion inside
    /// the cgroup writer makes the outcome order-insensitive.
    pub fn add_launched_app(&mut self, pid: Pid) {
        let path = self.proc.path_for_pid(pid);
        if path.is_empty() {
            // already gone, or not resolvable: nothing to classify
            return;
        }

        if self.exclusions.contains_path(&path) && self.prev_scan.is_valid() {
            tracing::debug!(pid, path, "adding launched app to exclusions");
            self.exclusions.add_pid(&path, pid);
            self.cgroup.assign_with_descendants(pid, &self.cgroups.exclusions_procs());
        } else if self.vpn_only.contains_path(&path) {
            tracing::debug!(pid, path, "adding launched app to vpn-only");
            self.vpn_only.add_pid(&path, pid);
            self.cgroup.assign_with_descendants(pid, &self.cgroups.vpn_only_procs());
        }
    }

    /// Forget an exited PID. The kernel has already dropped it from its
    /// cgroup, so only the maps are touched.
    pub fn remove_terminated_app(&mut self, pid: Pid) {
        self.exclusions.remove_pid_everywhere(pid);
        self.vpn_only.remove_pid_everywhere(pid);
    }

    async fn update_network(&mut self, scan: &NetworkScan, tunnel: &TunnelParams) {
        if scan.interface_name != self.prev_scan.interface_name {
            self.rules.update_masquerade(&scan.interface_name);
        }

        // old bindings go first so at most one rule per table survives
        if scan.ip_address != self.prev_scan.ip_address {
            self.rules.remove_source_ip_rule(&self.prev_scan.ip_address, BYPASS_TABLE).await;
            self.rules.add_source_ip_rule(&scan.ip_address, BYPASS_TABLE).await;
        }
        if tunnel.local_address != self.prev_tunnel_local {
            self.rules.remove_source_ip_rule(&self.prev_tunnel_local, VPN_ONLY_TABLE).await;
            self.rules.add_source_ip_rule(&tunnel.local_address, VPN_ONLY_TABLE).await;
        }

        self.rules.update_routes(scan, tunnel).await;

        self.prev_scan = scan.clone();
        self.prev_tunnel_local = tunnel.local_address.clone();
    }

    fn update_apps(&mut self, exclude_apps: &[String], vpn_only_apps: &[String]) {
        // never try to bypass a VPN that is not up
        let desired_exclusions: HashSet<&str> = if self.prev_scan.is_valid() {
            exclude_apps.iter().map(String::as_str).collect()
        } else {
            HashSet::new()
        };
        // a path present in both inputs stays excluded only, keeping the
        // maps disjoint
        let desired_vpn_only: HashSet<&str> = vpn_only_apps
            .iter()
            .map(String::as_str)
            .filter(|path| !desired_exclusions.contains(path))
            .collect();

        let parent_procs = self.cgroups.parent_procs();
        Self::sync_map(
            &self.proc,
            &self.cgroup,
            &mut self.exclusions,
            &desired_exclusions,
            &self.cgroups.exclusions_procs(),
            &parent_procs,
        );
        Self::sync_map(
            &self.proc,
            &self.cgroup,
            &mut self.vpn_only,
            &desired_vpn_only,
            &self.cgroups.vpn_only_procs(),
            &parent_procs,
        );
    }

    /// Bring one map in line with its desired path set: evict removed
    /// paths back to the parent cgroup, then scan `/proc` for PIDs of
    /// newly added paths. Re-running with unchanged inputs is a no-op.
    fn sync_map(
        proc: &P,
        cgroup: &C,
        map: &mut TrackedAppMap,
        desired: &HashSet<&str>,
        target_procs: &Path,
        parent_procs: &Path,
    ) {
        let removed: Vec<String> = map
            .paths()
            .filter(|path| !desired.contains(path.as_str()))
            .cloned()
            .collect();
        for path in removed {
            if let Some(pids) = map.remove_path(&path) {
                tracing::debug!(path, pid_count = pids.len(), "untracking app");
                for pid in pids {
                    cgroup.assign_with_descendants(pid, parent_procs);
                }
            }
        }

        for path in desired {
            if map.contains_path(path) {
                continue;
            }
            map.insert_path(path);
            for pid in proc.pids() {
                if proc.path_for_pid(pid) == *path {
                    tracing::debug!(pid, path, "tracking running app");
                    map.add_pid(path, pid);
                    cgroup.assign_with_descendants(pid, target_procs);
                }
            }
        }
    }
}
