//! Stateful mocks for the engine's kernel seams.
//!
//! These mocks track actual state (process table, cgroup assignments,
//! anchors, routes and rules that exist) rather than just verifying call
//! sequences, so tests can assert on the system's _state_ after a
//! lifecycle operation.
//!
//! All mocks use `Arc<Mutex<_>>` for interior mutability in async
//! contexts, and a `fail_on` map for error injection where failure
//! behavior matters.

#![cfg(test)]

use async_trait::async_trait;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::cgroup::CgroupOps;
use crate::firewall::{Direction, Error as FirewallError, FirewallOps, FirewallTable};
use crate::procfs::{Pid, ProcOps, descendants_with};
use crate::route_cmds::RouteCmdOps;
use crate::shell::Error as ShellError;

// ============================================================================
// MockProcOps
// ============================================================================

#[derive(Debug, Default)]
pub struct ProcEntry {
    pub path: String,
    pub ppid: Option<Pid>,
}

#[derive(Debug, Default)]
pub struct ProcState {
    pub procs: HashMap<Pid, ProcEntry>,
}

#[derive(Clone, Default)]
pub struct MockProcOps {
    pub state: Arc<Mutex<ProcState>>,
}

impl MockProcOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_process(&self, pid: Pid, path: &str, ppid: Option<Pid>) {
        self.state.lock().unwrap().procs.insert(
            pid,
            ProcEntry {
                path: path.to_string(),
                ppid,
            },
        );
    }

    pub fn remove_process(&self, pid: Pid) {
        self.state.lock().unwrap().procs.remove(&pid);
    }
}

impl ProcOps for MockProcOps {
    fn pids(&self) -> Vec<Pid> {
        self.state.lock().unwrap().procs.keys().copied().collect()
    }

    fn path_for_pid(&self, pid: Pid) -> String {
        self.state
            .lock()
            .unwrap()
            .procs
            .get(&pid)
            .map(|entry| entry.path.clone())
            .unwrap_or_default()
    }

    fn parent_pid_of(&self, pid: Pid) -> Option<Pid> {
        self.state.lock().unwrap().procs.get(&pid).and_then(|entry| entry.ppid)
    }

    fn descendants_of(&self, pid: Pid) -> Vec<Pid> {
        descendants_with(self, pid)
    }
}

// ============================================================================
// MockCgroupOps
// ============================================================================

#[derive(Debug, Default)]
pub struct CgroupState {
    /// Current procs file each PID was last written into.
    pub assignments: HashMap<Pid, PathBuf>,
    /// Every write in order, for no-touch assertions.
    pub log: Vec<(Pid, PathBuf)>,
}

/// Mirrors the production writer's descendant recursion against the mock
/// process table.
#[derive(Clone)]
pub struct MockCgroupOps {
    proc: MockProcOps,
    pub state: Arc<Mutex<CgroupState>>,
}

impl MockCgroupOps {
    pub fn new(proc: MockProcOps) -> Self {
        Self {
            proc,
            state: Arc::new(Mutex::new(CgroupState::default())),
        }
    }

    pub fn pids_in(&self, procs_file: &Path) -> HashSet<Pid> {
        self.state
            .lock()
            .unwrap()
            .assignments
            .iter()
            .filter(|(_, path)| path.as_path() == procs_file)
            .map(|(pid, _)| *pid)
            .collect()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().unwrap().log.len()
    }
}

impl CgroupOps for MockCgroupOps {
    fn assign_with_descendants(&self, pid: Pid, procs_file: &Path) {
        let mut members = vec![pid];
        members.extend(self.proc.descendants_of(pid));

        let mut state = self.state.lock().unwrap();
        for member in members {
            state.assignments.insert(member, procs_file.to_path_buf());
            state.log.push((member, procs_file.to_path_buf()));
        }
    }
}

// ============================================================================
// MockFirewallOps
// ============================================================================

#[derive(Debug, Default)]
pub struct FirewallState {
    pub enabled: HashSet<(FirewallTable, String)>,
    pub contents: HashMap<(FirewallTable, String), Vec<String>>,
    /// Map of operation name -> error message. If set, the operation fails.
    pub fail_on: HashMap<String, String>,
}

impl FirewallState {
    fn check_fail(&self, op: &str) -> Result<(), FirewallError> {
        match self.fail_on.get(op) {
            Some(msg) => Err(FirewallError::Iptables(msg.clone())),
            None => Ok(()),
        }
    }

    pub fn is_enabled(&self, table: FirewallTable, name: &str) -> bool {
        self.enabled.contains(&(table, name.to_string()))
    }

    pub fn anchor_rules(&self, table: FirewallTable, name: &str) -> Vec<String> {
        self.contents.get(&(table, name.to_string())).cloned().unwrap_or_default()
    }
}

#[derive(Clone, Default)]
pub struct MockFirewallOps {
    pub state: Arc<Mutex<FirewallState>>,
}

impl MockFirewallOps {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FirewallOps for MockFirewallOps {
    fn set_anchor_enabled(
        &self,
        _direction: Direction,
        name: &str,
        enabled: bool,
        table: FirewallTable,
    ) -> Result<(), FirewallError> {
        let mut state = self.state.lock().unwrap();
        state.check_fail("set_anchor_enabled")?;
        if enabled {
            state.enabled.insert((table, name.to_string()));
        } else {
            state.enabled.remove(&(table, name.to_string()));
            state.contents.remove(&(table, name.to_string()));
        }
        Ok(())
    }

    fn replace_anchor(
        &self,
        _direction: Direction,
        name: &str,
        rules: &[String],
        table: FirewallTable,
    ) -> Result<(), FirewallError> {
        let mut state = self.state.lock().unwrap();
        state.check_fail("replace_anchor")?;
        state.contents.insert((table, name.to_string()), rules.to_vec());
        Ok(())
    }
}

// ============================================================================
// MockRouteCmdOps
// ============================================================================

#[derive(Debug, Default)]
pub struct RouteCmdState {
    /// table -> (gateway, device)
    pub routes: HashMap<String, (String, String)>,
    /// (source ip, table) in install order
    pub source_rules: Vec<(String, String)>,
    pub sysctls: HashMap<String, String>,
    pub flush_count: usize,
    /// Every command in call order, for ordering assertions.
    pub log: Vec<String>,
    /// Map of operation name -> anything. If set, the operation fails.
    pub fail_on: HashMap<String, String>,
}

impl RouteCmdState {
    fn check_fail(&self, op: &str) -> Result<(), ShellError> {
        match self.fail_on.get(op) {
            Some(_) => Err(ShellError::CommandFailed),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Default)]
pub struct MockRouteCmdOps {
    pub state: Arc<Mutex<RouteCmdState>>,
}

impl MockRouteCmdOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sysctl(&self, key: &str, value: &str) {
        self.state.lock().unwrap().sysctls.insert(key.to_string(), value.to_string());
    }

    pub fn sysctl(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().sysctls.get(key).cloned()
    }

    pub fn rules_for_table(&self, table: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .source_rules
            .iter()
            .filter(|(_, t)| t == table)
            .map(|(ip, _)| ip.clone())
            .collect()
    }
}

#[async_trait]
impl RouteCmdOps for MockRouteCmdOps {
    async fn replace_default_route(&self, gateway: &str, device: &str, table: &str) -> Result<(), ShellError> {
        let mut state = self.state.lock().unwrap();
        state.check_fail("replace_default_route")?;
        state.log.push(format!("route_replace {table} via {gateway} dev {device}"));
        state.routes.insert(table.to_string(), (gateway.to_string(), device.to_string()));
        Ok(())
    }

    async fn flush_route_cache(&self) -> Result<(), ShellError> {
        let mut state = self.state.lock().unwrap();
        state.check_fail("flush_route_cache")?;
        state.log.push("route_flush_cache".to_string());
        state.flush_count += 1;
        Ok(())
    }

    async fn add_source_rule(&self, source_ip: &str, table: &str) -> Result<(), ShellError> {
        let mut state = self.state.lock().unwrap();
        state.check_fail("add_source_rule")?;
        state.log.push(format!("rule_add {source_ip} {table}"));
        state.source_rules.push((source_ip.to_string(), table.to_string()));
        Ok(())
    }

    async fn del_source_rule(&self, source_ip: &str, table: &str) -> Result<(), ShellError> {
        let mut state = self.state.lock().unwrap();
        state.check_fail("del_source_rule")?;
        state.log.push(format!("rule_del {source_ip} {table}"));
        state.source_rules.retain(|(ip, t)| !(ip == source_ip && t == table));
        Ok(())
    }

    async fn sysctl_read(&self, key: &str) -> Result<String, ShellError> {
        let state = self.state.lock().unwrap();
        state.check_fail("sysctl_read")?;
        state.sysctls.get(key).cloned().ok_or(ShellError::CommandFailed)
    }

    async fn sysctl_write(&self, key: &str, value: &str) -> Result<(), ShellError> {
        let mut state = self.state.lock().unwrap();
        state.check_fail("sysctl_write")?;
        state.log.push(format!("sysctl_write {key}={value}"));
        state.sysctls.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
