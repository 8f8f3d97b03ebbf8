//! Abstraction over the `ip`/`sysctl` shell invocations used for policy
//! routing:
//! - `ip route replace default via <gw> dev <if> table <name>`
//! - `ip route flush cache`
//! - `ip rule add/del from <ip> lookup <table> pri <prio>`
//! - `sysctl -n|-w <key>[=<value>]`
//!
//! Production code uses [`RealRouteCmdOps`].
//! Tests use stateful mocks (see the `mocks` module).

use async_trait::async_trait;
use tokio::process::Command;

use crate::shell::{Error, Logs, ShellCommandExt};

/// Priority of the source-IP policy rules, below the kernel's local-table
/// rule and above the main-table lookup.
pub const SOURCE_RULE_PRIORITY: u32 = 101;

/// Abstraction over route, rule and sysctl commands.
#[async_trait]
pub trait RouteCmdOps: Send + Sync {
    /// Idempotently install the default route of a named routing table.
    async fn replace_default_route(&self, gateway: &str, device: &str, table: &str) -> Result<(), Error>;

    /// Flush the kernel route cache after a table change.
    async fn flush_route_cache(&self) -> Result<(), Error>;

    /// Bind packets with source address `source_ip` to `table`.
    async fn add_source_rule(&self, source_ip: &str, table: &str) -> Result<(), Error>;

    /// Remove a previously installed source-address binding.
    async fn del_source_rule(&self, source_ip: &str, table: &str) -> Result<(), Error>;

    async fn sysctl_read(&self, key: &str) -> Result<String, Error>;

    async fn sysctl_write(&self, key: &str, value: &str) -> Result<(), Error>;
}

/// Production [`RouteCmdOps`] that executes real shell commands.
#[derive(Clone)]
pub struct RealRouteCmdOps;

#[async_trait]
impl RouteCmdOps for RealRouteCmdOps {
    async fn replace_default_route(&self, gateway: &str, device: &str, table: &str) -> Result<(), Error> {
        Command::new("ip")
            .args(["route", "replace", "default", "via", gateway, "dev", device, "table", table])
            .run(Logs::Print)
            .await
    }

    async fn flush_route_cache(&self) -> Result<(), Error> {
        Command::new("ip").args(["route", "flush", "cache"]).run(Logs::Print).await
    }

    async fn add_source_rule(&self, source_ip: &str, table: &str) -> Result<(), Error> {
        Command::new("ip")
            .args(["rule", "add", "from", source_ip, "lookup", table])
            .args(["pri", &SOURCE_RULE_PRIORITY.to_string()])
            .run(Logs::Print)
            .await
    }

    async fn del_source_rule(&self, source_ip: &str, table: &str) -> Result<(), Error> {
        // the rule may legitimately be gone already
        Command::new("ip")
            .args(["rule", "del", "from", source_ip, "lookup", table])
            .args(["pri", &SOURCE_RULE_PRIORITY.to_string()])
            .run(Logs::Suppress)
            .await
    }

    async fn sysctl_read(&self, key: &str) -> Result<String, Error> {
        Command::new("sysctl").arg("-n").arg(key).run_stdout(Logs::Print).await
    }

    async fn sysctl_write(&self, key: &str, value: &str) -> Result<(), Error> {
        Command::new("sysctl")
            .arg("-w")
            .arg(format!("{key}={value}"))
            .run(Logs::Print)
            .await
    }
}
