//! Non-process kernel state of a split-tunnel session.
//!
//! [`RuleController`] owns the four pieces of out-of-process state the
//! engine maintains besides cgroup membership:
//!
//! 1. the masquerade anchor for the physical interface,
//! 2. the default routes of the two policy routing tables,
//! 3. the source-IP rules binding an address to a table,
//! 4. the loose reverse-path-filter override for the session.
//!
//! Failed kernel updates are logged and absorbed here: every piece of
//! this state is re-derived on the next reconfiguration, so a transient
//! failure self-heals instead of tearing the session down.

use crate::firewall::{Direction, FirewallOps, FirewallTable};
use crate::params::{NetworkScan, TunnelParams};
use crate::route_cmds::RouteCmdOps;

/// Routing table consulted by traffic that must bypass the tunnel.
pub const BYPASS_TABLE: &str = "vpnbypass";
/// Routing table consulted by traffic that must only use the tunnel.
pub const VPN_ONLY_TABLE: &str = "vpnonly";

/// Mangle anchor translating cgroup membership into packet marks.
pub const TAG_ANCHOR: &str = "100.tagPkts";
/// NAT anchor rewriting the source address of bypassed traffic.
pub const MASQUERADE_ANCHOR: &str = "100.transIp";

/// net_cls classids of the two specialized cgroups. Provisioned together
/// with the hierarchy; the tag anchor matches on them.
const BYPASS_CLASSID: u32 = 0x0011_0011;
const VPN_ONLY_CLASSID: u32 = 0x0012_0012;

/// Packet marks consumed by the policy-routing rules.
const BYPASS_MARK: u32 = 0x3211;
const VPN_ONLY_MARK: u32 = 0x3212;

const RP_FILTER_KEY: &str = "net.ipv4.conf.all.rp_filter";
const RP_FILTER_LOOSE: &str = "2";

/// Content of the packet-tagging anchor, installed once per session.
fn tag_rules() -> Vec<String> {
    vec![
        format!("-m cgroup --cgroup {BYPASS_CLASSID:#010x} -j MARK --set-mark {BYPASS_MARK:#x}"),
        format!("-m cgroup --cgroup {VPN_ONLY_CLASSID:#010x} -j MARK --set-mark {VPN_ONLY_MARK:#x}"),
    ]
}

/// Content of the masquerade anchor for `iface`; empty interface means an
/// empty anchor.
fn masquerade_rules(iface: &str) -> Vec<String> {
    if iface.is_empty() {
        return Vec::new();
    }
    vec![format!("-o {iface} -j MASQUERADE"), "-o tun+ -j MASQUERADE".to_string()]
}

pub struct RuleController<F: FirewallOps, S: RouteCmdOps> {
    firewall: F,
    routes: S,
    saved_rp_filter: Option<String>,
}

impl<F: FirewallOps, S: RouteCmdOps> RuleController<F, S> {
    pub fn new(firewall: F, routes: S) -> Self {
        Self {
            firewall,
            routes,
            saved_rp_filter: None,
        }
    }

    /// Bring up both anchors. The tag anchor gets its session content
    /// immediately; the masquerade anchor stays empty until the first
    /// network scan arrives.
    pub fn enable_anchors(&self) {
        if let Err(error) =
            self.firewall
                .set_anchor_enabled(Direction::Outbound, TAG_ANCHOR, true, FirewallTable::Mangle)
        {
            tracing::warn!(%error, "failed to enable packet tagging anchor");
        }
        if let Err(error) =
            self.firewall
                .replace_anchor(Direction::Outbound, TAG_ANCHOR, &tag_rules(), FirewallTable::Mangle)
        {
            tracing::warn!(%error, "failed to install packet tagging rules");
        }
        if let Err(error) =
            self.firewall
                .set_anchor_enabled(Direction::Outbound, MASQUERADE_ANCHOR, true, FirewallTable::Nat)
        {
            tracing::warn!(%error, "failed to enable masquerade anchor");
        }
    }

    pub fn disable_anchors(&self) {
        for (name, table) in [(TAG_ANCHOR, FirewallTable::Mangle), (MASQUERADE_ANCHOR, FirewallTable::Nat)] {
            if let Err(error) = self.firewall.set_anchor_enabled(Direction::Outbound, name, false, table) {
                tracing::warn!(%error, anchor = name, "failed to disable anchor");
            }
        }
    }

    /// Swap the masquerade anchor content for a new physical interface.
    pub fn update_masquerade(&self, iface: &str) {
        let rules = masquerade_rules(iface);
        tracing::debug!(iface, rule_count = rules.len(), "replacing masquerade anchor");
        if let Err(error) =
            self.firewall
                .replace_anchor(Direction::Outbound, MASQUERADE_ANCHOR, &rules, FirewallTable::Nat)
        {
            tracing::warn!(%error, iface, "failed to replace masquerade anchor");
        }
    }

    /// Reinstall the default routes of both tables from the current scan
    /// and tunnel data. A table whose inputs are incomplete is left
    /// untouched; `replace` semantics make redundant updates harmless.
    pub async fn update_routes(&self, scan: &NetworkScan, tunnel: &TunnelParams) {
        let mut changed = false;

        if scan.is_valid() {
            tracing::debug!(
                "ip route replace default via {} dev {} table {BYPASS_TABLE}",
                scan.gateway_ip,
                scan.interface_name
            );
            match self
                .routes
                .replace_default_route(&scan.gateway_ip, &scan.interface_name, BYPASS_TABLE)
                .await
            {
                Ok(()) => changed = true,
                Err(error) => tracing::warn!(%error, "failed to update bypass default route"),
            }
        }

        if !tunnel.device_name.is_empty() && !tunnel.remote_address.is_empty() {
            tracing::debug!(
                "ip route replace default via {} dev {} table {VPN_ONLY_TABLE}",
                tunnel.remote_address,
                tunnel.device_name
            );
            match self
                .routes
                .replace_default_route(&tunnel.remote_address, &tunnel.device_name, VPN_ONLY_TABLE)
                .await
            {
                Ok(()) => changed = true,
                Err(error) => tracing::warn!(%error, "failed to update vpn-only default route"),
            }
        }

        if changed {
            if let Err(error) = self.routes.flush_route_cache().await {
                tracing::warn!(%error, "failed to flush route cache");
            }
        }
    }

    /// Bind `source_ip` to `table`. Empty address is a no-op.
    pub async fn add_source_ip_rule(&self, source_ip: &str, table: &str) {
        if source_ip.is_empty() {
            return;
        }
        tracing::debug!("ip rule add from {source_ip} lookup {table}");
        if let Err(error) = self.routes.add_source_rule(source_ip, table).await {
            tracing::warn!(%error, source_ip, table, "failed to add source ip rule");
        }
    }

    pub async fn remove_source_ip_rule(&self, source_ip: &str, table: &str) {
        if source_ip.is_empty() {
            return;
        }
        tracing::debug!("ip rule del from {source_ip} lookup {table}");
        if let Err(error) = self.routes.del_source_rule(source_ip, table).await {
            tracing::debug!(%error, source_ip, table, "source ip rule removal failed (may be gone already)");
        }
    }

    /// Switch reverse-path filtering to loose mode for the session.
    ///
    /// Bypassed packets leave the physical interface with a source
    /// address that does not match the tunnel default route; strict RPF
    /// would drop the replies.
    pub async fn enable_loose_rp_filter(&mut self) {
        let current = match self.routes.sysctl_read(RP_FILTER_KEY).await {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(%error, "unable to read rp_filter, leaving it unchanged");
                return;
            }
        };
        if current.trim() == RP_FILTER_LOOSE {
            return;
        }
        if let Err(error) = self.routes.sysctl_write(RP_FILTER_KEY, RP_FILTER_LOOSE).await {
            tracing::warn!(%error, "failed to set rp_filter to loose mode");
            return;
        }
        self.saved_rp_filter = Some(current);
    }

    /// Write the saved value back verbatim, even if the system value
    /// changed out-of-band during the session.
    pub async fn restore_rp_filter(&mut self) {
        if let Some(saved) = self.saved_rp_filter.take() {
            if let Err(error) = self.routes.sysctl_write(RP_FILTER_KEY, &saved).await {
                tracing::warn!(%error, saved, "failed to restore rp_filter");
            }
        }
    }
}
