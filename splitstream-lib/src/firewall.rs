//! Netfilter anchor facility.
//!
//! An anchor is a named, replaceable slot inside the daemon's ruleset:
//! enabling it creates a dedicated chain plus a jump from the built-in
//! chain, and replacing it swaps the chain's content in one flush+refill
//! pass. Rule content is expressed as plain `iptables` rule strings.
//!
//! Defines the [`FirewallOps`] trait consumed by the rule controller.
//! Production code uses [`IptablesAnchors`] backed by the `iptables`
//! crate. Tests use stateful mocks (see the `mocks` module).

use thiserror::Error;

/// Traffic direction of an anchor's built-in parent chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Netfilter table an anchor lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FirewallTable {
    Mangle,
    Nat,
}

impl FirewallTable {
    fn table_name(self) -> &'static str {
        match self {
            FirewallTable::Mangle => "mangle",
            FirewallTable::Nat => "nat",
        }
    }

    fn parent_chain(self, direction: Direction) -> &'static str {
        match (self, direction) {
            (FirewallTable::Mangle, Direction::Outbound) => "OUTPUT",
            (FirewallTable::Mangle, Direction::Inbound) => "PREROUTING",
            (FirewallTable::Nat, Direction::Outbound) => "POSTROUTING",
            (FirewallTable::Nat, Direction::Inbound) => "PREROUTING",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("iptables error: {0}")]
    Iptables(String),
}

/// Abstraction over the anchor facility.
pub trait FirewallOps: Send + Sync {
    /// Create or remove the anchor chain and its jump rule.
    /// Disabling also drops the anchor's content.
    fn set_anchor_enabled(
        &self,
        direction: Direction,
        name: &str,
        enabled: bool,
        table: FirewallTable,
    ) -> Result<(), Error>;

    /// Atomically (from netfilter's viewpoint) swap the anchor's rules.
    /// The anchor must be enabled first.
    fn replace_anchor(
        &self,
        direction: Direction,
        name: &str,
        rules: &[String],
        table: FirewallTable,
    ) -> Result<(), Error>;
}

/// Chain-name prefix separating our anchors from everything else.
const CHAIN_PREFIX: &str = "SPST";

/// Production [`FirewallOps`] backed by the `iptables` crate.
pub struct IptablesAnchors {
    inner: iptables::IPTables,
}

impl IptablesAnchors {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            inner: iptables::new(false).map_err(|e| Error::Iptables(e.to_string()))?,
        })
    }

    fn chain_name(name: &str) -> String {
        format!("{CHAIN_PREFIX}.{name}")
    }

    fn ensure_chain(&self, table: &str, chain: &str) -> Result<(), Error> {
        let exists = self
            .inner
            .chain_exists(table, chain)
            .map_err(|e| Error::Iptables(e.to_string()))?;
        if !exists {
            self.inner
                .new_chain(table, chain)
                .map_err(|e| Error::Iptables(e.to_string()))?;
        }
        Ok(())
    }
}

impl FirewallOps for IptablesAnchors {
    fn set_anchor_enabled(
        &self,
        direction: Direction,
        name: &str,
        enabled: bool,
        table: FirewallTable,
    ) -> Result<(), Error> {
        let table_name = table.table_name();
        let parent = table.parent_chain(direction);
        let chain = Self::chain_name(name);
        let jump = format!("-j {chain}");

        if enabled {
            self.ensure_chain(table_name, &chain)?;
            let jumped = self
                .inner
                .exists(table_name, parent, &jump)
                .map_err(|e| Error::Iptables(e.to_string()))?;
            if !jumped {
                self.inner
                    .append(table_name, parent, &jump)
                    .map_err(|e| Error::Iptables(e.to_string()))?;
            }
        } else {
            let jumped = self
                .inner
                .exists(table_name, parent, &jump)
                .map_err(|e| Error::Iptables(e.to_string()))?;
            if jumped {
                self.inner
                    .delete(table_name, parent, &jump)
                    .map_err(|e| Error::Iptables(e.to_string()))?;
            }
            let chained = self
                .inner
                .chain_exists(table_name, &chain)
                .map_err(|e| Error::Iptables(e.to_string()))?;
            if chained {
                self.inner
                    .flush_chain(table_name, &chain)
                    .map_err(|e| Error::Iptables(e.to_string()))?;
                self.inner
                    .delete_chain(table_name, &chain)
                    .map_err(|e| Error::Iptables(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn replace_anchor(
        &self,
        _direction: Direction,
        name: &str,
        rules: &[String],
        table: FirewallTable,
    ) -> Result<(), Error> {
        let table_name = table.table_name();
        let chain = Self::chain_name(name);

        self.ensure_chain(table_name, &chain)?;
        self.inner
            .flush_chain(table_name, &chain)
            .map_err(|e| Error::Iptables(e.to_string()))?;
        for rule in rules {
            self.inner
                .append(table_name, &chain, rule)
                .map_err(|e| Error::Iptables(e.to_string()))?;
        }
        Ok(())
    }
}
