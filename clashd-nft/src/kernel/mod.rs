//! Kernel configuration channel
//!
//! Everything the engines do to live kernel state goes through [`Kernel`]:
//! netfilter transactions, ruleset listing, policy rules, routes and link
//! lookups. [`SystemKernel`] drives the host through `nft` and `ip`;
//! [`MemoryKernel`] keeps the same state in memory for tests.

mod memory;
mod system;

pub use memory::{MemoryChain, MemoryKernel, MemoryState, MemoryTable};
pub use system::SystemKernel;

use crate::error::KernelError;
use crate::ruleset::{AddrFamily, Batch, TableId};
use std::fmt;

/// Kind of route installed into a policy routing table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// `local` route: deliver to this host (TPROXY)
    Local,
    /// Plain unicast route through a device (TUN)
    Unicast,
}

/// Default route in a dedicated table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub family: AddrFamily,
    pub table: u32,
    pub kind: RouteKind,
    pub device: String,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RouteKind::Local => "local ",
            RouteKind::Unicast => "",
        };
        write!(
            f,
            "{}default dev {} table {}",
            kind, self.device, self.table
        )
    }
}

/// fwmark-selected routing rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyRule {
    pub family: AddrFamily,
    pub fwmark: u32,
    pub mask: u32,
    pub table: u32,
    pub priority: u32,
}

impl fmt::Display for PolicyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fwmark {:#x}/{:#x} table {} priority {}",
            self.fwmark, self.mask, self.table, self.priority
        )
    }
}

/// A rule as listed back from the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRef {
    pub chain: String,
    pub handle: u64,
    pub comment: Option<String>,
}

pub trait Kernel: Send + Sync {
    /// Apply all commands of a batch as one transaction
    fn apply(&self, batch: &Batch) -> Result<(), KernelError>;

    fn list_tables(&self) -> Result<Vec<TableId>, KernelError>;

    fn list_chains(&self, table: &TableId) -> Result<Vec<String>, KernelError>;

    fn list_rules(&self, table: &TableId) -> Result<Vec<RuleRef>, KernelError>;

    fn link_exists(&self, name: &str) -> bool;

    fn route_add(&self, route: &Route) -> Result<(), KernelError>;

    fn route_replace(&self, route: &Route) -> Result<(), KernelError>;

    /// Remove every route of `family` in `table`
    fn route_flush(&self, family: AddrFamily, table: u32) -> Result<(), KernelError>;

    fn rule_add(&self, rule: &PolicyRule) -> Result<(), KernelError>;

    fn rule_del(&self, rule: &PolicyRule) -> Result<(), KernelError>;

    fn table_exists(&self, table: &TableId) -> Result<bool, KernelError> {
        Ok(self.list_tables()?.iter().any(|t| t == table))
    }
}
