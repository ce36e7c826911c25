use super::{Kernel, PolicyRule, Route, RuleRef};
use crate::error::KernelError;
use crate::interval::IntervalSet;
use crate::ruleset::{AddrFamily, Batch, ChainType, Command, Hook, Rule, TableFamily, TableId};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryChain {
    pub base: Option<(ChainType, Hook, i32)>,
    /// Rules in evaluation order, each with its kernel handle
    pub rules: Vec<(u64, Rule)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTable {
    pub chains: IndexMap<String, MemoryChain>,
    pub sets: IndexMap<String, IntervalSet>,
}

/// Whole kernel state held by [`MemoryKernel`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryState {
    pub tables: IndexMap<TableId, MemoryTable>,
    pub routes: Vec<Route>,
    pub policy_rules: Vec<PolicyRule>,
    pub links: Vec<String>,
    /// Successfully applied netfilter transactions
    pub transactions: usize,
    /// Every successful state-changing call, netfilter or routing
    pub mutations: usize,
    next_handle: u64,
}

/// In-memory kernel used by tests
///
/// Batches are replayed against a copy of the state and only committed when
/// every command succeeds, matching the all-or-nothing behaviour of `nft -f`.
#[derive(Debug, Default)]
pub struct MemoryKernel {
    state: Mutex<MemoryState>,
    failures: Mutex<Failures>,
}

/// Injected faults
#[derive(Debug, Default)]
struct Failures {
    tables: HashSet<String>,
    families: HashSet<AddrFamily>,
    teardown: bool,
}

impl MemoryKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kernel with the given network links present
    pub fn with_links(links: &[&str]) -> Self {
        let kernel = Self::new();
        for link in links {
            kernel.add_link(link);
        }
        kernel
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_link(&self, name: &str) {
        let mut state = self.lock();
        if !state.links.iter().any(|l| l == name) {
            state.links.push(name.to_string());
        }
    }

    pub fn remove_link(&self, name: &str) {
        self.lock().links.retain(|l| l != name);
    }

    fn failures(&self) -> MutexGuard<'_, Failures> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every batch touching the named table fail
    pub fn fail_table(&self, name: &str) {
        self.failures().tables.insert(name.to_string());
    }

    /// Reject routes and policy rules of one address family, like a host
    /// with that family disabled
    pub fn fail_family(&self, family: AddrFamily) {
        self.failures().families.insert(family);
    }

    /// Fail batches made only of deletions while letting setup batches through
    pub fn fail_teardown(&self) {
        self.failures().teardown = true;
    }

    pub fn clear_failures(&self) {
        *self.failures() = Failures::default();
    }

    /// Install an `inet fw4` table the way a host-managed firewall would
    pub fn seed_host_firewall(&self) {
        let mut state = self.lock();
        let table = state
            .tables
            .entry(TableId::new(TableFamily::Inet, "fw4"))
            .or_default();
        for (name, hook) in [
            ("forward", Hook::Forward),
            ("input", Hook::Input),
            ("srcnat", Hook::Postrouting),
        ] {
            table.chains.entry(name.to_string()).or_insert(MemoryChain {
                base: Some((ChainType::Filter, hook, 0)),
                rules: Vec::new(),
            });
        }
    }

    pub fn snapshot(&self) -> MemoryState {
        self.lock().clone()
    }

    pub fn has_table(&self, family: TableFamily, name: &str) -> bool {
        self.lock()
            .tables
            .contains_key(&TableId::new(family, name))
    }

    /// Rules of one chain, without handles
    pub fn rules_in(&self, family: TableFamily, table: &str, chain: &str) -> Vec<Rule> {
        self.lock()
            .tables
            .get(&TableId::new(family, table))
            .and_then(|t| t.chains.get(chain))
            .map(|c| c.rules.iter().map(|(_, r)| r.clone()).collect())
            .unwrap_or_default()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.lock().routes.clone()
    }

    pub fn policy_rules(&self) -> Vec<PolicyRule> {
        self.lock().policy_rules.clone()
    }

    pub fn mutations(&self) -> usize {
        self.lock().mutations
    }

    fn check_failure(&self, batch: &Batch) -> Result<(), KernelError> {
        let failures = self.failures();
        let teardown_only = batch
            .commands()
            .iter()
            .all(|c| matches!(c, Command::DestroyTable(_) | Command::DeleteRule { .. }));
        for command in batch.commands() {
            let table = command_table(command);
            if failures.tables.contains(&table.name) || (failures.teardown && teardown_only) {
                return Err(KernelError::Command {
                    program: "nft".to_string(),
                    args: "-f -".to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: format!("Error: injected failure for table {}", table),
                });
            }
        }
        Ok(())
    }

    fn check_family(&self, family: AddrFamily) -> Result<(), KernelError> {
        if self.failures().families.contains(&family) {
            return Err(KernelError::Command {
                program: "ip".to_string(),
                args: format!("{:?} route", family),
                status: "exit status: 2".to_string(),
                stderr: "RTNETLINK answers: Address family not supported by protocol".to_string(),
            });
        }
        Ok(())
    }
}

fn command_table(command: &Command) -> &TableId {
    match command {
        Command::AddTable(t)
        | Command::DestroyTable(t)
        | Command::AddChain(t, _)
        | Command::AddSet(t, _) => t,
        Command::AddRule { table, .. }
        | Command::InsertRule { table, .. }
        | Command::DeleteRule { table, .. } => table,
    }
}

fn missing(what: impl std::fmt::Display) -> KernelError {
    KernelError::NotFound(what.to_string())
}

fn replay(state: &mut MemoryState, command: &Command) -> Result<(), KernelError> {
    match command {
        Command::AddTable(table) => {
            state.tables.entry(table.clone()).or_default();
        }
        Command::DestroyTable(table) => {
            state.tables.shift_remove(table);
        }
        Command::AddChain(table, chain) => {
            let t = state
                .tables
                .get_mut(table)
                .ok_or_else(|| missing(format!("table {}", table)))?;
            t.chains.entry(chain.name.clone()).or_insert(MemoryChain {
                base: chain.base,
                rules: Vec::new(),
            });
        }
        Command::AddSet(table, set) => {
            let t = state
                .tables
                .get_mut(table)
                .ok_or_else(|| missing(format!("table {}", table)))?;
            let merged = match t.sets.get(&set.name) {
                Some(existing) => {
                    let mut intervals = existing.intervals().to_vec();
                    intervals.extend_from_slice(set.elements.intervals());
                    IntervalSet::from_intervals(set.elements.family(), intervals)
                }
                None => set.elements.clone(),
            };
            t.sets.insert(set.name.clone(), merged);
        }
        Command::AddRule { table, chain, rule } | Command::InsertRule { table, chain, rule } => {
            let handle = state.next_handle + 1;
            let c = state
                .tables
                .get_mut(table)
                .and_then(|t| t.chains.get_mut(chain))
                .ok_or_else(|| missing(format!("chain {} {}", table, chain)))?;
            if matches!(command, Command::InsertRule { .. }) {
                c.rules.insert(0, (handle, rule.clone()));
            } else {
                c.rules.push((handle, rule.clone()));
            }
            state.next_handle = handle;
        }
        Command::DeleteRule {
            table,
            chain,
            handle,
        } => {
            let c = state
                .tables
                .get_mut(table)
                .and_then(|t| t.chains.get_mut(chain))
                .ok_or_else(|| missing(format!("chain {} {}", table, chain)))?;
            let before = c.rules.len();
            c.rules.retain(|(h, _)| h != handle);
            if c.rules.len() == before {
                return Err(missing(format!("rule handle {}", handle)));
            }
        }
    }
    Ok(())
}

impl Kernel for MemoryKernel {
    fn apply(&self, batch: &Batch) -> Result<(), KernelError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.check_failure(batch)?;

        let mut state = self.lock();
        let mut next = state.clone();
        for command in batch.commands() {
            replay(&mut next, command)?;
        }
        next.transactions += 1;
        next.mutations += 1;
        *state = next;
        Ok(())
    }

    fn list_tables(&self) -> Result<Vec<TableId>, KernelError> {
        Ok(self.lock().tables.keys().cloned().collect())
    }

    fn list_chains(&self, table: &TableId) -> Result<Vec<String>, KernelError> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.chains.keys().cloned().collect())
            .ok_or_else(|| missing(format!("table {}", table)))
    }

    fn list_rules(&self, table: &TableId) -> Result<Vec<RuleRef>, KernelError> {
        let state = self.lock();
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| missing(format!("table {}", table)))?;
        Ok(t.chains
            .iter()
            .flat_map(|(name, chain)| {
                chain.rules.iter().map(move |(handle, rule)| RuleRef {
                    chain: name.clone(),
                    handle: *handle,
                    comment: rule.comment.clone(),
                })
            })
            .collect())
    }

    fn link_exists(&self, name: &str) -> bool {
        self.lock().links.iter().any(|l| l == name)
    }

    fn route_add(&self, route: &Route) -> Result<(), KernelError> {
        self.check_family(route.family)?;
        let mut state = self.lock();
        if state
            .routes
            .iter()
            .any(|r| r.family == route.family && r.table == route.table)
        {
            return Err(KernelError::AlreadyExists(format!("route {}", route)));
        }
        state.routes.push(route.clone());
        state.mutations += 1;
        Ok(())
    }

    fn route_replace(&self, route: &Route) -> Result<(), KernelError> {
        self.check_family(route.family)?;
        let mut state = self.lock();
        state
            .routes
            .retain(|r| !(r.family == route.family && r.table == route.table));
        state.routes.push(route.clone());
        state.mutations += 1;
        Ok(())
    }

    fn route_flush(&self, family: AddrFamily, table: u32) -> Result<(), KernelError> {
        self.check_family(family)?;
        let mut state = self.lock();
        let before = state.routes.len();
        state
            .routes
            .retain(|r| !(r.family == family && r.table == table));
        if state.routes.len() != before {
            state.mutations += 1;
        }
        Ok(())
    }

    fn rule_add(&self, rule: &PolicyRule) -> Result<(), KernelError> {
        self.check_family(rule.family)?;
        // the kernel accepts duplicate policy rules
        let mut state = self.lock();
        state.policy_rules.push(*rule);
        state.mutations += 1;
        Ok(())
    }

    fn rule_del(&self, rule: &PolicyRule) -> Result<(), KernelError> {
        self.check_family(rule.family)?;
        let mut state = self.lock();
        match state.policy_rules.iter().position(|r| r == rule) {
            Some(index) => {
                state.policy_rules.remove(index);
                state.mutations += 1;
                Ok(())
            }
            None => Err(KernelError::NotFound(format!("rule {}", rule))),
        }
    }
}
