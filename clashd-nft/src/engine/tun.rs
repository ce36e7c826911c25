//! Mark-based steering of traffic into the TUN device
//!
//! Packets that should reach the proxy core get fwmark 200; the policy rule
//! installed by [`PolicyRoutingManager`] routes them through table 200,
//! whose only route points at the TUN device.
//!
//! When the host runs fw4 its forward/input/srcnat chains would drop or
//! masquerade TUN traffic, so tagged accept rules are put at their head.

use crate::error::{Result, RoutingError};
use crate::kernel::Kernel;
use crate::mode::Protocols;
use crate::policy_route::{DeviceWait, PolicyRoutingManager, TUN_MARK};
use crate::ruleset::{
    AddrFamily, Batch, Chain, ChainType, Hook, L4Proto, Match, Rule, Statement, TableFamily,
    TableId, PRIORITY_MANGLE,
};
use ipnet::IpNet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const TUN_TABLE: &str = "clashd_tun";

pub const PREROUTING_CHAIN: &str = "prerouting";
pub const OUTPUT_CHAIN: &str = "output";

pub const HOST_FIREWALL_TABLE: &str = "fw4";

/// Every cooperating rule's comment starts with this
pub const HOST_RULE_TAG: &str = "clashd TUN";

const TAG_FORWARD_OUT: &str = "clashd TUN Forward Out";
const TAG_FORWARD_IN: &str = "clashd TUN Forward In";
const TAG_INPUT: &str = "clashd TUN Input";
const TAG_POSTROUTING: &str = "clashd TUN Postrouting";

const HOST_CHAINS: [&str; 3] = ["forward", "input", "srcnat"];

const PRIVATE_NETS: [&str; 4] = ["127.0.0.0/8", "10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

/// Where the TUN filter rules live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallBackend {
    /// Only our own marking table
    Standalone,
    /// fw4 is present and gets cooperating rules in its chains
    HostManaged,
}

pub fn table() -> TableId {
    TableId::new(TableFamily::Ip, TUN_TABLE)
}

pub fn host_table() -> TableId {
    TableId::new(TableFamily::Inet, HOST_FIREWALL_TABLE)
}

pub struct TunMarkEngine {
    kernel: Arc<dyn Kernel>,
    routing: PolicyRoutingManager,
}

impl TunMarkEngine {
    pub fn new(kernel: Arc<dyn Kernel>) -> Self {
        Self {
            routing: PolicyRoutingManager::new(kernel.clone()),
            kernel,
        }
    }

    pub fn with_device_wait(mut self, wait: DeviceWait) -> Self {
        self.routing = self.routing.with_device_wait(wait);
        self
    }

    pub fn detect_backend(&self) -> Result<FirewallBackend> {
        if self.kernel.table_exists(&host_table())? {
            Ok(FirewallBackend::HostManaged)
        } else {
            Ok(FirewallBackend::Standalone)
        }
    }

    /// Ruleset for `backend`. For the host-managed backend stale tagged rules
    /// are deleted in the same transaction before fresh ones are inserted.
    pub fn build(
        &self,
        backend: FirewallBackend,
        protocols: Protocols,
        device: &str,
    ) -> Result<Batch> {
        let mut batch = Batch::new();

        if backend == FirewallBackend::HostManaged {
            let host = host_table();
            let chains = self.kernel.list_chains(&host)?;
            let missing: Vec<&str> = HOST_CHAINS
                .iter()
                .copied()
                .filter(|c| !chains.iter().any(|have| have == c))
                .collect();
            if !missing.is_empty() {
                return Err(RoutingError::HostFirewallChainsMissing {
                    table: host.to_string(),
                    missing: missing.join(", "),
                });
            }

            for stale in self.tagged_host_rules()? {
                batch.delete_rule(&host, &stale.0, stale.1);
            }
            for (chain, rule) in host_rules(device) {
                batch.insert_rule(&host, chain, rule);
            }
        }

        let table = table();
        batch
            .destroy_table(&table)
            .add_table(&table)
            .add_chain(
                &table,
                Chain::base(PREROUTING_CHAIN, ChainType::Filter, Hook::Prerouting, PRIORITY_MANGLE),
            )
            .add_chain(
                &table,
                Chain::base(OUTPUT_CHAIN, ChainType::Route, Hook::Output, PRIORITY_MANGLE),
            );
        for rule in marking_rules(Match::Iifname, protocols, device) {
            batch.add_rule(&table, PREROUTING_CHAIN, rule);
        }
        for rule in marking_rules(Match::Oifname, protocols, device) {
            batch.add_rule(&table, OUTPUT_CHAIN, rule);
        }
        Ok(batch)
    }

    /// Route table first (it waits for the device), then the ruleset
    pub fn setup(&self, protocols: Protocols, device: &str) -> Result<FirewallBackend> {
        let backend = self.detect_backend()?;
        match backend {
            FirewallBackend::HostManaged => info!("Detected fw4, adding TUN rules to its chains"),
            FirewallBackend::Standalone => info!("Using standalone table for TUN routing"),
        }

        self.routing.create_tun_table(device)?;

        let batch = self.build(backend, protocols, device)?;
        self.kernel.apply(&batch)?;
        info!(
            "TUN marking rules installed for {} (tcp: {}, udp: {})",
            device, protocols.tcp, protocols.udp
        );
        Ok(backend)
    }

    /// Best effort; the backend is detected again rather than remembered
    pub fn cleanup(&self) -> Result<()> {
        let mut first_error: Option<RoutingError> = None;

        let mut batch = Batch::new();
        batch.destroy_table(&table());
        if let Err(e) = self.kernel.apply(&batch) {
            warn!("Failed to delete {}: {}", table(), e);
            first_error.get_or_insert(e.into());
        }

        if let Err(e) = self.routing.remove_tun_table() {
            warn!("Failed to remove TUN route table: {}", e);
            first_error.get_or_insert(e);
        }

        if let Err(e) = self.remove_host_rules() {
            warn!("Failed to remove fw4 TUN rules: {}", e);
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn tagged_host_rules(&self) -> Result<Vec<(String, u64)>> {
        Ok(self
            .kernel
            .list_rules(&host_table())?
            .into_iter()
            .filter(|r| {
                r.comment
                    .as_deref()
                    .is_some_and(|c| c.contains(HOST_RULE_TAG))
            })
            .map(|r| (r.chain, r.handle))
            .collect())
    }

    fn remove_host_rules(&self) -> Result<()> {
        if self.detect_backend()? != FirewallBackend::HostManaged {
            return Ok(());
        }
        let stale = self.tagged_host_rules()?;
        if stale.is_empty() {
            return Ok(());
        }

        let host = host_table();
        let mut batch = Batch::new();
        for (chain, handle) in &stale {
            batch.delete_rule(&host, chain, *handle);
        }
        self.kernel.apply(&batch)?;
        debug!("Removed {} tagged rules from {}", stale.len(), host);
        Ok(())
    }
}

fn host_rules(device: &str) -> Vec<(&'static str, Rule)> {
    let mut rules = Vec::with_capacity(7);
    for proto in [L4Proto::Tcp, L4Proto::Udp] {
        rules.push((
            "forward",
            Rule::new()
                .matching(Match::L4Proto(proto))
                .matching(Match::Oifname(device.to_string()))
                .then(Statement::Counter)
                .then(Statement::Accept)
                .comment(TAG_FORWARD_OUT),
        ));
        rules.push((
            "forward",
            Rule::new()
                .matching(Match::L4Proto(proto))
                .matching(Match::Iifname(device.to_string()))
                .then(Statement::Counter)
                .then(Statement::Accept)
                .comment(TAG_FORWARD_IN),
        ));
        rules.push((
            "input",
            Rule::new()
                .matching(Match::L4Proto(proto))
                .matching(Match::Iifname(device.to_string()))
                .then(Statement::Counter)
                .then(Statement::Accept)
                .comment(TAG_INPUT),
        ));
    }
    // keep fw4 from masquerading what leaves through the TUN device
    rules.push((
        "srcnat",
        Rule::new()
            .matching(Match::NfProto(AddrFamily::V4))
            .matching(Match::Oifname(device.to_string()))
            .then(Statement::Counter)
            .then(Statement::Return)
            .comment(TAG_POSTROUTING),
    ));
    rules
}

fn private_nets() -> Vec<IpNet> {
    PRIVATE_NETS.iter().filter_map(|n| n.parse().ok()).collect()
}

/// Marking chain body; `ifname` selects iifname (prerouting) or oifname (output)
pub(crate) fn marking_rules(
    ifname: fn(String) -> Match,
    protocols: Protocols,
    device: &str,
) -> Vec<Rule> {
    let mut rules = vec![
        Rule::new()
            .matching(ifname("lo".to_string()))
            .then(Statement::Accept),
        Rule::new()
            .matching(ifname(device.to_string()))
            .then(Statement::Accept),
    ];
    for net in private_nets() {
        rules.push(
            Rule::new()
                .matching(Match::DaddrInNet(net))
                .then(Statement::Accept),
        );
    }
    let protos = [(protocols.tcp, L4Proto::Tcp), (protocols.udp, L4Proto::Udp)];
    for (_, proto) in protos.into_iter().filter(|(on, _)| *on) {
        rules.push(
            Rule::new()
                .matching(Match::Mark(0))
                .matching(Match::L4Proto(proto))
                .then(Statement::SetMark(TUN_MARK))
                .then(Statement::Accept),
        );
    }
    rules
}
