//! TPROXY interception in a dedicated `inet` table
//!
//! The prerouting chain sends new flows to the core's TPROXY listener; the
//! output chain only marks locally generated flows so the mark rule in
//! table 80 loops them back through `lo` into prerouting.

use crate::error::Result;
use crate::interval::IntervalSet;
use crate::kernel::Kernel;
use crate::mode::Protocols;
use crate::policy_route::{BYPASS_MARK, TPROXY_MARK, TPROXY_MARK_MASK};
use crate::ruleset::{
    AddrFamily, AddrType, Batch, Chain, ChainType, Hook, L4Proto, Match, Rule, Set, Statement,
    TableFamily, TableId, PRIORITY_MANGLE,
};
use std::sync::Arc;
use tracing::info;

pub const TPROXY_TABLE: &str = "clashd_tproxy";
pub const TPROXY_PORT: u16 = 7894;

pub const PREROUTING_CHAIN: &str = "mangle_prerouting";
pub const OUTPUT_CHAIN: &str = "mangle_output";

pub const RESERVED_SET_V4: &str = "reserved_ip";
pub const RESERVED_SET_V6: &str = "reserved_ip6";

/// Reserved and special-purpose IPv4 space that is never proxied
pub const RESERVED_IPV4: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.88.99.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/3",
];

pub const RESERVED_IPV6: &[&str] = &[
    "::/128",
    "::1/128",
    "::ffff:0:0/96",
    "64:ff9b::/96",
    "64:ff9b:1::/48",
    "100::/64",
    "2001::/32",
    "2001:20::/28",
    "2001:db8::/32",
    "2002::/16",
    "5f00::/16",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
];

pub fn table() -> TableId {
    TableId::new(TableFamily::Inet, TPROXY_TABLE)
}

pub struct TProxyEngine {
    kernel: Arc<dyn Kernel>,
}

impl TProxyEngine {
    pub fn new(kernel: Arc<dyn Kernel>) -> Self {
        Self { kernel }
    }

    /// Complete ruleset for the enabled protocols, ready to apply
    pub fn build(&self, protocols: Protocols) -> Result<Batch> {
        let table = table();
        let reserved_v4 = IntervalSet::from_cidrs(AddrFamily::V4, RESERVED_IPV4)?;
        let reserved_v6 = IntervalSet::from_cidrs(AddrFamily::V6, RESERVED_IPV6)?;

        let mut batch = Batch::new();
        batch
            .destroy_table(&table)
            .add_table(&table)
            .add_set(
                &table,
                Set {
                    name: RESERVED_SET_V4.to_string(),
                    elements: reserved_v4,
                },
            )
            .add_set(
                &table,
                Set {
                    name: RESERVED_SET_V6.to_string(),
                    elements: reserved_v6,
                },
            )
            .add_chain(
                &table,
                Chain::base(PREROUTING_CHAIN, ChainType::Filter, Hook::Prerouting, PRIORITY_MANGLE),
            )
            .add_chain(
                &table,
                Chain::base(OUTPUT_CHAIN, ChainType::Route, Hook::Output, PRIORITY_MANGLE),
            );

        for rule in prerouting_rules(protocols) {
            batch.add_rule(&table, PREROUTING_CHAIN, rule);
        }
        for rule in output_rules(protocols) {
            batch.add_rule(&table, OUTPUT_CHAIN, rule);
        }
        Ok(batch)
    }

    pub fn setup(&self, protocols: Protocols) -> Result<()> {
        let batch = self.build(protocols)?;
        self.kernel.apply(&batch)?;
        info!(
            "TPROXY rules installed (tcp: {}, udp: {})",
            protocols.tcp, protocols.udp
        );
        Ok(())
    }

    /// Drop the whole table; absent is fine
    pub fn cleanup(&self) -> Result<()> {
        let mut batch = Batch::new();
        batch.destroy_table(&table());
        self.kernel.apply(&batch)?;
        Ok(())
    }
}

fn enabled(protocols: Protocols) -> Vec<L4Proto> {
    let mut out = Vec::with_capacity(2);
    if protocols.tcp {
        out.push(L4Proto::Tcp);
    }
    if protocols.udp {
        out.push(L4Proto::Udp);
    }
    out
}

/// Rules shared by both chains after the protocol specific head
fn bypass_rules() -> Vec<Rule> {
    vec![
        Rule::new()
            .matching(Match::CtReply)
            .then(Statement::Counter)
            .then(Statement::Return),
        Rule::new()
            .matching(Match::FibDaddrType(vec![
                AddrType::Local,
                AddrType::Broadcast,
                AddrType::Anycast,
                AddrType::Multicast,
            ]))
            .then(Statement::Counter)
            .then(Statement::Return),
        Rule::new()
            .matching(Match::DaddrInSet(AddrFamily::V4, RESERVED_SET_V4.to_string()))
            .then(Statement::Return),
        Rule::new()
            .matching(Match::DaddrInSet(AddrFamily::V6, RESERVED_SET_V6.to_string()))
            .then(Statement::Return),
    ]
}

fn head_rules() -> Vec<Rule> {
    vec![
        // no QUIC, clients fall back to TCP which is intercepted
        Rule::new()
            .matching(Match::DestPort(L4Proto::Udp, 443))
            .then(Statement::RejectPortUnreachable),
        Rule::new()
            .matching(Match::Mark(BYPASS_MARK))
            .then(Statement::Return),
    ]
}

pub(crate) fn prerouting_rules(protocols: Protocols) -> Vec<Rule> {
    let mut rules = head_rules();

    // looped back from the output chain via table 80
    for proto in enabled(protocols) {
        rules.push(
            Rule::new()
                .matching(Match::Iifname("lo".to_string()))
                .matching(Match::L4Proto(proto))
                .matching(Match::MarkMasked {
                    mask: TPROXY_MARK_MASK,
                    value: TPROXY_MARK,
                })
                .then(Statement::TProxy { port: TPROXY_PORT })
                .then(Statement::Counter)
                .then(Statement::Accept),
        );
    }

    rules.extend(bypass_rules());

    for proto in enabled(protocols) {
        rules.push(
            Rule::new()
                .matching(Match::L4Proto(proto))
                .then(Statement::Counter)
                .then(Statement::SetMark(TPROXY_MARK))
                .then(Statement::TProxy { port: TPROXY_PORT })
                .then(Statement::Accept),
        );
    }
    rules
}

pub(crate) fn output_rules(protocols: Protocols) -> Vec<Rule> {
    let mut rules = head_rules();
    rules.extend(bypass_rules());

    for proto in enabled(protocols) {
        rules.push(
            Rule::new()
                .matching(Match::L4Proto(proto))
                .then(Statement::Counter)
                .then(Statement::SetMark(TPROXY_MARK))
                .then(Statement::Accept),
        );
    }
    rules
}
