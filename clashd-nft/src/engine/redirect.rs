//! NAT REDIRECT of locally generated TCP flows

use crate::error::Result;
use crate::kernel::Kernel;
use crate::policy_route::BYPASS_MARK;
use crate::ruleset::{
    Batch, Chain, ChainType, Hook, L4Proto, Match, Rule, Statement, TableFamily, TableId,
    PRIORITY_DSTNAT,
};
use ipnet::IpNet;
use std::sync::Arc;
use tracing::info;

pub const REDIRECT_TABLE: &str = "clashd_redirect";
pub const REDIRECT_PORT: u16 = 7891;
pub const OUTPUT_CHAIN: &str = "nat_output";

const BYPASS_NETS: [&str; 4] = ["127.0.0.0/8", "10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

pub fn table() -> TableId {
    TableId::new(TableFamily::Inet, REDIRECT_TABLE)
}

pub struct RedirectEngine {
    kernel: Arc<dyn Kernel>,
}

impl RedirectEngine {
    pub fn new(kernel: Arc<dyn Kernel>) -> Self {
        Self { kernel }
    }

    pub fn build(&self) -> Batch {
        let table = table();
        let mut batch = Batch::new();
        batch
            .destroy_table(&table)
            .add_table(&table)
            .add_chain(
                &table,
                Chain::base(OUTPUT_CHAIN, ChainType::Nat, Hook::Output, PRIORITY_DSTNAT),
            );
        for rule in output_rules() {
            batch.add_rule(&table, OUTPUT_CHAIN, rule);
        }
        batch
    }

    pub fn setup(&self) -> Result<()> {
        self.kernel.apply(&self.build())?;
        info!("REDIRECT rules installed, TCP to :{}", REDIRECT_PORT);
        Ok(())
    }

    pub fn cleanup(&self) -> Result<()> {
        let mut batch = Batch::new();
        batch.destroy_table(&table());
        self.kernel.apply(&batch)?;
        Ok(())
    }
}

pub(crate) fn output_rules() -> Vec<Rule> {
    let mut rules = vec![
        Rule::new()
            .matching(Match::Oifname("lo".to_string()))
            .then(Statement::Accept),
        Rule::new()
            .matching(Match::Mark(BYPASS_MARK))
            .then(Statement::Counter)
            .then(Statement::Return),
    ];
    rules.extend(
        BYPASS_NETS
            .iter()
            .filter_map(|n| n.parse::<IpNet>().ok())
            .map(|net| {
                Rule::new()
                    .matching(Match::DaddrInNet(net))
                    .then(Statement::Accept)
            }),
    );
    rules.push(
        Rule::new()
            .matching(Match::L4Proto(L4Proto::Tcp))
            .then(Statement::Counter)
            .then(Statement::Redirect {
                port: REDIRECT_PORT,
            }),
    );
    rules
}
