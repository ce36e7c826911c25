//! Table/chain/set/rule primitives shared by the interception engines
//!
//! Engines describe what they want as a [`Batch`] of commands. A batch is
//! applied by the kernel channel as one transaction; the system channel
//! renders it to an `nft -f` script, the in-memory channel replays it.

use crate::interval::IntervalSet;
use ipnet::IpNet;
use std::fmt::{self, Write as _};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Netfilter "mangle" hook priority
pub const PRIORITY_MANGLE: i32 = -150;

/// Netfilter "dstnat" hook priority
pub const PRIORITY_DSTNAT: i32 = -100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddrFamily {
    V4,
    V6,
}

impl AddrFamily {
    pub fn max_value(&self) -> u128 {
        match self {
            AddrFamily::V4 => u32::MAX as u128,
            AddrFamily::V6 => u128::MAX,
        }
    }

    pub fn to_u128(&self, addr: IpAddr) -> Option<u128> {
        match (self, addr) {
            (AddrFamily::V4, IpAddr::V4(a)) => Some(u32::from(a) as u128),
            (AddrFamily::V6, IpAddr::V6(a)) => Some(u128::from(a)),
            _ => None,
        }
    }

    pub fn from_u128(&self, value: u128) -> IpAddr {
        match self {
            AddrFamily::V4 => IpAddr::V4(Ipv4Addr::from(value as u32)),
            AddrFamily::V6 => IpAddr::V6(Ipv6Addr::from(value)),
        }
    }

    /// Unspecified address, used as the default-route destination
    pub fn unspecified(&self) -> IpAddr {
        match self {
            AddrFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddrFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    /// Header keyword in nft expressions (`ip daddr`, `ip6 daddr`)
    fn header(&self) -> &'static str {
        match self {
            AddrFamily::V4 => "ip",
            AddrFamily::V6 => "ip6",
        }
    }

    fn nfproto(&self) -> &'static str {
        match self {
            AddrFamily::V4 => "ipv4",
            AddrFamily::V6 => "ipv6",
        }
    }

    fn set_type(&self) -> &'static str {
        match self {
            AddrFamily::V4 => "ipv4_addr",
            AddrFamily::V6 => "ipv6_addr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableFamily {
    Ip,
    Ip6,
    Inet,
}

impl TableFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableFamily::Ip => "ip",
            TableFamily::Ip6 => "ip6",
            TableFamily::Inet => "inet",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ip" => Some(TableFamily::Ip),
            "ip6" => Some(TableFamily::Ip6),
            "inet" => Some(TableFamily::Inet),
            _ => None,
        }
    }
}

/// A table addressed by family and name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId {
    pub family: TableFamily,
    pub name: String,
}

impl TableId {
    pub fn new(family: TableFamily, name: impl Into<String>) -> Self {
        Self {
            family,
            name: name.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family.as_str(), self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainType {
    Filter,
    Route,
    Nat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Prerouting,
    Input,
    Forward,
    Output,
    Postrouting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub name: String,
    /// Hook attachment; `None` for a regular (jump target) chain
    pub base: Option<(ChainType, Hook, i32)>,
}

impl Chain {
    pub fn base(name: impl Into<String>, ty: ChainType, hook: Hook, priority: i32) -> Self {
        Self {
            name: name.into(),
            base: Some((ty, hook, priority)),
        }
    }
}

/// Named interval set of addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Set {
    pub name: String,
    pub elements: IntervalSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4Proto {
    Tcp,
    Udp,
}

impl L4Proto {
    fn as_str(&self) -> &'static str {
        match self {
            L4Proto::Tcp => "tcp",
            L4Proto::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrType {
    Local,
    Broadcast,
    Anycast,
    Multicast,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    L4Proto(L4Proto),
    DestPort(L4Proto, u16),
    Mark(u32),
    MarkMasked { mask: u32, value: u32 },
    Iifname(String),
    Oifname(String),
    CtReply,
    FibDaddrType(Vec<AddrType>),
    DaddrInSet(AddrFamily, String),
    DaddrInNet(IpNet),
    NfProto(AddrFamily),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Counter,
    SetMark(u32),
    TProxy { port: u16 },
    Redirect { port: u16 },
    RejectPortUnreachable,
    Accept,
    Return,
}

/// One rule: matches, then statements, optionally tagged with a comment
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Rule {
    pub matches: Vec<Match>,
    pub statements: Vec<Statement>,
    pub comment: Option<String>,
}

impl Rule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matching(mut self, m: Match) -> Self {
        self.matches.push(m);
        self
    }

    pub fn then(mut self, s: Statement) -> Self {
        self.statements.push(s);
        self
    }

    pub fn comment(mut self, tag: impl Into<String>) -> Self {
        self.comment = Some(tag.into());
        self
    }

    /// Verdict statement, if the rule ends in one
    pub fn verdict(&self) -> Option<&Statement> {
        self.statements
            .iter()
            .rev()
            .find(|s| matches!(s, Statement::Accept | Statement::Return))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AddTable(TableId),
    /// Delete a table if it exists; a no-op otherwise
    DestroyTable(TableId),
    AddChain(TableId, Chain),
    AddSet(TableId, Set),
    AddRule {
        table: TableId,
        chain: String,
        rule: Rule,
    },
    /// Insert at the head of an existing chain
    InsertRule {
        table: TableId,
        chain: String,
        rule: Rule,
    },
    DeleteRule {
        table: TableId,
        chain: String,
        handle: u64,
    },
}

/// Ordered list of commands applied as a single transaction
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Batch {
    commands: Vec<Command>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn add_table(&mut self, table: &TableId) -> &mut Self {
        self.push(Command::AddTable(table.clone()))
    }

    pub fn destroy_table(&mut self, table: &TableId) -> &mut Self {
        self.push(Command::DestroyTable(table.clone()))
    }

    pub fn add_chain(&mut self, table: &TableId, chain: Chain) -> &mut Self {
        self.push(Command::AddChain(table.clone(), chain))
    }

    pub fn add_set(&mut self, table: &TableId, set: Set) -> &mut Self {
        self.push(Command::AddSet(table.clone(), set))
    }

    pub fn add_rule(&mut self, table: &TableId, chain: &str, rule: Rule) -> &mut Self {
        self.push(Command::AddRule {
            table: table.clone(),
            chain: chain.to_string(),
            rule,
        })
    }

    pub fn insert_rule(&mut self, table: &TableId, chain: &str, rule: Rule) -> &mut Self {
        self.push(Command::InsertRule {
            table: table.clone(),
            chain: chain.to_string(),
            rule,
        })
    }

    pub fn delete_rule(&mut self, table: &TableId, chain: &str, handle: u64) -> &mut Self {
        self.push(Command::DeleteRule {
            table: table.clone(),
            chain: chain.to_string(),
            handle,
        })
    }

    /// Render as an `nft -f` script
    pub fn render(&self) -> String {
        let mut out = String::new();
        for command in &self.commands {
            render_command(&mut out, command);
        }
        out
    }
}

fn render_command(out: &mut String, command: &Command) {
    // writes into a String cannot fail
    match command {
        Command::AddTable(table) => {
            let _ = writeln!(out, "add table {}", table);
        }
        Command::DestroyTable(table) => {
            // adding first makes the delete succeed whether or not the table exists
            let _ = writeln!(out, "add table {}", table);
            let _ = writeln!(out, "delete table {}", table);
        }
        Command::AddChain(table, chain) => match chain.base {
            Some((ty, hook, priority)) => {
                let _ = writeln!(
                    out,
                    "add chain {} {} {{ type {} hook {} priority {}; policy accept; }}",
                    table,
                    chain.name,
                    chain_type_str(ty),
                    hook_str(hook),
                    priority
                );
            }
            None => {
                let _ = writeln!(out, "add chain {} {}", table, chain.name);
            }
        },
        Command::AddSet(table, set) => {
            let family = set.elements.family();
            let _ = writeln!(
                out,
                "add set {} {} {{ type {}; flags interval; }}",
                table,
                set.name,
                family.set_type()
            );
            if !set.elements.is_empty() {
                let elements: Vec<String> = set
                    .elements
                    .ranges()
                    .into_iter()
                    .map(|(first, last)| {
                        if first == last {
                            first.to_string()
                        } else {
                            format!("{}-{}", first, last)
                        }
                    })
                    .collect();
                let _ = writeln!(
                    out,
                    "add element {} {} {{ {} }}",
                    table,
                    set.name,
                    elements.join(", ")
                );
            }
        }
        Command::AddRule { table, chain, rule } => {
            let _ = writeln!(out, "add rule {} {} {}", table, chain, render_rule(rule));
        }
        Command::InsertRule { table, chain, rule } => {
            let _ = writeln!(out, "insert rule {} {} {}", table, chain, render_rule(rule));
        }
        Command::DeleteRule {
            table,
            chain,
            handle,
        } => {
            let _ = writeln!(out, "delete rule {} {} handle {}", table, chain, handle);
        }
    }
}

/// Render the expression part of a rule
pub fn render_rule(rule: &Rule) -> String {
    let mut parts: Vec<String> = rule.matches.iter().map(render_match).collect();
    parts.extend(rule.statements.iter().map(render_statement));
    if let Some(ref comment) = rule.comment {
        parts.push(format!("comment \"{}\"", comment.replace('"', "'")));
    }
    parts.join(" ")
}

fn render_match(m: &Match) -> String {
    match m {
        Match::L4Proto(proto) => format!("meta l4proto {}", proto.as_str()),
        Match::DestPort(proto, port) => format!("{} dport {}", proto.as_str(), port),
        Match::Mark(value) => format!("meta mark {:#010x}", value),
        Match::MarkMasked { mask, value } => {
            format!("meta mark & {:#010x} == {:#010x}", mask, value)
        }
        Match::Iifname(name) => format!("iifname \"{}\"", name),
        Match::Oifname(name) => format!("oifname \"{}\"", name),
        Match::CtReply => "ct direction reply".to_string(),
        Match::FibDaddrType(types) => {
            let names: Vec<&str> = types.iter().map(addr_type_str).collect();
            format!("fib daddr type {{ {} }}", names.join(", "))
        }
        Match::DaddrInSet(family, set) => format!("{} daddr @{}", family.header(), set),
        Match::DaddrInNet(net) => match net {
            IpNet::V4(_) => format!("ip daddr {}", net.trunc()),
            IpNet::V6(_) => format!("ip6 daddr {}", net.trunc()),
        },
        Match::NfProto(family) => format!("meta nfproto {}", family.nfproto()),
    }
}

fn render_statement(s: &Statement) -> String {
    match s {
        Statement::Counter => "counter".to_string(),
        Statement::SetMark(value) => format!("meta mark set {:#010x}", value),
        Statement::TProxy { port } => format!("tproxy to :{}", port),
        Statement::Redirect { port } => format!("redirect to :{}", port),
        Statement::RejectPortUnreachable => "reject with icmpx type port-unreachable".to_string(),
        Statement::Accept => "accept".to_string(),
        Statement::Return => "return".to_string(),
    }
}

fn chain_type_str(ty: ChainType) -> &'static str {
    match ty {
        ChainType::Filter => "filter",
        ChainType::Route => "route",
        ChainType::Nat => "nat",
    }
}

fn hook_str(hook: Hook) -> &'static str {
    match hook {
        Hook::Prerouting => "prerouting",
        Hook::Input => "input",
        Hook::Forward => "forward",
        Hook::Output => "output",
        Hook::Postrouting => "postrouting",
    }
}

fn addr_type_str(t: &AddrType) -> &'static str {
    match t {
        AddrType::Local => "local",
        AddrType::Broadcast => "broadcast",
        AddrType::Anycast => "anycast",
        AddrType::Multicast => "multicast",
    }
}
