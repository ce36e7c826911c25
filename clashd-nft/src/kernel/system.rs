use super::{Kernel, PolicyRule, Route, RouteKind, RuleRef};
use crate::error::KernelError;
use crate::ruleset::{AddrFamily, Batch, TableFamily, TableId};
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Kernel channel backed by the `nft` and `ip` command line tools
#[derive(Debug, Clone)]
pub struct SystemKernel {
    nft: PathBuf,
    ip: PathBuf,
    sysfs_net: PathBuf,
}

impl Default for SystemKernel {
    fn default() -> Self {
        Self {
            nft: PathBuf::from("nft"),
            ip: PathBuf::from("ip"),
            sysfs_net: PathBuf::from("/sys/class/net"),
        }
    }
}

impl SystemKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use explicit tool locations (e.g. `/usr/sbin/nft`)
    pub fn with_tools<P: AsRef<Path>>(nft: P, ip: P) -> Self {
        Self {
            nft: nft.as_ref().to_path_buf(),
            ip: ip.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    fn run(&self, program: &Path, args: &[String], stdin: Option<&str>) -> Result<String, KernelError> {
        let program_name = program.display().to_string();
        debug!("Running {} {}", program_name, args.join(" "));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| KernelError::Spawn {
            program: program_name.clone(),
            source,
        })?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())
                    .map_err(|source| KernelError::Spawn {
                        program: program_name.clone(),
                        source,
                    })?;
            }
        }

        let output = child.wait_with_output().map_err(|source| KernelError::Spawn {
            program: program_name.clone(),
            source,
        })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("File exists") {
            return Err(KernelError::AlreadyExists(format!("{} {}", program_name, args.join(" "))));
        }
        if stderr.contains("No such file or directory") || stderr.contains("No such process") {
            return Err(KernelError::NotFound(format!("{} {}", program_name, args.join(" "))));
        }
        Err(KernelError::Command {
            program: program_name,
            args: args.join(" "),
            status: output.status.to_string(),
            stderr,
        })
    }

    fn nft(&self, args: &[&str], stdin: Option<&str>) -> Result<String, KernelError> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.run(&self.nft, &args, stdin)
    }

    fn ip(&self, family: AddrFamily, args: Vec<String>) -> Result<String, KernelError> {
        let mut full = vec![family_flag(family).to_string()];
        full.extend(args);
        self.run(&self.ip, &full, None)
    }

    /// `nft -j list ...` parsed into its array of objects
    fn nft_json(&self, args: &[&str]) -> Result<Vec<Value>, KernelError> {
        let mut full = vec!["-j"];
        full.extend_from_slice(args);
        let out = self.nft(&full, None)?;
        let value: Value = serde_json::from_str(&out).map_err(|e| KernelError::Parse {
            program: "nft".to_string(),
            message: e.to_string(),
        })?;
        Ok(value
            .get("nftables")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

fn family_flag(family: AddrFamily) -> &'static str {
    match family {
        AddrFamily::V4 => "-4",
        AddrFamily::V6 => "-6",
    }
}

fn route_args(verb: &str, route: &Route) -> Vec<String> {
    let mut args = vec!["route".to_string(), verb.to_string()];
    if route.kind == RouteKind::Local {
        args.push("local".to_string());
    }
    args.extend([
        "default".to_string(),
        "dev".to_string(),
        route.device.clone(),
        "table".to_string(),
        route.table.to_string(),
    ]);
    args
}

fn rule_args(verb: &str, rule: &PolicyRule) -> Vec<String> {
    vec![
        "rule".to_string(),
        verb.to_string(),
        "fwmark".to_string(),
        format!("{:#x}/{:#x}", rule.fwmark, rule.mask),
        "table".to_string(),
        rule.table.to_string(),
        "priority".to_string(),
        rule.priority.to_string(),
    ]
}

impl Kernel for SystemKernel {
    fn apply(&self, batch: &Batch) -> Result<(), KernelError> {
        if batch.is_empty() {
            return Ok(());
        }
        let script = batch.render();
        debug!("Applying nft transaction:\n{}", script);
        self.nft(&["-f", "-"], Some(&script)).map(|_| ())
    }

    fn list_tables(&self) -> Result<Vec<TableId>, KernelError> {
        let objects = self.nft_json(&["list", "tables"])?;
        Ok(objects
            .iter()
            .filter_map(|obj| obj.get("table"))
            .filter_map(|table| {
                let family = TableFamily::parse(table.get("family")?.as_str()?)?;
                let name = table.get("name")?.as_str()?;
                Some(TableId::new(family, name))
            })
            .collect())
    }

    fn list_chains(&self, table: &TableId) -> Result<Vec<String>, KernelError> {
        let objects = self.nft_json(&["list", "table", table.family.as_str(), &table.name])?;
        Ok(objects
            .iter()
            .filter_map(|obj| obj.get("chain"))
            .filter_map(|chain| chain.get("name")?.as_str().map(str::to_string))
            .collect())
    }

    fn list_rules(&self, table: &TableId) -> Result<Vec<RuleRef>, KernelError> {
        let objects = self.nft_json(&["-a", "list", "table", table.family.as_str(), &table.name])?;
        Ok(objects
            .iter()
            .filter_map(|obj| obj.get("rule"))
            .filter_map(|rule| {
                Some(RuleRef {
                    chain: rule.get("chain")?.as_str()?.to_string(),
                    handle: rule.get("handle")?.as_u64()?,
                    comment: rule.get("comment").and_then(Value::as_str).map(str::to_string),
                })
            })
            .collect())
    }

    fn link_exists(&self, name: &str) -> bool {
        !name.is_empty() && !name.contains('/') && self.sysfs_net.join(name).exists()
    }

    fn route_add(&self, route: &Route) -> Result<(), KernelError> {
        self.ip(route.family, route_args("add", route)).map(|_| ())
    }

    fn route_replace(&self, route: &Route) -> Result<(), KernelError> {
        self.ip(route.family, route_args("replace", route)).map(|_| ())
    }

    fn route_flush(&self, family: AddrFamily, table: u32) -> Result<(), KernelError> {
        let args = vec![
            "route".to_string(),
            "flush".to_string(),
            "table".to_string(),
            table.to_string(),
        ];
        self.ip(family, args).map(|_| ())
    }

    fn rule_add(&self, rule: &PolicyRule) -> Result<(), KernelError> {
        self.ip(rule.family, rule_args("add", rule)).map(|_| ())
    }

    fn rule_del(&self, rule: &PolicyRule) -> Result<(), KernelError> {
        self.ip(rule.family, rule_args("del", rule)).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_args() {
        let route = Route {
            family: AddrFamily::V6,
            table: 80,
            kind: RouteKind::Local,
            device: "lo".to_string(),
        };
        assert_eq!(
            route_args("replace", &route).join(" "),
            "route replace local default dev lo table 80"
        );
    }

    #[test]
    fn test_rule_args() {
        let rule = PolicyRule {
            family: AddrFamily::V4,
            fwmark: 200,
            mask: 0xffff_ffff,
            table: 200,
            priority: 100,
        };
        assert_eq!(
            rule_args("add", &rule).join(" "),
            "rule add fwmark 0xc8/0xffffffff table 200 priority 100"
        );
    }

    #[test]
    fn test_missing_tool_is_spawn_error() {
        let kernel = SystemKernel::with_tools("/nonexistent/nft", "/nonexistent/ip");
        let err = kernel.list_tables().unwrap_err();
        assert!(matches!(err, KernelError::Spawn { .. }));
    }

    #[test]
    fn test_link_exists_rejects_paths() {
        let kernel = SystemKernel::new();
        assert!(!kernel.link_exists("../lo"));
        assert!(!kernel.link_exists(""));
    }
}
