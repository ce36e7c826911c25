//! fwmark policy rules and dedicated route tables for TPROXY and TUN

use crate::error::{KernelError, Result, RoutingError};
use crate::kernel::{Kernel, PolicyRule, Route, RouteKind};
use crate::ruleset::AddrFamily;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const TPROXY_MARK: u32 = 0x80;
pub const TPROXY_MARK_MASK: u32 = 0xff;
pub const TPROXY_ROUTE_TABLE: u32 = 80;
pub const TPROXY_RULE_PRIORITY: u32 = 1024;

pub const TUN_MARK: u32 = 200;
pub const TUN_ROUTE_TABLE: u32 = 200;
pub const TUN_RULE_PRIORITY: u32 = 100;

/// Mark the proxy core puts on its own egress so it is never intercepted again
pub const BYPASS_MARK: u32 = 0x100;

const FAMILIES: [AddrFamily; 2] = [AddrFamily::V4, AddrFamily::V6];

/// How long to wait for the TUN device before giving up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceWait {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for DeviceWait {
    fn default() -> Self {
        Self {
            attempts: 20,
            interval: Duration::from_millis(500),
        }
    }
}

impl DeviceWait {
    pub fn total(&self) -> Duration {
        self.interval * self.attempts
    }
}

pub fn tproxy_rule(family: AddrFamily) -> PolicyRule {
    PolicyRule {
        family,
        fwmark: TPROXY_MARK,
        mask: TPROXY_MARK_MASK,
        table: TPROXY_ROUTE_TABLE,
        priority: TPROXY_RULE_PRIORITY,
    }
}

pub fn tun_rule() -> PolicyRule {
    PolicyRule {
        family: AddrFamily::V4,
        fwmark: TUN_MARK,
        mask: u32::MAX,
        table: TUN_ROUTE_TABLE,
        priority: TUN_RULE_PRIORITY,
    }
}

/// Installs and removes the routing side of interception
pub struct PolicyRoutingManager {
    kernel: Arc<dyn Kernel>,
    device_wait: DeviceWait,
}

impl PolicyRoutingManager {
    pub fn new(kernel: Arc<dyn Kernel>) -> Self {
        Self {
            kernel,
            device_wait: DeviceWait::default(),
        }
    }

    pub fn with_device_wait(mut self, wait: DeviceWait) -> Self {
        self.device_wait = wait;
        self
    }

    /// Local default route into table 80 plus the mark rule. IPv4 is
    /// required; IPv6 is installed when the host supports it.
    /// Deletes before adding so repeated calls leave a single rule.
    pub fn add_tproxy(&self) -> Result<()> {
        self.add_tproxy_family(AddrFamily::V4)?;
        if let Err(e) = self.add_tproxy_family(AddrFamily::V6) {
            warn!("IPv6 TPROXY policy routing unavailable: {}", e);
        }
        info!("TPROXY policy routing installed");
        Ok(())
    }

    fn add_tproxy_family(&self, family: AddrFamily) -> Result<()> {
        self.kernel.route_replace(&Route {
            family,
            table: TPROXY_ROUTE_TABLE,
            kind: RouteKind::Local,
            device: "lo".to_string(),
        })?;

        let rule = tproxy_rule(family);
        delete_all(self.kernel.as_ref(), &rule)?;
        self.kernel.rule_add(&rule)?;
        debug!("Installed TPROXY policy rule: {}", rule);
        Ok(())
    }

    /// Best effort; every step is attempted and the first IPv4 failure
    /// returned. IPv6 failures are only logged.
    pub fn remove_tproxy(&self) -> Result<()> {
        let mut first_error = None;
        for family in FAMILIES {
            let rule_result = delete_all(self.kernel.as_ref(), &tproxy_rule(family));
            let flush_result = self.kernel.route_flush(family, TPROXY_ROUTE_TABLE);
            for e in [rule_result.err(), flush_result.err()].into_iter().flatten() {
                warn!("Failed to remove {:?} TPROXY policy routing: {}", family, e);
                if family == AddrFamily::V4 {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Wait for `device`, then route mark-200 traffic through it via table 200
    pub fn create_tun_table(&self, device: &str) -> Result<()> {
        self.wait_for_device(device)?;

        tolerate_exists(self.kernel.rule_add(&tun_rule()))?;
        tolerate_exists(self.kernel.route_add(&Route {
            family: AddrFamily::V4,
            table: TUN_ROUTE_TABLE,
            kind: RouteKind::Unicast,
            device: device.to_string(),
        }))?;

        info!("TUN route table {} points at {}", TUN_ROUTE_TABLE, device);
        Ok(())
    }

    pub fn remove_tun_table(&self) -> Result<()> {
        let rule_result = delete_all(self.kernel.as_ref(), &tun_rule());
        let flush_result = self.kernel.route_flush(AddrFamily::V4, TUN_ROUTE_TABLE);
        rule_result?;
        flush_result?;
        Ok(())
    }

    fn wait_for_device(&self, device: &str) -> Result<()> {
        for attempt in 1..=self.device_wait.attempts {
            if self.kernel.link_exists(device) {
                return Ok(());
            }
            debug!(
                "Waiting for TUN device {} ({}/{})",
                device, attempt, self.device_wait.attempts
            );
            thread::sleep(self.device_wait.interval);
        }
        if self.kernel.link_exists(device) {
            return Ok(());
        }
        Err(RoutingError::TunDeviceMissing {
            device: device.to_string(),
            waited: self.device_wait.total(),
        })
    }
}

/// Delete a policy rule until none is left; absence is success
fn delete_all(kernel: &dyn Kernel, rule: &PolicyRule) -> std::result::Result<(), KernelError> {
    loop {
        match kernel.rule_del(rule) {
            Ok(()) => continue,
            Err(KernelError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

fn tolerate_exists(result: std::result::Result<(), KernelError>) -> Result<()> {
    match result {
        Err(e) if e.is_already_exists() => Ok(()),
        other => Ok(other?),
    }
}
