//! Interception engines and the orchestrator that switches between them

pub mod redirect;
pub mod tproxy;
pub mod tun;

pub use redirect::RedirectEngine;
pub use tproxy::TProxyEngine;
pub use tun::{FirewallBackend, TunMarkEngine};

use crate::error::{Result, RoutingError};
use crate::kernel::Kernel;
use crate::mode::{RoutingConfig, RoutingMode};
use crate::policy_route::{DeviceWait, PolicyRoutingManager};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which engine-owned tables are currently present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InstalledEngines {
    pub tproxy: bool,
    pub tun: bool,
    pub redirect: bool,
}

impl InstalledEngines {
    pub fn any(&self) -> bool {
        self.tproxy || self.tun || self.redirect
    }
}

impl fmt::Display for InstalledEngines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (self.tproxy, "tproxy"),
            (self.tun, "tun"),
            (self.redirect, "redirect"),
        ]
        .into_iter()
        .filter(|(on, _)| *on)
        .map(|(_, name)| name)
        .collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join(", "))
        }
    }
}

/// Tears everything down, then installs what a routing config asks for
pub struct RoutingEngine {
    kernel: Arc<dyn Kernel>,
    tproxy: TProxyEngine,
    tun: TunMarkEngine,
    redirect: RedirectEngine,
    policy: PolicyRoutingManager,
}

impl RoutingEngine {
    pub fn new(kernel: Arc<dyn Kernel>) -> Self {
        Self {
            tproxy: TProxyEngine::new(kernel.clone()),
            tun: TunMarkEngine::new(kernel.clone()),
            redirect: RedirectEngine::new(kernel.clone()),
            policy: PolicyRoutingManager::new(kernel.clone()),
            kernel,
        }
    }

    /// Bound on how long TUN setup waits for the device
    pub fn with_device_wait(mut self, wait: DeviceWait) -> Self {
        self.tun = self.tun.with_device_wait(wait);
        self
    }

    /// Each engine applies its ruleset as its own transaction; a later
    /// failure does not undo an earlier engine.
    pub fn setup(&self, config: &RoutingConfig) -> Result<()> {
        if let Err(e) = self.cleanup() {
            warn!("Cleanup before setup was incomplete: {}", e);
        }

        let tproxy = config.protocols_for(RoutingMode::Tproxy);
        if tproxy.any() {
            self.tproxy
                .setup(tproxy)
                .map_err(|e| RoutingError::setup("tproxy", e))?;
            self.policy
                .add_tproxy()
                .map_err(|e| RoutingError::setup("tproxy policy routing", e))?;
        }

        let tun = config.protocols_for(RoutingMode::Tun);
        if tun.any() {
            self.tun
                .setup(tun, config.tun_device())
                .map_err(|e| RoutingError::setup("tun", e))?;
        }

        if config.tcp == RoutingMode::Redirect {
            self.redirect
                .setup()
                .map_err(|e| RoutingError::setup("redirect", e))?;
        }
        if config.udp == RoutingMode::Redirect {
            warn!("UDP has no REDIRECT interception, leaving UDP untouched");
        }

        info!(
            "Routing set up (tcp: {}, udp: {})",
            config.tcp, config.udp
        );
        Ok(())
    }

    /// Idempotent teardown of all engines. Every step runs even if an
    /// earlier one fails; the first failure is returned.
    pub fn cleanup(&self) -> Result<()> {
        let steps: [(&str, Result<()>); 4] = [
            ("tproxy", self.tproxy.cleanup()),
            ("tun", self.tun.cleanup()),
            ("redirect", self.redirect.cleanup()),
            ("tproxy policy routing", self.policy.remove_tproxy()),
        ];

        let mut first_error = None;
        for (name, result) in steps {
            match result {
                Ok(()) => debug!("Cleaned up {}", name),
                Err(e) => {
                    warn!("Failed to clean up {}: {}", name, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn installed(&self) -> Result<InstalledEngines> {
        Ok(InstalledEngines {
            tproxy: self.kernel.table_exists(&tproxy::table())?,
            tun: self.kernel.table_exists(&tun::table())?,
            redirect: self.kernel.table_exists(&redirect::table())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::MemoryKernel;
    use crate::policy_route::{TPROXY_ROUTE_TABLE, TUN_ROUTE_TABLE};
    use crate::ruleset::TableFamily;
    use std::time::Duration;

    fn engine(kernel: &Arc<MemoryKernel>) -> RoutingEngine {
        RoutingEngine::new(kernel.clone()).with_device_wait(DeviceWait {
            attempts: 2,
            interval: Duration::from_millis(1),
        })
    }

    #[test]
    fn test_tun_supersedes_tproxy() {
        let kernel = Arc::new(MemoryKernel::with_links(&["Meta"]));
        let engine = engine(&kernel);

        engine
            .setup(&RoutingConfig::new(RoutingMode::Tproxy, RoutingMode::Disable))
            .unwrap();
        assert_eq!(
            engine.installed().unwrap(),
            InstalledEngines { tproxy: true, tun: false, redirect: false }
        );
        assert!(kernel.routes().iter().any(|r| r.table == TPROXY_ROUTE_TABLE));

        engine
            .setup(&RoutingConfig::new(RoutingMode::Tun, RoutingMode::Tun))
            .unwrap();
        assert_eq!(
            engine.installed().unwrap(),
            InstalledEngines { tproxy: false, tun: true, redirect: false }
        );
        assert!(kernel
            .policy_rules()
            .iter()
            .all(|r| r.table == TUN_ROUTE_TABLE));
        assert!(kernel.routes().iter().all(|r| r.table == TUN_ROUTE_TABLE));
    }

    #[test]
    fn test_cleanup_twice_is_identical() {
        let kernel = Arc::new(MemoryKernel::with_links(&["Meta"]));
        let engine = engine(&kernel);
        engine
            .setup(&RoutingConfig::new(RoutingMode::Redirect, RoutingMode::Tproxy))
            .unwrap();

        engine.cleanup().unwrap();
        let mut once = kernel.snapshot();
        engine.cleanup().unwrap();
        let mut twice = kernel.snapshot();

        // transaction counters differ, the kernel objects must not
        once.transactions = 0;
        once.mutations = 0;
        twice.transactions = 0;
        twice.mutations = 0;
        assert_eq!(once, twice);
        assert!(!engine.installed().unwrap().any());
        assert!(kernel.routes().is_empty());
    }

    #[test]
    fn test_redirect_tcp_with_tproxy_udp() {
        let kernel = Arc::new(MemoryKernel::new());
        let engine = engine(&kernel);
        engine
            .setup(&RoutingConfig::new(RoutingMode::Redirect, RoutingMode::Tproxy))
            .unwrap();

        assert_eq!(
            engine.installed().unwrap(),
            InstalledEngines { tproxy: true, tun: false, redirect: true }
        );
        let rules = kernel.rules_in(TableFamily::Inet, tproxy::TPROXY_TABLE, tproxy::PREROUTING_CHAIN);
        assert_eq!(
            rules,
            tproxy::prerouting_rules(crate::mode::Protocols { tcp: false, udp: true })
        );
    }

    #[test]
    fn test_udp_redirect_is_a_no_op() {
        let kernel = Arc::new(MemoryKernel::new());
        let engine = engine(&kernel);
        engine
            .setup(&RoutingConfig::new(RoutingMode::Disable, RoutingMode::Redirect))
            .unwrap();
        assert!(!engine.installed().unwrap().any());
    }

    #[test]
    fn test_failed_engine_reports_phase() {
        let kernel = Arc::new(MemoryKernel::new());
        kernel.fail_table(redirect::REDIRECT_TABLE);
        let engine = engine(&kernel);

        let err = engine
            .setup(&RoutingConfig::new(RoutingMode::Redirect, RoutingMode::Disable))
            .unwrap_err();
        assert!(matches!(err, RoutingError::Setup { engine: "redirect", .. }));
        assert!(err.to_string().contains("redirect"));
    }

    #[test]
    fn test_installed_display() {
        let installed = InstalledEngines { tproxy: true, tun: false, redirect: true };
        assert_eq!(installed.to_string(), "tproxy, redirect");
        assert_eq!(InstalledEngines::default().to_string(), "none");
    }
}
