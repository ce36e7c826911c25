//! Kernel side of transparent interception for the mihomo proxy core
//!
//! Builds nftables rulesets and fwmark policy routing for the TUN, TPROXY
//! and REDIRECT strategies, and switches between them atomically per engine.

pub mod engine;
pub mod error;
pub mod interval;
pub mod kernel;
pub mod mode;
pub mod policy_route;
pub mod ruleset;

pub use engine::{FirewallBackend, InstalledEngines, RoutingEngine};
pub use error::{KernelError, Result, RoutingError};
pub use interval::{Interval, IntervalSet, SetElement};
pub use kernel::{Kernel, MemoryKernel, SystemKernel};
pub use mode::{Protocols, RoutingConfig, RoutingMode, DEFAULT_TUN_DEVICE};
pub use policy_route::{DeviceWait, PolicyRoutingManager};
