//! Supervision of the mihomo proxy core
//!
//! Owns the application configuration, rewrites the core's TUN section,
//! runs the core process and ties its lifetime to the kernel routing
//! installed through `clashd_nft`.

pub mod config;
pub mod error;
pub mod lock;
pub mod logs;
pub mod patcher;
pub mod pidfile;
pub mod readiness;
pub mod supervisor;

pub use config::{AppConfig, ConfigLoader, ConfigValidator};
pub use error::{Result, ServiceError, ValidationError};
pub use lock::LifecycleLock;
pub use readiness::ReadinessConfig;
pub use supervisor::{Lifecycle, ServiceStatus, Supervisor, SupervisorOptions};
