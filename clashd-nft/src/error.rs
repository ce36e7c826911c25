//! Error types for kernel routing operations

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RoutingError>;

/// Failure talking to the kernel configuration channel
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} {args} failed ({status}): {stderr}")]
    Command {
        program: String,
        args: String,
        status: String,
        stderr: String,
    },

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Unexpected output from {program}: {message}")]
    Parse { program: String, message: String },
}

impl KernelError {
    /// True for the "File exists" class of netlink/nft failures
    pub fn is_already_exists(&self) -> bool {
        match self {
            KernelError::AlreadyExists(_) => true,
            KernelError::Command { stderr, .. } => stderr.contains("File exists"),
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("Invalid CIDR notation: {cidr}")]
    InvalidCidr { cidr: String },

    #[error("CIDR {cidr} does not belong to the requested address family")]
    FamilyMismatch { cidr: String },

    #[error("TUN device {device} not found after waiting {waited:?}")]
    TunDeviceMissing { device: String, waited: Duration },

    #[error("Host firewall table {table} is missing chains: {missing}")]
    HostFirewallChainsMissing { table: String, missing: String },

    #[error("Failed to set up {engine}: {source}")]
    Setup {
        engine: &'static str,
        #[source]
        source: Box<RoutingError>,
    },
}

impl RoutingError {
    pub(crate) fn setup(engine: &'static str, source: RoutingError) -> Self {
        RoutingError::Setup {
            engine,
            source: Box::new(source),
        }
    }
}
