//! Error types for supervising the proxy core

use clashd_nft::RoutingError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("mihomo is not running")]
    NotRunning,

    #[error("Another start/stop operation is in progress")]
    Busy,

    #[error("mihomo (pid {pid}) exited during startup: {status}")]
    ProcessDied { pid: u32, status: String },

    #[error("Timed out after {waited:?} waiting for {waiting_for}")]
    ReadinessTimeout {
        waited: Duration,
        waiting_for: String,
    },

    #[error("Failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Core config {path} does not exist")]
    CoreConfigMissing { path: PathBuf },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Routing setup failed: {0}")]
    Setup(#[source] RoutingError),

    #[error("Routing cleanup failed: {0}")]
    Cleanup(#[source] RoutingError),

    #[error("Failed to stop existing instance: {0}")]
    KillExisting(#[source] Box<ServiceError>),

    #[error("Failed to patch core config {path}: {source}")]
    PatchConfig {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to clear log file {path}: {source}")]
    ClearLog {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to spawn {path}: {source}")]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("PID file {path}: {source}")]
    PidFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to signal pid {pid}: {source}")]
    Signal { pid: u32, source: std::io::Error },

    #[error("Failed to load config from {path}: {source}")]
    ConfigLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to save config to {path}: {message}")]
    ConfigSave { path: PathBuf, message: String },

    #[error("Configuration validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("No log file available: {0}")]
    LogUnavailable(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("UDP cannot use redirect mode")]
    UdpRedirect,

    #[error("{field} must not be empty")]
    EmptyPath { field: &'static str },

    #[error("Invalid interface name: {name:?}")]
    InvalidInterface { name: String },
}
