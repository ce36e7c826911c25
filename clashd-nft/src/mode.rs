//! Interception modes requested per transport protocol

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Interface name used when the configuration leaves `tun_device` empty
pub const DEFAULT_TUN_DEVICE: &str = "Meta";

/// How traffic of one transport protocol is diverted into the proxy core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    #[default]
    Disable,
    Tun,
    Tproxy,
    Redirect,
}

impl RoutingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingMode::Disable => "disable",
            RoutingMode::Tun => "tun",
            RoutingMode::Tproxy => "tproxy",
            RoutingMode::Redirect => "redirect",
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disable" | "" => Ok(RoutingMode::Disable),
            "tun" => Ok(RoutingMode::Tun),
            "tproxy" => Ok(RoutingMode::Tproxy),
            "redirect" => Ok(RoutingMode::Redirect),
            other => Err(format!("Invalid routing mode: {}", other)),
        }
    }
}

/// Which transport protocols an engine should act on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Protocols {
    pub tcp: bool,
    pub udp: bool,
}

impl Protocols {
    pub fn any(&self) -> bool {
        self.tcp || self.udp
    }
}

/// Requested interception for TCP and UDP plus the TUN interface name
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub tcp: RoutingMode,
    #[serde(default)]
    pub udp: RoutingMode,
    #[serde(default = "default_tun_device")]
    pub tun_device: String,
}

fn default_tun_device() -> String {
    DEFAULT_TUN_DEVICE.to_string()
}

impl RoutingConfig {
    pub fn new(tcp: RoutingMode, udp: RoutingMode) -> Self {
        Self {
            tcp,
            udp,
            tun_device: default_tun_device(),
        }
    }

    /// TUN interface name, falling back to the default when unset
    pub fn tun_device(&self) -> &str {
        if self.tun_device.trim().is_empty() {
            DEFAULT_TUN_DEVICE
        } else {
            &self.tun_device
        }
    }

    /// Protocols that requested the given mode
    pub fn protocols_for(&self, mode: RoutingMode) -> Protocols {
        Protocols {
            tcp: self.tcp == mode,
            udp: self.udp == mode,
        }
    }

    /// True when either protocol requested the given mode
    pub fn uses(&self, mode: RoutingMode) -> bool {
        self.protocols_for(mode).any()
    }

    /// True when any kernel routing has to be installed
    pub fn needs_routing(&self) -> bool {
        self.tcp != RoutingMode::Disable || self.udp != RoutingMode::Disable
    }

    pub fn needs_tun(&self) -> bool {
        self.uses(RoutingMode::Tun)
    }
}
