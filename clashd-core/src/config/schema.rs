//! Configuration schema types

use clashd_nft::RoutingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete application configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub mihomo: MihomoConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also append log output here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// How to run the proxy core and intercept traffic for it
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MihomoConfig {
    #[serde(default = "default_core_path")]
    pub core_path: PathBuf,
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Core stdout/stderr; an empty path discards it
    #[serde(default = "default_log_file", skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub auto_start: bool,
    /// Restart a running core after its config file is rewritten or
    /// switched, or after this configuration changes
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    /// Let the daemon bring the core back when it exits on its own
    #[serde(default = "default_true")]
    pub restart_on_exit: bool,
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub routing: RoutingConfig,
}

fn default_core_path() -> PathBuf {
    PathBuf::from("/usr/bin/mihomo")
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/clashd/config/config.yaml")
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("/etc/clashd")
}

fn default_log_file() -> Option<PathBuf> {
    Some(PathBuf::from("/var/log/mihomo.log"))
}

fn default_true() -> bool {
    true
}

impl Default for MihomoConfig {
    fn default() -> Self {
        Self {
            core_path: default_core_path(),
            config_path: default_config_path(),
            working_dir: default_working_dir(),
            log_file: default_log_file(),
            auto_start: false,
            auto_restart: true,
            restart_on_exit: true,
            api_url: String::new(),
            api_secret: String::new(),
            routing: RoutingConfig::default(),
        }
    }
}

impl MihomoConfig {
    pub fn pid_file(&self) -> PathBuf {
        self.working_dir.join("mihomo.pid")
    }

    /// Core log file; an empty path counts as unset
    pub fn log_path(&self) -> Option<&Path> {
        self.log_file
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clashd_nft::RoutingMode;

    #[test]
    fn test_defaults_from_empty_file() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.mihomo.routing.tcp, RoutingMode::Disable);
        assert_eq!(config.mihomo.pid_file(), PathBuf::from("/etc/clashd/mihomo.pid"));
        assert!(config.mihomo.auto_restart);
        assert!(config.mihomo.restart_on_exit);
    }

    #[test]
    fn test_parse_routing_section() {
        let toml = r#"
[logging]
level = "debug"

[mihomo]
working_dir = "/tmp/clashd"
auto_start = true

[mihomo.routing]
tcp = "tun"
udp = "tun"
tun_device = "utun"
"#;
        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(config.mihomo.auto_start);
        assert_eq!(config.mihomo.routing.tun_device(), "utun");
        assert!(config.mihomo.routing.needs_tun());
        assert_eq!(config.mihomo.core_path, PathBuf::from("/usr/bin/mihomo"));
    }
}
