//! Configuration file loading and saving

use super::core_api;
use super::schema::AppConfig;
use crate::error::{Result, ServiceError};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CONFIG_ENV: &str = "CLASHD_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/clashd/app.toml";

pub struct ConfigLoader;

impl ConfigLoader {
    /// `$CLASHD_CONFIG`, else `/etc/clashd/app.toml`
    pub fn default_config_path() -> PathBuf {
        match env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ServiceError::ConfigLoad {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: AppConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load config, writing the defaults first if the file does not exist.
    /// The core API address is refreshed from the core's own YAML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<AppConfig> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            info!("Config file not found at {:?}, writing defaults", path);
            let config = AppConfig::default();
            Self::save(&config, path)?;
            config
        };

        Self::refresh_core_api(&mut config);
        Ok(config)
    }

    /// Pick up `external-controller` and `secret`; failures leave the values as they are
    pub fn refresh_core_api(config: &mut AppConfig) {
        let core_config = &config.mihomo.config_path;
        if core_config.as_os_str().is_empty() {
            return;
        }
        match core_api::discover(core_config) {
            Ok(api) => {
                config.mihomo.api_url = api.url;
                config.mihomo.api_secret = api.secret;
            }
            Err(e) => debug!("Could not read core API settings from {:?}: {}", core_config, e),
        }
    }

    pub fn save<P: AsRef<Path>>(config: &AppConfig, path: P) -> Result<()> {
        let path = path.as_ref();
        let save_err = |message: String| ServiceError::ConfigSave {
            path: path.to_path_buf(),
            message,
        };

        let contents = toml::to_string_pretty(config).map_err(|e| save_err(e.to_string()))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| save_err(e.to_string()))?;
            }
        }
        fs::write(path, contents).map_err(|e| save_err(e.to_string()))?;
        debug!("Saved config to {:?}", path);
        Ok(())
    }
}
