//! Configuration validation

use super::schema::{AppConfig, MihomoConfig};
use crate::error::{Result, ValidationError};
use clashd_nft::RoutingMode;
use std::path::Path;

/// Linux IFNAMSIZ minus the trailing NUL
const MAX_IFNAME_LEN: usize = 15;

pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &AppConfig) -> Result<()> {
        Self::validate_paths(&config.mihomo)?;
        Self::validate_routing(&config.mihomo)?;
        Ok(())
    }

    fn validate_paths(mihomo: &MihomoConfig) -> Result<()> {
        let required: [(&'static str, &Path); 3] = [
            ("core_path", &mihomo.core_path),
            ("config_path", &mihomo.config_path),
            ("working_dir", &mihomo.working_dir),
        ];
        for (field, path) in required {
            if path.as_os_str().is_empty() {
                return Err(ValidationError::EmptyPath { field }.into());
            }
        }
        Ok(())
    }

    fn validate_routing(mihomo: &MihomoConfig) -> Result<()> {
        let routing = &mihomo.routing;
        if routing.udp == RoutingMode::Redirect {
            return Err(ValidationError::UdpRedirect.into());
        }
        if routing.needs_tun() {
            Self::validate_interface(routing.tun_device())?;
        }
        Ok(())
    }

    pub fn validate_interface(name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && name.len() <= MAX_IFNAME_LEN
            && name != "."
            && name != ".."
            && !name
                .chars()
                .any(|c| c == '/' || c == '\0' || c.is_whitespace());
        if valid {
            Ok(())
        } else {
            Err(ValidationError::InvalidInterface {
                name: name.to_string(),
            }
            .into())
        }
    }
}
