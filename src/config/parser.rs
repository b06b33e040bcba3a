//! Configuration file loading and validation.

use std::fs;

use crate::common::ConfigError;

use super::types::Config;

/// Load configuration from a YAML file path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let s = fs::read_to_string(path)?;
    parse_config(&s)
}

/// Parse and validate configuration from a YAML string.
fn parse_config(s: &str) -> Result<Config, ConfigError> {
    let cfg: Config = serde_yaml::from_str(s)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.cluster_name.is_empty() {
        return Err(ConfigError::Invalid(
            "\"cluster_name\" must not be empty".into(),
        ));
    }
    if cfg.cluster_name.len() > u16::MAX as usize {
        return Err(ConfigError::Invalid(
            "\"cluster_name\" must fit in a 16-bit length prefix".into(),
        ));
    }
    if !cfg.hosts.contains_key(&cfg.server_id) {
        return Err(ConfigError::Invalid(format!(
            "the \"hosts\" map must contain an entry matching \"server_id\" ({})",
            cfg.server_id
        )));
    }
    if !cfg.use_ipv4 && !cfg.use_ipv6 {
        return Err(ConfigError::Invalid(
            "at least one of \"use_ipv4\" and \"use_ipv6\" must be enabled".into(),
        ));
    }
    Ok(())
}
