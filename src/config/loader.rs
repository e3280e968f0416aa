//! Configuration loading from disk and environment.

use std::fs;
use std::path::Path;

use crate::config::schema::RoutewayConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load, override from the process environment, and validate a TOML file.
pub fn load_config(path: &Path) -> Result<RoutewayConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    load_config_str(&content, |name| std::env::var(name).ok())
}

/// Parse `content`, apply overrides resolved through `env`, then validate.
pub fn load_config_str<F>(content: &str, env: F) -> Result<RoutewayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config: RoutewayConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
    apply_env_overrides(&mut config, env);

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Apply `ROUTEWAY_*` overrides.
pub fn apply_env_overrides<F>(config: &mut RoutewayConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(secret) = env("ROUTEWAY_AUTH_SECRET_KEY") {
        config.authentication.secret_key = secret;
    }
    if let Some(address) = env("ROUTEWAY_BIND_ADDRESS") {
        config.listener.bind_address = address;
    }
    if let Some(url) = env("ROUTEWAY_STORE_URL") {
        config.store.url = Some(url);
    }
    if let Some(prefix) = env("ROUTEWAY_STORE_PREFIX") {
        config.store.prefix = prefix;
    }
    if let Some(url) = env("ROUTEWAY_RPC_URL") {
        config.rpc.url = Some(url);
    }
    if let Some(queues) = env("ROUTEWAY_RPC_QUEUES") {
        config.rpc.queues = queues
            .split(',')
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(str::to_string)
            .collect();
    }
}
