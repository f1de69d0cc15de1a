//! API server configuration

use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Required unless the in-memory store is used
    pub database_url: Option<String>,
    pub bind_address: SocketAddr,
    pub webhook_username: String,
    pub webhook_password: String,
    pub use_in_memory_store: bool,
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    optional(key).ok_or(ConfigError::Missing(key))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_address = optional("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let bind_address: SocketAddr = bind_address
            .parse()
            .map_err(|_| ConfigError::Invalid {
                key: "BIND_ADDRESS",
                value: bind_address.clone(),
            })?;

        let use_in_memory_store = optional("USE_IN_MEMORY_STORE")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let database_url = optional("DATABASE_URL");
        if database_url.is_none() && !use_in_memory_store {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        Ok(Self {
            database_url,
            bind_address,
            webhook_username: required("WEBHOOK_USERNAME")?,
            webhook_password: required("WEBHOOK_PASSWORD")?,
            use_in_memory_store,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "DATABASE_URL",
            "BIND_ADDRESS",
            "WEBHOOK_USERNAME",
            "WEBHOOK_PASSWORD",
            "USE_IN_MEMORY_STORE",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_database_url_required_without_memory_store() {
        clear_env();
        std::env::set_var("WEBHOOK_USERNAME", "billing");
        std::env::set_var("WEBHOOK_PASSWORD", "hunter2");

        assert!(matches!(Config::from_env(), Err(ConfigError::Missing("DATABASE_URL"))));

        std::env::set_var("USE_IN_MEMORY_STORE", "true");
        let config = Config::from_env().unwrap();
        assert!(config.use_in_memory_store);
        assert_eq!(config.bind_address.port(), 8080);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_bind_address() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/ledgerline");
        std::env::set_var("WEBHOOK_USERNAME", "billing");
        std::env::set_var("WEBHOOK_PASSWORD", "hunter2");
        std::env::set_var("BIND_ADDRESS", "not-an-address");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid { key: "BIND_ADDRESS", .. })
        ));
        clear_env();
    }
}
