use std::path::PathBuf;
use std::time::Duration;

use lumo_core::security::{env_vars, ApiKey};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Applies to unary procedures only; chat streams run until done.
    pub request_timeout_secs: u64,
    /// Used when a chat request carries no key of its own.
    pub openai_api_key: Option<ApiKey>,
    /// Used when a chat request carries no base URL of its own.
    pub openai_base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            db_path: lumo_telemetry::data_dir().join("lumo.db"),
            request_timeout_secs: 30,
            openai_api_key: None,
            openai_base_url: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `PORT`, `LUMO_DB_PATH`, `OPENAI_API_KEY` and
    /// `OPENAI_BASE_URL`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| {
            get(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(port) = var(env_vars::PORT) {
            match port.parse() {
                Ok(port) => config.port = port,
                Err(_) => tracing::warn!(value = %port, "ignoring invalid PORT"),
            }
        }
        if let Some(path) = var(env_vars::LUMO_DB_PATH) {
            config.db_path = PathBuf::from(path);
        }
        config.openai_api_key = var(env_vars::OPENAI_API_KEY).map(ApiKey::new);
        config.openai_base_url = var(env_vars::OPENAI_BASE_URL);
        config
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 3001);
        assert!(config.db_path.ends_with("lumo.db"));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.openai_api_key.is_none());
        assert_eq!(config.bind_addr(), "127.0.0.1:3001");
    }

    #[test]
    fn env_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PORT", "4000"),
            ("LUMO_DB_PATH", "/tmp/lumo-test.db"),
            ("OPENAI_API_KEY", " sk-env "),
            ("OPENAI_BASE_URL", "http://localhost:11434/v1"),
        ]));
        assert_eq!(config.port, 4000);
        assert_eq!(config.db_path, PathBuf::from("/tmp/lumo-test.db"));
        assert_eq!(config.openai_api_key.unwrap().expose(), "sk-env");
        assert_eq!(config.openai_base_url.as_deref(), Some("http://localhost:11434/v1"));
    }

    #[test]
    fn invalid_or_blank_values_keep_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[("PORT", "not-a-port"), ("OPENAI_API_KEY", "   ")]));
        assert_eq!(config.port, 3001);
        assert!(config.openai_api_key.is_none());
    }
}
