use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_KEYCHAIN_SERVICE: &str = "Codex Auth";
pub const DEFAULT_USAGE_ENDPOINT: &str = "https://chatgpt.com/backend-api/wham/usage";
const DEFAULT_SECURITY_BIN: &str = "/usr/bin/security";
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub raw_credentials: Duration,
    pub validity: Duration,
    pub account_summary: Duration,
    pub token_expiry: Duration,
    /// Minimum spacing between two background validity refreshes unless forced.
    pub min_refresh_interval: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            raw_credentials: Duration::from_secs(5),
            validity: Duration::from_secs(30),
            account_summary: Duration::from_secs(120),
            token_expiry: Duration::from_secs(30),
            min_refresh_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store_dir: PathBuf,
    pub auth_file: PathBuf,
    pub keychain_service: String,
    pub keychain_account: String,
    pub security_executable: String,
    pub keychain_read_timeout: Duration,
    pub keychain_write_timeout: Duration,
    pub usage_endpoint: String,
    pub log_filter: String,
    pub cache_ttls: CacheTtls,
}

impl Config {
    pub fn from_env() -> Self {
        let home_dir = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut config = Self::for_home(home_dir);

        if let Some(store_dir) = env_override("CXAUTH_HOME") {
            config.store_dir = PathBuf::from(store_dir);
        }
        if let Some(codex_home) = env_override("CODEX_HOME") {
            config.auth_file = PathBuf::from(codex_home).join("auth.json");
        }
        if let Some(service) = env_override("CXAUTH_KEYCHAIN_SERVICE") {
            config.keychain_service = service;
        }
        if let Some(user) = env_override("USER") {
            config.keychain_account = user;
        }
        if let Some(security) = env_override("CXAUTH_SECURITY_BIN") {
            config.security_executable = security;
        }
        if let Some(endpoint) = env_override("CXAUTH_USAGE_URL") {
            config.usage_endpoint = endpoint;
        }
        if let Some(filter) = env_override("CXAUTH_LOG") {
            config.log_filter = filter;
        }
        config
    }

    pub fn for_home(home_dir: PathBuf) -> Self {
        Self {
            store_dir: home_dir.join(".cxauth"),
            auth_file: home_dir.join(".codex/auth.json"),
            keychain_service: DEFAULT_KEYCHAIN_SERVICE.to_string(),
            keychain_account: "default".to_string(),
            security_executable: DEFAULT_SECURITY_BIN.to_string(),
            keychain_read_timeout: Duration::from_secs(2),
            keychain_write_timeout: Duration::from_secs(5),
            usage_endpoint: DEFAULT_USAGE_ENDPOINT.to_string(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            cache_ttls: CacheTtls::default(),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.store_dir.join("logs")
    }
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
