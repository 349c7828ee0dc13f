//! Client configuration
//!
//! Process-wide settings read at request-build time: API base address,
//! locale, endpoint paths, timeouts and header names. Loaded from the
//! platform config directory (Windows, macOS, Linux) with environment
//! overrides on top.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding [`ClientConfig::base_url`]
pub const ENV_BASE_URL: &str = "SESSION_GATE_BASE_URL";
/// Environment variable overriding [`ClientConfig::locale`]
pub const ENV_LOCALE: &str = "SESSION_GATE_LOCALE";

/// Names of the headers the gateway attaches to authenticated requests
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeaderNames {
    pub locale: String,
    pub tenant: String,
    pub user: String,
}

impl Default for HeaderNames {
    fn default() -> Self {
        Self {
            locale: "Accept-Language".to_string(),
            tenant: "X-Tenant-Id".to_string(),
            user: "X-User-Id".to_string(),
        }
    }
}

/// Session client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// API base address, without trailing slash
    pub base_url: String,
    /// Locale sent with every request, authenticated or not
    pub locale: String,
    /// Login endpoint path
    pub login_path: String,
    /// Credential refresh endpoint path
    pub refresh_path: String,
    /// Current-user profile endpoint path
    pub profile_path: String,
    /// Prefix of every physical storage key
    pub storage_prefix: String,
    /// Timeout for ordinary requests, in seconds
    pub request_timeout_secs: u64,
    /// Upper bound on a single refresh call, in seconds
    pub refresh_timeout_secs: u64,
    /// Lifetime of the cached user profile, in minutes
    pub user_ttl_minutes: u64,
    pub headers: HeaderNames,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            locale: "en".to_string(),
            login_path: "/auth/login".to_string(),
            refresh_path: "/auth/refresh".to_string(),
            profile_path: "/users/me".to_string(),
            storage_prefix: "app".to_string(),
            request_timeout_secs: 30,
            refresh_timeout_secs: 30,
            user_ttl_minutes: 24 * 60,
            headers: HeaderNames::default(),
        }
    }
}

impl ClientConfig {
    /// Creates a default config pointing at the given base address
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Gets the config directory path (cross-platform)
    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA")
                .ok()
                .map(|p| PathBuf::from(p).join("SessionGate"))
        }

        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .ok()
                .map(|p| PathBuf::from(p).join("Library/Application Support/SessionGate"))
        }

        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| std::env::var("HOME").ok().map(|p| PathBuf::from(p).join(".config")))
                .map(|p| p.join("session-gate"))
        }

        #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }

    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.json"))
    }

    /// Loads configuration from the platform config directory, then applies
    /// environment overrides. Missing or unreadable files yield defaults.
    pub fn load() -> Self {
        let config = Self::config_path()
            .filter(|path| path.exists())
            .and_then(|path| match Self::load_from(&path) {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::warn!("Ignoring config at {:?}: {}", path, e);
                    None
                }
            })
            .unwrap_or_default();

        config.with_env_overrides()
    }

    /// Loads configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self, String> {
        let content =
            fs::read_to_string(path).map_err(|e| format!("Failed to read config: {}", e))?;
        serde_json::from_str(&content).map_err(|e| format!("Failed to parse config: {}", e))
    }

    /// Saves configuration to an explicit file, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config dir: {}", e))?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        fs::write(path, content).map_err(|e| format!("Failed to write config: {}", e))
    }

    /// Saves configuration to the platform config directory
    pub fn save(&self) -> Result<(), String> {
        let path = Self::config_path().ok_or("Could not determine config path")?;
        self.save_to(&path)
    }

    /// Applies `SESSION_GATE_*` environment overrides
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(base_url) = lookup(ENV_BASE_URL).filter(|v| !v.is_empty()) {
            self.base_url = base_url;
        }
        if let Some(locale) = lookup(ENV_LOCALE).filter(|v| !v.is_empty()) {
            self.locale = locale;
        }
        self
    }

    /// Joins the base address and an endpoint path
    pub fn url_for(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    pub fn user_ttl(&self) -> Duration {
        Duration::from_secs(self.user_ttl_minutes.saturating_mul(60))
    }
}
