use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PetSafeError, Result};

pub const DEFAULT_API_BASE: &str = "https://platform.cloud.petsafe.net";
pub const DEFAULT_CLIENT_ID: &str = "18hpp04puqmgf5nc6o474lcp2g";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_REFRESH_MARGIN_SECS: u64 = 100;

const CONFIG_ENV_VAR: &str = "PETSAFE_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PetSafeConfig {
    pub api_base: String,
    pub client_id: String,
    pub region: String,
    /// Overrides the region-derived Cognito endpoint.
    pub identity_endpoint: Option<String>,
    pub refresh_margin_secs: u64,
    /// Refresh ahead of expiry in `ensure_valid`; when off, refresh only
    /// happens after the platform rejects a request.
    pub proactive_refresh: bool,
    pub retry_on_auth_failure: bool,
    pub transient_retries: u32,
    pub request_timeout_secs: Option<u64>,
    pub http_proxy: String,
    pub https_proxy: String,
}

fn parse_bool_env(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn default_config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("petsafe").join("config.toml"))
}

impl Default for PetSafeConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            region: DEFAULT_REGION.to_string(),
            identity_endpoint: None,
            refresh_margin_secs: DEFAULT_REFRESH_MARGIN_SECS,
            proactive_refresh: true,
            retry_on_auth_failure: true,
            transient_retries: 0,
            request_timeout_secs: Some(30),
            http_proxy: String::new(),
            https_proxy: String::new(),
        }
    }
}

impl PetSafeConfig {
    /// Loads the config file (if any) and applies environment overrides.
    ///
    /// A missing or unreadable file falls back to defaults.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(path) = default_config_path() {
            if path.exists() {
                match Self::from_file(&path) {
                    Ok(file_config) => {
                        log::debug!("Loaded PetSafe config from {:?}", path);
                        config = file_config;
                    }
                    Err(e) => log::warn!("Ignoring config file {:?}: {}", path, e),
                }
            }
        }

        config.apply_env();
        config
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PetSafeError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| PetSafeError::Config(e.to_string()))
    }

    fn apply_env(&mut self) {
        if let Ok(api_base) = std::env::var("PETSAFE_API_BASE") {
            self.api_base = api_base;
        }
        if let Ok(client_id) = std::env::var("PETSAFE_CLIENT_ID") {
            self.client_id = client_id;
        }
        if let Ok(region) = std::env::var("PETSAFE_REGION") {
            self.region = region;
        }
        if let Ok(endpoint) = std::env::var("PETSAFE_IDENTITY_ENDPOINT") {
            self.identity_endpoint = Some(endpoint);
        }
        if let Ok(margin) = std::env::var("PETSAFE_REFRESH_MARGIN_SECS") {
            match margin.trim().parse() {
                Ok(secs) => self.refresh_margin_secs = secs,
                Err(e) => log::warn!("Ignoring PETSAFE_REFRESH_MARGIN_SECS={margin:?}: {e}"),
            }
        }
        if let Ok(proactive) = std::env::var("PETSAFE_PROACTIVE_REFRESH") {
            self.proactive_refresh = parse_bool_env(&proactive);
        }
        if let Ok(retry) = std::env::var("PETSAFE_RETRY_ON_AUTH_FAILURE") {
            self.retry_on_auth_failure = parse_bool_env(&retry);
        }
        if let Ok(retries) = std::env::var("PETSAFE_TRANSIENT_RETRIES") {
            match retries.trim().parse() {
                Ok(n) => self.transient_retries = n,
                Err(e) => log::warn!("Ignoring PETSAFE_TRANSIENT_RETRIES={retries:?}: {e}"),
            }
        }
        if let Ok(http_proxy) = std::env::var("HTTP_PROXY") {
            self.http_proxy = http_proxy;
        }
        if let Ok(https_proxy) = std::env::var("HTTPS_PROXY") {
            self.https_proxy = https_proxy;
        }
    }

    pub fn identity_endpoint(&self) -> String {
        match &self.identity_endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("https://cognito-idp.{}.amazonaws.com/", self.region),
        }
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}
