//! Provider configuration.

use std::cmp::Ordering;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ApiError, Result};

pub const DEFAULT_RENEWAL_THRESHOLD_SECS: u64 = 600;
pub const DEFAULT_API_VERSION: &str = "5.2";
pub const DEFAULT_LOGIN_PATH: &str = ":auth";

/// First API generation that returns deleted id arrays and honours the
/// version header.
const VERSION_HEADER_SINCE: &str = "5.2";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub api_url: String,
    #[serde(default = "default_threshold")]
    pub renewal_threshold_secs: u64,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Login path guess used until the backend description says otherwise.
    #[serde(default = "default_login_path")]
    pub login_path: String,
}

fn default_threshold() -> u64 {
    DEFAULT_RENEWAL_THRESHOLD_SECS
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_login_path() -> String {
    DEFAULT_LOGIN_PATH.to_string()
}

impl ProviderConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            renewal_threshold_secs: DEFAULT_RENEWAL_THRESHOLD_SECS,
            api_version: default_api_version(),
            login_path: default_login_path(),
        }
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| ApiError::Config(e.to_string()))
    }

    pub fn with_renewal_threshold(mut self, threshold: Duration) -> Self {
        self.renewal_threshold_secs = threshold.as_secs();
        self
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    /// Checks the configuration and strips trailing slashes from `api_url`.
    pub fn validated(mut self) -> Result<Self> {
        self.api_url = self.api_url.trim_end_matches('/').to_string();
        if self.api_url.is_empty() {
            return Err(ApiError::Config("api_url must not be empty".to_string()));
        }
        if self.api_version.trim().is_empty() {
            return Err(ApiError::Config("api_version must not be empty".to_string()));
        }
        Ok(self)
    }

    pub fn renewal_threshold(&self) -> Duration {
        Duration::from_secs(self.renewal_threshold_secs)
    }

    pub fn sends_version_header(&self) -> bool {
        compare_versions(&self.api_version, VERSION_HEADER_SINCE) != Ordering::Less
    }

    pub fn login_url(&self) -> String {
        join_path(&self.api_url, &self.login_path)
    }
}

/// Joins a base URL and a path, tolerating a leading slash on the path.
pub(crate) fn join_path(base: &str, path: &str) -> String {
    format!("{}/{}", base, path.trim_start_matches('/'))
}

/// Compares dotted version strings segment by segment, numerically.
/// Missing or non-numeric segments count as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim()
            .split('.')
            .map(|s| s.parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let ordering = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}
