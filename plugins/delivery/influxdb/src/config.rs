use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use lpcache_api::error::CacheError;

/// Timestamp precision of the cached lines, passed through to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Ns,
    Us,
    Ms,
    S,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Ns => "ns",
            Precision::Us => "us",
            Precision::Ms => "ms",
            Precision::S => "s",
        }
    }
}

/// One `[[destinations]]` entry (or the `[stats]` destination).
#[derive(Clone, Deserialize)]
pub struct InfluxDbConfig {
    /// Server base URL, e.g. `http://localhost:8086`.
    pub url: String,
    pub bucket: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub token: String,

    /// Per-request timeout. An attempt that exceeds it is a network failure.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// gzip the request body.
    #[serde(default = "default_gzip")]
    pub gzip: bool,

    #[serde(default)]
    pub precision: Precision,

    /// Name used in logs. Default: `<url>/<bucket>`.
    #[serde(default)]
    pub name: Option<String>,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_gzip() -> bool {
    true
}

impl InfluxDbConfig {
    pub fn new(url: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bucket: bucket.into(),
            org: String::new(),
            token: String::new(),
            timeout_ms: default_timeout_ms(),
            gzip: default_gzip(),
            precision: Precision::default(),
            name: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}/{}", self.url.trim_end_matches('/'), self.bucket))
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(CacheError::config(format!(
                "destination url must start with http:// or https://, got {:?}",
                self.url
            )));
        }
        if self.bucket.trim().is_empty() {
            return Err(CacheError::config(format!("destination {} has an empty bucket", self.url)));
        }
        if self.timeout_ms == 0 {
            return Err(CacheError::config(format!("destination {} timeout_ms must be > 0", self.url)));
        }
        Ok(())
    }
}

// The token stays out of logs.
impl fmt::Debug for InfluxDbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfluxDbConfig")
            .field("url", &self.url)
            .field("bucket", &self.bucket)
            .field("org", &self.org)
            .field("token", &if self.token.is_empty() { "" } else { "***" })
            .field("timeout_ms", &self.timeout_ms)
            .field("gzip", &self.gzip)
            .field("precision", &self.precision)
            .field("name", &self.name)
            .finish()
    }
}
