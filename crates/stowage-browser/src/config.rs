//! Object browser configuration.
//!
//! Provides [`BrowserConfig`] for tuning listing, upload, and session
//! behavior. Values are loaded from environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use stowage_core::parse_bool;
use typed_builder::TypedBuilder;

/// 64 MiB.
pub const DEFAULT_PART_SIZE: u64 = 64 * 1024 * 1024;

/// 30 GiB.
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 30 * 1024 * 1024 * 1024;

/// Hard page size of the eager standard listing pass.
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Object browser tunables.
///
/// # Examples
///
/// ```
/// use stowage_browser::config::BrowserConfig;
///
/// let config = BrowserConfig::default();
/// assert_eq!(config.upload_queue_size, 4);
/// assert_eq!(config.listing_page_size, 500);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    /// Multipart part size in bytes.
    #[builder(default = DEFAULT_PART_SIZE)]
    pub upload_part_size: u64,

    /// Concurrent part uploads per file.
    #[builder(default = 4)]
    pub upload_queue_size: usize,

    /// Largest accepted upload in bytes.
    #[builder(default = DEFAULT_MAX_UPLOAD_SIZE)]
    pub upload_max_size: u64,

    /// Entries per request in the eager standard listing pass.
    #[builder(default = DEFAULT_PAGE_SIZE)]
    pub listing_page_size: usize,

    /// Object count above which the alt listing strategy is used.
    #[builder(default = 10_000)]
    pub alt_pagination_threshold: u64,

    /// Object-count probe timeout in seconds.
    #[builder(default = 10)]
    pub object_count_timeout_secs: u64,

    /// Lifetime of the caveat attached to session keys, in hours.
    #[builder(default = 72)]
    pub grant_lifetime_hours: i64,

    /// Whether versioned listing is enabled when a session opens.
    #[builder(default = false)]
    pub versioning_ui: bool,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            upload_part_size: DEFAULT_PART_SIZE,
            upload_queue_size: 4,
            upload_max_size: DEFAULT_MAX_UPLOAD_SIZE,
            listing_page_size: DEFAULT_PAGE_SIZE,
            alt_pagination_threshold: 10_000,
            object_count_timeout_secs: 10,
            grant_lifetime_hours: 72,
            versioning_ui: false,
        }
    }
}

impl BrowserConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `UPLOAD_PART_SIZE` | `67108864` |
    /// | `UPLOAD_QUEUE_SIZE` | `4` |
    /// | `UPLOAD_MAX_SIZE` | `32212254720` |
    /// | `LISTING_PAGE_SIZE` | `500` |
    /// | `ALT_PAGINATION_THRESHOLD` | `10000` |
    /// | `OBJECT_COUNT_TIMEOUT_SECS` | `10` |
    /// | `GRANT_LIFETIME_HOURS` | `72` |
    /// | `VERSIONING_UI` | `false` |
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(n) = env_parse("UPLOAD_PART_SIZE") {
            config.upload_part_size = n;
        }
        if let Some(n) = env_parse::<usize>("UPLOAD_QUEUE_SIZE") {
            config.upload_queue_size = n.max(1);
        }
        if let Some(n) = env_parse("UPLOAD_MAX_SIZE") {
            config.upload_max_size = n;
        }
        if let Some(n) = env_parse::<usize>("LISTING_PAGE_SIZE") {
            config.listing_page_size = n.clamp(1, 1000);
        }
        if let Some(n) = env_parse("ALT_PAGINATION_THRESHOLD") {
            config.alt_pagination_threshold = n;
        }
        if let Some(n) = env_parse("OBJECT_COUNT_TIMEOUT_SECS") {
            config.object_count_timeout_secs = n;
        }
        if let Some(n) = env_parse("GRANT_LIFETIME_HOURS") {
            config.grant_lifetime_hours = n;
        }
        if let Ok(v) = std::env::var("VERSIONING_UI") {
            config.versioning_ui = parse_bool(&v);
        }

        config
    }

    /// Object-count probe timeout.
    #[must_use]
    pub fn object_count_timeout(&self) -> Duration {
        Duration::from_secs(self.object_count_timeout_secs)
    }

    /// Caveat lifetime for session keys.
    #[must_use]
    pub fn grant_lifetime(&self) -> chrono::Duration {
        chrono::Duration::hours(self.grant_lifetime_hours)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
