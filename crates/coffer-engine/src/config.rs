//! Engine configuration.

use std::time::Duration;

use coffer_core::Page;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long currency display names stay cached (default: 60s).
    pub currency_cache_ttl: Duration,

    /// Page size used when a query asks for zero rows (default: 50).
    pub default_page_size: usize,

    /// Largest page a query may request (default: 100).
    pub max_page_size: usize,
}

impl EngineConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            currency_cache_ttl: std::env::var("COFFER_CURRENCY_CACHE_TTL_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map_or(defaults.currency_cache_ttl, Duration::from_secs),
            default_page_size: std::env::var("COFFER_DEFAULT_PAGE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.default_page_size),
            max_page_size: std::env::var("COFFER_MAX_PAGE_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_page_size),
        }
    }

    /// Normalize a requested page: empty pages get the default size, large ones
    /// are clamped.
    #[must_use]
    pub fn page(&self, page: Page) -> Page {
        let page = if page.limit == 0 {
            Page::new(self.default_page_size, page.offset)
        } else {
            page
        };
        page.clamped(self.max_page_size.max(1))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            currency_cache_ttl: Duration::from_secs(60),
            default_page_size: 50,
            max_page_size: 100,
        }
    }
}
