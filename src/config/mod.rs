use crate::models::TimeWindow;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// WebDriver endpoint and browser behaviour
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrowserConfig {
    /// chromedriver listens on 9515 by default.
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,

    #[serde(default = "default_true")]
    pub headless: bool,

    #[serde(default)]
    pub user_agent: Option<String>,

    #[serde(default = "default_window_size")]
    pub window_size: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_page_load_timeout_secs")]
    pub page_load_timeout_secs: u64,

    #[serde(default = "default_click_timeout_secs")]
    pub click_timeout_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_poll_max_interval_ms")]
    pub poll_max_interval_ms: u64,
}

/// Crawl targets, pacing and retry policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CrawlConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_trending_path")]
    pub trending_path: String,

    /// Attempts at loading an entity page, first one included.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    #[serde(default = "default_scroll_max_iterations")]
    pub scroll_max_iterations: u32,

    #[serde(default = "default_scroll_pause_ms")]
    pub scroll_pause_ms: u64,

    #[serde(default = "default_discovery_scroll_pause_ms")]
    pub discovery_scroll_pause_ms: u64,

    /// Pause after clicks and scrolling so the page can attach new content.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    #[serde(default = "default_entity_delay_ms")]
    pub entity_delay_ms: u64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    #[serde(default = "default_windows")]
    pub windows: Vec<TimeWindow>,
}

/// Cookie persistence between runs
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_cookie_path")]
    pub cookie_path: PathBuf,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_webdriver_url() -> String {
    "http://localhost:9515".to_string()
}
fn default_window_size() -> String {
    "1920,1080".to_string()
}
fn default_request_timeout_secs() -> u64 {
    90
}
fn default_page_load_timeout_secs() -> u64 {
    60
}
fn default_click_timeout_secs() -> u64 {
    10
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_poll_max_interval_ms() -> u64 {
    2000
}
fn default_base_url() -> String {
    "https://dexscreener.com".to_string()
}
fn default_trending_path() -> String {
    "/?rankBy=trendingScoreM5&order=desc".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_secs() -> u64 {
    10
}
fn default_scroll_max_iterations() -> u32 {
    10
}
fn default_scroll_pause_ms() -> u64 {
    2000
}
fn default_discovery_scroll_pause_ms() -> u64 {
    5000
}
fn default_settle_ms() -> u64 {
    2000
}
fn default_entity_delay_ms() -> u64 {
    2000
}
fn default_jitter_ms() -> u64 {
    500
}
fn default_windows() -> Vec<TimeWindow> {
    TimeWindow::ALL.to_vec()
}
fn default_cookie_path() -> PathBuf {
    PathBuf::from("cookies.json")
}
fn default_db_path() -> PathBuf {
    PathBuf::from("data/dex.duckdb")
}
fn default_batch_size() -> usize {
    100
}
fn default_true() -> bool {
    true
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: default_webdriver_url(),
            headless: true,
            user_agent: None,
            window_size: default_window_size(),
            request_timeout_secs: default_request_timeout_secs(),
            page_load_timeout_secs: default_page_load_timeout_secs(),
            click_timeout_secs: default_click_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_max_interval_ms: default_poll_max_interval_ms(),
        }
    }
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            trending_path: default_trending_path(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            scroll_max_iterations: default_scroll_max_iterations(),
            scroll_pause_ms: default_scroll_pause_ms(),
            discovery_scroll_pause_ms: default_discovery_scroll_pause_ms(),
            settle_ms: default_settle_ms(),
            entity_delay_ms: default_entity_delay_ms(),
            jitter_ms: default_jitter_ms(),
            windows: default_windows(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_path: default_cookie_path(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            run_migrations: true,
            batch_size: default_batch_size(),
        }
    }
}

impl BrowserConfig {
    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout_secs)
    }

    pub fn click_timeout(&self) -> Duration {
        Duration::from_secs(self.click_timeout_secs)
    }
}

impl CrawlConfig {
    pub fn trending_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.trending_path)
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("DEXH").separator("__"))
            .build()?;

        let app_cfg: AppConfig = cfg.try_deserialize().unwrap_or_else(|e| {
            warn!("Config unreadable ({e}), using defaults");
            AppConfig::default()
        });
        app_cfg.validate()?;
        Ok(app_cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.batch_size == 0 {
            bail!("storage.batch_size must be at least 1");
        }
        if self.crawl.max_retries == 0 {
            bail!("crawl.max_retries must be at least 1");
        }
        match self.crawl.windows.first() {
            None => bail!("crawl.windows must name at least one window"),
            Some(w) if !w.is_page_default() => {
                bail!("crawl.windows must start with 30d, the tab the panel opens on (got {w})")
            }
            Some(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.crawl.max_retries, 3);
        assert_eq!(cfg.storage.batch_size, 100);
        assert_eq!(cfg.crawl.windows, TimeWindow::ALL.to_vec());
        assert_eq!(
            cfg.crawl.trending_url(),
            "https://dexscreener.com/?rankBy=trendingScoreM5&order=desc"
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg: AppConfig = toml_like(
            r#"
            [crawl]
            windows = ["30d", "1d"]
            [storage]
            batch_size = 10
            "#,
        );
        assert_eq!(cfg.crawl.windows, vec![TimeWindow::Days30, TimeWindow::Days1]);
        assert_eq!(cfg.crawl.retry_delay_secs, 10);
        assert_eq!(cfg.storage.batch_size, 10);
        assert_eq!(cfg.browser.webdriver_url, "http://localhost:9515");
    }

    #[test]
    fn test_validate_rejects_bad_windows() {
        let mut cfg = AppConfig::default();
        cfg.crawl.windows = vec![TimeWindow::Days7, TimeWindow::Days30];
        assert!(cfg.validate().is_err());
        cfg.crawl.windows.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut cfg = AppConfig::default();
        cfg.storage.batch_size = 0;
        assert!(cfg.validate().is_err());
    }

    fn toml_like(src: &str) -> AppConfig {
        config::Config::builder()
            .add_source(config::File::from_str(src, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }
}
