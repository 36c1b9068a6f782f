//! Headless browser control.
//!
//! One [`Browser`] drives one automation session; every call completes before
//! the next one starts. The orchestrator only sees this trait, so tests swap in
//! a scripted browser and production uses [`webdriver::WebDriverBrowser`].

pub mod session;
pub mod wait;
pub mod webdriver;

use crate::error::CrawlResult;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

pub use self::session::{Cookie, SessionStore};

// ── Locator ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Css,
    XPath,
}

/// Where to find an element in the live page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub strategy: Strategy,
    pub value: String,
}

impl Locator {
    pub fn css(value: impl Into<String>) -> Self {
        Self {
            strategy: Strategy::Css,
            value: value.into(),
        }
    }

    pub fn xpath(value: impl Into<String>) -> Self {
        Self {
            strategy: Strategy::XPath,
            value: value.into(),
        }
    }

    /// W3C WebDriver `using` value.
    pub fn using(&self) -> &'static str {
        match self.strategy {
            Strategy::Css => "css selector",
            Strategy::XPath => "xpath",
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.strategy {
            Strategy::Css => write!(f, "css:{}", self.value),
            Strategy::XPath => write!(f, "xpath:{}", self.value),
        }
    }
}

// ── Browser ───────────────────────────────────────────────────────────────────

/// How a scroll-to-exhaustion pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollOutcome {
    pub iterations: u32,
    pub final_height: u64,
    /// Two consecutive passes measured the same height.
    pub exhausted: bool,
}

#[async_trait]
pub trait Browser: Send {
    /// Navigate to `url`. With cookies: clear the jar, install them, reload.
    async fn open(&mut self, url: &str, cookies: Option<&[Cookie]>) -> CrawlResult<()>;

    async fn navigate(&mut self, url: &str) -> CrawlResult<()>;

    /// Poll `document.readyState` until it reports `complete`.
    async fn wait_until_ready(&mut self, timeout: Duration) -> CrawlResult<()>;

    async fn scroll_to_exhaustion(&mut self, max_iterations: u32, pause: Duration) -> CrawlResult<ScrollOutcome>;

    /// Wait for the target to be displayed and enabled, then click it.
    async fn click(&mut self, target: &Locator, timeout: Duration) -> CrawlResult<()>;

    /// Inner markup of the first element matching `scope`, waiting up to
    /// `timeout` for it to appear.
    async fn extract_markup(&mut self, scope: &Locator, timeout: Duration) -> CrawlResult<String>;

    async fn cookies(&mut self) -> CrawlResult<Vec<Cookie>>;

    /// End the automation session. Safe to call more than once.
    async fn quit(&mut self) -> CrawlResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_wire_strategy() {
        assert_eq!(Locator::css("main").using(), "css selector");
        assert_eq!(Locator::xpath("//button").using(), "xpath");
        assert_eq!(Locator::css(".custom-tv0t33").to_string(), "css:.custom-tv0t33");
    }
}
