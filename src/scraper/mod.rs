pub mod cleaner;
pub mod parsers;
pub mod selectors;

use crate::browser::Locator;
use crate::error::CrawlResult;
use crate::models::{RankedSnapshotRow, TimeWindow, TraderActivityRecord};
use chrono::NaiveDateTime;

pub use self::parsers::Extraction;
use self::selectors::{DiscoverySelectors, TraderSelectors};

// ── Page extractor ────────────────────────────────────────────────────────────

/// Turns rendered markup into rows, and tells the browser where to look.
///
/// Selectors are compiled once; the crawler never builds a selector itself.
pub struct PageExtractor {
    discovery: DiscoverySelectors,
    traders: TraderSelectors,
}

impl PageExtractor {
    pub fn new() -> CrawlResult<Self> {
        Ok(Self {
            discovery: DiscoverySelectors::compile()?,
            traders: TraderSelectors::compile()?,
        })
    }

    /// Subtree of the trending page that holds the discovery table.
    pub fn discovery_scope(&self) -> Locator {
        Locator::css(selectors::DISCOVERY_SCOPE)
    }

    pub fn trader_panel_button(&self) -> Locator {
        Locator::css(selectors::TRADER_PANEL_BUTTON)
    }

    /// Re-queried after every window switch: the page swaps the whole table.
    pub fn trader_table(&self) -> Locator {
        Locator::css(selectors::TRADER_TABLE)
    }

    pub fn window_tab(&self, window: TimeWindow) -> Locator {
        selectors::window_tab(window)
    }

    pub fn extract_discovery(&self, markup: &str) -> CrawlResult<Extraction<RankedSnapshotRow>> {
        parsers::parse_discovery_table(markup, &self.discovery)
    }

    pub fn extract_traders(
        &self,
        markup: &str,
        token_address: &str,
        window: TimeWindow,
        scraped_at: NaiveDateTime,
    ) -> Extraction<TraderActivityRecord> {
        parsers::parse_trader_table(markup, &self.traders, token_address, window, scraped_at)
    }
}
