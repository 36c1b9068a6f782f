//! Every structural selector the crawler depends on.
//!
//! The class names are build artifacts of the source site and change without
//! notice. When the layout moves, this is the only file that should need an
//! edit: list the new class next to the old one so both layouts keep parsing.

use crate::browser::Locator;
use crate::error::{CrawlError, CrawlResult};
use crate::models::TimeWindow;
use scraper::Selector;

// ── Discovery (trending) table ───────────────────────────────────────────────

/// Browser-side scope handed to the extractor for the trending page.
pub const DISCOVERY_SCOPE: &str = "main";
/// Table container, newest layout first.
pub const DISCOVERY_CONTAINERS: [&str; 2] = [".ds-dex-table-top", ".ds-dex-table"];
pub const DISCOVERY_HEADER: &str = ".ds-table-th-button";
pub const DISCOVERY_ROW: &str = ".ds-dex-table-row";
pub const DISCOVERY_CELL: &str = ".ds-table-data-cell";
pub const CHAIN_ICON: &str = ".ds-dex-table-row-chain-icon";
pub const DEX_ICON: &str = ".ds-dex-table-row-dex-icon";
pub const BASE_SYMBOL: &str = ".ds-dex-table-row-base-token-symbol";

// ── Top-trader panel ─────────────────────────────────────────────────────────

pub const TRADER_PANEL_BUTTON: &str = ".custom-tv0t33";
pub const TRADER_TABLE: &str = ".custom-1vjv7zm";
pub const TRADER_ROW: &str = ".custom-1nvxwu0";
pub const RANK: &str = ".custom-q9k0mw";
pub const WALLET_LINK: &str = ".custom-1dwgrrr a";
/// Bought column first, sold column second.
pub const TRADE_COLUMN: &str = ".custom-1o79wax";
/// The second class is the "new token" rendering of the same amount.
pub const BOUGHT_AMOUNT: &str = ".custom-6qd5i2, .custom-rcecxm";
pub const SOLD_AMOUNT: &str = ".custom-6qd5i2, .custom-dv3t8y";
pub const TRADE_VOLUME: &str = ".custom-2ygcmq";
pub const PNL_POSITIVE: &str = ".custom-1e9y0rl";
pub const PNL_NEGATIVE: &str = ".custom-1yklr7h";
pub const UNREALIZED: &str = ".custom-1hd7h4r";
pub const UNREALIZED_VALUE: &str = ".custom-6qd5i2";
pub const BALANCE: &str = ".custom-1cicvqe";
pub const BALANCE_UNKNOWN: &str = ".custom-sqw9c5";
pub const BALANCE_PART: &str = ".custom-2ygcmq";
pub const TXN_COUNTER: &str = ".custom-13ppmr2";

/// Tab button whose label span reads exactly the window name.
pub fn window_tab(window: TimeWindow) -> Locator {
    Locator::xpath(format!("//button[.//span[text()='{}']]", window.as_str()))
}

pub fn compile(css: &str) -> CrawlResult<Selector> {
    Selector::parse(css).map_err(|e| CrawlError::Selector {
        selector: css.to_string(),
        reason: format!("{e:?}"),
    })
}

// ── Compiled sets ────────────────────────────────────────────────────────────

pub struct DiscoverySelectors {
    pub containers: Vec<Selector>,
    pub header: Selector,
    pub row: Selector,
    pub cell: Selector,
    pub chain_icon: Selector,
    pub dex_icon: Selector,
    pub symbol: Selector,
}

impl DiscoverySelectors {
    pub fn compile() -> CrawlResult<Self> {
        Ok(Self {
            containers: DISCOVERY_CONTAINERS
                .iter()
                .map(|css| compile(css))
                .collect::<CrawlResult<_>>()?,
            header: compile(DISCOVERY_HEADER)?,
            row: compile(DISCOVERY_ROW)?,
            cell: compile(DISCOVERY_CELL)?,
            chain_icon: compile(CHAIN_ICON)?,
            dex_icon: compile(DEX_ICON)?,
            symbol: compile(BASE_SYMBOL)?,
        })
    }
}

pub struct TraderSelectors {
    pub row: Selector,
    pub rank: Selector,
    pub wallet_link: Selector,
    pub trade_column: Selector,
    pub bought_amount: Selector,
    pub sold_amount: Selector,
    pub trade_volume: Selector,
    /// Either PnL variant.
    pub pnl: Selector,
    pub pnl_negative: Selector,
    pub unrealized: Selector,
    pub unrealized_value: Selector,
    pub balance: Selector,
    pub balance_unknown: Selector,
    pub balance_part: Selector,
    pub txn_counter: Selector,
}

impl TraderSelectors {
    pub fn compile() -> CrawlResult<Self> {
        Ok(Self {
            row: compile(TRADER_ROW)?,
            rank: compile(RANK)?,
            wallet_link: compile(WALLET_LINK)?,
            trade_column: compile(TRADE_COLUMN)?,
            bought_amount: compile(BOUGHT_AMOUNT)?,
            sold_amount: compile(SOLD_AMOUNT)?,
            trade_volume: compile(TRADE_VOLUME)?,
            pnl: compile(&format!("{PNL_POSITIVE}, {PNL_NEGATIVE}"))?,
            pnl_negative: compile(PNL_NEGATIVE)?,
            unrealized: compile(UNREALIZED)?,
            unrealized_value: compile(UNREALIZED_VALUE)?,
            balance: compile(BALANCE)?,
            balance_unknown: compile(BALANCE_UNKNOWN)?,
            balance_part: compile(BALANCE_PART)?,
            txn_counter: compile(TXN_COUNTER)?,
        })
    }
}
