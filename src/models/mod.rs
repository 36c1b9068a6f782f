use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ── Time window ───────────────────────────────────────────────────────────────

/// Trailing period a top-trader table is aggregated over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimeWindow {
    #[serde(rename = "30d")]
    Days30,
    #[serde(rename = "7d")]
    Days7,
    #[serde(rename = "3d")]
    Days3,
    #[serde(rename = "1d")]
    Days1,
}

impl TimeWindow {
    /// Page order: the first entry is the tab shown when the panel opens.
    pub const ALL: [TimeWindow; 4] = [Self::Days30, Self::Days7, Self::Days3, Self::Days1];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Days30 => "30d",
            Self::Days7 => "7d",
            Self::Days3 => "3d",
            Self::Days1 => "1d",
        }
    }

    /// The window selected without clicking any tab.
    pub fn is_page_default(self) -> bool {
        self == Self::Days30
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "30d" => Ok(Self::Days30),
            "7d" => Ok(Self::Days7),
            "3d" => Ok(Self::Days3),
            "1d" => Ok(Self::Days1),
            other => Err(format!("invalid window {other:?}: must be one of 30d, 7d, 3d, 1d")),
        }
    }
}

// ── Tracked entity ────────────────────────────────────────────────────────────

/// A token pair under observation. Keyed by `address`.
///
/// The metric columns hold the raw display strings of the discovery table at
/// the time the entity was last seen there.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedEntity {
    pub address: String,
    pub chain: String,
    pub symbol: String,
    pub dex: Option<String>,
    pub price: Option<String>,
    pub age: Option<String>,
    pub txns: Option<String>,
    pub volume: Option<String>,
    pub makers: Option<String>,
    pub trend_5m: Option<String>,
    pub trend_1h: Option<String>,
    pub trend_6h: Option<String>,
    pub trend_24h: Option<String>,
    pub liquidity: Option<String>,
    pub mcap: Option<String>,
    pub updated_at: NaiveDateTime,
}

impl TrackedEntity {
    /// Entity registered by hand, with no discovery metrics yet.
    pub fn manual(symbol: &str, chain: &str, address: &str, now: NaiveDateTime) -> Self {
        Self {
            address: address.trim().to_string(),
            chain: chain.trim().to_lowercase(),
            symbol: symbol.trim().to_string(),
            dex: None,
            price: None,
            age: None,
            txns: None,
            volume: None,
            makers: None,
            trend_5m: None,
            trend_1h: None,
            trend_6h: None,
            trend_24h: None,
            liquidity: None,
            mcap: None,
            updated_at: now,
        }
    }
}

// ── Discovery table row ───────────────────────────────────────────────────────

/// One row of the trending table as rendered, before any interpretation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankedSnapshotRow {
    pub address: String,
    pub chain: String,
    pub dex: String,
    pub symbol: String,
    /// `(header, display text)` in header order, token cell excluded.
    pub columns: Vec<(String, String)>,
}

impl RankedSnapshotRow {
    /// Display text of a column, matched case-insensitively on the header.
    pub fn column(&self, header: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(h, _)| h.eq_ignore_ascii_case(header))
            .map(|(_, v)| v.as_str())
    }
}

// ── Trader activity ───────────────────────────────────────────────────────────

/// One row of a token's top-trader table for one window.
/// Unique by `(token_address, window, rank)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraderActivityRecord {
    pub token_address: String,
    pub window: TimeWindow,
    pub rank: u32,
    pub wallet: String,
    pub bought_amount: f64,
    pub bought_volume: f64,
    pub sold_amount: f64,
    pub sold_volume: f64,
    pub pnl: f64,
    pub unrealized_value: f64,
    /// `"current/total"` in canonical decimals, or `"0"` when unknown.
    pub balance: String,
    pub transaction_count: i64,
    pub scraped_at: NaiveDateTime,
}

impl TraderActivityRecord {
    pub fn key(&self) -> String {
        format!("{}/{}/#{}", self.token_address, self.window, self.rank)
    }
}

/// Per-wallet aggregate over every token for one window.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WalletStanding {
    pub wallet: String,
    pub total_pnl: f64,
    pub total_bought_amount: f64,
    pub total_bought_volume: f64,
    pub total_sold_amount: f64,
    pub total_sold_volume: f64,
    pub appearances: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_window_parse() {
        assert_eq!("7d".parse::<TimeWindow>(), Ok(TimeWindow::Days7));
        assert_eq!(" 30D ".parse::<TimeWindow>(), Ok(TimeWindow::Days30));
        assert!("2d".parse::<TimeWindow>().is_err());
        assert_eq!(TimeWindow::Days1.to_string(), "1d");
    }

    #[test]
    fn test_only_thirty_days_is_default_tab() {
        let defaults: Vec<_> = TimeWindow::ALL.iter().filter(|w| w.is_page_default()).collect();
        assert_eq!(defaults, vec![&TimeWindow::Days30]);
        assert_eq!(TimeWindow::ALL[0], TimeWindow::Days30);
    }

    #[test]
    fn test_column_lookup_ignores_case() {
        let row = RankedSnapshotRow {
            columns: vec![("MCAP".into(), "$1.2M".into())],
            ..Default::default()
        };
        assert_eq!(row.column("mcap"), Some("$1.2M"));
        assert_eq!(row.column("Price"), None);
    }
}
