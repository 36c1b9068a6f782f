use crate::error::{CrawlError, CrawlResult};
use crate::models::{RankedSnapshotRow, TimeWindow, TraderActivityRecord};
use chrono::NaiveDateTime;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use super::cleaner::{last_path_segment, normalize, parse_decimal};
use super::selectors::{self, DiscoverySelectors, TraderSelectors};

/// Rows recovered from one table, plus the rows that could not be read.
#[derive(Debug)]
pub struct Extraction<T> {
    pub rows: Vec<T>,
    /// One entry per structurally present row whose mandatory fields failed.
    pub rejected: Vec<CrawlError>,
    /// Rows dropped because every cell was empty (placeholders, skeletons).
    pub blank: usize,
}

impl<T> Default for Extraction<T> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            rejected: Vec::new(),
            blank: 0,
        }
    }
}

fn text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn first<'a>(scope: ElementRef<'a>, sel: &Selector) -> Option<ElementRef<'a>> {
    scope.select(sel).next()
}

// ── Discovery table ───────────────────────────────────────────────────────────

/// Parse the trending table out of the rendered `main` markup.
///
/// Fails with `ElementNotFound` only when no known table container exists.
pub fn parse_discovery_table(
    markup: &str,
    sel: &DiscoverySelectors,
) -> CrawlResult<Extraction<RankedSnapshotRow>> {
    let doc = Html::parse_fragment(markup);
    let container = sel
        .containers
        .iter()
        .find_map(|s| doc.select(s).next())
        .ok_or_else(|| CrawlError::not_found(selectors::DISCOVERY_CONTAINERS.join(" | ")))?;

    let headers: Vec<String> = container
        .select(&sel.header)
        .map(text)
        .filter(|h| !h.is_empty())
        .collect();

    let mut out = Extraction::default();
    for row in container.select(&sel.row) {
        let cells: Vec<ElementRef<'_>> = row.select(&sel.cell).collect();
        let texts: Vec<String> = cells.iter().map(|c| text(*c)).collect();
        if texts.iter().all(|t| t.is_empty()) {
            out.blank += 1;
            continue;
        }

        let token_cell = cells[0];
        let title = |s: &Selector| {
            first(token_cell, s)
                .and_then(|img| img.value().attr("title"))
                .unwrap_or_default()
                .trim()
                .to_string()
        };

        let address = row
            .value()
            .attr("href")
            .and_then(last_path_segment)
            .unwrap_or_default();

        out.rows.push(RankedSnapshotRow {
            address,
            chain: title(&sel.chain_icon),
            dex: title(&sel.dex_icon),
            symbol: first(token_cell, &sel.symbol).map(text).unwrap_or_default(),
            columns: headers
                .iter()
                .skip(1)
                .cloned()
                .zip(texts.into_iter().skip(1))
                .collect(),
        });
    }

    debug!(
        "discovery table: {} headers, {} rows, {} blank",
        headers.len(),
        out.rows.len(),
        out.blank
    );
    Ok(out)
}

// ── Top-trader table ──────────────────────────────────────────────────────────

/// Parse every row of one window's top-trader table.
///
/// A row that fails to parse is reported in `rejected`; the rest of the table
/// is still returned.
pub fn parse_trader_table(
    markup: &str,
    sel: &TraderSelectors,
    token_address: &str,
    window: TimeWindow,
    scraped_at: NaiveDateTime,
) -> Extraction<TraderActivityRecord> {
    let doc = Html::parse_fragment(markup);
    let mut out = Extraction::default();

    for row in doc.select(&sel.row) {
        if text(row).is_empty() {
            out.blank += 1;
            continue;
        }
        match parse_trader_row(row, sel) {
            Ok(fields) => out.rows.push(TraderActivityRecord {
                token_address: token_address.to_string(),
                window,
                rank: fields.rank,
                wallet: fields.wallet,
                bought_amount: fields.bought.amount,
                bought_volume: fields.bought.volume,
                sold_amount: fields.sold.amount,
                sold_volume: fields.sold.volume,
                pnl: fields.pnl,
                unrealized_value: fields.unrealized_value,
                balance: fields.balance,
                transaction_count: fields.transaction_count,
                scraped_at,
            }),
            Err(e) => out.rejected.push(e),
        }
    }
    out
}

struct TradeSide {
    amount: f64,
    volume: f64,
}

struct TraderFields {
    rank: u32,
    wallet: String,
    bought: TradeSide,
    sold: TradeSide,
    pnl: f64,
    unrealized_value: f64,
    balance: String,
    transaction_count: i64,
}

fn parse_trader_row(row: ElementRef<'_>, sel: &TraderSelectors) -> CrawlResult<TraderFields> {
    let rank_text = first(row, &sel.rank)
        .map(text)
        .ok_or_else(|| CrawlError::parse("rank", "rank cell missing"))?;
    let rank = rank_text
        .trim_start_matches('#')
        .trim()
        .parse::<u32>()
        .map_err(|_| CrawlError::parse("rank", format!("{rank_text:?}")))?;

    let wallet = first(row, &sel.wallet_link)
        .and_then(|a| a.value().attr("href"))
        .and_then(last_path_segment)
        .ok_or_else(|| CrawlError::parse("wallet", format!("no explorer link in row #{rank}")))?;

    let columns: Vec<ElementRef<'_>> = row.select(&sel.trade_column).collect();
    let bought = parse_trade_side(
        columns.first().copied(),
        &sel.bought_amount,
        &sel.trade_volume,
        ("bought_amount", "bought_volume"),
    )?;
    let sold = parse_trade_side(
        columns.get(1).copied(),
        &sel.sold_amount,
        &sel.trade_volume,
        ("sold_amount", "sold_volume"),
    )?;

    // The sign lives in which class the cell carries, not in its text.
    let pnl = match first(row, &sel.pnl) {
        Some(cell) => {
            let magnitude = parse_decimal("pnl", &text(cell))?.abs();
            if sel.pnl_negative.matches(&cell) { -magnitude } else { magnitude }
        }
        None => 0.0,
    };

    let unrealized_value = match first(row, &sel.unrealized) {
        Some(cell) => {
            let shown = first(cell, &sel.unrealized_value).map_or_else(|| text(cell), text);
            parse_decimal("unrealized_value", &shown)?
        }
        None => 0.0,
    };

    let balance = match first(row, &sel.balance) {
        Some(cell) if first(cell, &sel.balance_unknown).is_none() => {
            let parts: Vec<String> = cell.select(&sel.balance_part).take(2).map(text).collect();
            match parts.as_slice() {
                [current, total] => format!("{}/{}", normalize(current)?, normalize(total)?),
                _ => "0".to_string(),
            }
        }
        _ => "0".to_string(),
    };

    let transaction_count = match first(row, &sel.txn_counter) {
        Some(cell) => parse_txn_count(&text(cell))?,
        None => 0,
    };

    Ok(TraderFields {
        rank,
        wallet,
        bought,
        sold,
        pnl,
        unrealized_value,
        balance,
        transaction_count,
    })
}

/// Amount plus volume for one side of the trade.
///
/// A zero amount renders without a volume span, so the volume is zero
/// without looking for it.
fn parse_trade_side(
    column: Option<ElementRef<'_>>,
    amount_sel: &Selector,
    volume_sel: &Selector,
    (amount_field, volume_field): (&'static str, &'static str),
) -> CrawlResult<TradeSide> {
    let Some(column) = column else {
        return Ok(TradeSide { amount: 0.0, volume: 0.0 });
    };

    let amount = match first(column, amount_sel) {
        Some(span) => parse_decimal(amount_field, &text(span))?,
        None => 0.0,
    };
    if amount == 0.0 {
        return Ok(TradeSide { amount, volume: 0.0 });
    }

    let volume = match first(column, volume_sel) {
        Some(span) => parse_decimal(volume_field, &text(span))?,
        None => 0.0,
    };
    Ok(TradeSide { amount, volume })
}

/// "4 / 12 txns" → 12: the second slash-separated token, first word.
fn parse_txn_count(counter: &str) -> CrawlResult<i64> {
    if counter.is_empty() {
        return Ok(0);
    }
    let word = counter
        .split('/')
        .nth(1)
        .and_then(|fragment| fragment.split_whitespace().next())
        .ok_or_else(|| CrawlError::parse("transaction_count", format!("{counter:?}")))?;
    Ok(parse_decimal("transaction_count", word)?.round() as i64)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
