use crate::error::{CrawlError, CrawlResult};
use crate::models::{RankedSnapshotRow, TrackedEntity};
use chrono::NaiveDateTime;

/// Display strings the page uses for "no value".
const SENTINELS: [&str; 2] = ["-", "Unknown"];

/// Characters dropped before reading a number: currency, grouping, "less than".
const NOISE: [char; 3] = ['$', ',', '<'];

// ── Normalizer ────────────────────────────────────────────────────────────────

/// Turn a humanized display number into a canonical decimal string.
///
/// "$1.2K" → "1200.0" | "-" → "0" | "<0.01" → "0.01" | "1,234.5" → "1234.5"
///
/// Input without a magnitude suffix is only stripped, so canonical input comes
/// back unchanged. A suffixed value whose prefix is not a decimal is an error.
pub fn normalize(text: &str) -> CrawlResult<String> {
    let text = text.trim();
    if SENTINELS.contains(&text) {
        return Ok("0".to_string());
    }

    let stripped: String = text.chars().filter(|c| !NOISE.contains(c)).collect();
    let stripped = stripped.trim();

    let exponent = match stripped.chars().last() {
        Some('K') => 3,
        Some('M') => 6,
        Some('B') => 9,
        _ => return Ok(stripped.to_string()),
    };

    let prefix = stripped[..stripped.len() - 1].trim();
    scale_decimal(prefix, exponent)
        .ok_or_else(|| CrawlError::parse("number", format!("{text:?} is not a humanized decimal")))
}

/// Multiply a decimal literal by 10^exponent by moving its point, so that
/// "1.2" × 10³ is exactly "1200.0" rather than a binary float approximation.
fn scale_decimal(literal: &str, exponent: usize) -> Option<String> {
    let (sign, unsigned) = match literal.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", literal.strip_prefix('+').unwrap_or(literal)),
    };

    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty()) || !all_digits(int_part) || !all_digits(frac_part) {
        return None;
    }

    let (int_digits, frac_digits) = if frac_part.len() <= exponent {
        let pad = "0".repeat(exponent - frac_part.len());
        (format!("{int_part}{frac_part}{pad}"), String::new())
    } else {
        let (moved, rest) = frac_part.split_at(exponent);
        (format!("{int_part}{moved}"), rest.to_string())
    };

    let int_digits = int_digits.trim_start_matches('0');
    let frac_digits = frac_digits.trim_end_matches('0');
    Some(format!(
        "{sign}{}.{}",
        if int_digits.is_empty() { "0" } else { int_digits },
        if frac_digits.is_empty() { "0" } else { frac_digits },
    ))
}

/// Normalize then read as a float, naming the field on failure.
pub fn parse_decimal(field: &'static str, text: &str) -> CrawlResult<f64> {
    let canonical = normalize(text)?;
    canonical
        .parse::<f64>()
        .map_err(|_| CrawlError::parse(field, format!("{text:?} normalized to {canonical:?}")))
}

/// Last non-empty path segment of an explorer or pair link.
/// "https://solscan.io/account/7xKX…" → "7xKX…" | "/solana/abc" → "abc"
pub fn last_path_segment(href: &str) -> Option<String> {
    let path = match url::Url::parse(href) {
        Ok(url) => url.path().to_string(),
        Err(_) => href.split(['?', '#']).next().unwrap_or_default().to_string(),
    };
    path.split('/')
        .rev()
        .find(|s| !s.trim().is_empty())
        .map(|s| s.trim().to_string())
}

pub fn normalise_chain(s: &str) -> String {
    s.trim().to_lowercase()
}

// ── Discovery row → TrackedEntity ─────────────────────────────────────────────

pub fn snapshot_to_entity(row: &RankedSnapshotRow, now: NaiveDateTime) -> CrawlResult<TrackedEntity> {
    let address = row.address.trim();
    if address.is_empty() {
        return Err(CrawlError::parse(
            "address",
            format!("row for {:?} has no pair link", row.symbol),
        ));
    }

    let column = |header: &str| {
        row.column(header)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let non_empty = |s: &str| {
        let s = s.trim();
        if s.is_empty() { None } else { Some(s.to_string()) }
    };

    Ok(TrackedEntity {
        address: address.to_string(),
        chain: normalise_chain(&row.chain),
        symbol: row.symbol.trim().to_string(),
        dex: non_empty(&row.dex),
        price: column("Price"),
        age: column("Age"),
        txns: column("Txns"),
        volume: column("Volume"),
        makers: column("Makers"),
        trend_5m: column("5M"),
        trend_1h: column("1H"),
        trend_6h: column("6H"),
        trend_24h: column("24H"),
        liquidity: column("Liquidity"),
        mcap: column("MCAP"),
        updated_at: now,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
