pub mod csv_export;
pub mod sink;

use crate::error::CrawlError;
use crate::models::{TimeWindow, TrackedEntity, TraderActivityRecord, WalletStanding};
use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use duckdb::{params, Connection};
use std::path::Path;
use tracing::{info, warn};

pub use self::csv_export::CsvSink;
pub use self::sink::{Sink, WriteReport};

/// Read-only listings never return more than this many rows.
pub const MAX_LISTING_LIMIT: usize = 30;
pub const DEFAULT_LISTING_LIMIT: usize = 10;

pub fn clamp_limit(requested: Option<usize>) -> usize {
    requested
        .unwrap_or(DEFAULT_LISTING_LIMIT)
        .clamp(1, MAX_LISTING_LIMIT)
}

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS tokens (
    address     VARCHAR PRIMARY KEY,
    chain       VARCHAR NOT NULL,
    symbol      VARCHAR NOT NULL DEFAULT '',
    dex         VARCHAR,
    -- Raw display strings from the trending table
    price       VARCHAR,
    age         VARCHAR,
    txns        VARCHAR,
    volume      VARCHAR,
    makers      VARCHAR,
    trend_5m    VARCHAR,
    trend_1h    VARCHAR,
    trend_6h    VARCHAR,
    trend_24h   VARCHAR,
    liquidity   VARCHAR,
    mcap        VARCHAR,
    created_at  TIMESTAMP NOT NULL,
    updated_at  TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS top_traders (
    token_address     VARCHAR  NOT NULL,
    time_window       VARCHAR  NOT NULL,
    rank              INTEGER  NOT NULL,
    wallet            VARCHAR  NOT NULL,
    bought_amount     DOUBLE   NOT NULL,
    bought_volume     DOUBLE   NOT NULL,
    sold_amount       DOUBLE   NOT NULL,
    sold_volume       DOUBLE   NOT NULL,
    pnl               DOUBLE   NOT NULL,
    unrealized_value  DOUBLE   NOT NULL,
    balance           VARCHAR  NOT NULL,
    transaction_count BIGINT   NOT NULL,
    scraped_at        TIMESTAMP NOT NULL,
    PRIMARY KEY (token_address, time_window, rank)
);

CREATE SEQUENCE IF NOT EXISTS crawl_run_ids START 1;

CREATE TABLE IF NOT EXISTS crawl_runs (
    id                  BIGINT PRIMARY KEY DEFAULT nextval('crawl_run_ids'),
    kind                VARCHAR NOT NULL,
    started_at          TIMESTAMP NOT NULL,
    finished_at         TIMESTAMP,
    status              VARCHAR NOT NULL DEFAULT 'running',
    entities_processed  INTEGER DEFAULT 0,
    records_written     INTEGER DEFAULT 0,
    error_msg           VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_traders_wallet ON top_traders (wallet);
CREATE INDEX IF NOT EXISTS idx_traders_window ON top_traders (time_window);
"#;

const UPSERT_TOKEN: &str = r#"
    INSERT INTO tokens
        (address, chain, symbol, dex, price, age, txns, volume, makers,
         trend_5m, trend_1h, trend_6h, trend_24h, liquidity, mcap, created_at, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (address) DO UPDATE SET
        chain      = excluded.chain,
        symbol     = excluded.symbol,
        dex        = excluded.dex,
        price      = excluded.price,
        age        = excluded.age,
        txns       = excluded.txns,
        volume     = excluded.volume,
        makers     = excluded.makers,
        trend_5m   = excluded.trend_5m,
        trend_1h   = excluded.trend_1h,
        trend_6h   = excluded.trend_6h,
        trend_24h  = excluded.trend_24h,
        liquidity  = excluded.liquidity,
        mcap       = excluded.mcap,
        updated_at = excluded.updated_at
"#;

const INSERT_TOKEN: &str = r#"
    INSERT INTO tokens
        (address, chain, symbol, dex, price, age, txns, volume, makers,
         trend_5m, trend_1h, trend_6h, trend_24h, liquidity, mcap, created_at, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

const UPSERT_TRADER: &str = r#"
    INSERT INTO top_traders
        (token_address, time_window, rank, wallet, bought_amount, bought_volume,
         sold_amount, sold_volume, pnl, unrealized_value, balance, transaction_count, scraped_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (token_address, time_window, rank) DO UPDATE SET
        wallet            = excluded.wallet,
        bought_amount     = excluded.bought_amount,
        bought_volume     = excluded.bought_volume,
        sold_amount       = excluded.sold_amount,
        sold_volume       = excluded.sold_volume,
        pnl               = excluded.pnl,
        unrealized_value  = excluded.unrealized_value,
        balance           = excluded.balance,
        transaction_count = excluded.transaction_count,
        scraped_at        = excluded.scraped_at
"#;

const SELECT_TOKENS: &str = r#"
    SELECT address, chain, symbol, dex, price, age, txns, volume, makers,
           trend_5m, trend_1h, trend_6h, trend_24h, liquidity, mcap, updated_at
    FROM tokens
    ORDER BY created_at, address
    LIMIT ?
"#;

fn write_token(conn: &Connection, sql: &str, t: &TrackedEntity) -> duckdb::Result<usize> {
    conn.execute(
        sql,
        params![
            t.address, t.chain, t.symbol, t.dex,
            t.price, t.age, t.txns, t.volume, t.makers,
            t.trend_5m, t.trend_1h, t.trend_6h, t.trend_24h,
            t.liquidity, t.mcap,
            t.updated_at, t.updated_at,
        ],
    )
}

fn write_trader(conn: &Connection, r: &TraderActivityRecord) -> duckdb::Result<usize> {
    conn.execute(
        UPSERT_TRADER,
        params![
            r.token_address, r.window.as_str(), i64::from(r.rank), r.wallet,
            r.bought_amount, r.bought_volume, r.sold_amount, r.sold_volume,
            r.pnl, r.unrealized_value, r.balance, r.transaction_count,
            r.scraped_at,
        ],
    )
}

/// Summary of one row of `crawl_runs`.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlRunSummary {
    pub id: i64,
    pub kind: String,
    pub started_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
    pub status: String,
    pub entities_processed: i64,
    pub records_written: i64,
    pub error_msg: Option<String>,
}

// ── Repository ────────────────────────────────────────────────────────────────

pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        self.conn.execute_batch(DDL).context("DDL failed")?;
        self.conn.execute_batch(INDEXES).context("Index creation failed")?;
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Batched writes ────────────────────────────────────────────────────────

    /// Write `items` in transactions of `batch_size`.
    ///
    /// A batch that fails is rolled back and replayed one row at a time, so a
    /// bad record costs only itself. The end state does not depend on where
    /// the batch boundaries fall.
    fn write_batched<T>(
        &self,
        what: &str,
        items: &[T],
        batch_size: usize,
        key: impl Fn(&T) -> String,
        write: impl Fn(&Connection, &T) -> duckdb::Result<usize>,
    ) -> WriteReport {
        let mut report = WriteReport::default();
        for batch in items.chunks(batch_size.max(1)) {
            match self.write_batch(batch, &write) {
                Ok(()) => report.written += batch.len(),
                Err(e) => {
                    warn!("{} batch of {} failed ({}), retrying row by row", what, batch.len(), e);
                    for item in batch {
                        match write(&self.conn, item) {
                            Ok(_) => report.written += 1,
                            Err(e) => {
                                let err = CrawlError::Persistence {
                                    key: key(item),
                                    reason: e.to_string(),
                                };
                                warn!("{err}");
                                report.failed += 1;
                            }
                        }
                    }
                }
            }
        }
        report
    }

    fn write_batch<T>(
        &self,
        batch: &[T],
        write: &impl Fn(&Connection, &T) -> duckdb::Result<usize>,
    ) -> duckdb::Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for item in batch {
            write(&*tx, item)?;
        }
        tx.commit()
    }

    // ── Tokens ────────────────────────────────────────────────────────────────

    /// Insert or fully overwrite entities by address. `created_at` survives.
    pub fn upsert_entities(&self, entities: &[TrackedEntity]) -> WriteReport {
        self.write_batched(
            "token",
            entities,
            entities.len(),
            |t| t.address.clone(),
            |conn, t| write_token(conn, UPSERT_TOKEN, t),
        )
    }

    /// Insert new entities; any existing address fails the whole call.
    pub fn create_entities(&self, entities: &[TrackedEntity]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        for t in entities {
            write_token(&tx, INSERT_TOKEN, t)
                .with_context(|| format!("create token {}", t.address))?;
        }
        tx.commit()?;
        Ok(entities.len())
    }

    pub fn delete_entity(&self, address: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM tokens WHERE address = ?", params![address])?;
        Ok(n > 0)
    }

    /// Worklist in discovery order.
    pub fn list_entities(&self, limit: Option<usize>) -> Result<Vec<TrackedEntity>> {
        let mut stmt = self.conn.prepare(SELECT_TOKENS)?;
        let limit = limit.map_or(i64::MAX, |n| n as i64);
        let rows = stmt.query_map(params![limit], |r| {
            Ok(TrackedEntity {
                address: r.get(0)?,
                chain: r.get(1)?,
                symbol: r.get(2)?,
                dex: r.get(3)?,
                price: r.get(4)?,
                age: r.get(5)?,
                txns: r.get(6)?,
                volume: r.get(7)?,
                makers: r.get(8)?,
                trend_5m: r.get(9)?,
                trend_1h: r.get(10)?,
                trend_6h: r.get(11)?,
                trend_24h: r.get(12)?,
                liquidity: r.get(13)?,
                mcap: r.get(14)?,
                updated_at: r.get(15)?,
            })
        })?;
        rows.collect::<duckdb::Result<Vec<_>>>()
            .context("reading tokens")
    }

    pub fn entity_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM tokens")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    // ── Top traders ───────────────────────────────────────────────────────────

    /// Upsert by `(token_address, window, rank)`, `batch_size` rows per
    /// transaction.
    pub fn upsert_trader_records(&self, records: &[TraderActivityRecord], batch_size: usize) -> WriteReport {
        self.write_batched("trader", records, batch_size, TraderActivityRecord::key, write_trader)
    }

    pub fn top_traders(&self, token_address: &str, window: TimeWindow, limit: usize) -> Result<Vec<TraderActivityRecord>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT rank, wallet, bought_amount, bought_volume, sold_amount, sold_volume,
                      pnl, unrealized_value, balance, transaction_count, scraped_at
               FROM top_traders
               WHERE token_address = ? AND time_window = ?
               ORDER BY rank ASC
               LIMIT ?"#,
        )?;
        let limit = limit.clamp(1, MAX_LISTING_LIMIT) as i64;
        let rows = stmt.query_map(params![token_address, window.as_str(), limit], |r| {
            let rank: i64 = r.get(0)?;
            Ok(TraderActivityRecord {
                token_address: token_address.to_string(),
                window,
                rank: u32::try_from(rank).unwrap_or_default(),
                wallet: r.get(1)?,
                bought_amount: r.get(2)?,
                bought_volume: r.get(3)?,
                sold_amount: r.get(4)?,
                sold_volume: r.get(5)?,
                pnl: r.get(6)?,
                unrealized_value: r.get(7)?,
                balance: r.get(8)?,
                transaction_count: r.get(9)?,
                scraped_at: r.get(10)?,
            })
        })?;
        rows.collect::<duckdb::Result<Vec<_>>>()
            .context("reading top traders")
    }

    /// Wallets ranked by summed PnL across every token for one window.
    pub fn leaderboard(&self, window: TimeWindow, limit: usize) -> Result<Vec<WalletStanding>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT wallet,
                      SUM(pnl)           AS total_pnl,
                      SUM(bought_amount) AS total_bought_amount,
                      SUM(bought_volume) AS total_bought_volume,
                      SUM(sold_amount)   AS total_sold_amount,
                      SUM(sold_volume)   AS total_sold_volume,
                      COUNT(*)           AS appearances
               FROM top_traders
               WHERE time_window = ?
               GROUP BY wallet
               ORDER BY total_pnl DESC, wallet
               LIMIT ?"#,
        )?;
        let limit = limit.clamp(1, MAX_LISTING_LIMIT) as i64;
        let rows = stmt.query_map(params![window.as_str(), limit], |r| {
            Ok(WalletStanding {
                wallet: r.get(0)?,
                total_pnl: r.get(1)?,
                total_bought_amount: r.get(2)?,
                total_bought_volume: r.get(3)?,
                total_sold_amount: r.get(4)?,
                total_sold_volume: r.get(5)?,
                appearances: r.get(6)?,
            })
        })?;
        rows.collect::<duckdb::Result<Vec<_>>>()
            .context("reading leaderboard")
    }

    pub fn trader_record_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare("SELECT COUNT(*) FROM top_traders")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    // ── Crawl run log ─────────────────────────────────────────────────────────

    pub fn begin_crawl_run(&self, kind: &str) -> Result<i64> {
        let id: i64 = self.conn.query_row(
            "INSERT INTO crawl_runs (kind, started_at, status) VALUES (?, ?, 'running') RETURNING id",
            params![kind, Utc::now().naive_utc()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn finish_crawl_run(
        &self, run_id: i64, entities: usize, records: usize, error: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            r#"UPDATE crawl_runs SET
               finished_at = ?, status = ?,
               entities_processed = ?, records_written = ?, error_msg = ?
               WHERE id = ?"#,
            params![
                Utc::now().naive_utc(),
                if error.is_none() { "success" } else { "error" },
                entities as i64, records as i64, error, run_id,
            ],
        )?;
        Ok(())
    }

    pub fn last_crawl_run(&self) -> Result<Option<CrawlRunSummary>> {
        let mut stmt = self.conn.prepare(
            r#"SELECT id, kind, started_at, finished_at, status,
                      entities_processed, records_written, error_msg
               FROM crawl_runs ORDER BY id DESC LIMIT 1"#,
        )?;
        let mut rows = stmt.query_map([], |r| {
            Ok(CrawlRunSummary {
                id: r.get(0)?,
                kind: r.get(1)?,
                started_at: r.get(2)?,
                finished_at: r.get(3)?,
                status: r.get(4)?,
                entities_processed: r.get(5)?,
                records_written: r.get(6)?,
                error_msg: r.get(7)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
