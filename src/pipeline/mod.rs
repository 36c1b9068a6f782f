//! Crawl orchestrator: ties browser → extractor → sink together.
//!
//! ## Run modes
//!
//! `run_discovery()`, trending list:
//!   open the trending page, scroll it out, extract the table under `main`,
//!   hand the entities to the sink.
//!
//! `run_top_traders()`: one pass over the worklist, per entity:
//!   `Navigate → WaitReady → Scroll → OpenTraderPanel → {SelectWindow → ExtractWindow}…`
//!   Only `Navigate → WaitReady` is retried. A failing entity is skipped, a
//!   failing window switch keeps the windows already extracted. Only shutdown
//!   or a lost browser session stops the pass early.
//!
//! Both modes save the cookie jar and quit the browser before returning,
//! whatever happened during the crawl.

use crate::browser::{Browser, Cookie, SessionStore};
use crate::config::AppConfig;
use crate::error::{CrawlError, CrawlResult};
use crate::models::{RankedSnapshotRow, TimeWindow, TrackedEntity, TraderActivityRecord};
use crate::scraper::cleaner::snapshot_to_entity;
use crate::scraper::{Extraction, PageExtractor};
use crate::storage::{Sink, WriteReport};
use chrono::Utc;
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_retry::strategy::FixedInterval;
use tracing::{debug, error, info, warn};

/// Step of the per-entity state machine a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlStage {
    Navigate,
    WaitReady,
    Scroll,
    OpenTraderPanel,
    SelectWindow(TimeWindow),
    ExtractWindow(TimeWindow),
}

impl fmt::Display for CrawlStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Navigate => f.write_str("navigate"),
            Self::WaitReady => f.write_str("wait-ready"),
            Self::Scroll => f.write_str("scroll"),
            Self::OpenTraderPanel => f.write_str("open-trader-panel"),
            Self::SelectWindow(w) => write!(f, "select-window {w}"),
            Self::ExtractWindow(w) => write!(f, "extract-window {w}"),
        }
    }
}

/// An entity that did not yield every configured window.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityFailure {
    pub address: String,
    pub symbol: String,
    pub stage: CrawlStage,
    pub reason: String,
    /// Windows extracted before the failure; empty when the entity was skipped.
    pub windows_kept: Vec<TimeWindow>,
    /// The browser session died, so no later entity can succeed either.
    pub fatal: bool,
}

#[derive(Debug, Default)]
pub struct CrawlReport {
    pub entities_total: usize,
    pub completed: usize,
    pub skipped: Vec<EntityFailure>,
    pub truncated: Vec<EntityFailure>,
    pub records: usize,
    pub rejected_rows: usize,
    pub write: WriteReport,
    pub interrupted: bool,
    /// Why the pass stopped before the end of the worklist, if it did.
    pub aborted: Option<String>,
}

impl CrawlReport {
    /// Entities that produced at least one window.
    pub fn processed(&self) -> usize {
        self.completed + self.truncated.len()
    }
}

#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub rows: usize,
    pub blank_rows: usize,
    pub rejected_rows: usize,
    pub write: WriteReport,
    /// Why nothing was extracted, if so.
    pub error: Option<String>,
    pub interrupted: bool,
}

/// Page of a tracked entity on the source site.
pub fn entity_url(base_url: &str, entity: &TrackedEntity) -> String {
    format!(
        "{}/{}/{}",
        base_url.trim_end_matches('/'),
        entity.chain.to_lowercase(),
        entity.address
    )
}

/// Rows gathered so far, keyed by `(entity, window)`.
#[derive(Default)]
struct Harvest {
    rows: BTreeMap<(String, TimeWindow), Vec<TraderActivityRecord>>,
    report: CrawlReport,
}

impl Harvest {
    fn absorb(&mut self, address: &str, window: TimeWindow, extraction: Extraction<TraderActivityRecord>) {
        for err in &extraction.rejected {
            warn!("{} {}: dropped row: {}", address, window, err);
        }
        self.report.rejected_rows += extraction.rejected.len();
        self.rows.insert((address.to_string(), window), extraction.rows);
    }
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

pub struct Pipeline<B: Browser> {
    browser: B,
    extractor: PageExtractor,
    session: SessionStore,
    config: AppConfig,
}

impl<B: Browser> Pipeline<B> {
    pub fn new(browser: B, config: AppConfig) -> CrawlResult<Self> {
        Ok(Self {
            browser,
            extractor: PageExtractor::new()?,
            session: SessionStore::new(config.session.cookie_path.clone()),
            config,
        })
    }

    // ── Discovery ─────────────────────────────────────────────────────────────

    pub async fn run_discovery<S, F>(mut self, sink: &S, shutdown: F) -> DiscoveryReport
    where
        S: Sink + ?Sized,
        F: Future<Output = ()>,
    {
        let cookies = self.restore_cookies();
        let outcome = {
            let crawl = self.discover(cookies.as_deref());
            tokio::select! {
                result = crawl => result,
                () = shutdown => Err(CrawlError::Interrupted),
            }
        };
        self.release().await;

        let mut report = DiscoveryReport::default();
        let extraction = match outcome {
            Ok(extraction) => extraction,
            Err(e) => {
                warn!("Discovery failed: {}", e);
                report.interrupted = matches!(e, CrawlError::Interrupted);
                report.error = Some(e.to_string());
                return report;
            }
        };

        report.blank_rows = extraction.blank;
        report.rejected_rows = extraction.rejected.len();
        let now = Utc::now().naive_utc();
        let mut entities = Vec::with_capacity(extraction.rows.len());
        for row in &extraction.rows {
            match snapshot_to_entity(row, now) {
                Ok(entity) => entities.push(entity),
                Err(e) => {
                    warn!("Dropped trending row {:?}: {}", row.symbol, e);
                    report.rejected_rows += 1;
                }
            }
        }
        report.rows = entities.len();
        report.write = sink.write_entities(&entities);
        info!(
            "Discovery: {} entities | {} blank | {} rejected | {} written",
            report.rows, report.blank_rows, report.rejected_rows, report.write.written
        );
        report
    }

    async fn discover(&mut self, cookies: Option<&[Cookie]>) -> CrawlResult<Extraction<RankedSnapshotRow>> {
        let url = self.config.crawl.trending_url();
        info!("=== Discovery: {} ===", url);
        self.load_with_retry(&url, cookies).await.map_err(|(_, e)| e)?;

        let crawl = &self.config.crawl;
        let (max, pause, settle) = (crawl.scroll_max_iterations, ms(crawl.discovery_scroll_pause_ms), ms(crawl.settle_ms));
        match self.browser.scroll_to_exhaustion(max, pause).await {
            Ok(outcome) => debug!("Trending scroll: {:?}", outcome),
            Err(e) => warn!("Trending scroll failed, extracting what is loaded: {}", e),
        }
        sleep(settle).await;

        let scope = self.extractor.discovery_scope();
        let markup = self
            .browser
            .extract_markup(&scope, self.config.browser.page_load_timeout())
            .await?;
        self.extractor.extract_discovery(&markup)
    }

    // ── Top traders ───────────────────────────────────────────────────────────

    pub async fn run_top_traders<S, F>(mut self, entities: &[TrackedEntity], sink: &S, shutdown: F) -> CrawlReport
    where
        S: Sink + ?Sized,
        F: Future<Output = ()>,
    {
        let cookies = self.restore_cookies();
        let mut harvest = Harvest::default();
        harvest.report.entities_total = entities.len();

        let interrupted = {
            let crawl = self.crawl_entities(entities, cookies.as_deref(), &mut harvest);
            tokio::select! {
                () = crawl => false,
                () = shutdown => true,
            }
        };
        harvest.report.interrupted = interrupted;
        if interrupted {
            warn!("Shutdown requested, keeping what was crawled so far");
        }
        self.release().await;

        let Harvest { rows, mut report } = harvest;
        let records: Vec<TraderActivityRecord> = rows.into_values().flatten().collect();
        report.records = records.len();
        report.write = sink.write_trader_records(&records, self.config.storage.batch_size);

        info!(
            "=== Done: {}/{} entities complete | {} truncated | {} skipped | {} records | {} written | {} failed ===",
            report.completed, report.entities_total,
            report.truncated.len(), report.skipped.len(),
            report.records, report.write.written, report.write.failed,
        );
        report
    }

    async fn crawl_entities(&mut self, entities: &[TrackedEntity], cookies: Option<&[Cookie]>, harvest: &mut Harvest) {
        let base_url = self.config.crawl.base_url.clone();
        if let Err(e) = self.browser.open(&base_url, cookies).await {
            if e.is_fatal() {
                error!("Cannot continue: {}", e);
                harvest.report.aborted = Some(e.to_string());
                return;
            }
            warn!("Could not open {} to restore the session: {}", base_url, e);
        }

        let started = Instant::now();
        let total = entities.len();
        for (i, entity) in entities.iter().enumerate() {
            let entity_started = Instant::now();
            let fatal = match self.crawl_entity(entity, harvest).await {
                Ok(None) => {
                    harvest.report.completed += 1;
                    None
                }
                Ok(Some(truncated)) => {
                    let fatal = truncated.fatal.then(|| truncated.reason.clone());
                    harvest.report.truncated.push(truncated);
                    fatal
                }
                Err(skipped) => {
                    warn!("Skipping {} ({}) at {}: {}", entity.symbol, entity.address, skipped.stage, skipped.reason);
                    let fatal = skipped.fatal.then(|| skipped.reason.clone());
                    harvest.report.skipped.push(skipped);
                    fatal
                }
            };
            info!(
                "Token {}/{}: {} | entity {:.1?} | total {:.1?}",
                i + 1, total, entity.symbol,
                entity_started.elapsed(), started.elapsed()
            );
            if let Some(reason) = fatal {
                error!("Stopping after {}/{} tokens: {}", i + 1, total, reason);
                harvest.report.aborted = Some(reason);
                return;
            }
            if i + 1 < total {
                sleep(self.pace()).await;
            }
        }
    }

    /// `Ok(None)` when every window was extracted, `Ok(Some(_))` when a window
    /// switch cut the list short, `Err(_)` when the entity produced nothing.
    async fn crawl_entity(
        &mut self,
        entity: &TrackedEntity,
        harvest: &mut Harvest,
    ) -> Result<Option<EntityFailure>, EntityFailure> {
        let failure = |stage: CrawlStage, e: CrawlError, windows_kept: Vec<TimeWindow>| EntityFailure {
            address: entity.address.clone(),
            symbol: entity.symbol.clone(),
            stage,
            reason: e.to_string(),
            windows_kept,
            fatal: e.is_fatal(),
        };

        let url = entity_url(&self.config.crawl.base_url, entity);
        self.load_with_retry(&url, None)
            .await
            .map_err(|(stage, e)| failure(stage, e, Vec::new()))?;

        let crawl = &self.config.crawl;
        let (max, pause, settle) = (crawl.scroll_max_iterations, ms(crawl.scroll_pause_ms), ms(crawl.settle_ms));
        let windows = crawl.windows.clone();
        let click_timeout = self.config.browser.click_timeout();

        if let Err(e) = self.browser.scroll_to_exhaustion(max, pause).await {
            warn!("{}: {} failed, continuing: {}", entity.symbol, CrawlStage::Scroll, e);
        }

        let panel = self.extractor.trader_panel_button();
        self.browser
            .click(&panel, click_timeout)
            .await
            .map_err(|e| failure(CrawlStage::OpenTraderPanel, e, Vec::new()))?;
        sleep(settle).await;

        let mut kept = Vec::with_capacity(windows.len());
        for window in windows {
            match self.extract_window(entity, window, click_timeout, settle).await {
                Ok(extraction) => {
                    debug!("{} {}: {} rows", entity.symbol, window, extraction.rows.len());
                    harvest.absorb(&entity.address, window, extraction);
                    kept.push(window);
                }
                Err((stage, e)) if kept.is_empty() => return Err(failure(stage, e, kept)),
                Err((stage, e)) => {
                    warn!("{}: {} failed, keeping {:?}: {}", entity.symbol, stage, kept, e);
                    return Ok(Some(failure(stage, e, kept)));
                }
            }
        }
        Ok(None)
    }

    async fn extract_window(
        &mut self,
        entity: &TrackedEntity,
        window: TimeWindow,
        click_timeout: Duration,
        settle: Duration,
    ) -> Result<Extraction<TraderActivityRecord>, (CrawlStage, CrawlError)> {
        if !window.is_page_default() {
            let tab = self.extractor.window_tab(window);
            self.browser
                .click(&tab, click_timeout)
                .await
                .map_err(|e| (CrawlStage::SelectWindow(window), e))?;
            sleep(settle).await;
        }
        // The table is replaced on every switch, so it is looked up afresh.
        let table = self.extractor.trader_table();
        let markup = self
            .browser
            .extract_markup(&table, click_timeout)
            .await
            .map_err(|e| (CrawlStage::ExtractWindow(window), e))?;
        Ok(self
            .extractor
            .extract_traders(&markup, &entity.address, window, Utc::now().naive_utc()))
    }

    // ── Shared steps ──────────────────────────────────────────────────────────

    /// `Navigate → WaitReady`, retried at a fixed interval.
    async fn load_with_retry(&mut self, url: &str, cookies: Option<&[Cookie]>) -> Result<(), (CrawlStage, CrawlError)> {
        let crawl = &self.config.crawl;
        let mut delays = FixedInterval::from_millis(crawl.retry_delay_secs * 1000)
            .take(crawl.max_retries.saturating_sub(1) as usize);
        let timeout = self.config.browser.page_load_timeout();

        let mut attempt = 1;
        loop {
            let loaded = match cookies {
                Some(_) => self.browser.open(url, cookies).await,
                None => self.browser.navigate(url).await,
            };
            let result = match loaded {
                Ok(()) => self
                    .browser
                    .wait_until_ready(timeout)
                    .await
                    .map_err(|e| (CrawlStage::WaitReady, e)),
                Err(e) => Err((CrawlStage::Navigate, e)),
            };
            let (stage, e) = match result {
                Ok(()) => return Ok(()),
                Err(failed) => failed,
            };
            match delays.next() {
                Some(delay) if !e.is_fatal() => {
                    warn!("Attempt {} at {} failed during {}: {}. Retrying in {:?}", attempt, url, stage, e, delay);
                    sleep(delay).await;
                    attempt += 1;
                }
                _ => return Err((stage, e)),
            }
        }
    }

    fn restore_cookies(&self) -> Option<Vec<Cookie>> {
        match self.session.load() {
            Ok(cookies) => cookies,
            Err(e) => {
                warn!("Ignoring saved session: {}", e);
                None
            }
        }
    }

    /// Save the cookie jar, then end the browser session.
    async fn release(&mut self) {
        match self.browser.cookies().await {
            Ok(jar) => {
                if let Err(e) = self.session.save(&jar) {
                    warn!("{}", e);
                }
            }
            Err(e) => warn!("Could not read cookies from the browser: {}", e),
        }
        if let Err(e) = self.browser.quit().await {
            warn!("Browser did not quit cleanly: {}", e);
        }
    }

    fn pace(&self) -> Duration {
        let crawl = &self.config.crawl;
        let jitter = if crawl.jitter_ms > 0 {
            rand::rng().random_range(0..=crawl.jitter_ms)
        } else {
            0
        };
        ms(crawl.entity_delay_ms + jitter)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{Locator, ScrollOutcome};
    use crate::scraper::selectors;
    use async_trait::async_trait;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    /// Scripted browser: pages load unless their URL is listed as broken,
    /// clicks succeed unless the locator is listed as missing.
    #[derive(Default)]
    struct FakeBrowser {
        broken_urls: HashSet<String>,
        /// `(url, locator)` pairs that never become clickable.
        missing: HashSet<(String, String)>,
        /// Navigating here reports the session as gone.
        lost_at: Option<String>,
        trader_rows: usize,
        discovery_markup: Option<String>,
        current_url: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl FakeBrowser {
        fn new(trader_rows: usize) -> Self {
            Self { trader_rows, ..Default::default() }
        }

        fn record(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    #[async_trait]
    impl Browser for FakeBrowser {
        async fn open(&mut self, url: &str, cookies: Option<&[Cookie]>) -> CrawlResult<()> {
            self.record(format!("open {url} cookies={}", cookies.map_or(0, |c| c.len())));
            self.navigate(url).await
        }

        async fn navigate(&mut self, url: &str) -> CrawlResult<()> {
            self.record(format!("navigate {url}"));
            self.current_url = url.to_string();
            if self.lost_at.as_deref() == Some(url) {
                return Err(CrawlError::SessionLost("invalid session id".to_string()));
            }
            if self.broken_urls.contains(url) {
                return Err(CrawlError::NavigationTimeout { url: url.to_string(), waited: Duration::from_secs(60) });
            }
            Ok(())
        }

        async fn wait_until_ready(&mut self, _timeout: Duration) -> CrawlResult<()> {
            Ok(())
        }

        async fn scroll_to_exhaustion(&mut self, max_iterations: u32, pause: Duration) -> CrawlResult<ScrollOutcome> {
            sleep(pause).await;
            Ok(ScrollOutcome { iterations: max_iterations.min(2), final_height: 4000, exhausted: true })
        }

        async fn click(&mut self, target: &Locator, timeout: Duration) -> CrawlResult<()> {
            self.record(format!("click {target}"));
            if self.missing.contains(&(self.current_url.clone(), target.to_string())) {
                sleep(timeout).await;
                return Err(CrawlError::ElementNotInteractable { locator: target.to_string(), waited: timeout });
            }
            Ok(())
        }

        async fn extract_markup(&mut self, scope: &Locator, _timeout: Duration) -> CrawlResult<String> {
            if scope.value == selectors::DISCOVERY_SCOPE {
                return self.discovery_markup.clone().ok_or_else(|| CrawlError::not_found(scope));
            }
            Ok(trader_table(self.trader_rows))
        }

        async fn cookies(&mut self) -> CrawlResult<Vec<Cookie>> {
            Ok(vec![serde_json::from_value(serde_json::json!({"name": "__cf_bm", "value": "fresh"})).unwrap()])
        }

        async fn quit(&mut self) -> CrawlResult<()> {
            self.record("quit".to_string());
            Ok(())
        }
    }

    fn trader_table(rows: usize) -> String {
        (1..=rows)
            .map(|i| {
                format!(
                    r#"<div class="custom-1nvxwu0">
                         <span class="custom-q9k0mw">#{i}</span>
                         <div class="custom-1dwgrrr"><a href="https://solscan.io/account/W{i}">view</a></div>
                         <div class="custom-1o79wax"><span class="custom-6qd5i2">$1K</span><span class="custom-2ygcmq">10</span></div>
                         <div class="custom-1o79wax"><span class="custom-6qd5i2">-</span></div>
                         <div class="custom-1yklr7h">$25</div>
                         <div class="custom-1hd7h4r">$0</div>
                         <div class="custom-1cicvqe"><span class="custom-sqw9c5">?</span></div>
                         <div class="custom-13ppmr2">1 / 2</div>
                       </div>"#
                )
            })
            .collect()
    }

    /// Collects whatever the pipeline hands over.
    #[derive(Default)]
    struct MemorySink {
        entities: RefCell<Vec<TrackedEntity>>,
        records: RefCell<Vec<TraderActivityRecord>>,
    }

    impl Sink for MemorySink {
        fn write_entities(&self, entities: &[TrackedEntity]) -> WriteReport {
            self.entities.borrow_mut().extend_from_slice(entities);
            WriteReport { written: entities.len(), failed: 0 }
        }

        fn write_trader_records(&self, records: &[TraderActivityRecord], _batch_size: usize) -> WriteReport {
            self.records.borrow_mut().extend_from_slice(records);
            WriteReport { written: records.len(), failed: 0 }
        }
    }

    fn config(dir: &tempfile::TempDir) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.session.cookie_path = dir.path().join("cookies.json");
        cfg
    }

    fn worklist(n: usize) -> Vec<TrackedEntity> {
        (1..=n)
            .map(|i| TrackedEntity::manual(&format!("TOK{i}"), "Solana", &format!("pair{i}"), Utc::now().naive_utc()))
            .collect()
    }

    fn url_of(cfg: &AppConfig, entity: &TrackedEntity) -> String {
        entity_url(&cfg.crawl.base_url, entity)
    }

    fn windows_for(sink: &MemorySink, address: &str) -> Vec<TimeWindow> {
        let mut windows: Vec<_> = sink
            .records
            .borrow()
            .iter()
            .filter(|r| r.token_address == address)
            .map(|r| r.window)
            .collect();
        windows.dedup();
        windows
    }

    async fn never() {
        std::future::pending::<()>().await
    }

    #[test]
    fn test_entity_url_lowercases_chain() {
        let e = TrackedEntity { chain: "Solana".into(), ..TrackedEntity::manual("X", "", "abc", Utc::now().naive_utc()) };
        assert_eq!(entity_url("https://dexscreener.com/", &e), "https://dexscreener.com/solana/abc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_windows_extracted() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MemorySink::default();
        let pipeline = Pipeline::new(FakeBrowser::new(3), config(&dir)).unwrap();

        let report = pipeline.run_top_traders(&worklist(1), &sink, never()).await;

        assert_eq!(report.completed, 1);
        assert_eq!(report.records, 12);
        assert_eq!(report.write.written, 12);
        assert_eq!(windows_for(&sink, "pair1"), TimeWindow::ALL.to_vec());
        let first = &sink.records.borrow()[0];
        assert_eq!(first.pnl, -25.0);
        assert_eq!(first.sold_volume, 0.0);
        assert_eq!(first.balance, "0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_switch_failure_keeps_earlier_windows() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let entities = worklist(2);
        let mut browser = FakeBrowser::new(2);
        browser.missing.insert((url_of(&cfg, &entities[0]), selectors::window_tab(TimeWindow::Days3).to_string()));
        let sink = MemorySink::default();

        let report = Pipeline::new(browser, cfg).unwrap().run_top_traders(&entities, &sink, never()).await;

        assert_eq!(windows_for(&sink, "pair1"), vec![TimeWindow::Days30, TimeWindow::Days7]);
        assert_eq!(windows_for(&sink, "pair2"), TimeWindow::ALL.to_vec());
        assert_eq!(report.completed, 1);
        assert_eq!(report.truncated.len(), 1);
        assert_eq!(report.truncated[0].stage, CrawlStage::SelectWindow(TimeWindow::Days3));
        assert_eq!(report.truncated[0].windows_kept, vec![TimeWindow::Days30, TimeWindow::Days7]);
        assert_eq!(report.processed(), 2);
        assert!(report.aborted.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_entity_is_skipped_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let entities = worklist(5);
        let broken = url_of(&cfg, &entities[1]);
        let mut browser = FakeBrowser::new(1);
        browser.broken_urls.insert(broken.clone());
        let log = Arc::clone(&browser.log);
        let sink = MemorySink::default();

        let report = Pipeline::new(browser, cfg).unwrap().run_top_traders(&entities, &sink, never()).await;

        for address in ["pair1", "pair3", "pair4", "pair5"] {
            assert_eq!(windows_for(&sink, address).len(), 4, "{address}");
        }
        assert!(windows_for(&sink, "pair2").is_empty());
        assert_eq!(report.completed, 4);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].address, "pair2");
        assert_eq!(report.skipped[0].stage, CrawlStage::Navigate);
        assert!(!report.skipped[0].fatal);
        assert_eq!(report.processed(), 4);

        let attempts = log.lock().unwrap().iter().filter(|l| **l == format!("navigate {broken}")).count();
        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_session_stops_the_pass_without_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let entities = worklist(5);
        let lost = url_of(&cfg, &entities[1]);
        let mut browser = FakeBrowser::new(1);
        browser.lost_at = Some(lost.clone());
        let log = Arc::clone(&browser.log);
        let sink = MemorySink::default();

        let report = Pipeline::new(browser, cfg.clone()).unwrap().run_top_traders(&entities, &sink, never()).await;

        assert_eq!(report.completed, 1);
        assert_eq!(report.processed(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.skipped[0].fatal);
        assert!(report.aborted.as_deref().unwrap().contains("invalid session id"));
        assert_eq!(windows_for(&sink, "pair1").len(), 4);

        let log = log.lock().unwrap();
        assert_eq!(log.iter().filter(|l| **l == format!("navigate {lost}")).count(), 1);
        for e in &entities[2..] {
            let url = url_of(&cfg, e);
            assert!(!log.iter().any(|l| *l == format!("navigate {url}")), "{url}");
        }
        assert_eq!(log.last().map(String::as_str), Some("quit"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panel_failure_skips_entity() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let entities = worklist(2);
        let mut browser = FakeBrowser::new(1);
        browser.missing.insert((url_of(&cfg, &entities[1]), Locator::css(selectors::TRADER_PANEL_BUTTON).to_string()));
        let sink = MemorySink::default();

        let report = Pipeline::new(browser, cfg).unwrap().run_top_traders(&entities, &sink, never()).await;

        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].stage, CrawlStage::OpenTraderPanel);
        assert_eq!(windows_for(&sink, "pair1").len(), 4);
        assert!(windows_for(&sink, "pair2").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_saved_even_when_everything_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let cookie_path = cfg.session.cookie_path.clone();
        let entities = worklist(3);
        let mut browser = FakeBrowser::new(1);
        for e in &entities {
            browser.broken_urls.insert(url_of(&cfg, e));
        }
        let log = Arc::clone(&browser.log);
        let sink = MemorySink::default();

        let report = Pipeline::new(browser, cfg).unwrap().run_top_traders(&entities, &sink, never()).await;

        assert_eq!(report.skipped.len(), 3);
        assert_eq!(report.records, 0);
        let saved = SessionStore::new(&cookie_path).load().unwrap().unwrap();
        assert_eq!(saved[0].value, "fresh");
        assert_eq!(log.lock().unwrap().last().map(String::as_str), Some("quit"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_keeps_partial_results_and_saves_session() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let cookie_path = cfg.session.cookie_path.clone();
        let sink = MemorySink::default();
        // Every entity spends at least ten seconds in settle and scroll pauses.
        let shutdown = sleep(Duration::from_secs(20));

        let report = Pipeline::new(FakeBrowser::new(1), cfg)
            .unwrap()
            .run_top_traders(&worklist(50), &sink, shutdown)
            .await;

        assert!(report.interrupted);
        assert!(report.completed < 50);
        assert_eq!(report.write.written, sink.records.borrow().len());
        assert!(SessionStore::new(&cookie_path).load().unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cookies_restored_on_first_open() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let jar: Vec<Cookie> = vec![serde_json::from_value(serde_json::json!({"name": "a", "value": "b"})).unwrap()];
        SessionStore::new(&cfg.session.cookie_path).save(&jar).unwrap();
        let browser = FakeBrowser::new(1);
        let log = Arc::clone(&browser.log);

        Pipeline::new(browser, cfg).unwrap().run_top_traders(&worklist(1), &MemorySink::default(), never()).await;

        let first = log.lock().unwrap()[0].clone();
        assert_eq!(first, "open https://dexscreener.com cookies=1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_writes_entities() {
        let dir = tempfile::tempdir().unwrap();
        let mut browser = FakeBrowser::new(0);
        browser.discovery_markup = Some(
            r#"<div class="ds-dex-table ds-dex-table-top">
                 <button class="ds-table-th-button">Token</button>
                 <button class="ds-table-th-button">Price</button>
                 <button class="ds-table-th-button">MCAP</button>
                 <a class="ds-dex-table-row" href="/solana/pairA">
                   <div class="ds-table-data-cell">
                     <img class="ds-dex-table-row-chain-icon" title="Solana">
                     <img class="ds-dex-table-row-dex-icon" title="Raydium">
                     <span class="ds-dex-table-row-base-token-symbol">BONK</span>
                   </div>
                   <div class="ds-table-data-cell">$0.00002</div>
                   <div class="ds-table-data-cell">$1.2B</div>
                 </a>
               </div>"#
                .to_string(),
        );
        let sink = MemorySink::default();

        let report = Pipeline::new(browser, config(&dir)).unwrap().run_discovery(&sink, never()).await;

        assert_eq!(report.error, None);
        assert_eq!(report.rows, 1);
        let entities = sink.entities.borrow();
        assert_eq!(entities[0].address, "pairA");
        assert_eq!(entities[0].chain, "solana");
        assert_eq!(entities[0].mcap.as_deref(), Some("$1.2B"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_without_table_still_saves_session() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(&dir);
        let cookie_path = cfg.session.cookie_path.clone();
        let sink = MemorySink::default();

        let report = Pipeline::new(FakeBrowser::new(0), cfg).unwrap().run_discovery(&sink, never()).await;

        assert!(report.error.is_some());
        assert!(sink.entities.borrow().is_empty());
        assert!(cookie_path.exists());
    }
}
