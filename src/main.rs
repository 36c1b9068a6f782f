mod browser;
mod config;
mod error;
mod models;
mod pipeline;
mod scraper;
mod storage;
mod utils;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::browser::webdriver::WebDriverBrowser;
use crate::config::AppConfig;
use crate::models::{TimeWindow, TrackedEntity};
use crate::pipeline::Pipeline;
use crate::storage::{clamp_limit, CsvSink, Repository, Sink};
use crate::utils::{fmt_amount, fmt_number, short_address};

#[derive(Parser)]
#[command(name = "dex-harvester", about = "DexScreener trending and top-trader harvester", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Crawl the trending list and upsert the tokens found there
    Discover {
        /// Append to CSV files in this directory instead of the database
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Crawl top traders for every tracked token
    Traders {
        /// Only crawl the first N tracked tokens
        #[arg(short, long)]
        limit: Option<usize>,

        /// Append to CSV files in this directory instead of the database
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Manage the tracked token list
    Tokens {
        #[command(subcommand)]
        action: TokensCommand,
    },

    /// Show the stored top traders of one token
    TopTraders {
        /// Pair address
        #[arg(short, long)]
        token: String,

        #[arg(short, long, default_value = "30d")]
        window: TimeWindow,

        /// At most 30
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Rank wallets by PnL summed over every tracked token
    Leaderboard {
        #[arg(short, long, default_value = "30d")]
        window: TimeWindow,

        /// At most 30
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show database statistics
    Stats,

    /// Apply schema migrations without crawling
    Migrate,
}

#[derive(Subcommand)]
enum TokensCommand {
    /// List tracked tokens in discovery order
    List {
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Track a token by hand
    Add {
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        chain: String,
        #[arg(long)]
        address: String,
    },

    /// Stop tracking a token
    Remove {
        #[arg(long)]
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "dex_harvester=info,warn",
        1 => "dex_harvester=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let config = AppConfig::load()?;

    match cli.command {
        Command::Discover { export } => {
            let _t = utils::Timer::start("Discovery crawl");
            discover(config, export.as_deref()).await?;
        }

        Command::Traders { limit, export } => {
            let _t = utils::Timer::start("Top-trader crawl");
            crawl_traders(config, limit, export.as_deref()).await?;
        }

        Command::Tokens { action } => {
            let repo = open_repo(&config)?;
            match action {
                TokensCommand::List { limit } => {
                    let tokens = repo.list_entities(limit)?;
                    if tokens.is_empty() {
                        println!("No tokens — run `dex-harvester discover` first.");
                    }
                    for t in &tokens {
                        println!(
                            "  {:<10} {:<10} {:<46} {}",
                            t.symbol,
                            t.chain,
                            t.address,
                            t.mcap.as_deref().unwrap_or("—"),
                        );
                    }
                }
                TokensCommand::Add { symbol, chain, address } => {
                    let token = TrackedEntity::manual(&symbol, &chain, &address, Utc::now().naive_utc());
                    repo.create_entities(std::slice::from_ref(&token))?;
                    println!("Tracking {} ({}) on {}", token.symbol, token.address, token.chain);
                }
                TokensCommand::Remove { address } => {
                    if repo.delete_entity(&address)? {
                        println!("Removed {}", address);
                    } else {
                        bail!("{} is not tracked", address);
                    }
                }
            }
        }

        Command::TopTraders { token, window, limit } => {
            let repo = open_repo(&config)?;
            let rows = repo.top_traders(&token, window, clamp_limit(limit))?;
            if rows.is_empty() {
                println!("No top traders stored for {} ({}).", token, window);
            }
            for r in &rows {
                println!(
                    "  #{:<3} {:<14} pnl {:>16}  bought {:>14}  sold {:>14}  txns {:>5}  bal {}",
                    r.rank,
                    short_address(&r.wallet),
                    fmt_amount(r.pnl),
                    fmt_amount(r.bought_amount),
                    fmt_amount(r.sold_amount),
                    r.transaction_count,
                    r.balance,
                );
            }
        }

        Command::Leaderboard { window, limit } => {
            let repo = open_repo(&config)?;
            let board = repo.leaderboard(window, clamp_limit(limit))?;
            println!("─────────────────────────────────");
            println!("  Leaderboard — {}", window);
            println!("─────────────────────────────────");
            for (i, w) in board.iter().enumerate() {
                println!(
                    "  {:>2}. {:<14} pnl {:>16}  bought {:>16}  sold {:>16}  tokens {}",
                    i + 1,
                    short_address(&w.wallet),
                    fmt_amount(w.total_pnl),
                    fmt_amount(w.total_bought_volume),
                    fmt_amount(w.total_sold_volume),
                    w.appearances,
                );
            }
        }

        Command::Stats => {
            let repo = open_repo(&config)?;
            let tokens = repo.entity_count()?;
            let traders = repo.trader_record_count()?;
            let last = repo.last_crawl_run()?;
            println!("─────────────────────────────────");
            println!("  Dex Harvester — Database Stats");
            println!("─────────────────────────────────");
            println!("  Tokens       : {}", fmt_number(tokens));
            println!("  Trader rows  : {}", fmt_number(traders));
            match last {
                Some(run) => {
                    println!("  Last run     : #{} {} ({})", run.id, run.kind, run.status);
                    println!("  Started      : {}", run.started_at);
                    println!(
                        "  Finished     : {}",
                        run.finished_at.map(|d| d.to_string()).unwrap_or("—".into())
                    );
                    println!(
                        "  Written      : {} rows over {} tokens",
                        fmt_number(run.records_written),
                        fmt_number(run.entities_processed)
                    );
                    if let Some(msg) = run.error_msg {
                        println!("  Error        : {}", msg);
                    }
                }
                None => println!("  Last run     : —"),
            }
            println!("─────────────────────────────────");
        }

        Command::Migrate => {
            Repository::open(&config.storage.db_path)?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}

fn open_repo(config: &AppConfig) -> Result<Repository> {
    let repo = Repository::open(&config.storage.db_path).context("Failed to open DuckDB")?;
    if config.storage.run_migrations {
        repo.run_migrations()?;
    }
    Ok(repo)
}

/// Resolves on Ctrl-C, or on SIGTERM from `timeout`, systemd or a container
/// runtime. SIGTERM is hooked before this returns.
fn shutdown_signal() -> impl Future<Output = ()> {
    let terminate = terminate_signal();
    async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            () = ctrl_c => warn!("Ctrl-C received, stopping the crawl"),
            () = terminate => warn!("SIGTERM received, stopping the crawl"),
        }
    }
}

#[cfg(unix)]
fn terminate_signal() -> impl Future<Output = ()> {
    use tokio::signal::unix::{signal, SignalKind};

    let sigterm = signal(SignalKind::terminate());
    async move {
        match sigterm {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
fn terminate_signal() -> impl Future<Output = ()> {
    std::future::pending::<()>()
}

async fn launch_browser(config: &AppConfig, repo: &Repository, run_id: i64) -> Result<WebDriverBrowser> {
    match WebDriverBrowser::launch(&config.browser).await {
        Ok(browser) => Ok(browser),
        Err(e) => {
            error!("{}", e);
            repo.finish_crawl_run(run_id, 0, 0, Some(&e.to_string())).ok();
            Err(e).context("Is chromedriver running? See browser.webdriver_url")
        }
    }
}

async fn discover(config: AppConfig, export: Option<&Path>) -> Result<()> {
    let repo = open_repo(&config)?;
    let csv = export.map(CsvSink::new).transpose()?;
    let sink: &dyn Sink = match &csv {
        Some(csv) => csv,
        None => &repo,
    };

    let run_id = repo.begin_crawl_run("discover").unwrap_or(0);
    let browser = launch_browser(&config, &repo, run_id).await?;
    let report = Pipeline::new(browser, config)?
        .run_discovery(sink, shutdown_signal())
        .await;

    repo.finish_crawl_run(run_id, report.rows, report.write.written, report.error.as_deref())
        .ok();
    info!(
        "Done: {} tokens | {} written | {} failed",
        report.rows, report.write.written, report.write.failed
    );
    if report.interrupted {
        bail!("discovery interrupted");
    }
    if let Some(e) = report.error {
        bail!("discovery failed: {}", e);
    }
    Ok(())
}

async fn crawl_traders(config: AppConfig, limit: Option<usize>, export: Option<&Path>) -> Result<()> {
    let repo = open_repo(&config)?;
    let entities = repo.list_entities(limit)?;
    if entities.is_empty() {
        println!("No tracked tokens — run `dex-harvester discover` first.");
        return Ok(());
    }
    let csv = export.map(CsvSink::new).transpose()?;
    let sink: &dyn Sink = match &csv {
        Some(csv) => csv,
        None => &repo,
    };

    info!("=== Top traders for {} tokens ===", entities.len());
    let run_id = repo.begin_crawl_run("traders").unwrap_or(0);
    let browser = launch_browser(&config, &repo, run_id).await?;
    let report = Pipeline::new(browser, config)?
        .run_top_traders(&entities, sink, shutdown_signal())
        .await;

    let summary = (!report.skipped.is_empty()
        || report.write.failed > 0
        || report.interrupted
        || report.aborted.is_some())
    .then(|| {
        let mut summary = format!(
            "{} skipped, {} truncated, {} records failed",
            report.skipped.len(),
            report.truncated.len(),
            report.write.failed,
        );
        if report.interrupted {
            summary.push_str(", interrupted");
        }
        if let Some(reason) = &report.aborted {
            summary.push_str(&format!(", aborted: {reason}"));
        }
        summary
    });
    repo.finish_crawl_run(run_id, report.processed(), report.write.written, summary.as_deref())
        .ok();

    if report.interrupted {
        bail!("crawl interrupted after {} of {} tokens", report.processed(), report.entities_total);
    }
    if let Some(ref reason) = report.aborted {
        bail!("crawl aborted after {} of {} tokens: {}", report.processed(), report.entities_total, reason);
    }
    Ok(())
}
