//! Append-only CSV export next to the database.

use super::sink::{Sink, WriteReport};
use crate::error::CrawlError;
use crate::models::{TrackedEntity, TraderActivityRecord};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const TOKENS_FILE: &str = "tokens.csv";
pub const TRADERS_FILE: &str = "top_traders.csv";

pub struct CsvSink {
    dir: PathBuf,
}

impl CsvSink {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Could not create export dir {:?}", dir))?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    /// Header is written only when the file starts out empty.
    fn append<T: Serialize>(&self, file: &str, rows: &[T], key: impl Fn(&T) -> String) -> WriteReport {
        let path = self.dir.join(file);
        let mut report = WriteReport::default();
        if rows.is_empty() {
            return report;
        }

        let handle = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                warn!("Cannot open {:?}: {}", path, e);
                report.failed = rows.len();
                return report;
            }
        };
        let fresh = handle.metadata().map(|m| m.len() == 0).unwrap_or(false);
        let mut writer = csv::WriterBuilder::new().has_headers(fresh).from_writer(handle);

        for row in rows {
            match writer.serialize(row) {
                Ok(()) => report.written += 1,
                Err(e) => {
                    let err = CrawlError::Persistence { key: key(row), reason: e.to_string() };
                    warn!("{err}");
                    report.failed += 1;
                }
            }
        }
        if let Err(e) = writer.flush() {
            warn!("Flushing {:?} failed: {}", path, e);
            report.failed += report.written;
            report.written = 0;
        }
        info!("Appended {} rows to {:?}", report.written, path);
        report
    }
}

impl Sink for CsvSink {
    fn write_entities(&self, entities: &[TrackedEntity]) -> WriteReport {
        self.append(TOKENS_FILE, entities, |t| t.address.clone())
    }

    fn write_trader_records(&self, records: &[TraderActivityRecord], _batch_size: usize) -> WriteReport {
        self.append(TRADERS_FILE, records, TraderActivityRecord::key)
    }
}
