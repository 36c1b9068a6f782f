use super::Repository;
use crate::models::{TrackedEntity, TraderActivityRecord};

/// How many records a write stored and how many it gave up on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub written: usize,
    pub failed: usize,
}

/// Where crawl results end up.
///
/// Writes never fail as a whole: a record that cannot be stored is logged and
/// counted in [`WriteReport::failed`].
pub trait Sink {
    fn write_entities(&self, entities: &[TrackedEntity]) -> WriteReport;

    fn write_trader_records(&self, records: &[TraderActivityRecord], batch_size: usize) -> WriteReport;
}

impl Sink for Repository {
    fn write_entities(&self, entities: &[TrackedEntity]) -> WriteReport {
        self.upsert_entities(entities)
    }

    fn write_trader_records(&self, records: &[TraderActivityRecord], batch_size: usize) -> WriteReport {
        self.upsert_trader_records(records, batch_size)
    }
}
