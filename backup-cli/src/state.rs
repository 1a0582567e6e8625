//! Strongly-typed per-table run state (spec §4.12, §9 Design Note replacing
//! a stringly-keyed `Set(key, any)` map).

use backup_core::Outcome;
use std::time::Duration;

/// One table's accumulated counters across every partition/shard it backed
/// up or restored this run. Shared across concurrent shard tasks of the same
/// table behind a mutex (spec §5).
#[derive(Debug, Clone)]
pub struct TableState {
    pub table: String,
    pub rows: u64,
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
    pub remote_bytes: u64,
    pub partitions: u64,
    pub elapsed: Duration,
    pub outcome: Outcome,
    pub cause: Option<String>,
}

impl TableState {
    pub fn new(table: impl Into<String>) -> Self {
        TableState {
            table: table.into(),
            rows: 0,
            uncompressed_bytes: 0,
            compressed_bytes: 0,
            remote_bytes: 0,
            partitions: 0,
            elapsed: Duration::ZERO,
            outcome: Outcome::Success,
            cause: None,
        }
    }

    pub fn add_partition(&mut self, rows: u64, uncompressed: u64, compressed: u64, remote: u64) {
        self.rows += rows;
        self.uncompressed_bytes += uncompressed;
        self.compressed_bytes += compressed;
        self.remote_bytes += remote;
        self.partitions += 1;
    }

    pub fn record_elapsed(&mut self, elapsed: Duration) {
        self.elapsed += elapsed;
    }

    pub fn mark_failure(&mut self, cause: impl Into<String>) {
        self.outcome = Outcome::Failure;
        self.cause = Some(cause.into());
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }
}

/// The run-wide aggregate: one [`TableState`] per `"<database>.<table>"`,
/// owned exclusively by the run controller (spec §3 "Run state").
#[derive(Debug, Default)]
pub struct RunState {
    pub tables: Vec<TableState>,
}

impl RunState {
    pub fn totals(&self) -> TableState {
        let mut total = TableState::new("TOTAL");
        for table in &self.tables {
            total.rows += table.rows;
            total.uncompressed_bytes += table.uncompressed_bytes;
            total.compressed_bytes += table.compressed_bytes;
            total.remote_bytes += table.remote_bytes;
            total.partitions += table.partitions;
            total.elapsed += table.elapsed;
            if !table.is_success() {
                total.outcome = Outcome::Failure;
            }
        }
        total
    }

    pub fn failed(&self) -> Vec<&TableState> {
        self.tables.iter().filter(|t| !t.is_success()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_sum_every_table_and_fail_if_any_failed() {
        let mut state = RunState::default();
        let mut a = TableState::new("default.a");
        a.add_partition(10, 100, 50, 50);
        let mut b = TableState::new("default.b");
        b.add_partition(5, 40, 20, 20);
        b.mark_failure("verification miss");
        state.tables.push(a);
        state.tables.push(b);

        let totals = state.totals();
        assert_eq!(totals.rows, 15);
        assert_eq!(totals.partitions, 2);
        assert!(!totals.is_success());
        assert_eq!(state.failed().len(), 1);
    }
}
