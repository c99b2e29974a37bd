//! Cumulative counters shown by `sensor-pipeline status`.

pub mod ledger;

pub use ledger::{LedgerStats, SharedStatsLedger, StatsLedger};
