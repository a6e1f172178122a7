//! Persistence layer: one SQLite database behind a shared handle, with
//! domain-grouped operations implemented across the submodules.

mod alerts;
mod coins;
mod db;
mod hot;
mod migrations;
mod mints;
mod rolling;
mod schedule;

pub use alerts::{AlertHistoryRow, OutboxRow};
pub use db::Database;
pub use hot::NewHotEntry;
pub use rolling::{RETENTION_SECS, WINDOW_12H, WINDOW_24H, WINDOW_72H};
