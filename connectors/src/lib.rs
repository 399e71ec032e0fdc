//! Local adapters for the engine: sled-backed history and monitor stores,
//! and a DataFusion loader for report files.

pub mod loader;
pub mod store;

pub use loader::{ReportFormat, ReportLoader};
pub use store::{SledHistoryStore, SledMonitorStore};
