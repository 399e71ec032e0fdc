//! # AdRule Core - Campaign Decision Engine
//!
//! Evaluates nested KPI conditions over Arrow performance reports and turns
//! the selected rows into governed, auditable adjustments of ad entities.
//!
//! ## Quick Start
//!
//! ```no_run
//! use adrule_core::config::AdruleConfig;
//! use adrule_core::rule::RuleConnection;
//! use adrule_core::report::Granularity;
//!
//! # async fn example(connection: RuleConnection) -> anyhow::Result<()> {
//! let config = AdruleConfig::from_file("rules.yaml")?;
//! let rule = config.build_rule("raise_cheap_keywords", connection.channel.as_ref())?;
//! let now = chrono::Utc::now();
//! let result = rule
//!     .execute(&connection, now - chrono::Duration::days(7), now, Some(Granularity::Daily), now)
//!     .await?;
//! println!("{}", result.serialize()?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Arrow-Native**: reports are labelled `RecordBatch`es; KPIs are derived columns
//! - **Nested Conditions**: AND/OR condition groups evaluated over an arena
//! - **Governed Actions**: channel preferences can temper or veto any adjustment
//! - **Row-Scoped Failures**: one bad entity never aborts a batch
//! - **Auditable**: every decision lands in an append-only history log

pub mod action;
pub mod channel;
pub mod condition;
pub mod config;
pub mod context;
pub mod error;
pub mod history;
pub mod kpi;
pub mod metrics;
pub mod report;
pub mod reporter;
pub mod rule;

pub use action::{adjust, Action, ActionKind, ActionReport, ActionResult, EntityValue, Preference};
pub use channel::{Channel, ChannelApi};
pub use condition::{Condition, ConditionGroup, GroupOperator, Operator};
pub use context::{RuleContext, RuleOptions};
pub use error::{ActionError, RuleError};
pub use history::{HistoryRecord, HistoryStore, MonitorStore};
pub use kpi::Kpi;
pub use report::{Granularity, Report, ReportType};
pub use rule::{Rule, RuleConnection, RuleResult, Task};
