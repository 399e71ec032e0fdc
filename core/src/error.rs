use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal errors raised while configuring or running a rule.
///
/// These abort the call that raised them and are never retried.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("action `{action}` is not supported by channel `{channel}`")]
    UnsupportedAction { action: String, channel: String },

    #[error("report type `{0}` is not supported")]
    UnsupportedReportType(String),

    #[error("no granularity is compatible with report `{report_type}` between {start} and {end}")]
    IncompatibleGranularity {
        report_type: String,
        start: String,
        end: String,
    },

    #[error("unknown channel `{0}`")]
    UnknownChannel(String),

    #[error("task {task} declares {count} actions; exactly one action per task is supported")]
    MultipleActions { task: usize, count: usize },

    #[error("task {0} has no action")]
    MissingAction(usize),

    #[error("report is missing column `{0}`")]
    MissingColumn(String),

    #[error("invalid action report: {0}")]
    InvalidActionReport(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Errors scoped to a single action-report row.
///
/// A row carrying one of these is skipped by every later phase, and the
/// rest of the batch proceeds.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionError {
    #[error("Cannot locate action target (ID {target_id})")]
    MissingTarget { target_id: String },

    #[error("Action entity error for target ID {target_id} error:\n{error}\ntraceback:\n{traceback}")]
    Entity {
        target_id: String,
        error: String,
        traceback: String,
    },
}

impl ActionError {
    pub fn missing_target(target_id: impl Into<String>) -> Self {
        Self::MissingTarget {
            target_id: target_id.into(),
        }
    }

    /// Wrap a per-entity failure, keeping the full cause chain as the traceback.
    pub fn entity(target_id: impl Into<String>, error: &anyhow::Error) -> Self {
        Self::Entity {
            target_id: target_id.into(),
            error: error.to_string(),
            traceback: format!("{:?}", error),
        }
    }

    pub fn target_id(&self) -> &str {
        match self {
            Self::MissingTarget { target_id } | Self::Entity { target_id, .. } => target_id,
        }
    }
}
