use super::{AdjustmentType, EntityValue, TargetType};
use crate::channel::EntityDetail;
use crate::error::ActionError;
use crate::history::{HistoryRecord, HistoryType};
use crate::report::Report;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Governance verdict on a computed adjustment, ordered from least to most
/// restrictive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preference {
    #[default]
    MakeAdjustment = 0,
    ModifyAdjustment = 1,
    PreventAdjustment = 2,
}

impl Preference {
    pub fn rank(self) -> u8 {
        self as u8
    }

    /// The stricter of two verdicts.
    pub fn merge(self, other: Preference) -> Preference {
        self.max(other)
    }
}

/// Conversions observed since an entity was last adjusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitMetrics {
    pub since: DateTime<Utc>,
    pub conversions: f64,
    pub optimized_conversions: f64,
    pub last_adjustment_time: Option<DateTime<Utc>>,
    pub last_adjustment_description: Option<String>,
}

/// A realized or would-be change to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionLog {
    #[serde(rename = "targetID")]
    pub target_id: String,
    pub target_type: TargetType,
    pub target_channel: String,
    pub adjustment_type: AdjustmentType,
    pub adjustment_from: Option<EntityValue>,
    pub adjustment_to: Option<EntityValue>,
    pub target_description: Option<String>,
    pub action_description: String,
    pub consumed_data: bool,
}

/// Rule-level fields shared by every history record of one task.
#[derive(Debug, Clone)]
pub struct HistoryMetadata {
    pub user_id: String,
    pub rule_id: String,
    pub created: DateTime<Utc>,
    pub rule_description: String,
    pub dry_run: bool,
    pub last_data_checked_date: Option<DateTime<Utc>>,
}

impl HistoryMetadata {
    pub fn record(&self, history_type: HistoryType, action_description: String) -> HistoryRecord {
        HistoryRecord {
            history_type,
            target_id: "-1".to_string(),
            target_type: None,
            target_channel: None,
            adjustment_type: None,
            adjustment_from: None,
            adjustment_to: None,
            target_description: None,
            action_description,
            consumed_data: false,
            user_id: self.user_id.clone(),
            rule_id: self.rule_id.clone(),
            history_creation_date: self.created,
            rule_description: self.rule_description.clone(),
            dry_run: self.dry_run,
            last_data_checked_date: self.last_data_checked_date,
            error_descriptions: None,
            action_count: None,
        }
    }
}

impl ActionLog {
    pub fn to_history(&self, metadata: &HistoryMetadata) -> HistoryRecord {
        HistoryRecord {
            target_id: self.target_id.clone(),
            target_type: Some(self.target_type),
            target_channel: Some(self.target_channel.clone()),
            adjustment_type: Some(self.adjustment_type),
            adjustment_from: self.adjustment_from.clone(),
            adjustment_to: self.adjustment_to.clone(),
            target_description: self.target_description.clone(),
            consumed_data: self.consumed_data,
            ..metadata.record(HistoryType::Action, self.action_description.clone())
        }
    }
}

/// Working state for one target entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionReportRow {
    pub target_id: String,
    pub target_name: Option<String>,
    pub target_type: TargetType,
    pub unadjusted_state: Option<EntityValue>,
    pub prehistoric_state: Option<EntityValue>,
    pub adjustment: Option<EntityValue>,
    pub preferred_adjustment: Option<EntityValue>,
    pub unpreferred_adjustment: Option<EntityValue>,
    pub preference: Preference,
    pub preference_messages: Vec<String>,
    pub override_preference: bool,
    pub history: Vec<HistoryRecord>,
    pub wait: Option<WaitMetrics>,
    /// Raw detail fields as fetched from the channel.
    pub attributes: EntityDetail,
    pub error: Option<ActionError>,
    pub log: Option<ActionLog>,
    pub api_request: Option<serde_json::Value>,
    pub api_response: Option<serde_json::Value>,
    pub dry_run: bool,
}

impl ActionReportRow {
    pub fn new(target_id: impl Into<String>, target_type: TargetType) -> Self {
        Self {
            target_id: target_id.into(),
            target_name: None,
            target_type,
            unadjusted_state: None,
            prehistoric_state: None,
            adjustment: None,
            preferred_adjustment: None,
            unpreferred_adjustment: None,
            preference: Preference::MakeAdjustment,
            preference_messages: Vec::new(),
            override_preference: false,
            history: Vec::new(),
            wait: None,
            attributes: EntityDetail::new(),
            error: None,
            log: None,
            api_request: None,
            api_response: None,
            dry_run: false,
        }
    }

    pub fn missing(target_id: impl Into<String>, target_type: TargetType) -> Self {
        let target_id = target_id.into();
        let error = ActionError::missing_target(target_id.clone());
        Self {
            error: Some(error),
            ..Self::new(target_id, target_type)
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Raise the verdict (never lowering it) and record why.
    pub fn add_preference(&mut self, preference: Preference, message: impl Into<String>) {
        self.preference = self.preference.merge(preference);
        self.preference_messages.push(message.into());
    }

    /// Record a safer adjustment, applying it unless the rule overrides
    /// governance.
    pub fn prefer_adjustment(&mut self, preferred: EntityValue) {
        self.unpreferred_adjustment = self.adjustment.clone();
        if !self.override_preference {
            self.adjustment = Some(preferred.clone());
        }
        self.preferred_adjustment = Some(preferred);
    }

    /// Whether a logged adjustment should go on to be requested.
    pub fn consumes_data(&self) -> bool {
        self.override_preference || self.preference != Preference::PreventAdjustment
    }

    pub fn attribute_f64(&self, name: &str) -> Option<f64> {
        self.attributes.get(name).and_then(|v| v.as_f64())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionReport {
    pub rows: Vec<ActionReportRow>,
}

impl ActionReport {
    pub fn new(rows: Vec<ActionReportRow>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn logs(&self) -> Vec<Option<ActionLog>> {
        self.rows.iter().map(|row| row.log.clone()).collect()
    }

    pub fn errors(&self) -> Vec<Option<ActionError>> {
        self.rows.iter().map(|row| row.error.clone()).collect()
    }

    pub fn api_responses(&self) -> Vec<Option<serde_json::Value>> {
        self.rows.iter().map(|row| row.api_response.clone()).collect()
    }

    /// Rows as a JSON array; an empty report renders as `""`.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        if self.is_empty() {
            return Ok(serde_json::Value::String(String::new()));
        }
        Ok(serde_json::to_value(&self.rows)?)
    }
}

/// Outcome of running one action over a selected report.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub report: Report,
    pub action_report: ActionReport,
    pub dry_run: bool,
}

impl ActionResult {
    pub fn logs(&self) -> Vec<Option<ActionLog>> {
        self.action_report.logs()
    }

    pub fn errors(&self) -> Vec<Option<ActionError>> {
        self.action_report.errors()
    }

    pub fn api_responses(&self) -> Vec<Option<serde_json::Value>> {
        self.action_report.api_responses()
    }

    pub fn serialize(&self) -> Result<serde_json::Value> {
        let action_report = if self.action_report.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&self.action_report.rows)?
        };
        let errors: Vec<Option<String>> = self
            .errors()
            .into_iter()
            .map(|error| error.map(|e| format!("{:?}", e)))
            .collect();
        Ok(json!({
            "report": self.report.to_csv()?,
            "action_report": action_report,
            "apiResponse": self.api_responses(),
            "logs": self.logs(),
            "dryRun": self.dry_run,
            "errors": errors,
        }))
    }
}
