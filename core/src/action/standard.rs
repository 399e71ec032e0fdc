//! Data-driven action built from a policy, a state field and governance.
//!
//! Channels describe each action they support as a [`StandardAction`]
//! rather than implementing [`Action`] by hand.

use super::{
    Action, ActionKind, ActionReport, ActionReportRow, AdjustmentPolicy, AdjustmentType, EntityValue, PreferenceRule,
    TargetType, WaitMetrics,
};
use crate::channel::{ChannelApi, EntityDetail, MutationRequest};
use crate::context::RuleContext;
use crate::error::{ActionError, RuleError};
use crate::history::HistoryRecord;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Where an entity's adjustable state lives in its detail.
#[derive(Debug, Clone, PartialEq)]
pub enum StateField {
    /// Numeric field, stored in the channel divided by `divisor`.
    Amount { field: String, divisor: Option<f64> },
    Status { field: String },
    /// The action does not read any state.
    Absent,
}

impl StateField {
    pub fn amount(field: impl Into<String>) -> Self {
        Self::Amount {
            field: field.into(),
            divisor: None,
        }
    }

    /// Amount the channel stores in millionths.
    pub fn micros(field: impl Into<String>) -> Self {
        Self::Amount {
            field: field.into(),
            divisor: Some(1e6),
        }
    }

    pub fn status(field: impl Into<String>) -> Self {
        Self::Status { field: field.into() }
    }

    pub fn read(&self, detail: &EntityDetail) -> Result<Option<EntityValue>> {
        match self {
            Self::Amount { field, divisor } => {
                let value = detail
                    .get(field)
                    .and_then(number)
                    .ok_or_else(|| anyhow!("entity detail has no numeric `{}`", field))?;
                Ok(Some(EntityValue::Amount(value / divisor.unwrap_or(1.0))))
            }
            Self::Status { field } => {
                let status = detail
                    .get(field)
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("entity detail has no `{}` status", field))?;
                Ok(Some(EntityValue::Status(status.to_string())))
            }
            Self::Absent => Ok(None),
        }
    }

    /// The channel-native form of `value`.
    pub fn write(&self, value: &EntityValue) -> Result<EntityDetail> {
        let mut changes = EntityDetail::new();
        match (self, value) {
            (Self::Amount { field, divisor: Some(divisor) }, EntityValue::Amount(amount)) => {
                changes.insert(field.clone(), Value::from((amount * divisor).round() as i64));
            }
            (Self::Amount { field, divisor: None }, EntityValue::Amount(amount)) => {
                changes.insert(field.clone(), Value::from(*amount));
            }
            (Self::Status { field }, EntityValue::Status(status)) => {
                changes.insert(field.clone(), Value::from(status.clone()));
            }
            (Self::Absent, _) => {}
            (field, value) => return Err(anyhow!("cannot write {:?} into {:?}", value, field)),
        }
        Ok(changes)
    }
}

/// A detail field that must hold one of the expected values before the
/// entity may be adjusted.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailRequirement {
    pub field: String,
    pub expected: Vec<String>,
}

impl DetailRequirement {
    pub fn new(field: impl Into<String>, expected: &[&str]) -> Self {
        Self {
            field: field.into(),
            expected: expected.iter().map(|v| v.to_string()).collect(),
        }
    }

    fn check(&self, detail: &EntityDetail) -> Result<()> {
        let actual = detail.get(&self.field).and_then(Value::as_str);
        match actual {
            Some(value) if self.expected.iter().any(|e| e == value) => Ok(()),
            _ => Err(anyhow!(
                "`{}` is {} but must be one of {}",
                self.field,
                actual.unwrap_or("missing"),
                self.expected.join(", ")
            )),
        }
    }
}

/// Enrichment run at the end of the generate phase.
#[derive(Debug, Clone, PartialEq)]
pub enum Supplement {
    /// State at the earliest same-type adjustment inside `window`.
    PrehistoricState { window: Duration },
    /// Conversions since the last same-type adjustment.
    WaitMetrics,
}

impl Supplement {
    pub fn prehistoric_state() -> Self {
        Self::PrehistoricState { window: Duration::days(1) }
    }
}

#[derive(Debug, Clone)]
pub struct StandardAction {
    kind: ActionKind,
    granularity: TargetType,
    adjustment_type: AdjustmentType,
    policy: AdjustmentPolicy,
    state: StateField,
    id_field: String,
    name_field: Option<String>,
    subject: String,
    preferences_title: String,
    rules: Vec<PreferenceRule>,
    supplements: Vec<Supplement>,
    requirements: Vec<DetailRequirement>,
}

impl StandardAction {
    pub fn new(
        kind: ActionKind,
        granularity: TargetType,
        adjustment_type: AdjustmentType,
        policy: AdjustmentPolicy,
        state: StateField,
    ) -> Self {
        Self {
            kind,
            granularity,
            adjustment_type,
            policy,
            state,
            id_field: granularity.id_column().name().to_string(),
            name_field: None,
            subject: granularity.noun().to_string(),
            preferences_title: "channel preferences".to_string(),
            rules: Vec::new(),
            supplements: Vec::new(),
            requirements: Vec::new(),
        }
    }

    pub fn with_entity_fields(mut self, id_field: impl Into<String>, name_field: impl Into<String>) -> Self {
        self.id_field = id_field.into();
        self.name_field = Some(name_field.into());
        self
    }

    /// What descriptions call the adjusted state.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_preferences_title(mut self, title: impl Into<String>) -> Self {
        self.preferences_title = title.into();
        self
    }

    pub fn with_preference_rules(mut self, rules: Vec<PreferenceRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_supplements(mut self, supplements: Vec<Supplement>) -> Self {
        self.supplements = supplements;
        self
    }

    pub fn with_requirements(mut self, requirements: Vec<DetailRequirement>) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn policy(&self) -> &AdjustmentPolicy {
        &self.policy
    }

    pub fn supplements(&self) -> &[Supplement] {
        &self.supplements
    }

    fn same_type<'a>(&self, history: &'a [HistoryRecord]) -> impl Iterator<Item = &'a HistoryRecord> {
        let adjustment_type = self.adjustment_type;
        history
            .iter()
            .filter(move |record| record.adjustment_type == Some(adjustment_type))
    }

    fn attach_prehistoric_state(&self, report: &mut ActionReport, window: Duration, context: &RuleContext) {
        let window_start = context.now - window;
        for row in report.rows.iter_mut().filter(|row| !row.has_error()) {
            let earliest = self
                .same_type(&row.history)
                .find(|record| record.history_creation_date >= window_start)
                .and_then(|record| record.adjustment_from.clone());
            row.prehistoric_state = earliest.or_else(|| row.unadjusted_state.clone());
        }
    }

    async fn attach_wait_metrics(
        &self,
        report: &mut ActionReport,
        api: &dyn ChannelApi,
        context: &RuleContext,
    ) -> Result<()> {
        let wait_days = context.options.wait_days;
        if wait_days <= 0.0 {
            return Ok(());
        }
        let wait_start = (context.now - Duration::seconds((wait_days * 86_400.0) as i64))
            .duration_trunc(Duration::hours(1))
            .context("truncating wait start")?;

        let mut starts: HashMap<String, WaitMetrics> = HashMap::new();
        for row in report.rows.iter().filter(|row| !row.has_error()) {
            let latest = self
                .same_type(&row.history)
                .filter(|record| record.history_creation_date > wait_start)
                .last();
            let metrics = match latest {
                Some(record) => WaitMetrics {
                    since: record.history_creation_date,
                    conversions: 0.0,
                    optimized_conversions: 0.0,
                    last_adjustment_time: Some(record.history_creation_date),
                    last_adjustment_description: Some(adjustment_origin(record, context)),
                },
                None => WaitMetrics {
                    since: wait_start,
                    conversions: 0.0,
                    optimized_conversions: 0.0,
                    last_adjustment_time: None,
                    last_adjustment_description: None,
                },
            };
            starts.insert(row.target_id.clone(), metrics);
        }
        if starts.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = starts.keys().cloned().collect();
        let earliest: DateTime<Utc> = starts.values().map(|m| m.since).min().unwrap_or(wait_start);
        for record in api.fetch_conversions(self.granularity, &ids, earliest).await? {
            if let Some(metrics) = starts.get_mut(&record.entity_id) {
                if record.time >= metrics.since {
                    metrics.conversions += record.conversions;
                    metrics.optimized_conversions += record.optimized_conversions;
                }
            }
        }
        for row in &mut report.rows {
            if let Some(metrics) = starts.remove(&row.target_id) {
                row.wait = Some(metrics);
            }
        }
        Ok(())
    }
}

fn adjustment_origin(record: &HistoryRecord, context: &RuleContext) -> String {
    if record.rule_id == context.rule_id {
        "adjustment by this rule".to_string()
    } else {
        format!("rule {} [{}]", record.rule_description, record.rule_id)
    }
}

/// Ids and numbers arrive as either JSON strings or JSON numbers.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl Action for StandardAction {
    fn kind(&self) -> ActionKind {
        self.kind
    }

    fn entity_granularity(&self) -> TargetType {
        self.granularity
    }

    fn adjustment_type(&self) -> AdjustmentType {
        self.adjustment_type
    }

    fn preferences_title(&self) -> &str {
        &self.preferences_title
    }

    fn map_entity(&self, detail: &EntityDetail, _context: &RuleContext) -> Result<ActionReportRow> {
        let target_id = detail
            .get(&self.id_field)
            .and_then(id_string)
            .ok_or_else(|| RuleError::InvalidActionReport(format!("entity detail has no `{}`", self.id_field)))?;

        let mut row = ActionReportRow::new(target_id, self.granularity);
        row.target_name = self
            .name_field
            .as_ref()
            .and_then(|field| detail.get(field))
            .and_then(id_string);
        row.attributes = detail.clone();

        let state = self
            .requirements
            .iter()
            .try_for_each(|requirement| requirement.check(detail))
            .and_then(|_| self.state.read(detail));
        match state {
            Ok(state) => row.unadjusted_state = state,
            Err(e) => row.error = Some(ActionError::entity(row.target_id.clone(), &e)),
        }
        Ok(row)
    }

    async fn supplement(
        &self,
        mut report: ActionReport,
        api: &dyn ChannelApi,
        context: &RuleContext,
    ) -> Result<ActionReport> {
        for supplement in &self.supplements {
            debug!(action = %self.kind, supplement = ?supplement, "Supplementing action report");
            match supplement {
                Supplement::PrehistoricState { window } => self.attach_prehistoric_state(&mut report, *window, context),
                Supplement::WaitMetrics => self.attach_wait_metrics(&mut report, api, context).await?,
            }
        }
        Ok(report)
    }

    fn entity_adjustment(&self, row: &ActionReportRow, _context: &RuleContext) -> Result<Option<EntityValue>> {
        Ok(self.policy.propose(row.unadjusted_state.as_ref()))
    }

    fn preference_rules(&self) -> &[PreferenceRule] {
        &self.rules
    }

    fn action_description(&self, row: &ActionReportRow, _context: &RuleContext) -> Option<String> {
        self.policy
            .describe(&self.subject, row.unadjusted_state.as_ref(), row.adjustment.as_ref())
    }

    fn entity_request(&self, row: &ActionReportRow, _context: &RuleContext) -> Result<Option<Value>> {
        if matches!(self.policy, AdjustmentPolicy::NoAction(_)) {
            return Ok(None);
        }
        let Some(value) = row.adjustment.clone() else {
            return Ok(None);
        };
        let request = MutationRequest {
            action: self.kind,
            adjustment_type: self.adjustment_type,
            target_type: self.granularity,
            target_id: row.target_id.clone(),
            changes: self.state.write(&value)?,
            value,
        };
        Ok(Some(serde_json::to_value(request)?))
    }

    async fn mutate_entity(&self, row: &ActionReportRow, api: &dyn ChannelApi, _context: &RuleContext) -> Result<Value> {
        let request = row
            .api_request
            .clone()
            .ok_or_else(|| anyhow!("no request for target {}", row.target_id))?;
        let request: MutationRequest = serde_json::from_value(request)?;
        api.mutate_entity(&request).await
    }
}
