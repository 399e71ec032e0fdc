//! Channel actions and the per-entity action report they drive.
//!
//! An [`Action`] supplies the entity-specific capabilities (how to read the
//! current state, what adjustment to propose, how to describe and request
//! it); [`pipeline::adjust`] runs those capabilities through the
//! generate, interpret, execute and finalize phases.

pub mod pipeline;
pub mod policy;
pub mod preference;
pub mod report;
pub mod standard;

pub use pipeline::adjust;
pub use policy::{AdjustmentPolicy, MultiplierPolicy, NoActionPolicy, PausePolicy};
pub use preference::PreferenceRule;
pub use report::{ActionLog, ActionReport, ActionReportRow, ActionResult, HistoryMetadata, Preference, WaitMetrics};
pub use standard::{DetailRequirement, StandardAction, StateField, Supplement};

use crate::channel::{ChannelApi, EntityDetail};
use crate::context::RuleContext;
use crate::report::{Report, ReportColumn};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Campaign,
    Adgroup,
    Keyword,
}

impl TargetType {
    /// Report column holding ids of this entity type.
    pub fn id_column(&self) -> ReportColumn {
        match self {
            Self::Campaign => ReportColumn::CampaignId,
            Self::Adgroup => ReportColumn::AdGroupId,
            Self::Keyword => ReportColumn::KeywordId,
        }
    }

    pub fn noun(&self) -> &'static str {
        match self {
            Self::Campaign => "campaign",
            Self::Adgroup => "ad group",
            Self::Keyword => "keyword",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentType {
    Bid,
    Status,
    Budget,
    CpaGoal,
    NoAction,
}

/// Every action a rule task may configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    IncBid,
    DecBid,
    IncCpaGoal,
    DecCpaGoal,
    IncCpaGoalCampaign,
    DecCpaGoalCampaign,
    PauseKeyword,
    PauseCampaign,
    NoAction,
    IncreaseCampaignBudget,
    DecreaseCampaignBudget,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IncBid => "inc_bid",
            Self::DecBid => "dec_bid",
            Self::IncCpaGoal => "inc_cpa_goal",
            Self::DecCpaGoal => "dec_cpa_goal",
            Self::IncCpaGoalCampaign => "inc_cpa_goal_campaign",
            Self::DecCpaGoalCampaign => "dec_cpa_goal_campaign",
            Self::PauseKeyword => "pause_keyword",
            Self::PauseCampaign => "pause_campaign",
            Self::NoAction => "no_action",
            Self::IncreaseCampaignBudget => "increase_campaign_budget",
            Self::DecreaseCampaignBudget => "decrease_campaign_budget",
        }
    }

    /// Multiplier for a percentage adjustment, or `None` for actions that
    /// do not scale a numeric state.
    pub fn multiplier(&self, percent: f64) -> Option<f64> {
        match self {
            Self::IncBid | Self::IncCpaGoal | Self::IncCpaGoalCampaign | Self::IncreaseCampaignBudget => {
                Some(1.0 + percent / 100.0)
            }
            Self::DecBid | Self::DecCpaGoal | Self::DecCpaGoalCampaign | Self::DecreaseCampaignBudget => {
                Some(1.0 - percent / 100.0)
            }
            Self::PauseKeyword | Self::PauseCampaign | Self::NoAction => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_value(serde_json::Value::String(s.to_string()))?)
    }
}

/// State of an entity before or after an adjustment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityValue {
    Flag(bool),
    Amount(f64),
    Status(String),
}

impl EntityValue {
    pub fn as_amount(&self) -> Option<f64> {
        match self {
            Self::Amount(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_status(&self) -> Option<&str> {
        match self {
            Self::Status(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for EntityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(v) => write!(f, "{}", v),
            Self::Amount(v) => write!(f, "{:.2}", v),
            Self::Status(s) => f.write_str(s),
        }
    }
}

/// Capabilities one configured action contributes to the pipeline.
#[async_trait]
pub trait Action: Send + Sync {
    fn kind(&self) -> ActionKind;
    fn entity_granularity(&self) -> TargetType;
    fn adjustment_type(&self) -> AdjustmentType;

    /// Heading used when describing governance verdicts.
    fn preferences_title(&self) -> &str {
        "channel preferences"
    }

    /// Distinct entity ids the selected rows refer to, in first-seen order.
    fn entity_ids(&self, report: &Report) -> Result<Vec<String>> {
        let column = self.entity_granularity().id_column();
        let mut seen = BTreeSet::new();
        Ok(report
            .group_keys(column.name())?
            .into_iter()
            .flatten()
            .filter(|id| seen.insert(id.clone()))
            .collect())
    }

    async fn fetch_entities(
        &self,
        entity_ids: &[String],
        api: &dyn ChannelApi,
        _context: &RuleContext,
    ) -> Result<Vec<EntityDetail>> {
        api.fetch_entities(self.entity_granularity(), entity_ids).await
    }

    /// Canonical row for one fetched entity detail.
    fn map_entity(&self, detail: &EntityDetail, context: &RuleContext) -> Result<ActionReportRow>;

    async fn supplement(
        &self,
        report: ActionReport,
        _api: &dyn ChannelApi,
        _context: &RuleContext,
    ) -> Result<ActionReport> {
        Ok(report)
    }

    fn entity_adjustment(&self, row: &ActionReportRow, context: &RuleContext) -> Result<Option<EntityValue>>;

    /// Governance rules, applied in order after adjustments are computed.
    fn preference_rules(&self) -> &[PreferenceRule] {
        &[]
    }

    fn transform(&self, report: ActionReport, _context: &RuleContext) -> Result<ActionReport> {
        Ok(report)
    }

    /// What the adjustment changes, before any governance qualifier.
    fn action_description(&self, row: &ActionReportRow, context: &RuleContext) -> Option<String>;

    fn entity_request(&self, row: &ActionReportRow, context: &RuleContext) -> Result<Option<serde_json::Value>>;

    async fn mutate_entity(
        &self,
        row: &ActionReportRow,
        api: &dyn ChannelApi,
        context: &RuleContext,
    ) -> Result<serde_json::Value>;
}
