//! Contracts for ad channels and their wire clients.
//!
//! A [`ChannelApi`] is the raw request/response boundary to one ad
//! platform. A [`Channel`] layers the platform's catalogue on top: which
//! actions it supports, how its reports are shaped, and which defaults its
//! rules run with.

use crate::action::{Action, ActionKind, AdjustmentType, EntityValue, TargetType};
use crate::context::{RuleOptionOverrides, RuleOptions};
use crate::error::RuleError;
use crate::report::{Granularity, Report, ReportType};
use crate::reporter::Reporter;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One entity as returned by a channel detail lookup.
pub type EntityDetail = serde_json::Map<String, serde_json::Value>;

/// Everything needed to pull one report from a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub report_type: ReportType,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub granularity: Granularity,
    pub org_id: String,
    pub campaign_id: Option<String>,
    pub ad_group_id: Option<String>,
}

/// A single entity change sent to a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub action: ActionKind,
    pub adjustment_type: AdjustmentType,
    pub target_type: TargetType,
    pub target_id: String,
    pub value: EntityValue,
    /// The change in the channel's own field names and units.
    pub changes: EntityDetail,
}

/// Conversions attributed to an entity during one reporting interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRecord {
    pub entity_id: String,
    pub time: DateTime<Utc>,
    pub conversions: f64,
    pub optimized_conversions: f64,
}

/// Entity listing query, scoped by the ids of enclosing entities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityQuery {
    pub target_type: Option<TargetType>,
    pub campaign_id: Option<String>,
    pub ad_group_id: Option<String>,
}

#[async_trait]
pub trait ChannelApi: Send + Sync {
    async fn fetch_report(&self, request: &ReportRequest) -> Result<Report>;

    async fn fetch_entities(&self, target_type: TargetType, entity_ids: &[String]) -> Result<Vec<EntityDetail>>;

    async fn fetch_conversions(
        &self,
        _target_type: TargetType,
        _entity_ids: &[String],
        _since: DateTime<Utc>,
    ) -> Result<Vec<ConversionRecord>> {
        Ok(Vec::new())
    }

    async fn mutate_entity(&self, request: &MutationRequest) -> Result<serde_json::Value>;

    async fn list_entities(&self, _query: &EntityQuery) -> Result<Vec<EntityDetail>> {
        Ok(Vec::new())
    }
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn identifier(&self) -> &str;
    fn title(&self) -> &str;
    fn api(&self) -> Arc<dyn ChannelApi>;

    async fn connect(&self, _credentials: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    fn default_options(&self) -> RuleOptions {
        RuleOptions::default()
    }

    /// Options a rule runs with on this channel.
    fn rule_options(&self, overrides: &RuleOptionOverrides) -> RuleOptions {
        overrides.apply(self.default_options())
    }

    /// Report an action's conditions are evaluated against.
    fn report_type(&self, kind: ActionKind) -> Result<ReportType>;

    fn build_action(&self, kind: ActionKind, value: f64, limit: Option<f64>) -> Result<Box<dyn Action>>;

    fn build_reporter(&self, report_type: ReportType) -> Result<Box<dyn Reporter>>;

    async fn get_entities(&self, query: &EntityQuery) -> Result<Vec<EntityDetail>> {
        self.api().list_entities(query).await
    }

    fn granularity_is_compatible(
        &self,
        _granularity: Granularity,
        _report_type: ReportType,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _now: DateTime<Utc>,
    ) -> bool {
        true
    }

    /// Finest granularity the channel can serve for the period.
    fn highest_compatible_granularity(
        &self,
        report_type: ReportType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Granularity> {
        Granularity::ALL
            .into_iter()
            .find(|g| self.granularity_is_compatible(*g, report_type, start, end, now))
            .ok_or_else(|| {
                RuleError::IncompatibleGranularity {
                    report_type: report_type.to_string(),
                    start: start.to_rfc3339(),
                    end: end.to_rfc3339(),
                }
                .into()
            })
    }
}

/// Error for an action a channel does not offer.
pub fn unsupported_action(kind: ActionKind, channel: &str) -> anyhow::Error {
    RuleError::UnsupportedAction {
        action: kind.to_string(),
        channel: channel.to_string(),
    }
    .into()
}
