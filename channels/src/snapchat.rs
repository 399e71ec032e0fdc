//! Snapchat: campaign daily budgets and pauses.

use crate::multiplier;
use adrule_core::action::{
    Action, ActionKind, AdjustmentPolicy, AdjustmentType, MultiplierPolicy, NoActionPolicy, PausePolicy,
    PreferenceRule, StandardAction, StateField, TargetType,
};
use adrule_core::channel::{unsupported_action, Channel, ChannelApi};
use adrule_core::context::RuleOptions;
use adrule_core::error::RuleError;
use adrule_core::report::{ColumnMapping, ReportColumn, ReportType};
use adrule_core::reporter::{ApiReporter, Reporter, RetryPolicy};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub const IDENTIFIER: &str = "snapchat";

/// Smallest daily budget Snapchat accepts, in account currency.
const MINIMUM_DAILY_BUDGET: f64 = 20.0;

pub struct Snapchat {
    api: Arc<dyn ChannelApi>,
    retry: RetryPolicy,
}

impl Snapchat {
    pub fn new(api: Arc<dyn ChannelApi>) -> Self {
        Self {
            api,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl Channel for Snapchat {
    fn identifier(&self) -> &str {
        IDENTIFIER
    }

    fn title(&self) -> &str {
        "Snapchat"
    }

    fn api(&self) -> Arc<dyn ChannelApi> {
        self.api.clone()
    }

    fn default_options(&self) -> RuleOptions {
        RuleOptions {
            dynamic_window: false,
            ..RuleOptions::default()
        }
    }

    fn report_type(&self, kind: ActionKind) -> Result<ReportType> {
        match kind {
            ActionKind::IncreaseCampaignBudget
            | ActionKind::DecreaseCampaignBudget
            | ActionKind::PauseCampaign
            | ActionKind::NoAction => Ok(ReportType::Campaign),
            other => Err(unsupported_action(other, IDENTIFIER)),
        }
    }

    fn build_action(&self, kind: ActionKind, value: f64, limit: Option<f64>) -> Result<Box<dyn Action>> {
        let action = match kind {
            ActionKind::IncreaseCampaignBudget | ActionKind::DecreaseCampaignBudget => StandardAction::new(
                kind,
                TargetType::Campaign,
                AdjustmentType::Budget,
                AdjustmentPolicy::Multiplier(
                    MultiplierPolicy::new(multiplier(kind, value, IDENTIFIER)?, limit).with_precision(2),
                ),
                StateField::micros("daily_budget_micro"),
            )
            .with_subject("campaign budget")
            .with_preferences_title("Snapchat requirements")
            .with_preference_rules(vec![PreferenceRule::MinimumAmount {
                minimum: MINIMUM_DAILY_BUDGET,
                subject: "campaign budget".to_string(),
            }]),
            ActionKind::PauseCampaign => StandardAction::new(
                kind,
                TargetType::Campaign,
                AdjustmentType::Status,
                AdjustmentPolicy::Pause(PausePolicy::default()),
                StateField::status("status"),
            ),
            ActionKind::NoAction => StandardAction::new(
                kind,
                TargetType::Campaign,
                AdjustmentType::NoAction,
                AdjustmentPolicy::NoAction(NoActionPolicy { logs_inaction: true }),
                StateField::Absent,
            ),
            other => return Err(unsupported_action(other, IDENTIFIER)),
        };
        Ok(Box::new(action.with_entity_fields("id", "name")))
    }

    fn build_reporter(&self, report_type: ReportType) -> Result<Box<dyn Reporter>> {
        if report_type != ReportType::Campaign {
            return Err(RuleError::UnsupportedReportType(report_type.to_string()).into());
        }
        let reporter = ApiReporter::new(report_type)
            .with_mappings(vec![
                ColumnMapping::new(ReportColumn::CampaignId, "id"),
                ColumnMapping::new(ReportColumn::Date, "start_time"),
                ColumnMapping::scaled(ReportColumn::LocalSpend, "spend", 1e6),
                ColumnMapping::new(ReportColumn::Impressions, "impressions"),
                ColumnMapping::new(ReportColumn::Taps, "swipes"),
                ColumnMapping::new(ReportColumn::Installs, "total_installs"),
            ])
            .with_retry(self.retry);
        Ok(Box::new(reporter))
    }
}
