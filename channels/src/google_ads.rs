//! Google Ads (app campaigns): target CPA, daily budget and pauses.
//!
//! Changes follow the app campaign best practices: wait for conversions
//! after every change and move at most 20% away from yesterday's value.

use crate::multiplier;
use adrule_core::action::{
    Action, ActionKind, AdjustmentPolicy, AdjustmentType, DetailRequirement, MultiplierPolicy, NoActionPolicy,
    PausePolicy, PreferenceRule, StandardAction, StateField, Supplement, TargetType,
};
use adrule_core::channel::{unsupported_action, Channel, ChannelApi};
use adrule_core::context::RuleOptions;
use adrule_core::error::RuleError;
use adrule_core::report::{ColumnMapping, ReportColumn, ReportType};
use adrule_core::reporter::{ApiReporter, Reporter, RetryPolicy};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub const IDENTIFIER: &str = "google_ads";

const PREFERENCES_TITLE: &str = "UAC best practices";
const DAILY_LIMIT: f64 = 0.2;

pub struct GoogleAds {
    api: Arc<dyn ChannelApi>,
    retry: RetryPolicy,
}

impl GoogleAds {
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

    fn best_practices() -> Vec<PreferenceRule> {
        vec![
            PreferenceRule::ConversionWait,
            PreferenceRule::RelativeDailyLimit { limit: DAILY_LIMIT },
        ]
    }

    fn campaign_action(
        kind: ActionKind,
        adjustment_type: AdjustmentType,
        policy: AdjustmentPolicy,
        state: StateField,
    ) -> StandardAction {
        StandardAction::new(kind, TargetType::Campaign, adjustment_type, policy, state)
            .with_entity_fields("id", "name")
            .with_preferences_title(PREFERENCES_TITLE)
    }
}

#[async_trait]
impl Channel for GoogleAds {
    fn identifier(&self) -> &str {
        IDENTIFIER
    }

    fn title(&self) -> &str {
        "Google Ads"
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
            ActionKind::IncCpaGoalCampaign
            | ActionKind::DecCpaGoalCampaign
            | ActionKind::IncreaseCampaignBudget
            | ActionKind::DecreaseCampaignBudget
            | ActionKind::PauseCampaign
            | ActionKind::NoAction => Ok(ReportType::Campaign),
            other => Err(unsupported_action(other, IDENTIFIER)),
        }
    }

    fn build_action(&self, kind: ActionKind, value: f64, limit: Option<f64>) -> Result<Box<dyn Action>> {
        let action = match kind {
            ActionKind::IncCpaGoalCampaign | ActionKind::DecCpaGoalCampaign => Self::campaign_action(
                kind,
                AdjustmentType::CpaGoal,
                AdjustmentPolicy::Multiplier(
                    MultiplierPolicy::new(multiplier(kind, value, IDENTIFIER)?, limit).with_micro_resolution(),
                ),
                StateField::micros("target_cpa_micros"),
            )
            .with_subject("campaign CPA goal")
            .with_requirements(vec![DetailRequirement::new("bidding_strategy_type", &["TARGET_CPA"])])
            .with_supplements(vec![Supplement::WaitMetrics, Supplement::prehistoric_state()])
            .with_preference_rules(Self::best_practices()),
            ActionKind::IncreaseCampaignBudget | ActionKind::DecreaseCampaignBudget => Self::campaign_action(
                kind,
                AdjustmentType::Budget,
                AdjustmentPolicy::Multiplier(
                    MultiplierPolicy::new(multiplier(kind, value, IDENTIFIER)?, limit).with_precision(2),
                ),
                StateField::micros("budget_amount_micros"),
            )
            .with_subject("campaign budget")
            .with_requirements(vec![
                DetailRequirement::new("budget_delivery_method", &["STANDARD"]),
                DetailRequirement::new("budget_status", &["ENABLED"]),
                DetailRequirement::new("budget_period", &["DAILY"]),
            ])
            .with_supplements(vec![Supplement::WaitMetrics, Supplement::prehistoric_state()])
            .with_preference_rules(Self::best_practices()),
            ActionKind::PauseCampaign => Self::campaign_action(
                kind,
                AdjustmentType::Status,
                AdjustmentPolicy::Pause(PausePolicy::default()),
                StateField::status("status"),
            )
            .with_supplements(vec![Supplement::WaitMetrics])
            .with_preference_rules(vec![PreferenceRule::ConversionWait]),
            ActionKind::NoAction => Self::campaign_action(
                kind,
                AdjustmentType::NoAction,
                AdjustmentPolicy::NoAction(NoActionPolicy { logs_inaction: false }),
                StateField::Absent,
            ),
            other => return Err(unsupported_action(other, IDENTIFIER)),
        };
        Ok(Box::new(action))
    }

    fn build_reporter(&self, report_type: ReportType) -> Result<Box<dyn Reporter>> {
        if report_type != ReportType::Campaign {
            return Err(RuleError::UnsupportedReportType(report_type.to_string()).into());
        }
        let reporter = ApiReporter::new(report_type)
            .with_mappings(vec![
                ColumnMapping::new(ReportColumn::CampaignId, "campaign_id"),
                ColumnMapping::new(ReportColumn::Date, "segments_date"),
                ColumnMapping::scaled(ReportColumn::LocalSpend, "metrics_cost_micros", 1e6),
                ColumnMapping::new(ReportColumn::Impressions, "metrics_impressions"),
                ColumnMapping::new(ReportColumn::Taps, "metrics_clicks"),
                ColumnMapping::new(ReportColumn::Installs, "metrics_conversions"),
            ])
            .with_retry(self.retry);
        Ok(Box::new(reporter))
    }
}
