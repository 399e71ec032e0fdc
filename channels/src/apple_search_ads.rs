//! Apple Search Ads: keyword bids, ad group CPA goals and keyword pauses.
//!
//! Keyword details are expected to carry the owning campaign's daily
//! budget as `campaignBudget`; bids are never raised above it.

use crate::multiplier;
use adrule_core::action::{
    Action, ActionKind, AdjustmentPolicy, AdjustmentType, MultiplierPolicy, NoActionPolicy, PausePolicy,
    PreferenceRule, StandardAction, StateField, TargetType,
};
use adrule_core::channel::{unsupported_action, Channel, ChannelApi};
use adrule_core::report::{Granularity, ReportType};
use adrule_core::reporter::{ApiReporter, Reporter, RetryPolicy};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Months, Utc};
use std::sync::Arc;

pub const IDENTIFIER: &str = "apple_search_ads";

pub struct AppleSearchAds {
    api: Arc<dyn ChannelApi>,
    retry: RetryPolicy,
}

impl AppleSearchAds {
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
impl Channel for AppleSearchAds {
    fn identifier(&self) -> &str {
        IDENTIFIER
    }

    fn title(&self) -> &str {
        "Apple Search Ads"
    }

    fn api(&self) -> Arc<dyn ChannelApi> {
        self.api.clone()
    }

    fn report_type(&self, kind: ActionKind) -> Result<ReportType> {
        match kind {
            ActionKind::IncBid | ActionKind::DecBid | ActionKind::PauseKeyword | ActionKind::NoAction => {
                Ok(ReportType::Keyword)
            }
            ActionKind::IncCpaGoal | ActionKind::DecCpaGoal => Ok(ReportType::Adgroup),
            other => Err(unsupported_action(other, IDENTIFIER)),
        }
    }

    fn build_action(&self, kind: ActionKind, value: f64, limit: Option<f64>) -> Result<Box<dyn Action>> {
        let action = match kind {
            ActionKind::IncBid | ActionKind::DecBid => StandardAction::new(
                kind,
                TargetType::Keyword,
                AdjustmentType::Bid,
                AdjustmentPolicy::Multiplier(
                    MultiplierPolicy::new(multiplier(kind, value, IDENTIFIER)?, limit).with_precision(2),
                ),
                StateField::amount("bidAmount"),
            )
            .with_entity_fields("id", "text")
            .with_subject("keyword bid")
            .with_preference_rules(vec![PreferenceRule::AttributeCeiling {
                attribute: "campaignBudget".to_string(),
                subject: "keyword bid".to_string(),
            }]),
            ActionKind::IncCpaGoal | ActionKind::DecCpaGoal => StandardAction::new(
                kind,
                TargetType::Adgroup,
                AdjustmentType::CpaGoal,
                AdjustmentPolicy::Multiplier(
                    MultiplierPolicy::new(multiplier(kind, value, IDENTIFIER)?, limit).with_precision(2),
                ),
                StateField::amount("cpaGoal"),
            )
            .with_entity_fields("id", "name")
            .with_subject("ad group CPA goal"),
            ActionKind::PauseKeyword => StandardAction::new(
                kind,
                TargetType::Keyword,
                AdjustmentType::Status,
                AdjustmentPolicy::Pause(PausePolicy::default()),
                StateField::status("status"),
            )
            .with_entity_fields("id", "text"),
            ActionKind::NoAction => StandardAction::new(
                kind,
                TargetType::Keyword,
                AdjustmentType::NoAction,
                AdjustmentPolicy::NoAction(NoActionPolicy { logs_inaction: true }),
                StateField::Absent,
            )
            .with_entity_fields("id", "text"),
            other => return Err(unsupported_action(other, IDENTIFIER)),
        };
        Ok(Box::new(action))
    }

    fn build_reporter(&self, report_type: ReportType) -> Result<Box<dyn Reporter>> {
        // Apple reports already use the canonical column names.
        Ok(Box::new(ApiReporter::new(report_type).with_retry(self.retry)))
    }

    fn granularity_is_compatible(
        &self,
        granularity: Granularity,
        _report_type: ReportType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let range = end - start;
        let within_two_years = now
            .checked_sub_months(Months::new(24))
            .map_or(false, |limit| start >= limit);
        match granularity {
            Granularity::Hourly => start >= now - Duration::days(30) && range < Duration::days(7),
            Granularity::Daily => range <= Duration::days(90),
            Granularity::Weekly => {
                range >= Duration::days(14) && range <= Duration::days(365) && within_two_years
            }
            Granularity::Monthly => {
                within_two_years
                    && start
                        .checked_add_months(Months::new(3))
                        .map_or(false, |three_months| end > three_months)
            }
        }
    }
}
