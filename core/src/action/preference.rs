//! Governance rules that temper computed adjustments.
//!
//! Rules run in the order an action lists them. Each may raise a row's
//! preference, explain itself, and substitute a safer adjustment; none can
//! lower a verdict an earlier rule reached.

use super::{ActionReportRow, EntityValue, Preference};
use crate::context::RuleContext;
use chrono::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum PreferenceRule {
    /// Hold changes until enough time or conversions have passed since the
    /// last adjustment.
    ConversionWait,
    /// Bound the change relative to the state one day ago.
    RelativeDailyLimit { limit: f64 },
    /// Never propose less than a channel minimum.
    MinimumAmount { minimum: f64, subject: String },
    /// Never propose more than the value of an entity attribute.
    AttributeCeiling { attribute: String, subject: String },
}

impl PreferenceRule {
    pub fn apply(&self, row: &mut ActionReportRow, context: &RuleContext) {
        if row.has_error() {
            return;
        }
        match self {
            Self::ConversionWait => conversion_wait(row, context),
            Self::RelativeDailyLimit { limit } => relative_daily_limit(row, *limit),
            Self::MinimumAmount { minimum, subject } => minimum_amount(row, *minimum, subject),
            Self::AttributeCeiling { attribute, subject } => {
                if let Some(ceiling) = row.attribute_f64(attribute) {
                    attribute_ceiling(row, ceiling, subject);
                }
            }
        }
    }
}

fn amounts(row: &ActionReportRow) -> Option<(f64, f64)> {
    let unadjusted = row.unadjusted_state.as_ref()?.as_amount()?;
    let adjustment = row.adjustment.as_ref()?.as_amount()?;
    Some((unadjusted, adjustment))
}

fn conversion_wait(row: &mut ActionReportRow, context: &RuleContext) {
    let options = &context.options;
    let Some(wait) = row.wait.as_ref() else {
        return;
    };
    let wait_start = context.now - Duration::seconds((options.wait_days * 86_400.0) as i64);
    let optimized_pending =
        !options.use_optimized_conversions || wait.optimized_conversions < options.wait_optimized_conversions;
    if wait.since <= wait_start || wait.conversions >= options.wait_conversions || !optimized_pending {
        return;
    }

    let elapsed_days = (context.now - wait.since).num_seconds() as f64 / 86_400.0;
    let mut message = format!(
        "Wait for {:.2} / {} days or {} / {} conversions",
        elapsed_days, options.wait_days, wait.conversions, options.wait_conversions
    );
    if options.use_optimized_conversions {
        message.push_str(&format!(
            " or {} / {} optimized conversions",
            wait.optimized_conversions, options.wait_optimized_conversions
        ));
    }
    if let (Some(time), Some(description)) = (
        wait.last_adjustment_time,
        wait.last_adjustment_description.as_ref(),
    ) {
        message.push_str(&format!(
            " since {} at {} UTC",
            description,
            time.format("%Y-%m-%d %H:%M:%S")
        ));
    }
    row.add_preference(Preference::PreventAdjustment, message);
}

fn relative_daily_limit(row: &mut ActionReportRow, limit: f64) {
    let Some(prehistoric) = row.prehistoric_state.as_ref().and_then(EntityValue::as_amount) else {
        return;
    };
    let Some((unadjusted, adjustment)) = amounts(row) else {
        return;
    };
    if prehistoric == 0.0 {
        return;
    }

    let current = unadjusted / prehistoric - 1.0;
    let proposed = adjustment / prehistoric - 1.0;
    if current.abs() >= limit && current * (adjustment - unadjusted) > 0.0 {
        row.add_preference(
            Preference::PreventAdjustment,
            format!(
                "Limit 1 day adjustment to {:.0}% of {:.2} (already {:.0}% at {:.2})",
                limit * 100.0,
                prehistoric,
                current * 100.0,
                unadjusted
            ),
        );
    } else if proposed.abs() > limit {
        let preferred = prehistoric * (1.0 + limit * proposed.signum());
        row.prefer_adjustment(EntityValue::Amount(preferred));
        row.add_preference(
            Preference::ModifyAdjustment,
            format!(
                "Limit 1 day adjustment to {:.0}% of {:.2} ({:.2} instead of {:.2})",
                limit * 100.0,
                prehistoric,
                preferred,
                adjustment
            ),
        );
    }
}

fn minimum_amount(row: &mut ActionReportRow, minimum: f64, subject: &str) {
    let Some((unadjusted, adjustment)) = amounts(row) else {
        return;
    };
    if adjustment >= minimum {
        return;
    }
    if unadjusted <= minimum {
        row.add_preference(
            Preference::PreventAdjustment,
            format!(
                "Keep {} at not less than {:.2} (already {:.2})",
                subject, minimum, unadjusted
            ),
        );
    } else {
        row.prefer_adjustment(EntityValue::Amount(minimum));
        row.add_preference(
            Preference::ModifyAdjustment,
            format!(
                "Reduce {} to not less than {:.2} (instead of {:.2})",
                subject, minimum, adjustment
            ),
        );
    }
}

fn attribute_ceiling(row: &mut ActionReportRow, ceiling: f64, subject: &str) {
    let Some((unadjusted, adjustment)) = amounts(row) else {
        return;
    };
    if adjustment <= ceiling {
        return;
    }
    if unadjusted >= ceiling {
        row.add_preference(
            Preference::PreventAdjustment,
            format!(
                "Keep {} at not more than {:.2} (already {:.2})",
                subject, ceiling, unadjusted
            ),
        );
    } else {
        row.prefer_adjustment(EntityValue::Amount(ceiling));
        row.add_preference(
            Preference::ModifyAdjustment,
            format!(
                "Raise {} to not more than {:.2} (instead of {:.2})",
                subject, ceiling, adjustment
            ),
        );
    }
}
