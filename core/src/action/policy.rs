//! Standard ways of turning an entity's current state into a proposal.

use super::EntityValue;
use serde::{Deserialize, Serialize};

/// Scale a numeric state, clamped at a limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiplierPolicy {
    pub multiplier: f64,
    pub limit: Option<f64>,
    /// Decimal places the result is rounded to.
    pub precision: Option<i32>,
    /// Treat values equal to the micro unit as unchanged.
    #[serde(default)]
    pub micro_resolution: bool,
}

impl MultiplierPolicy {
    pub fn new(multiplier: f64, limit: Option<f64>) -> Self {
        Self {
            multiplier,
            limit,
            precision: None,
            micro_resolution: false,
        }
    }

    pub fn with_precision(mut self, precision: i32) -> Self {
        self.precision = Some(precision);
        self
    }

    pub fn with_micro_resolution(mut self) -> Self {
        self.micro_resolution = true;
        self
    }

    pub fn adjusted_amount(&self, unadjusted: f64) -> Option<f64> {
        let mut adjusted = unadjusted * self.multiplier;
        if let Some(precision) = self.precision {
            let scale = 10f64.powi(precision);
            adjusted = (adjusted * scale).round() / scale;
        }
        if let Some(limit) = self.limit {
            if self.multiplier > 1.0 && adjusted > limit {
                if unadjusted >= limit {
                    return None;
                }
                adjusted = limit;
            } else if self.multiplier < 1.0 && adjusted < limit {
                if unadjusted <= limit {
                    return None;
                }
                adjusted = limit;
            }
        }
        if adjusted == unadjusted || (self.micro_resolution && to_micros(adjusted) == to_micros(unadjusted)) {
            return None;
        }
        Some(adjusted)
    }

    pub fn unchanged(&self, from: f64, to: f64) -> bool {
        from == to || (self.micro_resolution && to_micros(from) == to_micros(to))
    }
}

fn to_micros(value: f64) -> i64 {
    (value * 1e6) as i64
}

/// Move an entity to its paused status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PausePolicy {
    pub paused_status: String,
}

impl Default for PausePolicy {
    fn default() -> Self {
        Self {
            paused_status: "PAUSED".to_string(),
        }
    }
}

impl PausePolicy {
    pub fn adjusted_status(&self, current: Option<&str>) -> Option<EntityValue> {
        match current {
            Some(status) if status == self.paused_status => None,
            _ => Some(EntityValue::Status(self.paused_status.clone())),
        }
    }
}

/// Propose nothing but, optionally, log that nothing was done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoActionPolicy {
    pub logs_inaction: bool,
}

impl NoActionPolicy {
    pub fn adjustment(&self) -> Option<EntityValue> {
        self.logs_inaction.then_some(EntityValue::Flag(true))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdjustmentPolicy {
    Multiplier(MultiplierPolicy),
    Pause(PausePolicy),
    NoAction(NoActionPolicy),
}

impl AdjustmentPolicy {
    pub fn propose(&self, unadjusted: Option<&EntityValue>) -> Option<EntityValue> {
        match self {
            Self::Multiplier(policy) => unadjusted
                .and_then(EntityValue::as_amount)
                .and_then(|amount| policy.adjusted_amount(amount))
                .map(EntityValue::Amount),
            Self::Pause(policy) => policy.adjusted_status(unadjusted.and_then(EntityValue::as_status)),
            Self::NoAction(policy) => policy.adjustment(),
        }
    }

    /// What the proposal changes. `subject` names the adjusted state for
    /// multipliers and the entity for pauses.
    pub fn describe(&self, subject: &str, from: Option<&EntityValue>, to: Option<&EntityValue>) -> Option<String> {
        match self {
            Self::Multiplier(policy) => {
                let from = from.and_then(EntityValue::as_amount)?;
                let to = to.and_then(EntityValue::as_amount)?;
                if policy.unchanged(from, to) {
                    return None;
                }
                Some(format!("adjusted {} from {:.2} to {:.2}", subject, from, to))
            }
            Self::Pause(_) => Some(format!("paused {}", subject)),
            Self::NoAction(_) => Some("took no action".to_string()),
        }
    }
}
