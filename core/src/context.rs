use crate::history::HistoryStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Tunables a channel defaults and a rule may override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleOptions {
    /// Skip report rows already covered by a consumed action of the rule.
    #[serde(default = "default_true")]
    pub dynamic_window: bool,
    /// Let dry-run history count as prior adjustments.
    #[serde(default)]
    pub use_dry_run_history: bool,
    #[serde(default = "default_wait_days")]
    pub wait_days: f64,
    #[serde(default = "default_wait_conversions")]
    pub wait_conversions: f64,
    #[serde(default = "default_wait_optimized_conversions")]
    pub wait_optimized_conversions: f64,
    #[serde(default = "default_true")]
    pub use_optimized_conversions: bool,
    #[serde(default = "default_mutation_concurrency")]
    pub mutation_concurrency: usize,
}

fn default_true() -> bool {
    true
}

fn default_wait_days() -> f64 {
    1.0
}

fn default_wait_conversions() -> f64 {
    100.0
}

fn default_wait_optimized_conversions() -> f64 {
    10.0
}

fn default_mutation_concurrency() -> usize {
    1
}

impl Default for RuleOptions {
    fn default() -> Self {
        Self {
            dynamic_window: true,
            use_dry_run_history: false,
            wait_days: default_wait_days(),
            wait_conversions: default_wait_conversions(),
            wait_optimized_conversions: default_wait_optimized_conversions(),
            use_optimized_conversions: true,
            mutation_concurrency: default_mutation_concurrency(),
        }
    }
}

/// Per-rule overrides; unset fields fall back to the channel defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleOptionOverrides {
    #[serde(default)]
    pub dynamic_window: Option<bool>,
    #[serde(default)]
    pub use_dry_run_history: Option<bool>,
    #[serde(default)]
    pub wait_days: Option<f64>,
    #[serde(default)]
    pub wait_conversions: Option<f64>,
    #[serde(default)]
    pub wait_optimized_conversions: Option<f64>,
    #[serde(default)]
    pub use_optimized_conversions: Option<bool>,
    #[serde(default)]
    pub mutation_concurrency: Option<usize>,
}

impl RuleOptionOverrides {
    pub fn apply(&self, defaults: RuleOptions) -> RuleOptions {
        RuleOptions {
            dynamic_window: self.dynamic_window.unwrap_or(defaults.dynamic_window),
            use_dry_run_history: self
                .use_dry_run_history
                .unwrap_or(defaults.use_dry_run_history),
            wait_days: self.wait_days.unwrap_or(defaults.wait_days),
            wait_conversions: self.wait_conversions.unwrap_or(defaults.wait_conversions),
            wait_optimized_conversions: self
                .wait_optimized_conversions
                .unwrap_or(defaults.wait_optimized_conversions),
            use_optimized_conversions: self
                .use_optimized_conversions
                .unwrap_or(defaults.use_optimized_conversions),
            mutation_concurrency: self
                .mutation_concurrency
                .unwrap_or(defaults.mutation_concurrency),
        }
    }
}

/// Everything an action needs to know about the rule running it.
#[derive(Clone)]
pub struct RuleContext {
    pub rule_id: String,
    pub user_id: String,
    pub channel: String,
    pub channel_title: String,
    pub org_id: String,
    pub campaign_id: Option<String>,
    pub ad_group_id: Option<String>,
    pub rule_description: String,
    pub safe_mode: bool,
    pub dry_run: bool,
    pub now: DateTime<Utc>,
    pub options: RuleOptions,
    pub history: Arc<dyn HistoryStore>,
}

impl std::fmt::Debug for RuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleContext")
            .field("rule_id", &self.rule_id)
            .field("user_id", &self.user_id)
            .field("channel", &self.channel)
            .field("safe_mode", &self.safe_mode)
            .field("dry_run", &self.dry_run)
            .field("now", &self.now)
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_context() -> RuleContext {
    use chrono::TimeZone;
    RuleContext {
        rule_id: "r1".to_string(),
        user_id: "u1".to_string(),
        channel: "apple_search_ads".to_string(),
        channel_title: "Apple Search Ads".to_string(),
        org_id: "1".to_string(),
        campaign_id: Some("100".to_string()),
        ad_group_id: None,
        rule_description: "Apple Search Ads (1) → Brand → All | raise bids".to_string(),
        safe_mode: true,
        dry_run: false,
        now: Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap(),
        options: RuleOptions::default(),
        history: Arc::new(crate::history::MemoryHistoryStore::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_only_replace_set_fields() {
        let defaults = RuleOptions {
            dynamic_window: false,
            ..RuleOptions::default()
        };
        let overrides = RuleOptionOverrides {
            wait_days: Some(3.0),
            ..RuleOptionOverrides::default()
        };
        let options = overrides.apply(defaults);
        assert!(!options.dynamic_window);
        assert_eq!(options.wait_days, 3.0);
        assert_eq!(options.wait_conversions, 100.0);
    }

    #[test]
    fn test_options_yaml_defaults() {
        let options: RuleOptions = serde_yaml::from_str("use_dry_run_history: true").unwrap();
        assert!(options.dynamic_window);
        assert!(options.use_dry_run_history);
        assert_eq!(options.wait_optimized_conversions, 10.0);
        assert_eq!(options.mutation_concurrency, 1);
    }
}
