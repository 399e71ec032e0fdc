use crate::action::ActionKind;
use crate::channel::Channel;
use crate::condition::{ConditionGroup, ConditionGroupDefinition};
use crate::context::RuleOptionOverrides;
use crate::error::RuleError;
use crate::reporter::RetryPolicy;
use crate::rule::{Rule, RuleMetadata, Task};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AdruleConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    pub rules: Vec<RuleDefinition>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_history_path")]
    pub history_path: String,
    #[serde(default = "default_monitor_path")]
    pub monitor_path: String,
    #[serde(default = "default_mutation_concurrency")]
    pub mutation_concurrency: usize, // Concurrent entity mutations per action
    #[serde(default = "default_report_retry_attempts")]
    pub report_retry_attempts: u32,
    #[serde(default = "default_report_retry_delay_ms")]
    pub report_retry_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_path: default_history_path(),
            monitor_path: default_monitor_path(),
            mutation_concurrency: default_mutation_concurrency(),
            report_retry_attempts: default_report_retry_attempts(),
            report_retry_delay_ms: default_report_retry_delay_ms(),
        }
    }
}

impl EngineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.report_retry_attempts,
            delay: std::time::Duration::from_millis(self.report_retry_delay_ms),
        }
    }
}

fn default_history_path() -> String {
    "adrule_data/history".to_string()
}

fn default_monitor_path() -> String {
    "adrule_data/monitor".to_string()
}

fn default_mutation_concurrency() -> usize {
    1
}

fn default_report_retry_attempts() -> u32 {
    3
}

fn default_report_retry_delay_ms() -> u64 {
    30_000
}

fn default_safe_mode() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuleDefinition {
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    pub channel: String,
    pub org_id: String,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub ad_group_id: Option<String>,
    #[serde(default)]
    pub metadata: RuleMetadata,
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub monitor: bool,
    #[serde(default = "default_safe_mode")]
    pub safe_mode: bool,
    /// Hours before the newest report row that are still settling upstream.
    #[serde(default)]
    pub data_check_range_hours: Option<i64>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub options: RuleOptionOverrides,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TaskDefinition {
    pub conditions: ConditionGroupDefinition,
    pub actions: Vec<ActionDefinition>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ActionDefinition {
    pub action: ActionKind,
    /// Percentage for scaling actions; ignored by pause and no-action.
    #[serde(default)]
    pub adjustment_value: f64,
    #[serde(default)]
    pub adjustment_limit: Option<f64>,
}

impl AdruleConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?;

        let config: AdruleConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.mutation_concurrency == 0 {
            anyhow::bail!("engine.mutation_concurrency must be at least 1");
        }

        let mut rule_ids = HashSet::new();
        for rule in &self.rules {
            if !rule_ids.insert(&rule.id) {
                anyhow::bail!("Duplicate rule ID: {}", rule.id);
            }
            if rule.tasks.is_empty() {
                anyhow::bail!("Rule '{}' has no tasks", rule.id);
            }

            for (index, task) in rule.tasks.iter().enumerate() {
                match task.actions.len() {
                    0 => return Err(RuleError::MissingAction(index).into()),
                    1 => {}
                    count => return Err(RuleError::MultipleActions { task: index, count }.into()),
                }
                for action in &task.actions {
                    if action.action.multiplier(action.adjustment_value).is_some() {
                        if action.adjustment_value <= 0.0 {
                            anyhow::bail!(
                                "Rule '{}' task {} has a non-positive adjustment value for {}",
                                rule.id,
                                index,
                                action.action
                            );
                        }
                        if action.action.multiplier(action.adjustment_value).unwrap_or(0.0) <= 0.0 {
                            anyhow::bail!(
                                "Rule '{}' task {} would reduce {} to nothing",
                                rule.id,
                                index,
                                action.action
                            );
                        }
                    }
                }
                if ConditionGroup::from_definition(&task.conditions).metrics().is_empty() {
                    anyhow::bail!("Rule '{}' task {} has no conditions", rule.id, index);
                }
            }
        }
        Ok(())
    }

    pub fn rule(&self, id: &str) -> Result<&RuleDefinition> {
        self.rules
            .iter()
            .find(|rule| rule.id == id)
            .ok_or_else(|| RuleError::InvalidConfiguration(format!("no rule with id `{}`", id)).into())
    }

    /// Build a rule, falling back to engine settings the rule leaves unset.
    pub fn build_rule(&self, id: &str, channel: &dyn Channel) -> Result<Rule> {
        let mut rule = self.rule(id)?.build(channel)?;
        if rule.options.mutation_concurrency.is_none() {
            rule.options.mutation_concurrency = Some(self.engine.mutation_concurrency);
        }
        Ok(rule)
    }
}

impl RuleDefinition {
    pub fn build(&self, channel: &dyn Channel) -> Result<Rule> {
        if channel.identifier() != self.channel {
            return Err(RuleError::InvalidConfiguration(format!(
                "rule `{}` is for channel `{}`, not `{}`",
                self.id,
                self.channel,
                channel.identifier()
            ))
            .into());
        }

        let tasks = self
            .tasks
            .iter()
            .map(|task| {
                let actions = task
                    .actions
                    .iter()
                    .map(|a| channel.build_action(a.action, a.adjustment_value, a.adjustment_limit))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Task {
                    condition_group: ConditionGroup::from_definition(&task.conditions),
                    actions,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Rule {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            channel: self.channel.clone(),
            org_id: self.org_id.clone(),
            campaign_id: self.campaign_id.clone(),
            ad_group_id: self.ad_group_id.clone(),
            metadata: self.metadata.clone(),
            tasks,
            dry_run: self.dry_run,
            monitor: self.monitor,
            safe_mode: self.safe_mode,
            data_check_range: self.data_check_range_hours.map(Duration::hours),
            created: self.created.unwrap_or_else(Utc::now),
            options: self.options.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::GroupOperator;
    use crate::kpi::Kpi;
    use std::io::Write;

    const RULES: &str = r#"
engine:
  history_path: "/tmp/adrule/history"
  mutation_concurrency: 4

rules:
  - id: "raise_cheap_keywords"
    user_id: "u1"
    channel: "apple_search_ads"
    org_id: "1"
    campaign_id: "100"
    metadata:
      campaign_name: "Brand"
      description: "raise bids on cheap keywords"
    tasks:
      - conditions:
          operator: all
          conditions:
            - metric: cpt
              operator: "<"
              value: 2
          subgroups:
            - operator: any
              conditions:
                - metric: taps
                  operator: ">="
                  value: 10
                - metric: conversions
                  operator: greater
                  value: 1
        actions:
          - action: inc_bid
            adjustment_value: 10
            adjustment_limit: 5.0
    options:
      wait_days: 2
"#;

    #[test]
    fn test_rule_file_parses() {
        let config: AdruleConfig = serde_yaml::from_str(RULES).unwrap();
        config.validate().unwrap();

        assert_eq!(config.engine.mutation_concurrency, 4);
        assert_eq!(config.engine.report_retry_attempts, 3);
        assert_eq!(config.engine.monitor_path, "adrule_data/monitor");

        let rule = &config.rules[0];
        assert!(rule.safe_mode);
        assert!(!rule.dry_run);
        assert_eq!(rule.options.wait_days, Some(2.0));
        assert_eq!(rule.tasks[0].actions[0].action, ActionKind::IncBid);
        assert_eq!(rule.tasks[0].conditions.operator, GroupOperator::All);

        let group = ConditionGroup::from_definition(&rule.tasks[0].conditions);
        assert_eq!(group.metrics(), vec![Kpi::Cpt, Kpi::Taps, Kpi::Conversions]);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(RULES.as_bytes()).unwrap();

        let config = AdruleConfig::from_file(file.path()).unwrap();
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rule("raise_cheap_keywords").unwrap().org_id, "1");
        assert!(config.rule("missing").is_err());
    }

    #[test]
    fn test_duplicate_rule_ids_rejected() {
        let mut config: AdruleConfig = serde_yaml::from_str(RULES).unwrap();
        config.rules.push(config.rules[0].clone());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate rule ID"));
    }

    #[test]
    fn test_multiple_actions_rejected() {
        let mut config: AdruleConfig = serde_yaml::from_str(RULES).unwrap();
        let extra = config.rules[0].tasks[0].actions[0].clone();
        config.rules[0].tasks[0].actions.push(extra);
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RuleError>(),
            Some(RuleError::MultipleActions { task: 0, count: 2 })
        ));
    }

    #[test]
    fn test_adjustment_values_must_be_positive() {
        let mut config: AdruleConfig = serde_yaml::from_str(RULES).unwrap();
        config.rules[0].tasks[0].actions[0].adjustment_value = 0.0;
        assert!(config.validate().is_err());

        config.rules[0].tasks[0].actions[0].action = ActionKind::DecBid;
        config.rules[0].tasks[0].actions[0].adjustment_value = 100.0;
        assert!(config.validate().is_err());

        config.rules[0].tasks[0].actions[0].action = ActionKind::PauseKeyword;
        config.rules[0].tasks[0].actions[0].adjustment_value = 0.0;
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_conditions_rejected() {
        let mut config: AdruleConfig = serde_yaml::from_str(RULES).unwrap();
        config.rules[0].tasks[0].conditions = ConditionGroupDefinition {
            operator: GroupOperator::Any,
            conditions: Vec::new(),
            subgroups: Vec::new(),
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("has no conditions"));
    }
}
