//! Rules: ordered tasks of conditions and actions over channel reports.

use crate::action::{adjust, Action, ActionResult, HistoryMetadata};
use crate::channel::{Channel, ReportRequest};
use crate::condition::ConditionGroup;
use crate::context::{RuleContext, RuleOptionOverrides};
use crate::error::RuleError;
use crate::history::{HistoryRecord, HistoryStore, HistoryType, MonitorSnapshot, MonitorStore, MonitorTask};
use crate::metrics::METRICS;
use crate::report::{Granularity, Report, ReportColumn, ReportType};
use crate::reporter::ReportFilter;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One condition group and the action applied to the rows it selects.
pub struct Task {
    pub condition_group: ConditionGroup,
    pub actions: Vec<Box<dyn Action>>,
}

impl Task {
    pub fn new(condition_group: ConditionGroup, action: Box<dyn Action>) -> Self {
        Self {
            condition_group,
            actions: vec![action],
        }
    }

    fn action(&self, index: usize) -> Result<&dyn Action> {
        match self.actions.as_slice() {
            [action] => Ok(action.as_ref()),
            [] => Err(RuleError::MissingAction(index).into()),
            actions => Err(RuleError::MultipleActions {
                task: index,
                count: actions.len(),
            }
            .into()),
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("condition_group", &self.condition_group)
            .field(
                "actions",
                &self.actions.iter().map(|a| a.kind()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Human-facing names of the entities a rule is scoped to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleMetadata {
    #[serde(default)]
    pub campaign_name: Option<String>,
    #[serde(default)]
    pub ad_group_name: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug)]
pub struct Rule {
    pub id: String,
    pub user_id: String,
    /// Identifier of the channel the rule runs on.
    pub channel: String,
    pub org_id: String,
    pub campaign_id: Option<String>,
    pub ad_group_id: Option<String>,
    pub metadata: RuleMetadata,
    pub tasks: Vec<Task>,
    pub dry_run: bool,
    /// Record a snapshot of every run; monitored rules never commit.
    pub monitor: bool,
    pub safe_mode: bool,
    pub data_check_range: Option<Duration>,
    pub created: DateTime<Utc>,
    pub options: RuleOptionOverrides,
}

/// Collaborators a rule runs against.
#[derive(Clone)]
pub struct RuleConnection {
    pub channel: Arc<dyn Channel>,
    pub history: Arc<dyn HistoryStore>,
    pub monitor: Option<Arc<dyn MonitorStore>>,
}

impl std::fmt::Debug for RuleConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleConnection")
            .field("monitor", &self.monitor.is_some())
            .finish_non_exhaustive()
    }
}

/// Everything one rule execution produced.
#[derive(Debug, Clone)]
pub struct RuleResult {
    /// Rows consumed by all tasks, in task order.
    pub report: Report,
    pub action_results: Vec<ActionResult>,
}

impl RuleResult {
    pub fn serialize(&self) -> Result<serde_json::Value> {
        let results = self
            .action_results
            .iter()
            .map(ActionResult::serialize)
            .collect::<Result<Vec<_>>>()?;
        Ok(json!({
            "report": self.report.to_csv()?,
            "actionResults": results,
        }))
    }

    pub fn errors(&self) -> usize {
        self.action_results
            .iter()
            .flat_map(|result| result.errors())
            .flatten()
            .count()
    }
}

impl Rule {
    /// `"{channel} ({org}) → {campaign} → {ad group} | {description}"`
    pub fn description(&self, channel_title: &str) -> String {
        let campaign = self
            .metadata
            .campaign_name
            .as_deref()
            .or(self.campaign_id.as_deref())
            .unwrap_or("All");
        let ad_group = self
            .metadata
            .ad_group_name
            .as_deref()
            .or(self.ad_group_id.as_deref())
            .unwrap_or("All");
        format!(
            "{} ({}) → {} → {} | {}",
            channel_title, self.org_id, campaign, ad_group, self.metadata.description
        )
    }

    /// Fail before any side effect if a task is not runnable.
    pub fn validate_tasks(&self) -> Result<()> {
        for (index, task) in self.tasks.iter().enumerate() {
            task.action(index)?;
        }
        Ok(())
    }

    pub fn context(&self, connection: &RuleConnection, now: DateTime<Utc>) -> RuleContext {
        let channel = &connection.channel;
        RuleContext {
            rule_id: self.id.clone(),
            user_id: self.user_id.clone(),
            channel: channel.identifier().to_string(),
            channel_title: channel.title().to_string(),
            org_id: self.org_id.clone(),
            campaign_id: self.campaign_id.clone(),
            ad_group_id: self.ad_group_id.clone(),
            rule_description: self.description(channel.title()),
            safe_mode: self.safe_mode,
            dry_run: self.dry_run || self.monitor,
            now,
            options: channel.rule_options(&self.options),
            history: connection.history.clone(),
        }
    }

    /// Report types the tasks evaluate against.
    pub fn report_types(&self, channel: &dyn Channel) -> Result<BTreeSet<ReportType>> {
        self.tasks
            .iter()
            .enumerate()
            .map(|(index, task)| channel.report_type(task.action(index)?.kind()))
            .collect()
    }

    /// Fetch, filter and act on the channel's reports for `[start, end]`.
    pub async fn execute(
        &self,
        connection: &RuleConnection,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Option<Granularity>,
        now: DateTime<Utc>,
    ) -> Result<RuleResult> {
        self.validate_tasks()?;
        let channel = connection.channel.as_ref();
        let api = channel.api();
        let options = channel.rule_options(&self.options);

        let mut reports = BTreeMap::new();
        for report_type in self.report_types(channel)? {
            let granularity = match granularity {
                Some(granularity) => granularity,
                None => channel.highest_compatible_granularity(report_type, start, end, now)?,
            };
            let request = ReportRequest {
                report_type,
                start,
                end,
                granularity,
                org_id: self.org_id.clone(),
                campaign_id: self.campaign_id.clone(),
                ad_group_id: self.ad_group_id.clone(),
            };
            debug!(rule_id = %self.id, report_type = %report_type, granularity = ?granularity, "Fetching report");
            let raw = channel
                .build_reporter(report_type)?
                .fetch_raw(&request, api.as_ref())
                .await
                .with_context(|| format!("failed to fetch {} report for rule {}", report_type, self.id))?;
            let filter = ReportFilter {
                report_type,
                rule_id: self.id.clone(),
                ad_group_id: self.ad_group_id.clone(),
                data_check_range: self.data_check_range,
                fetched_at: now,
                dynamic_window: options.dynamic_window,
            };
            reports.insert(report_type, filter.apply(raw, connection.history.as_ref()).await?);
        }
        self.run_tasks(connection, reports, now).await
    }

    /// Run every task in order against prepared reports.
    ///
    /// Rows a task selects are removed from its report before the next task
    /// runs, so no two tasks act on the same row.
    pub async fn run_tasks(
        &self,
        connection: &RuleConnection,
        mut reports: BTreeMap<ReportType, Report>,
        now: DateTime<Utc>,
    ) -> Result<RuleResult> {
        self.validate_tasks()?;
        let started = Instant::now();
        let channel = connection.channel.as_ref();
        let api = channel.api();
        let context = self.context(connection, now);
        info!(rule_id = %self.id, tasks = self.tasks.len(), dry_run = context.dry_run, "Running rule");

        let mut selections = Vec::with_capacity(self.tasks.len());
        let mut action_results = Vec::with_capacity(self.tasks.len());
        let mut monitor_tasks = Vec::new();
        for (index, task) in self.tasks.iter().enumerate() {
            let action = task.action(index)?;
            let report_type = channel.report_type(action.kind())?;
            let report = reports.get_mut(&report_type).ok_or_else(|| {
                RuleError::InvalidConfiguration(format!("no {} report for task {}", report_type, index))
            })?;

            let source = report.clone();
            let mut selected = report.clone();
            task.condition_group
                .filter_data(&mut selected, report_type.group_by_id().name())?;
            METRICS.record_task(selected.num_rows());
            info!(
                rule_id = %self.id,
                task = index,
                action = %action.kind(),
                selected = selected.num_rows(),
                "Task selected rows"
            );

            let result = adjust(action, api.as_ref(), &context, &selected).await?;
            self.log_history(&context, &result, &selected, connection.history.as_ref())
                .await?;

            report.drop_rows(&selected.label_set())?;
            if self.monitor {
                monitor_tasks.push(MonitorTask {
                    report: selected.to_csv()?,
                    source_report: source.to_csv()?,
                    action_report: result.action_report.to_json()?,
                    api_response: result.api_responses(),
                });
            }
            selections.push(selected);
            action_results.push(result);
        }

        if self.monitor && !monitor_tasks.is_empty() {
            match connection.monitor.as_ref() {
                Some(monitor) => {
                    monitor
                        .insert(MonitorSnapshot {
                            rule_id: self.id.clone(),
                            log_creation_date: now,
                            rule_description: context.rule_description.clone(),
                            tasks: monitor_tasks,
                        })
                        .await?
                }
                None => warn!(rule_id = %self.id, "Monitored rule has no monitor store"),
            }
        }

        METRICS.record_rule(&self.id, started.elapsed().as_secs_f64());
        Ok(RuleResult {
            report: Report::concat(&selections)?,
            action_results,
        })
    }

    /// Action, error-summary and execute-summary records for one task.
    pub fn history_records(&self, context: &RuleContext, result: &ActionResult, selected: &Report) -> Result<Vec<HistoryRecord>> {
        let last_data_checked_date = if selected.has_column(ReportColumn::Date.name()) {
            selected.max_timestamp(ReportColumn::Date.name())?
        } else {
            None
        };
        let metadata = HistoryMetadata {
            user_id: context.user_id.clone(),
            rule_id: context.rule_id.clone(),
            created: context.now,
            rule_description: context.rule_description.clone(),
            dry_run: context.dry_run,
            last_data_checked_date,
        };

        let mut records: Vec<HistoryRecord> = result
            .logs()
            .iter()
            .flatten()
            .map(|log| log.to_history(&metadata))
            .collect();
        let attempted = records.len();
        METRICS.record_actions_logged(attempted as u64);

        let errors: Vec<String> = result.errors().iter().flatten().map(|e| e.to_string()).collect();
        if !errors.is_empty() {
            warn!(rule_id = %context.rule_id, errors = errors.len(), "Task finished with entity errors");
            records.push(HistoryRecord {
                error_descriptions: Some(errors.clone()),
                ..metadata.record(
                    HistoryType::Error,
                    format!(
                        "ERROR: {} error(s) occurred while attempting the last {} action(s) for rule {}",
                        errors.len(),
                        attempted,
                        context.rule_description
                    ),
                )
            });
        }
        records.push(HistoryRecord {
            action_count: Some(attempted),
            ..metadata.record(
                HistoryType::Execute,
                format!("Attempting {} action(s) for rule {}", attempted, context.rule_description),
            )
        });
        Ok(records)
    }

    async fn log_history(
        &self,
        context: &RuleContext,
        result: &ActionResult,
        selected: &Report,
        history: &dyn HistoryStore,
    ) -> Result<()> {
        let records = self.history_records(context, result, selected)?;
        debug!(rule_id = %self.id, records = records.len(), "Writing history");
        history.insert_many(records).await
    }
}
