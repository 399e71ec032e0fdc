use adrule_channels::channel_factory;
use adrule_connectors::{ReportLoader, SledHistoryStore};
use adrule_core::action::TargetType;
use adrule_core::channel::{ChannelApi, EntityDetail, MutationRequest, ReportRequest};
use adrule_core::condition::ConditionGroup;
use adrule_core::config::AdruleConfig;
use adrule_core::error::RuleError;
use adrule_core::report::Report;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Stand-in client for commands that never reach a channel.
struct OfflineApi;

#[async_trait]
impl ChannelApi for OfflineApi {
    async fn fetch_report(&self, request: &ReportRequest) -> Result<Report> {
        bail!("no channel client configured to fetch {} reports", request.report_type)
    }

    async fn fetch_entities(&self, target_type: TargetType, _entity_ids: &[String]) -> Result<Vec<EntityDetail>> {
        bail!("no channel client configured to fetch {} entities", target_type.noun())
    }

    async fn mutate_entity(&self, request: &MutationRequest) -> Result<serde_json::Value> {
        bail!("no channel client configured to mutate target {}", request.target_id)
    }
}

pub fn validate(config_path: &str) -> Result<()> {
    let config = AdruleConfig::from_file(config_path)?;
    let retry = config.engine.retry_policy();

    let mut invalid = 0;
    for definition in &config.rules {
        let built = channel_factory(&definition.channel, Arc::new(OfflineApi), retry).and_then(|channel| {
            let rule = definition.build(channel.as_ref())?;
            rule.validate_tasks()?;
            rule.report_types(channel.as_ref())
        });
        match built {
            Ok(report_types) => {
                let names: Vec<String> = report_types.iter().map(|t| t.to_string()).collect();
                println!(
                    "✅ Rule '{}' ({}): {} task(s) over {} report(s)",
                    definition.id,
                    definition.channel,
                    definition.tasks.len(),
                    names.join(", ")
                );
            }
            Err(e) => {
                invalid += 1;
                eprintln!("❌ Rule '{}' ({}): {}", definition.id, definition.channel, e);
            }
        }
    }

    if invalid > 0 {
        bail!("{} of {} rule(s) are invalid", invalid, config.rules.len());
    }
    println!("\n{} rule(s) valid", config.rules.len());
    Ok(())
}

pub async fn evaluate(config_path: &str, rule_id: &str, report_path: &str, task: usize, sql: Option<&str>) -> Result<()> {
    let config = AdruleConfig::from_file(config_path)?;
    let definition = config.rule(rule_id)?;
    let Some(task_definition) = definition.tasks.get(task) else {
        bail!("rule '{}' has {} task(s), no task {}", rule_id, definition.tasks.len(), task);
    };
    let action = task_definition
        .actions
        .first()
        .ok_or(RuleError::MissingAction(task))?;

    let channel = channel_factory(&definition.channel, Arc::new(OfflineApi), config.engine.retry_policy())?;
    let report_type = channel.report_type(action.action)?;
    let group_by_id = report_type.group_by_id();

    let loader = ReportLoader::new();
    let mut report = match sql {
        Some(sql) => loader.load_query(report_path, sql).await?,
        None => loader.load(report_path).await?,
    };
    let total = report.num_rows();

    let group = ConditionGroup::from_definition(&task_definition.conditions);
    group.filter_data(&mut report, group_by_id.name())?;
    info!(rule_id = %rule_id, task, total, selected = report.num_rows(), "Task evaluated");

    println!(
        "Rule '{}' task {} ({} on {} report) selects {} of {} row(s)",
        rule_id,
        task,
        action.action,
        report_type,
        report.num_rows(),
        total
    );
    if !report.is_empty() {
        println!("{}", report.pretty()?);
    }
    Ok(())
}

pub fn history(db: &str, rule_id: &str, limit: usize, json: bool) -> Result<()> {
    let store = SledHistoryStore::new(db)?;
    let records = store.recent_for_rule(rule_id, limit)?;
    if records.is_empty() {
        println!("No history for rule '{}'", rule_id);
        return Ok(());
    }

    for record in &records {
        if json {
            println!("{}", serde_json::to_string(record)?);
            continue;
        }
        let dry_run = if record.dry_run { " (dry run)" } else { "" };
        println!(
            "{} {:?} {} → {}{}",
            record.history_creation_date.format("%Y-%m-%d %H:%M:%S"),
            record.history_type,
            record.target_id,
            record.action_description,
            dry_run
        );
    }
    Ok(())
}
