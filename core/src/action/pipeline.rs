//! The generate, interpret, execute and finalize phases of one action.

use super::{Action, ActionLog, ActionReport, ActionReportRow, ActionResult, Preference};
use crate::channel::ChannelApi;
use crate::context::RuleContext;
use crate::error::{ActionError, RuleError};
use crate::history::{HistoryQuery, HistoryRecord, HistoryType};
use crate::metrics::METRICS;
use crate::report::Report;
use anyhow::Result;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Run `action` over the selected rows.
///
/// Entity-level failures are recorded on their rows; only failures that
/// make the whole action report meaningless are returned as errors.
pub async fn adjust(
    action: &dyn Action,
    api: &dyn ChannelApi,
    context: &RuleContext,
    report: &Report,
) -> Result<ActionResult> {
    if report.is_empty() {
        return Ok(ActionResult {
            report: report.clone(),
            action_report: ActionReport::default(),
            dry_run: context.dry_run,
        });
    }

    let action_report = generate(action, api, context, report).await?;
    let mut action_report = interpret(action, context, action_report)?;
    execute(action, api, context, &mut action_report).await;
    finalize(&mut action_report);

    debug!(
        action = %action.kind(),
        rows = action_report.len(),
        "Action report complete"
    );
    Ok(ActionResult {
        report: report.clone(),
        action_report,
        dry_run: context.dry_run,
    })
}

pub async fn generate(
    action: &dyn Action,
    api: &dyn ChannelApi,
    context: &RuleContext,
    report: &Report,
) -> Result<ActionReport> {
    // 1. Entities referenced by the selected rows
    let entity_ids = action.entity_ids(report)?;

    // 2. Current state of each entity
    let details = action.fetch_entities(&entity_ids, api, context).await?;

    // 3. Canonical rows
    let rows = details
        .iter()
        .map(|detail| action.map_entity(detail, context))
        .collect::<Result<Vec<_>>>()?;

    // 4. Shape
    let mut action_report = shape(action, context, &entity_ids, rows)?;

    // 5. Prior adjustments
    attach_history(context, &mut action_report).await?;

    // 6. Action-specific enrichment
    action.supplement(action_report, api, context).await
}

fn shape(
    action: &dyn Action,
    context: &RuleContext,
    entity_ids: &[String],
    mut rows: Vec<ActionReportRow>,
) -> Result<ActionReport> {
    let found: HashSet<String> = rows.iter().map(|row| row.target_id.clone()).collect();
    for id in entity_ids.iter().filter(|id| !found.contains(*id)) {
        warn!(target_id = %id, action = %action.kind(), "Action target not found");
        METRICS.record_missing_target();
        rows.push(ActionReportRow::missing(id.clone(), action.entity_granularity()));
    }

    let mut seen = HashSet::new();
    for row in &rows {
        if row.target_id.is_empty() {
            return Err(RuleError::InvalidActionReport("empty target id".to_string()).into());
        }
        if !seen.insert(row.target_id.as_str()) {
            return Err(RuleError::InvalidActionReport(format!(
                "duplicate target id {}",
                row.target_id
            ))
            .into());
        }
    }

    for row in &mut rows {
        row.preference = Preference::MakeAdjustment;
        row.override_preference = !context.safe_mode;
        row.preference_messages.clear();
        row.dry_run = context.dry_run;
    }
    Ok(ActionReport::new(rows))
}

async fn attach_history(context: &RuleContext, report: &mut ActionReport) -> Result<()> {
    let query = HistoryQuery {
        user_id: Some(context.user_id.clone()),
        target_channel: Some(context.channel.clone()),
        target_ids: Some(report.rows.iter().map(|row| row.target_id.clone()).collect()),
        history_type: Some(HistoryType::Action),
        consumed_data: Some(true),
        dry_run: if context.options.use_dry_run_history {
            None
        } else {
            Some(false)
        },
        ..HistoryQuery::default()
    };
    let mut by_target: HashMap<String, Vec<HistoryRecord>> = HashMap::new();
    for record in context.history.find(&query).await? {
        by_target.entry(record.target_id.clone()).or_default().push(record);
    }
    for row in &mut report.rows {
        row.history = by_target.remove(&row.target_id).unwrap_or_default();
    }
    Ok(())
}

pub fn interpret(action: &dyn Action, context: &RuleContext, mut report: ActionReport) -> Result<ActionReport> {
    entity_apply(&mut report, |row| !row.has_error(), |row| {
        row.adjustment = action.entity_adjustment(row, context)?;
        Ok(())
    });

    for rule in action.preference_rules() {
        for row in &mut report.rows {
            rule.apply(row, context);
        }
    }

    action.transform(report, context)
}

pub async fn execute(action: &dyn Action, api: &dyn ChannelApi, context: &RuleContext, report: &mut ActionReport) {
    entity_apply(
        report,
        |row| !row.has_error() && row.adjustment.is_some(),
        |row| {
            row.log = entity_log(action, row, context);
            Ok(())
        },
    );

    entity_apply(
        report,
        |row| !row.has_error() && row.log.is_some() && row.consumes_data(),
        |row| {
            row.api_request = action.entity_request(row, context)?;
            Ok(())
        },
    );

    let logged = report.rows.iter().filter(|row| row.log.is_some()).count();
    if context.dry_run {
        METRICS.record_dry_run_actions(logged as u64);
        return;
    }
    commit(action, api, context, report).await;
}

/// Send every pending request, at most `mutation_concurrency` at a time.
async fn commit(action: &dyn Action, api: &dyn ChannelApi, context: &RuleContext, report: &mut ActionReport) {
    let pending: Vec<usize> = report
        .rows
        .iter()
        .enumerate()
        .filter(|(_, row)| !row.has_error() && row.api_request.is_some())
        .map(|(i, _)| i)
        .collect();
    if pending.is_empty() {
        return;
    }

    let concurrency = context.options.mutation_concurrency.max(1);
    let rows = &report.rows;
    let responses: Vec<(usize, Result<serde_json::Value>)> = stream::iter(pending.into_iter().map(|i| async move {
        (i, action.mutate_entity(&rows[i], api, context).await)
    }))
    .buffered(concurrency)
    .collect()
    .await;

    for (i, response) in responses {
        let row = &mut report.rows[i];
        match response {
            Ok(value) => {
                METRICS.record_mutation();
                row.api_response = Some(value);
            }
            Err(e) => {
                warn!(target_id = %row.target_id, error = %e, "Entity mutation failed");
                METRICS.record_entity_error();
                row.error = Some(ActionError::entity(row.target_id.clone(), &e));
            }
        }
    }
}

/// Rows that failed must not be reported as logged.
pub fn finalize(report: &mut ActionReport) {
    for row in report.rows.iter_mut().filter(|row| row.has_error()) {
        row.log = None;
    }
}

/// Apply `transform` to each row matching `location`, replacing the row on
/// success and attaching an entity error to the untouched row on failure.
pub fn entity_apply<L, T>(report: &mut ActionReport, location: L, mut transform: T)
where
    L: Fn(&ActionReportRow) -> bool,
    T: FnMut(&mut ActionReportRow) -> Result<()>,
{
    for row in report.rows.iter_mut().filter(|row| location(row)) {
        let mut candidate = row.clone();
        match transform(&mut candidate) {
            Ok(()) => *row = candidate,
            Err(e) => {
                warn!(target_id = %row.target_id, error = %e, "Entity transform failed");
                METRICS.record_entity_error();
                row.error = Some(ActionError::entity(row.target_id.clone(), &e));
            }
        }
    }
}

fn entity_log(action: &dyn Action, row: &ActionReportRow, context: &RuleContext) -> Option<ActionLog> {
    let description = action.action_description(row, context)?;
    Some(ActionLog {
        target_id: row.target_id.clone(),
        target_type: row.target_type,
        target_channel: context.channel.clone(),
        adjustment_type: action.adjustment_type(),
        adjustment_from: row.unadjusted_state.clone(),
        adjustment_to: row.adjustment.clone(),
        target_description: row.target_name.clone(),
        action_description: qualified_description(&description, row, action.preferences_title()),
        consumed_data: row.consumes_data(),
    })
}

/// Describe a change in light of the governance verdict on it.
pub fn qualified_description(description: &str, row: &ActionReportRow, title: &str) -> String {
    if row.override_preference {
        return description.to_string();
    }
    let messages = row.preference_messages.join(", ");
    match row.preference {
        Preference::MakeAdjustment => description.to_string(),
        Preference::ModifyAdjustment => format!("moderately {} using {}: {}", description, title, messages),
        Preference::PreventAdjustment => {
            format!("should have {} but did not due to {}: {}", description, title, messages)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{
        ActionKind, AdjustmentPolicy, AdjustmentType, EntityValue, MultiplierPolicy, PreferenceRule, StandardAction,
        StateField, TargetType,
    };
    use crate::channel::{EntityDetail, MutationRequest, ReportRequest};
    use crate::context::test_context;
    use crate::history::tests::action_record;
    use crate::history::MemoryHistoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    struct FakeApi {
        bids: HashMap<String, f64>,
        failing: HashSet<String>,
        mutations: Mutex<Vec<MutationRequest>>,
    }

    impl FakeApi {
        fn new(bids: &[(&str, f64)]) -> Self {
            Self {
                bids: bids.iter().map(|(id, bid)| (id.to_string(), *bid)).collect(),
                failing: HashSet::new(),
                mutations: Mutex::new(Vec::new()),
            }
        }

        fn mutation_count(&self) -> usize {
            self.mutations.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChannelApi for FakeApi {
        async fn fetch_report(&self, _request: &ReportRequest) -> Result<Report> {
            anyhow::bail!("not used")
        }

        async fn fetch_entities(&self, _target_type: TargetType, entity_ids: &[String]) -> Result<Vec<EntityDetail>> {
            Ok(entity_ids
                .iter()
                .filter_map(|id| self.bids.get(id).map(|bid| (id, bid)))
                .map(|(id, bid)| {
                    json!({"keywordId": id, "text": format!("kw {}", id), "bidAmount": bid, "campaignBudget": 2.0})
                        .as_object()
                        .cloned()
                        .unwrap()
                })
                .collect())
        }

        async fn mutate_entity(&self, request: &MutationRequest) -> Result<serde_json::Value> {
            if self.failing.contains(&request.target_id) {
                anyhow::bail!("rejected by channel");
            }
            self.mutations.lock().unwrap().push(request.clone());
            Ok(json!({"id": request.target_id, "ok": true}))
        }
    }

    fn bid_action(multiplier: f64, limit: f64) -> StandardAction {
        StandardAction::new(
            ActionKind::IncBid,
            TargetType::Keyword,
            AdjustmentType::Bid,
            AdjustmentPolicy::Multiplier(MultiplierPolicy::new(multiplier, Some(limit)).with_precision(2)),
            StateField::amount("bidAmount"),
        )
        .with_entity_fields("keywordId", "text")
        .with_subject("keyword bid")
    }

    fn selected(ids: &[i64]) -> Report {
        crate::report::tests::keyword_report(ids, &vec![1.0; ids.len()], &vec![1; ids.len()])
    }

    #[tokio::test]
    async fn test_full_pipeline_commits_adjustments() {
        let api = FakeApi::new(&[("1", 1.0), ("2", 1.5)]);
        let context = test_context();
        let result = adjust(&bid_action(1.1, 5.0), &api, &context, &selected(&[1, 2, 1]))
            .await
            .unwrap();

        let rows = &result.action_report.rows;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].adjustment, Some(EntityValue::Amount(1.1)));
        assert_eq!(
            rows[0].log.as_ref().unwrap().action_description,
            "adjusted keyword bid from 1.00 to 1.10"
        );
        assert!(rows[0].log.as_ref().unwrap().consumed_data);
        assert!(rows.iter().all(|row| row.api_response.is_some()));
        assert_eq!(api.mutation_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_targets_become_error_rows() {
        let api = FakeApi::new(&[("1", 1.0)]);
        let result = adjust(&bid_action(1.1, 5.0), &api, &test_context(), &selected(&[1, 9]))
            .await
            .unwrap();

        let errors = result.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].is_none());
        assert_eq!(errors[1], Some(ActionError::missing_target("9")));
        assert!(result.logs()[1].is_none());
    }

    #[tokio::test]
    async fn test_dry_run_never_mutates() {
        let api = FakeApi::new(&[("1", 1.0), ("2", 1.5)]);
        let mut context = test_context();
        context.dry_run = true;
        let result = adjust(&bid_action(1.1, 5.0), &api, &context, &selected(&[1, 2]))
            .await
            .unwrap();

        assert_eq!(api.mutation_count(), 0);
        assert!(result.api_responses().iter().all(Option::is_none));
        assert!(result.logs().iter().all(Option::is_some));
        assert!(result.action_report.rows.iter().all(|row| row.dry_run && row.api_request.is_some()));
    }

    #[tokio::test]
    async fn test_failed_mutation_clears_log_only_for_that_row() {
        let mut api = FakeApi::new(&[("1", 1.0), ("2", 1.5)]);
        api.failing.insert("2".to_string());
        let result = adjust(&bid_action(1.1, 5.0), &api, &test_context(), &selected(&[1, 2]))
            .await
            .unwrap();

        let rows = &result.action_report.rows;
        assert!(rows[0].log.is_some());
        assert!(rows[1].log.is_none());
        match rows[1].error.as_ref() {
            Some(ActionError::Entity { target_id, error, .. }) => {
                assert_eq!(target_id, "2");
                assert_eq!(error, "rejected by channel");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_prevented_rows_log_but_do_not_request() {
        let api = FakeApi::new(&[("1", 2.0)]);
        let action = bid_action(1.5, 10.0).with_preference_rules(vec![PreferenceRule::AttributeCeiling {
            attribute: "campaignBudget".to_string(),
            subject: "keyword bid".to_string(),
        }]);
        let result = adjust(&action, &api, &test_context(), &selected(&[1]))
            .await
            .unwrap();

        let row = &result.action_report.rows[0];
        assert_eq!(row.preference, Preference::PreventAdjustment);
        let log = row.log.as_ref().unwrap();
        assert!(!log.consumed_data);
        assert!(log
            .action_description
            .starts_with("should have adjusted keyword bid from 2.00 to 3.00 but did not due to channel preferences: "));
        assert!(row.api_request.is_none());
        assert_eq!(api.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_override_requests_prevented_rows() {
        let api = FakeApi::new(&[("1", 2.0)]);
        let action = bid_action(1.5, 10.0).with_preference_rules(vec![PreferenceRule::AttributeCeiling {
            attribute: "campaignBudget".to_string(),
            subject: "keyword bid".to_string(),
        }]);
        let mut context = test_context();
        context.safe_mode = false;
        let result = adjust(&action, &api, &context, &selected(&[1])).await.unwrap();

        let row = &result.action_report.rows[0];
        assert!(row.override_preference);
        assert_eq!(row.log.as_ref().unwrap().action_description, "adjusted keyword bid from 2.00 to 3.00");
        assert!(row.api_response.is_some());
    }

    #[tokio::test]
    async fn test_history_is_attached_per_target() {
        let api = FakeApi::new(&[("1", 1.0), ("2", 1.5)]);
        let mut context = test_context();
        let record = action_record("1", context.now);
        let mut dry = action_record("1", context.now);
        dry.dry_run = true;
        context.history = Arc::new(MemoryHistoryStore::with_records(vec![record, dry]));

        let result = adjust(&bid_action(1.1, 5.0), &api, &context, &selected(&[1, 2]))
            .await
            .unwrap();
        assert_eq!(result.action_report.rows[0].history.len(), 1);
        assert!(result.action_report.rows[1].history.is_empty());
    }

    #[tokio::test]
    async fn test_empty_selection_short_circuits() {
        let api = FakeApi::new(&[("1", 1.0)]);
        let empty = selected(&[1]).take(&Default::default()).unwrap();
        let result = adjust(&bid_action(1.1, 5.0), &api, &test_context(), &empty).await.unwrap();
        assert!(result.action_report.is_empty());
    }

    #[test]
    fn test_qualified_descriptions() {
        let mut row = ActionReportRow::new("1", TargetType::Campaign);
        row.add_preference(Preference::ModifyAdjustment, "cap one");
        row.add_preference(Preference::ModifyAdjustment, "cap two");
        assert_eq!(
            qualified_description("adjusted budget", &row, "Snapchat requirements"),
            "moderately adjusted budget using Snapchat requirements: cap one, cap two"
        );
        row.override_preference = true;
        assert_eq!(qualified_description("adjusted budget", &row, "Snapchat requirements"), "adjusted budget");
    }

    #[test]
    fn test_entity_apply_isolates_failures() {
        let mut report = ActionReport::new(vec![
            ActionReportRow::new("1", TargetType::Keyword),
            ActionReportRow::new("2", TargetType::Keyword),
        ]);
        entity_apply(&mut report, |_| true, |row| {
            row.target_name = Some("touched".to_string());
            if row.target_id == "2" {
                anyhow::bail!("boom");
            }
            Ok(())
        });
        assert_eq!(report.rows[0].target_name.as_deref(), Some("touched"));
        assert!(report.rows[1].target_name.is_none());
        assert!(report.rows[1].has_error());
    }
}
