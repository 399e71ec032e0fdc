mod common;

use adrule::channels::AppleSearchAds;
use adrule::engine::action::{adjust, ActionKind, EntityValue, Preference};
use adrule::engine::channel::Channel;
use adrule::engine::context::{RuleContext, RuleOptions};
use adrule::engine::error::ActionError;
use adrule::engine::history::MemoryHistoryStore;
use adrule::engine::report::Report;
use adrule::engine::{Condition, ConditionGroup, GroupOperator, Kpi, Operator};
use common::{keyword, keyword_report, now, row, MockApi};
use serde_json::json;
use std::sync::Arc;

fn context() -> RuleContext {
    RuleContext {
        rule_id: "raise_cheap".to_string(),
        user_id: "u1".to_string(),
        channel: "apple_search_ads".to_string(),
        channel_title: "Apple Search Ads".to_string(),
        org_id: "1".to_string(),
        campaign_id: Some("100".to_string()),
        ad_group_id: None,
        rule_description: "Apple Search Ads (1) → Brand → All | raise cheap".to_string(),
        safe_mode: true,
        dry_run: false,
        now: now(),
        options: RuleOptions::default(),
        history: Arc::new(MemoryHistoryStore::new()),
    }
}

/// Keywords 1 and 3 tap for 0.50, keyword 2 for 3.00.
fn cheap_keywords() -> Report {
    let mut report = keyword_report(&[row(1, 10.0, 20, 2), row(2, 30.0, 10, 1), row(3, 4.0, 8, 0)]);
    ConditionGroup::new(GroupOperator::All)
        .with_condition(Condition::new(Kpi::Cpt, Operator::Less, 1.0))
        .filter_data(&mut report, "keywordId")
        .unwrap();
    report
}

#[tokio::test]
async fn test_cheap_keywords_get_raised() {
    let api = Arc::new(MockApi::new(vec![
        keyword(1, 1.0, 100.0),
        keyword(2, 5.0, 100.0),
        keyword(3, 2.0, 100.0),
    ]));
    let channel = AppleSearchAds::new(api.clone());
    let action = channel.build_action(ActionKind::IncBid, 10.0, None).unwrap();

    let selected = cheap_keywords();
    assert_eq!(selected.group_keys("keywordId").unwrap(), vec![Some("1".to_string()), Some("3".to_string())]);

    let result = adjust(action.as_ref(), api.as_ref(), &context(), &selected).await.unwrap();
    let rows = &result.action_report.rows;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].adjustment, Some(EntityValue::Amount(1.1)));
    assert_eq!(rows[1].adjustment, Some(EntityValue::Amount(2.2)));
    assert_eq!(rows[1].target_name.as_deref(), Some("keyword 3"));

    let log = rows[0].log.as_ref().unwrap();
    assert_eq!(log.action_description, "adjusted keyword bid from 1.00 to 1.10");
    assert_eq!(log.target_channel, "apple_search_ads");
    assert!(log.consumed_data);

    assert_eq!(api.mutated_ids(), vec!["1", "3"]);
    assert_eq!(api.mutations()[0].changes.get("bidAmount"), Some(&json!(1.1)));
    assert!(result.errors().iter().all(Option::is_none));
}

#[tokio::test]
async fn test_failed_mutation_only_affects_its_row() {
    let api = Arc::new(MockApi::new(vec![keyword(1, 1.0, 100.0), keyword(3, 2.0, 100.0)]).failing_on("3"));
    let channel = AppleSearchAds::new(api.clone());
    let action = channel.build_action(ActionKind::IncBid, 10.0, None).unwrap();

    let result = adjust(action.as_ref(), api.as_ref(), &context(), &cheap_keywords()).await.unwrap();

    assert_eq!(api.mutated_ids(), vec!["1"]);
    let logs = result.logs();
    assert!(logs[0].is_some());
    assert!(logs[1].is_none());
    match &result.errors()[1] {
        Some(ActionError::Entity { target_id, error, .. }) => {
            assert_eq!(target_id, "3");
            assert_eq!(error, "channel rejected change to 3");
        }
        other => panic!("expected an entity error, got {:?}", other),
    }
    assert!(result.api_responses()[0].is_some());
}

#[tokio::test]
async fn test_missing_target_is_recorded() {
    let api = Arc::new(MockApi::new(vec![keyword(1, 1.0, 100.0)]));
    let channel = AppleSearchAds::new(api.clone());
    let action = channel.build_action(ActionKind::IncBid, 10.0, None).unwrap();

    let result = adjust(action.as_ref(), api.as_ref(), &context(), &cheap_keywords()).await.unwrap();

    assert_eq!(result.action_report.len(), 2);
    assert_eq!(result.errors()[1], Some(ActionError::missing_target("3")));
    assert!(result.logs()[1].is_none());
    assert_eq!(api.mutated_ids(), vec!["1"]);
}

#[tokio::test]
async fn test_dry_run_logs_without_mutating() {
    let api = Arc::new(MockApi::new(vec![keyword(1, 1.0, 100.0), keyword(3, 2.0, 100.0)]));
    let channel = AppleSearchAds::new(api.clone());
    let action = channel.build_action(ActionKind::PauseKeyword, 0.0, None).unwrap();
    let mut ctx = context();
    ctx.dry_run = true;

    let result = adjust(action.as_ref(), api.as_ref(), &ctx, &cheap_keywords()).await.unwrap();

    assert!(result.dry_run);
    assert!(api.mutations().is_empty());
    assert!(result.api_responses().iter().all(Option::is_none));
    let logs: Vec<_> = result.logs().into_iter().flatten().collect();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].action_description, "paused keyword");
    assert_eq!(logs[0].adjustment_to, Some(EntityValue::Status("PAUSED".to_string())));
    assert!(result.action_report.rows.iter().all(|row| row.dry_run));
}

#[tokio::test]
async fn test_unsafe_rule_overrides_budget_ceiling() {
    let api = Arc::new(MockApi::new(vec![keyword(1, 9.0, 10.0)]));
    let channel = AppleSearchAds::new(api.clone());
    let action = channel.build_action(ActionKind::IncBid, 20.0, None).unwrap();
    let selected = keyword_report(&[row(1, 10.0, 20, 2)]);

    let safe = adjust(action.as_ref(), api.as_ref(), &context(), &selected).await.unwrap();
    let row = &safe.action_report.rows[0];
    assert_eq!(row.preference, Preference::ModifyAdjustment);
    assert_eq!(row.adjustment, Some(EntityValue::Amount(10.0)));

    let mut ctx = context();
    ctx.safe_mode = false;
    let unsafe_result = adjust(action.as_ref(), api.as_ref(), &ctx, &selected).await.unwrap();
    let row = &unsafe_result.action_report.rows[0];
    assert!(row.override_preference);
    assert_eq!(row.preference, Preference::ModifyAdjustment);
    assert_eq!(row.adjustment, Some(EntityValue::Amount(10.8)));
    assert_eq!(row.preferred_adjustment, Some(EntityValue::Amount(10.0)));
    assert_eq!(
        row.log.as_ref().unwrap().action_description,
        "adjusted keyword bid from 9.00 to 10.80"
    );

    let mutations = api.mutations();
    assert_eq!(mutations.len(), 2);
    assert_eq!(mutations[0].changes.get("bidAmount"), Some(&json!(10.0)));
    assert_eq!(mutations[1].changes.get("bidAmount"), Some(&json!(10.8)));
}

#[tokio::test]
async fn test_serialized_result_shape() {
    let api = Arc::new(MockApi::new(vec![keyword(1, 1.0, 100.0), keyword(3, 2.0, 100.0)]));
    let channel = AppleSearchAds::new(api.clone());
    let action = channel.build_action(ActionKind::NoAction, 0.0, None).unwrap();

    let result = adjust(action.as_ref(), api.as_ref(), &context(), &cheap_keywords()).await.unwrap();
    let value = result.serialize().unwrap();

    assert_eq!(value["dryRun"], json!(false));
    assert!(value["report"].as_str().unwrap().starts_with("keywordId,date,localSpend"));
    assert!(!value["action_report"].as_str().unwrap().is_empty());
    assert_eq!(value["logs"].as_array().unwrap().len(), 2);
    assert_eq!(value["logs"][0]["actionDescription"], json!("took no action"));
    assert_eq!(value["errors"], json!([null, null]));
    assert!(api.mutations().is_empty());
}
