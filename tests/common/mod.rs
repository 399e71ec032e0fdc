#![allow(dead_code)]

use adrule::engine::action::TargetType;
use adrule::engine::channel::{ChannelApi, EntityDetail, MutationRequest, ReportRequest};
use adrule::engine::report::{Report, ReportType};
use anyhow::{bail, Result};
use arrow::array::{Float64Array, Int64Array, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap()
}

pub fn yesterday() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

/// One keyword report row.
pub struct Row {
    pub keyword: i64,
    pub date: DateTime<Utc>,
    pub spend: f64,
    pub impressions: i64,
    pub taps: i64,
    pub installs: i64,
}

pub fn row(keyword: i64, spend: f64, taps: i64, installs: i64) -> Row {
    Row {
        keyword,
        date: yesterday(),
        spend,
        impressions: taps * 10,
        taps,
        installs,
    }
}

pub fn keyword_report(rows: &[Row]) -> Report {
    let schema = Schema::new(vec![
        Field::new("keywordId", DataType::Int64, false),
        Field::new("date", DataType::Timestamp(TimeUnit::Millisecond, None), true),
        Field::new("localSpend", DataType::Float64, true),
        Field::new("impressions", DataType::Int64, true),
        Field::new("taps", DataType::Int64, true),
        Field::new("installs", DataType::Int64, true),
    ]);
    let batch = RecordBatch::try_new(
        Arc::new(schema),
        vec![
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.keyword))),
            Arc::new(TimestampMillisecondArray::from_iter_values(
                rows.iter().map(|r| r.date.timestamp_millis()),
            )),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.spend))),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.impressions))),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.taps))),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.installs))),
        ],
    )
    .unwrap();
    Report::new(batch)
}

/// Apple keyword detail.
pub fn keyword(id: i64, bid: f64, budget: f64) -> EntityDetail {
    json!({
        "id": id,
        "text": format!("keyword {}", id),
        "bidAmount": bid,
        "campaignBudget": budget,
        "status": "ACTIVE",
    })
    .as_object()
    .cloned()
    .unwrap()
}

/// In-memory channel: canned reports and entities, recorded mutations.
#[derive(Default)]
pub struct MockApi {
    pub reports: HashMap<ReportType, Report>,
    pub entities: Vec<EntityDetail>,
    pub failing: HashSet<String>,
    pub mutations: Mutex<Vec<MutationRequest>>,
    pub report_requests: Mutex<Vec<ReportRequest>>,
}

impl MockApi {
    pub fn new(entities: Vec<EntityDetail>) -> Self {
        Self {
            entities,
            ..Self::default()
        }
    }

    pub fn with_report(mut self, report_type: ReportType, report: Report) -> Self {
        self.reports.insert(report_type, report);
        self
    }

    pub fn failing_on(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }

    pub fn mutations(&self) -> Vec<MutationRequest> {
        self.mutations.lock().unwrap().clone()
    }

    pub fn mutated_ids(&self) -> Vec<String> {
        self.mutations().into_iter().map(|m| m.target_id).collect()
    }
}

fn id_of(detail: &EntityDetail) -> Option<String> {
    match detail.get("id")? {
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl ChannelApi for MockApi {
    async fn fetch_report(&self, request: &ReportRequest) -> Result<Report> {
        self.report_requests.lock().unwrap().push(request.clone());
        match self.reports.get(&request.report_type) {
            Some(report) => Ok(report.clone()),
            None => bail!("no {} report", request.report_type),
        }
    }

    async fn fetch_entities(&self, _target_type: TargetType, entity_ids: &[String]) -> Result<Vec<EntityDetail>> {
        Ok(self
            .entities
            .iter()
            .filter(|detail| id_of(detail).map_or(false, |id| entity_ids.contains(&id)))
            .cloned()
            .collect())
    }

    async fn mutate_entity(&self, request: &MutationRequest) -> Result<Value> {
        if self.failing.contains(&request.target_id) {
            bail!("channel rejected change to {}", request.target_id);
        }
        self.mutations.lock().unwrap().push(request.clone());
        Ok(json!({"id": request.target_id, "status": "ok"}))
    }
}
