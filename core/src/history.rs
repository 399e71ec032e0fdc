//! Append-only history and monitor sinks.

use crate::action::{AdjustmentType, EntityValue, TargetType};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryType {
    Action,
    Error,
    Execute,
}

/// One persisted history document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub history_type: HistoryType,
    #[serde(rename = "targetID")]
    pub target_id: String,
    pub target_type: Option<TargetType>,
    pub target_channel: Option<String>,
    pub adjustment_type: Option<AdjustmentType>,
    pub adjustment_from: Option<EntityValue>,
    pub adjustment_to: Option<EntityValue>,
    pub target_description: Option<String>,
    pub action_description: String,
    #[serde(default)]
    pub consumed_data: bool,
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "ruleID")]
    pub rule_id: String,
    pub history_creation_date: DateTime<Utc>,
    pub rule_description: String,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_data_checked_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_descriptions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_count: Option<usize>,
}

/// Filter over history records. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub user_id: Option<String>,
    pub rule_id: Option<String>,
    pub target_channel: Option<String>,
    pub target_type: Option<TargetType>,
    pub target_ids: Option<Vec<String>>,
    pub history_type: Option<HistoryType>,
    pub consumed_data: Option<bool>,
    pub dry_run: Option<bool>,
}

impl HistoryQuery {
    pub fn matches(&self, record: &HistoryRecord) -> bool {
        self.user_id.as_ref().map_or(true, |v| *v == record.user_id)
            && self.rule_id.as_ref().map_or(true, |v| *v == record.rule_id)
            && self
                .target_channel
                .as_ref()
                .map_or(true, |v| record.target_channel.as_ref() == Some(v))
            && self
                .target_type
                .map_or(true, |v| record.target_type == Some(v))
            && self
                .target_ids
                .as_ref()
                .map_or(true, |ids| ids.contains(&record.target_id))
            && self
                .history_type
                .map_or(true, |v| v == record.history_type)
            && self
                .consumed_data
                .map_or(true, |v| v == record.consumed_data)
            && self.dry_run.map_or(true, |v| v == record.dry_run)
    }
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn insert_many(&self, records: Vec<HistoryRecord>) -> Result<()>;
    /// Matching records ordered by creation date, oldest first.
    async fn find(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>>;
}

/// Latest `lastDataCheckedDate` per target among records matching `query`.
pub async fn latest_checked_dates(
    store: &dyn HistoryStore,
    query: &HistoryQuery,
) -> Result<HashMap<String, DateTime<Utc>>> {
    let mut latest: HashMap<String, DateTime<Utc>> = HashMap::new();
    for record in store.find(query).await? {
        if let Some(checked) = record.last_data_checked_date {
            latest
                .entry(record.target_id)
                .and_modify(|current| *current = (*current).max(checked))
                .or_insert(checked);
        }
    }
    Ok(latest)
}

/// One task as captured by a monitored run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorTask {
    pub report: String,
    pub source_report: String,
    pub action_report: serde_json::Value,
    pub api_response: Vec<Option<serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    #[serde(rename = "ruleID")]
    pub rule_id: String,
    pub log_creation_date: DateTime<Utc>,
    pub rule_description: String,
    pub tasks: Vec<MonitorTask>,
}

#[async_trait]
pub trait MonitorStore: Send + Sync {
    async fn insert(&self, snapshot: MonitorSnapshot) -> Result<()>;
}

/// In-process history log, useful for tests and single-shot runs.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    records: Mutex<Vec<HistoryRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<HistoryRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn insert_many(&self, records: Vec<HistoryRecord>) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| anyhow::anyhow!("history store lock poisoned"))?
            .extend(records);
        Ok(())
    }

    async fn find(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>> {
        let mut matched: Vec<HistoryRecord> = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("history store lock poisoned"))?
            .iter()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();
        matched.sort_by_key(|record| record.history_creation_date);
        Ok(matched)
    }
}

#[derive(Debug, Default)]
pub struct MemoryMonitorStore {
    snapshots: Mutex<Vec<MonitorSnapshot>>,
}

impl MemoryMonitorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshots(&self) -> Vec<MonitorSnapshot> {
        self.snapshots
            .lock()
            .map(|snapshots| snapshots.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MonitorStore for MemoryMonitorStore {
    async fn insert(&self, snapshot: MonitorSnapshot) -> Result<()> {
        self.snapshots
            .lock()
            .map_err(|_| anyhow::anyhow!("monitor store lock poisoned"))?
            .push(snapshot);
        Ok(())
    }
}
