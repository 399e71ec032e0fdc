//! Append-only sled stores.
//!
//! Keys are the zero-padded creation time in nanoseconds followed by a
//! random id, so iterating a tree yields documents oldest first.

use adrule_core::history::{HistoryQuery, HistoryRecord, HistoryStore, MonitorSnapshot, MonitorStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::{Db, Tree};
use std::path::Path;
use tracing::{debug, error};
use uuid::Uuid;

const HISTORY_TREE: &str = "history";
const MONITOR_TREE: &str = "monitor";

fn document_key(created: DateTime<Utc>) -> String {
    format!(
        "{:020}_{}",
        created.timestamp_nanos_opt().unwrap_or(0).max(0),
        Uuid::new_v4()
    )
}

fn open_tree<P: AsRef<Path>>(path: P, name: &str) -> Result<(Db, Tree)> {
    let db = sled::open(path.as_ref())
        .with_context(|| format!("opening sled database at {}", path.as_ref().display()))?;
    let tree = db.open_tree(name)?;
    Ok((db, tree))
}

pub struct SledHistoryStore {
    db: Db,
    tree: Tree,
}

impl SledHistoryStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let (db, tree) = open_tree(path, HISTORY_TREE)?;
        Ok(Self { db, tree })
    }

    /// Share an already open database.
    pub fn from_db(db: Db) -> Result<Self> {
        let tree = db.open_tree(HISTORY_TREE)?;
        Ok(Self { db, tree })
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// The most recent `limit` records of one rule, newest first.
    pub fn recent_for_rule(&self, rule_id: &str, limit: usize) -> Result<Vec<HistoryRecord>> {
        let mut records = Vec::new();
        for item in self.tree.iter().rev() {
            if records.len() >= limit {
                break;
            }
            let (_key, value) = item?;
            match serde_json::from_slice::<HistoryRecord>(&value) {
                Ok(record) if record.rule_id == rule_id => records.push(record),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Failed to deserialize history record"),
            }
        }
        Ok(records)
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for SledHistoryStore {
    async fn insert_many(&self, records: Vec<HistoryRecord>) -> Result<()> {
        let count = records.len();
        let mut batch = sled::Batch::default();
        for record in &records {
            let key = document_key(record.history_creation_date);
            batch.insert(key.as_bytes(), serde_json::to_vec(record)?);
        }
        self.tree.apply_batch(batch)?;
        debug!(records = count, "History records stored");
        Ok(())
    }

    async fn find(&self, query: &HistoryQuery) -> Result<Vec<HistoryRecord>> {
        let mut records = Vec::new();
        for item in self.tree.iter() {
            let (_key, value) = item?;
            match serde_json::from_slice::<HistoryRecord>(&value) {
                Ok(record) if query.matches(&record) => records.push(record),
                Ok(_) => {}
                Err(e) => error!(error = %e, "Failed to deserialize history record"),
            }
        }
        Ok(records)
    }
}

pub struct SledMonitorStore {
    tree: Tree,
}

impl SledMonitorStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let (_db, tree) = open_tree(path, MONITOR_TREE)?;
        Ok(Self { tree })
    }

    pub fn from_db(db: &Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(MONITOR_TREE)?,
        })
    }

    /// Snapshots of one rule, oldest first.
    pub fn snapshots_for_rule(&self, rule_id: &str) -> Result<Vec<MonitorSnapshot>> {
        let mut snapshots = Vec::new();
        for item in self.tree.iter() {
            let (_key, value) = item?;
            let snapshot: MonitorSnapshot = serde_json::from_slice(&value)?;
            if snapshot.rule_id == rule_id {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }
}

#[async_trait]
impl MonitorStore for SledMonitorStore {
    async fn insert(&self, snapshot: MonitorSnapshot) -> Result<()> {
        let key = document_key(snapshot.log_creation_date);
        self.tree.insert(key.as_bytes(), serde_json::to_vec(&snapshot)?)?;
        debug!(rule_id = %snapshot.rule_id, tasks = snapshot.tasks.len(), "Monitor snapshot stored");
        Ok(())
    }
}
