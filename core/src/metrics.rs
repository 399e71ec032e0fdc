use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

// Cumulative latency histogram
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>, // (upper_bound, count)
    overflow: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        let bounds = [0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0];
        Self {
            buckets: bounds.into_iter().map(|b| (b, AtomicU64::new(0))).collect(),
            overflow: AtomicU64::new(0),
        }
    }

    fn record(&self, value: f64) {
        for (bound, count) in &self.buckets {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.overflow.fetch_add(1, Ordering::Relaxed);
    }

    fn to_prometheus(&self, name: &str, labels: &str) -> String {
        let mut output = String::new();
        let mut cumulative = 0;
        for (bound, count) in &self.buckets {
            cumulative += count.load(Ordering::Relaxed);
            output.push_str(&format!("{}_bucket{{le=\"{}\",{}}} {}\n", name, bound, labels, cumulative));
        }
        cumulative += self.overflow.load(Ordering::Relaxed);
        output.push_str(&format!("{}_bucket{{le=\"+Inf\",{}}} {}\n", name, labels, cumulative));
        output
    }
}

pub struct EngineMetrics {
    pub rules_executed: AtomicU64,
    pub tasks_executed: AtomicU64,
    pub rows_selected: AtomicU64,
    pub actions_logged: AtomicU64,
    pub mutations_committed: AtomicU64,
    pub entity_errors: AtomicU64,
    pub missing_targets: AtomicU64,
    pub dry_run_actions: AtomicU64,
    pub rule_executions: Mutex<HashMap<String, u64>>,
    pub rule_duration: Mutex<HashMap<String, Histogram>>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            rules_executed: AtomicU64::new(0),
            tasks_executed: AtomicU64::new(0),
            rows_selected: AtomicU64::new(0),
            actions_logged: AtomicU64::new(0),
            mutations_committed: AtomicU64::new(0),
            entity_errors: AtomicU64::new(0),
            missing_targets: AtomicU64::new(0),
            dry_run_actions: AtomicU64::new(0),
            rule_executions: Mutex::new(HashMap::new()),
            rule_duration: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_rule(&self, rule_id: &str, duration_secs: f64) {
        self.rules_executed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut map) = self.rule_executions.lock() {
            *map.entry(rule_id.to_string()).or_insert(0) += 1;
        }
        if let Ok(mut map) = self.rule_duration.lock() {
            map.entry(rule_id.to_string())
                .or_insert_with(Histogram::new)
                .record(duration_secs);
        }
    }

    pub fn record_task(&self, selected_rows: usize) {
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
        self.rows_selected.fetch_add(selected_rows as u64, Ordering::Relaxed);
    }

    pub fn record_actions_logged(&self, count: u64) {
        self.actions_logged.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_mutation(&self) {
        self.mutations_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_entity_error(&self) {
        self.entity_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_missing_target(&self) {
        self.missing_targets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dry_run_actions(&self, count: u64) {
        self.dry_run_actions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rules_executed: self.rules_executed.load(Ordering::Relaxed),
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            rows_selected: self.rows_selected.load(Ordering::Relaxed),
            actions_logged: self.actions_logged.load(Ordering::Relaxed),
            mutations_committed: self.mutations_committed.load(Ordering::Relaxed),
            entity_errors: self.entity_errors.load(Ordering::Relaxed),
            missing_targets: self.missing_targets.load(Ordering::Relaxed),
            dry_run_actions: self.dry_run_actions.load(Ordering::Relaxed),
            rule_executions: self
                .rule_executions
                .lock()
                .map(|map| map.clone())
                .unwrap_or_default(),
        }
    }

    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let counters = [
            ("adrule_rules_executed_total", "Total number of rule executions.", snapshot.rules_executed),
            ("adrule_tasks_executed_total", "Total number of rule tasks run.", snapshot.tasks_executed),
            ("adrule_rows_selected_total", "Report rows selected by task conditions.", snapshot.rows_selected),
            ("adrule_actions_logged_total", "Action log entries produced.", snapshot.actions_logged),
            ("adrule_mutations_committed_total", "Entity mutations accepted by a channel.", snapshot.mutations_committed),
            ("adrule_entity_errors_total", "Row-scoped entity errors.", snapshot.entity_errors),
            ("adrule_missing_targets_total", "Requested entities the channel did not return.", snapshot.missing_targets),
            ("adrule_dry_run_actions_total", "Actions logged without being committed.", snapshot.dry_run_actions),
        ];
        let mut output = String::new();
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {} {}\n# TYPE {} counter\n{} {}\n", name, help, name, name, value));
        }

        output.push_str("# HELP adrule_rule_executions_total Executions per rule.\n");
        output.push_str("# TYPE adrule_rule_executions_total counter\n");
        for (rule_id, count) in &snapshot.rule_executions {
            output.push_str(&format!(
                "adrule_rule_executions_total{{rule_id=\"{}\"}} {}\n",
                rule_id, count
            ));
        }

        if let Ok(durations) = self.rule_duration.lock() {
            output.push_str("# HELP adrule_rule_duration_seconds Rule execution duration.\n");
            output.push_str("# TYPE adrule_rule_duration_seconds histogram\n");
            for (rule_id, hist) in durations.iter() {
                output.push_str(&hist.to_prometheus(
                    "adrule_rule_duration_seconds",
                    &format!("rule_id=\"{}\"", rule_id),
                ));
            }
        }
        output
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub rules_executed: u64,
    pub tasks_executed: u64,
    pub rows_selected: u64,
    pub actions_logged: u64,
    pub mutations_committed: u64,
    pub entity_errors: u64,
    pub missing_targets: u64,
    pub dry_run_actions: u64,
    pub rule_executions: HashMap<String, u64>,
}

lazy_static::lazy_static! {
    pub static ref METRICS: EngineMetrics = EngineMetrics::new();
}
