//! Boolean row selection over KPIs.
//!
//! A [`ConditionGroup`] is an arena of group nodes. Each node holds its own
//! conditions plus the ids of its child groups, and evaluation walks the
//! arena from the root. Every condition after the first only sees rows
//! whose fate is still open: the running selection for `All`, the rows not
//! yet selected for `Any`.

use crate::kpi::Kpi;
use crate::report::{Report, RowSet};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "less", alias = "<")]
    Less,
    #[serde(rename = "greater", alias = ">")]
    Greater,
    #[serde(rename = "leq", alias = "<=")]
    Leq,
    #[serde(rename = "geq", alias = ">=")]
    Geq,
    #[serde(rename = "equal", alias = "==")]
    Equal,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Less => "<",
            Self::Greater => ">",
            Self::Leq => "<=",
            Self::Geq => ">=",
            Self::Equal => "==",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub metric: Kpi,
    pub operator: Operator,
    pub value: f64,
}

impl Condition {
    pub fn new(metric: Kpi, operator: Operator, value: f64) -> Self {
        Self {
            metric,
            operator,
            value,
        }
    }

    pub fn select(&self, report: &mut Report, group_by_id: &str) -> Result<RowSet> {
        self.metric.ensure_columns(report, group_by_id)?;
        self.metric.selected_index(report, self.operator, self.value)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.metric, self.operator, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupOperator {
    All,
    Any,
}

impl GroupOperator {
    fn initial(&self, report: &Report) -> RowSet {
        match self {
            Self::All => report.label_set(),
            Self::Any => RowSet::new(),
        }
    }

    fn combine(&self, running: &RowSet, selected: &RowSet) -> RowSet {
        match self {
            Self::All => running.intersection(selected).copied().collect(),
            Self::Any => running.union(selected).copied().collect(),
        }
    }

    /// Rows of `report` whose membership is not yet settled.
    fn undetermined(&self, report: &Report, running: &RowSet) -> Result<Report> {
        match self {
            Self::All => report.take(running),
            Self::Any => report.exclude(running),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(usize);

#[derive(Debug, Clone, PartialEq)]
struct GroupNode {
    operator: GroupOperator,
    conditions: Vec<Condition>,
    children: Vec<GroupId>,
}

/// A tree of condition groups stored as an arena.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionGroup {
    nodes: Vec<GroupNode>,
}

impl ConditionGroup {
    pub fn new(operator: GroupOperator) -> Self {
        Self {
            nodes: vec![GroupNode {
                operator,
                conditions: Vec::new(),
                children: Vec::new(),
            }],
        }
    }

    pub fn root(&self) -> GroupId {
        GroupId(0)
    }

    pub fn add_condition(&mut self, group: GroupId, condition: Condition) -> &mut Self {
        self.nodes[group.0].conditions.push(condition);
        self
    }

    pub fn add_group(&mut self, parent: GroupId, operator: GroupOperator) -> GroupId {
        let id = GroupId(self.nodes.len());
        self.nodes.push(GroupNode {
            operator,
            conditions: Vec::new(),
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Builder shorthand for a root-level condition.
    pub fn with_condition(mut self, condition: Condition) -> Self {
        let root = self.root();
        self.add_condition(root, condition);
        self
    }

    pub fn from_definition(definition: &ConditionGroupDefinition) -> Self {
        let mut group = Self::new(definition.operator);
        let mut stack = vec![(group.root(), definition)];
        while let Some((id, def)) = stack.pop() {
            for condition in &def.conditions {
                group.add_condition(id, condition.clone());
            }
            // Children are allocated in declaration order before descending so
            // evaluation order matches the definition.
            let children: Vec<_> = def
                .subgroups
                .iter()
                .map(|sub| (group.add_group(id, sub.operator), sub))
                .collect();
            stack.extend(children.into_iter().rev());
        }
        group
    }

    pub fn conditions(&self, group: GroupId) -> &[Condition] {
        &self.nodes[group.0].conditions
    }

    pub fn children(&self, group: GroupId) -> &[GroupId] {
        &self.nodes[group.0].children
    }

    /// All KPIs referenced anywhere in the tree.
    pub fn metrics(&self) -> Vec<Kpi> {
        let mut metrics = Vec::new();
        for node in &self.nodes {
            for condition in &node.conditions {
                if !metrics.contains(&condition.metric) {
                    metrics.push(condition.metric);
                }
            }
        }
        metrics
    }

    pub fn select(&self, report: &mut Report, group_by_id: &str) -> Result<RowSet> {
        self.select_group(self.root(), report, group_by_id)
    }

    fn select_group(&self, id: GroupId, report: &mut Report, group_by_id: &str) -> Result<RowSet> {
        let node = &self.nodes[id.0];
        let operator = node.operator;

        let mut index = operator.initial(report);
        let mut undetermined: Option<Report> = None;
        for condition in &node.conditions {
            let selected = match undetermined.as_mut() {
                Some(remaining) => condition.select(remaining, group_by_id)?,
                None => condition.select(report, group_by_id)?,
            };
            index = operator.combine(&index, &selected);
            undetermined = Some(operator.undetermined(report, &index)?);
        }

        let mut remaining = operator.undetermined(report, &index)?;
        for &child in &node.children {
            let selected = self.select_group(child, &mut remaining, group_by_id)?;
            index = operator.combine(&index, &selected);
            remaining = operator.undetermined(&remaining, &index)?;
        }
        Ok(index)
    }

    /// Drop every row the group does not select.
    pub fn filter_data(&self, report: &mut Report, group_by_id: &str) -> Result<()> {
        if report.is_empty() {
            return Ok(());
        }
        let selected = self.select(report, group_by_id)?;
        report.retain(&selected)
    }
}

/// Nested form of a condition group, as written in rule files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroupDefinition {
    pub operator: GroupOperator,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub subgroups: Vec<ConditionGroupDefinition>,
}
