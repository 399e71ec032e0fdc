//! Derived performance metrics.
//!
//! Every KPI is backed by one or more derived columns appended to the
//! report. A column that already exists is never recomputed, which also
//! lets callers inject pre-aggregated values.

use crate::condition::Operator;
use crate::report::{Report, ReportColumn, RowSet};
use anyhow::Result;
use arrow::array::{Array, ArrayRef, AsArray, Float64Array};
use arrow::compute::kernels::cmp;
use arrow::datatypes::Float64Type;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const TOTAL_SPEND: &str = "totalSpend";
pub const TOTAL_IMPRESSIONS: &str = "totalImpressions";
pub const TOTAL_TAPS: &str = "totalTaps";
pub const TOTAL_CONVERSIONS: &str = "totalConversions";
pub const REAVG_CPT: &str = "reavgCPT";
pub const REAVG_CPA: &str = "reavgCPA";
pub const REAVG_TTR: &str = "reavgTTR";
pub const REAVG_CONVERSION_RATE: &str = "reavgConversionRate";
pub const REAVG_CPM: &str = "reavgCPM";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kpi {
    #[serde(rename = "totalSpend", alias = "spend")]
    Spend,
    #[serde(rename = "totalImpressions", alias = "impressions")]
    Impressions,
    #[serde(rename = "totalTaps", alias = "taps")]
    Taps,
    #[serde(rename = "totalConversions", alias = "conversions")]
    Conversions,
    #[serde(rename = "reavgCPT", alias = "cpt")]
    Cpt,
    #[serde(rename = "reavgCPA", alias = "cpa")]
    Cpa,
    #[serde(rename = "reavgTTR", alias = "ttr")]
    Ttr,
    #[serde(rename = "reavgConversionRate", alias = "conversionRate")]
    ConversionRate,
    #[serde(rename = "reavgCPM", alias = "cpm")]
    Cpm,
}

impl Kpi {
    /// Column the KPI's value is read from.
    pub fn column(&self) -> &'static str {
        match self {
            Self::Spend => TOTAL_SPEND,
            Self::Impressions => TOTAL_IMPRESSIONS,
            Self::Taps => TOTAL_TAPS,
            Self::Conversions => TOTAL_CONVERSIONS,
            Self::Cpt => REAVG_CPT,
            Self::Cpa => REAVG_CPA,
            Self::Ttr => REAVG_TTR,
            Self::ConversionRate => REAVG_CONVERSION_RATE,
            Self::Cpm => REAVG_CPM,
        }
    }

    /// Make sure every column this KPI reads is present.
    pub fn ensure_columns(&self, report: &mut Report, group_by_id: &str) -> Result<()> {
        match self {
            Self::Spend => group_total(report, ReportColumn::LocalSpend, TOTAL_SPEND, group_by_id),
            Self::Impressions => group_total(report, ReportColumn::Impressions, TOTAL_IMPRESSIONS, group_by_id),
            Self::Taps => group_total(report, ReportColumn::Taps, TOTAL_TAPS, group_by_id),
            Self::Conversions => group_total(report, ReportColumn::Installs, TOTAL_CONVERSIONS, group_by_id),
            Self::Cpt => {
                Self::Spend.ensure_columns(report, group_by_id)?;
                Self::Taps.ensure_columns(report, group_by_id)?;
                ratio(report, TOTAL_SPEND, TOTAL_TAPS, 1.0, REAVG_CPT)
            }
            Self::Cpa => {
                Self::Spend.ensure_columns(report, group_by_id)?;
                Self::Conversions.ensure_columns(report, group_by_id)?;
                ratio(report, TOTAL_SPEND, TOTAL_CONVERSIONS, 1.0, REAVG_CPA)
            }
            Self::Ttr => {
                Self::Taps.ensure_columns(report, group_by_id)?;
                Self::Impressions.ensure_columns(report, group_by_id)?;
                ratio(report, TOTAL_TAPS, TOTAL_IMPRESSIONS, 1.0, REAVG_TTR)
            }
            Self::ConversionRate => {
                Self::Conversions.ensure_columns(report, group_by_id)?;
                Self::Taps.ensure_columns(report, group_by_id)?;
                ratio(report, TOTAL_CONVERSIONS, TOTAL_TAPS, 1.0, REAVG_CONVERSION_RATE)
            }
            Self::Cpm => {
                Self::Spend.ensure_columns(report, group_by_id)?;
                Self::Impressions.ensure_columns(report, group_by_id)?;
                ratio(report, TOTAL_SPEND, TOTAL_IMPRESSIONS, 1000.0, REAVG_CPM)
            }
        }
    }

    /// Labels of rows whose KPI value passes `operator value`.
    ///
    /// Under `>` and `>=`, a row with an undefined cost ratio (nothing to
    /// divide by) is judged by its spend instead.
    pub fn selected_index(&self, report: &Report, operator: Operator, value: f64) -> Result<RowSet> {
        let mut selected = compare(report, self.column(), operator, value)?;
        if matches!(self, Self::Cpt | Self::Cpa) && matches!(operator, Operator::Greater | Operator::Geq) {
            let ratios = report.column(self.column())?;
            let spend = compare(report, TOTAL_SPEND, operator, value)?;
            selected.extend(
                report
                    .labels()
                    .iter()
                    .enumerate()
                    .filter(|(i, label)| ratios.is_null(*i) && spend.contains(*label))
                    .map(|(_, label)| *label),
            );
        }
        Ok(selected)
    }
}

impl fmt::Display for Kpi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

fn defined(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

/// Per-row sum of `source` over all rows sharing the row's group id.
fn group_total(report: &mut Report, source: ReportColumn, target: &str, group_by_id: &str) -> Result<()> {
    if report.has_column(target) {
        return Ok(());
    }
    let keys = report.group_keys(group_by_id)?;
    let values = report.f64_values(source.name())?;

    let mut totals: HashMap<&str, f64> = HashMap::new();
    for (key, value) in keys.iter().zip(&values) {
        if let Some(key) = key {
            *totals.entry(key.as_str()).or_insert(0.0) += value.unwrap_or(0.0);
        }
    }
    let column: Float64Array = keys
        .iter()
        .map(|key| key.as_deref().and_then(|k| totals.get(k).copied()))
        .collect();
    report.set_column(target, Arc::new(column))
}

/// `numerator / (denominator / scale)`, undefined wherever that is not finite.
fn ratio(report: &mut Report, numerator: &str, denominator: &str, scale: f64, target: &str) -> Result<()> {
    if report.has_column(target) {
        return Ok(());
    }
    let numerators = report.f64_values(numerator)?;
    let denominators = report.f64_values(denominator)?;
    let column: Float64Array = numerators
        .into_iter()
        .zip(denominators)
        .map(|pair| match pair {
            (Some(n), Some(d)) => defined(n / (d / scale)),
            _ => None,
        })
        .collect();
    report.set_column(target, Arc::new(column) as ArrayRef)
}

fn compare(report: &Report, column: &str, operator: Operator, value: f64) -> Result<RowSet> {
    let values = arrow::compute::cast(report.column(column)?, &arrow::datatypes::DataType::Float64)?;
    let values = values.as_primitive::<Float64Type>();
    let threshold = Float64Array::new_scalar(value);
    let mask = match operator {
        Operator::Less => cmp::lt(values, &threshold)?,
        Operator::Greater => cmp::gt(values, &threshold)?,
        Operator::Leq => cmp::lt_eq(values, &threshold)?,
        Operator::Geq => cmp::gt_eq(values, &threshold)?,
        Operator::Equal => cmp::eq(values, &threshold)?,
    };
    // NaN sorts above every number in Arrow's float ordering; treat it as
    // undefined like a null.
    Ok(report
        .labels()
        .iter()
        .enumerate()
        .filter(|(i, _)| mask.is_valid(*i) && mask.value(*i) && !values.value(*i).is_nan())
        .map(|(_, label)| *label)
        .collect())
}
