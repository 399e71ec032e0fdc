//! Labelled tabular performance data.
//!
//! A [`Report`] wraps an Arrow [`RecordBatch`] and pairs every row with a
//! stable label. Selections are sets of labels, so a row keeps its identity
//! while the report is narrowed, split between tasks, or re-assembled.

use crate::action::TargetType;
use crate::error::RuleError;
use anyhow::{Context, Result};
use arrow::array::{new_null_array, Array, ArrayRef, AsArray, BooleanArray, Float64Array, UInt32Array};
use arrow::compute::{cast, concat_batches, take_record_batch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit, TimestampMillisecondType};
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// A set of row labels.
pub type RowSet = BTreeSet<usize>;

/// Canonical raw report columns every reporter maps its channel fields onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportColumn {
    CampaignId,
    AdGroupId,
    KeywordId,
    Date,
    LocalSpend,
    Impressions,
    Taps,
    Installs,
    AvgCpt,
    AvgCpa,
}

impl ReportColumn {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CampaignId => "campaignId",
            Self::AdGroupId => "adGroupId",
            Self::KeywordId => "keywordId",
            Self::Date => "date",
            Self::LocalSpend => "localSpend",
            Self::Impressions => "impressions",
            Self::Taps => "taps",
            Self::Installs => "installs",
            Self::AvgCpt => "avgCPT",
            Self::AvgCpa => "avgCPA",
        }
    }
}

impl fmt::Display for ReportColumn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The entity level a report is aggregated at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportType {
    Keyword,
    Adgroup,
    Searchterm,
    Campaign,
}

impl ReportType {
    /// Column rows are grouped by when deriving KPIs for this report.
    pub fn group_by_id(&self) -> ReportColumn {
        match self {
            Self::Keyword => ReportColumn::KeywordId,
            Self::Adgroup | Self::Searchterm => ReportColumn::AdGroupId,
            Self::Campaign => ReportColumn::CampaignId,
        }
    }

    /// Entity type history entries are keyed by for this report.
    pub fn target_type(&self) -> TargetType {
        match self {
            Self::Keyword => TargetType::Keyword,
            Self::Adgroup | Self::Searchterm => TargetType::Adgroup,
            Self::Campaign => TargetType::Campaign,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Adgroup => "adgroup",
            Self::Searchterm => "searchterm",
            Self::Campaign => "campaign",
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time bucket of report rows, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Granularity {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl Granularity {
    pub const ALL: [Granularity; 4] = [Self::Hourly, Self::Daily, Self::Weekly, Self::Monthly];
}

/// Performance rows with stable labels.
#[derive(Debug, Clone)]
pub struct Report {
    batch: RecordBatch,
    labels: Vec<usize>,
}

impl Report {
    pub fn new(batch: RecordBatch) -> Self {
        let labels = (0..batch.num_rows()).collect();
        Self { batch, labels }
    }

    pub fn with_labels(batch: RecordBatch, labels: Vec<usize>) -> Result<Self> {
        anyhow::ensure!(
            batch.num_rows() == labels.len(),
            "report has {} rows but {} labels",
            batch.num_rows(),
            labels.len()
        );
        Ok(Self { batch, labels })
    }

    pub fn empty(schema: SchemaRef) -> Self {
        Self::new(RecordBatch::new_empty(schema))
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn label_set(&self) -> RowSet {
        self.labels.iter().copied().collect()
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.batch.schema().index_of(name).is_ok()
    }

    pub fn column(&self, name: &str) -> Result<&ArrayRef> {
        self.batch
            .column_by_name(name)
            .ok_or_else(|| RuleError::MissingColumn(name.to_string()).into())
    }

    /// Numeric values of a column, casting integer counters to floats.
    pub fn f64_values(&self, name: &str) -> Result<Vec<Option<f64>>> {
        let column = cast(self.column(name)?, &DataType::Float64)
            .with_context(|| format!("column `{}` is not numeric", name))?;
        Ok(column.as_primitive::<arrow::datatypes::Float64Type>().iter().collect())
    }

    /// Values of a column rendered as grouping keys.
    pub fn group_keys(&self, name: &str) -> Result<Vec<Option<String>>> {
        let column = self.column(name)?;
        (0..column.len())
            .map(|i| {
                if column.is_null(i) {
                    Ok(None)
                } else {
                    Ok(Some(array_value_to_string(column, i)?))
                }
            })
            .collect()
    }

    /// Timestamps of a column, normalised to UTC.
    pub fn timestamps(&self, name: &str) -> Result<Vec<Option<DateTime<Utc>>>> {
        let column = cast(
            self.column(name)?,
            &DataType::Timestamp(TimeUnit::Millisecond, None),
        )
        .with_context(|| format!("column `{}` is not a timestamp", name))?;
        Ok(column
            .as_primitive::<TimestampMillisecondType>()
            .iter()
            .map(|v| v.and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
            .collect())
    }

    pub fn max_timestamp(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.timestamps(name)?.into_iter().flatten().max())
    }

    /// Append a column, or replace it when one with the same name exists.
    pub fn set_column(&mut self, name: &str, values: ArrayRef) -> Result<()> {
        anyhow::ensure!(
            values.len() == self.num_rows(),
            "column `{}` has {} values for {} rows",
            name,
            values.len(),
            self.num_rows()
        );
        let schema = self.batch.schema();
        let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
        let mut columns = self.batch.columns().to_vec();
        let field = Field::new(name, values.data_type().clone(), true);
        match schema.index_of(name) {
            Ok(i) => {
                fields[i] = field;
                columns[i] = values;
            }
            Err(_) => {
                fields.push(field);
                columns.push(values);
            }
        }
        self.batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?;
        Ok(())
    }

    /// Rows whose label is in `labels`, in report order.
    pub fn take(&self, labels: &RowSet) -> Result<Report> {
        let positions: Vec<usize> = self
            .labels
            .iter()
            .enumerate()
            .filter(|(_, label)| labels.contains(*label))
            .map(|(i, _)| i)
            .collect();
        self.take_positions(&positions)
    }

    /// Rows whose label is not in `labels`.
    pub fn exclude(&self, labels: &RowSet) -> Result<Report> {
        let positions: Vec<usize> = self
            .labels
            .iter()
            .enumerate()
            .filter(|(_, label)| !labels.contains(*label))
            .map(|(i, _)| i)
            .collect();
        self.take_positions(&positions)
    }

    pub fn retain(&mut self, labels: &RowSet) -> Result<()> {
        *self = self.take(labels)?;
        Ok(())
    }

    pub fn drop_rows(&mut self, labels: &RowSet) -> Result<()> {
        *self = self.exclude(labels)?;
        Ok(())
    }

    /// Keep rows where `mask` is true; a null mask entry drops the row.
    pub fn retain_mask(&mut self, mask: &BooleanArray) -> Result<()> {
        let positions: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter(|(_, keep)| *keep == Some(true))
            .map(|(i, _)| i)
            .collect();
        *self = self.take_positions(&positions)?;
        Ok(())
    }

    fn take_positions(&self, positions: &[usize]) -> Result<Report> {
        let indices = UInt32Array::from_iter_values(positions.iter().map(|&p| p as u32));
        let batch = take_record_batch(&self.batch, &indices)?;
        let labels = positions.iter().map(|&p| self.labels[p]).collect();
        Ok(Report { batch, labels })
    }

    /// Copy channel-specific columns onto canonical names, scaling numeric
    /// values by `1 / divisor` when one is given. Missing sources become
    /// null columns.
    pub fn map_columns(&mut self, mappings: &[ColumnMapping]) -> Result<()> {
        for mapping in mappings {
            let target = mapping.target.name();
            let values: ArrayRef = match (self.batch.column_by_name(&mapping.source), mapping.divisor) {
                (Some(source), None) => source.clone(),
                (Some(_), Some(divisor)) => {
                    let scaled: Float64Array = self
                        .f64_values(&mapping.source)?
                        .into_iter()
                        .map(|v| v.map(|v| v / divisor))
                        .collect();
                    Arc::new(scaled)
                }
                (None, _) => new_null_array(&DataType::Float64, self.num_rows()),
            };
            self.set_column(target, values)?;
        }
        Ok(())
    }

    /// Stack reports, filling columns a report lacks with nulls.
    pub fn concat(reports: &[Report]) -> Result<Report> {
        let mut fields: Vec<Field> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for report in reports {
            for field in report.schema().fields() {
                if !positions.contains_key(field.name()) {
                    positions.insert(field.name().clone(), fields.len());
                    fields.push(Field::new(field.name(), field.data_type().clone(), true));
                }
            }
        }
        let schema = Arc::new(Schema::new(fields));

        let mut batches = Vec::with_capacity(reports.len());
        let mut labels = Vec::new();
        for report in reports {
            let columns = schema
                .fields()
                .iter()
                .map(|field| match report.batch.column_by_name(field.name()) {
                    Some(column) if column.data_type() == field.data_type() => Ok(column.clone()),
                    Some(column) => Ok(cast(column, field.data_type())?),
                    None => Ok(new_null_array(field.data_type(), report.num_rows())),
                })
                .collect::<Result<Vec<_>>>()?;
            batches.push(RecordBatch::try_new(schema.clone(), columns)?);
            labels.extend_from_slice(&report.labels);
        }
        let batch = concat_batches(&schema, &batches)?;
        Report::with_labels(batch, labels)
    }

    /// CSV rendering with a header row; an empty report renders as "".
    pub fn to_csv(&self) -> Result<String> {
        if self.is_empty() {
            return Ok(String::new());
        }
        let mut buffer = Vec::new();
        {
            let mut writer = arrow::csv::Writer::new(&mut buffer);
            writer.write(&self.batch)?;
        }
        Ok(String::from_utf8(buffer)?)
    }

    pub fn pretty(&self) -> Result<String> {
        Ok(arrow::util::pretty::pretty_format_batches(&[self.batch.clone()])?.to_string())
    }
}

/// Rename a channel column onto a canonical one.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    pub target: ReportColumn,
    pub source: String,
    pub divisor: Option<f64>,
}

impl ColumnMapping {
    pub fn new(target: ReportColumn, source: impl Into<String>) -> Self {
        Self {
            target,
            source: source.into(),
            divisor: None,
        }
    }

    pub fn scaled(target: ReportColumn, source: impl Into<String>, divisor: f64) -> Self {
        Self {
            target,
            source: source.into(),
            divisor: Some(divisor),
        }
    }
}
