//! Report files loaded through DataFusion.

use adrule_core::report::Report;
use anyhow::{bail, Context, Result};
use arrow::compute::concat_batches;
use datafusion::dataframe::DataFrame;
use datafusion::prelude::*;
use std::path::Path;
use tracing::{debug, info};

/// Table name reports are registered under for SQL queries.
pub const REPORT_TABLE: &str = "report";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Csv,
    NdJson,
    Parquet,
}

impl ReportFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "csv" => Ok(Self::Csv),
            "json" | "ndjson" | "jsonl" => Ok(Self::NdJson),
            "parquet" => Ok(Self::Parquet),
            other => bail!("unsupported report file extension `{}`", other),
        }
    }
}

pub struct ReportLoader {
    ctx: SessionContext,
}

impl Default for ReportLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportLoader {
    pub fn new() -> Self {
        Self {
            ctx: SessionContext::new(),
        }
    }

    async fn read(&self, path: &Path) -> Result<DataFrame> {
        let format = ReportFormat::from_path(path)?;
        let location = path
            .to_str()
            .with_context(|| format!("report path {} is not valid UTF-8", path.display()))?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e))
            .unwrap_or_default();

        let df = match format {
            ReportFormat::Csv => {
                self.ctx
                    .read_csv(location, CsvReadOptions::new().file_extension(&extension))
                    .await?
            }
            ReportFormat::NdJson => {
                self.ctx
                    .read_json(location, NdJsonReadOptions::default().file_extension(&extension))
                    .await?
            }
            ReportFormat::Parquet => {
                self.ctx
                    .read_parquet(
                        location,
                        ParquetReadOptions {
                            file_extension: &extension,
                            ..ParquetReadOptions::default()
                        },
                    )
                    .await?
            }
        };
        debug!(path = %path.display(), format = ?format, "Report file opened");
        Ok(df)
    }

    async fn collect(df: DataFrame) -> Result<Report> {
        let planned = df.schema().inner().clone();
        let batches = df.collect().await?;
        let schema = batches.first().map_or(planned, |batch| batch.schema());
        let batch = concat_batches(&schema, &batches)?;
        Ok(Report::new(batch))
    }

    /// Load a whole report file.
    pub async fn load<P: AsRef<Path>>(&self, path: P) -> Result<Report> {
        let path = path.as_ref();
        let report = Self::collect(self.read(path).await?).await?;
        info!(path = %path.display(), rows = report.num_rows(), "Report loaded");
        Ok(report)
    }

    /// Load the result of `sql` run against the file, registered as
    /// [`REPORT_TABLE`].
    pub async fn load_query<P: AsRef<Path>>(&self, path: P, sql: &str) -> Result<Report> {
        let path = path.as_ref();
        let df = self.read(path).await?;
        self.ctx.deregister_table(REPORT_TABLE)?;
        self.ctx.register_table(REPORT_TABLE, df.into_view())?;
        let report = Self::collect(self.ctx.sql(sql).await.context("planning report query")?).await?;
        info!(path = %path.display(), rows = report.num_rows(), "Report query loaded");
        Ok(report)
    }
}
