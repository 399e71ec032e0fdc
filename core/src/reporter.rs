//! Report retrieval and the standard filters applied before evaluation.

use crate::channel::{ChannelApi, ReportRequest};
use crate::history::{latest_checked_dates, HistoryQuery, HistoryStore, HistoryType};
use crate::report::{ColumnMapping, Report, ReportColumn, ReportType};
use anyhow::{Context, Result};
use arrow::array::{BooleanArray, Float64Array};
use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

#[async_trait]
pub trait Reporter: Send + Sync {
    fn report_type(&self) -> ReportType;

    /// Rows for the request, with channel columns mapped onto canonical names.
    async fn fetch_raw(&self, request: &ReportRequest, api: &dyn ChannelApi) -> Result<Report>;
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: std::time::Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: std::time::Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts => {
                    warn!(attempt, error = %e, "Report fetch failed, retrying");
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.context(format!("report fetch failed after {} attempts", attempt))),
            }
        }
    }
}

/// Reporter backed by [`ChannelApi::fetch_report`].
#[derive(Debug, Clone)]
pub struct ApiReporter {
    report_type: ReportType,
    mappings: Vec<ColumnMapping>,
    retry: RetryPolicy,
}

impl ApiReporter {
    pub fn new(report_type: ReportType) -> Self {
        Self {
            report_type,
            mappings: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_mappings(mut self, mappings: Vec<ColumnMapping>) -> Self {
        self.mappings = mappings;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl Reporter for ApiReporter {
    fn report_type(&self) -> ReportType {
        self.report_type
    }

    async fn fetch_raw(&self, request: &ReportRequest, api: &dyn ChannelApi) -> Result<Report> {
        let mut report = self.retry.run(move || api.fetch_report(request)).await?;
        report.map_columns(&self.mappings)?;
        debug!(report_type = %self.report_type, rows = report.num_rows(), "Fetched raw report");
        Ok(report)
    }
}

/// Standard row filters applied to every fetched report.
#[derive(Clone)]
pub struct ReportFilter {
    pub report_type: ReportType,
    pub rule_id: String,
    pub ad_group_id: Option<String>,
    /// Rows this close to the newest row are still being processed upstream.
    pub data_check_range: Option<Duration>,
    pub fetched_at: DateTime<Utc>,
    pub dynamic_window: bool,
}

impl ReportFilter {
    pub async fn apply(&self, mut report: Report, history: &dyn HistoryStore) -> Result<Report> {
        if report.is_empty() {
            return Ok(report);
        }
        let before = report.num_rows();
        self.drop_future_rows(&mut report)?;
        self.drop_processing_lag(&mut report)?;
        self.restrict_ad_group(&mut report)?;
        invalidate_zero_divisors(&mut report)?;
        if self.dynamic_window {
            self.drop_checked_rows(&mut report, history).await?;
        }
        debug!(
            report_type = %self.report_type,
            before,
            after = report.num_rows(),
            "Filtered report"
        );
        Ok(report)
    }

    /// Rows without a date are kept.
    fn drop_future_rows(&self, report: &mut Report) -> Result<()> {
        let fetch_hour = self.fetched_at.duration_trunc(Duration::hours(1))?;
        let mask: BooleanArray = report
            .timestamps(ReportColumn::Date.name())?
            .into_iter()
            .map(|date| Some(date.map_or(true, |d| d < fetch_hour)))
            .collect();
        report.retain_mask(&mask)
    }

    fn drop_processing_lag(&self, report: &mut Report) -> Result<()> {
        let Some(range) = self.data_check_range else {
            return Ok(());
        };
        let Some(newest) = report.max_timestamp(ReportColumn::Date.name())? else {
            return Ok(());
        };
        let cutoff = newest - range;
        let mask: BooleanArray = report
            .timestamps(ReportColumn::Date.name())?
            .into_iter()
            .map(|date| Some(date.map_or(false, |d| d > cutoff)))
            .collect();
        report.retain_mask(&mask)
    }

    fn restrict_ad_group(&self, report: &mut Report) -> Result<()> {
        let Some(ad_group_id) = self.ad_group_id.as_deref() else {
            return Ok(());
        };
        let mask: BooleanArray = report
            .group_keys(ReportColumn::AdGroupId.name())?
            .into_iter()
            .map(|id| Some(id.as_deref() == Some(ad_group_id)))
            .collect();
        report.retain_mask(&mask)
    }

    async fn drop_checked_rows(&self, report: &mut Report, history: &dyn HistoryStore) -> Result<()> {
        let query = HistoryQuery {
            rule_id: Some(self.rule_id.clone()),
            target_type: Some(self.report_type.target_type()),
            history_type: Some(HistoryType::Action),
            consumed_data: Some(true),
            ..HistoryQuery::default()
        };
        let checked = latest_checked_dates(history, &query)
            .await
            .context("failed to load last action dates")?;
        if checked.is_empty() {
            return Ok(());
        }

        let ids = report.group_keys(self.report_type.group_by_id().name())?;
        let dates = report.timestamps(ReportColumn::Date.name())?;
        let mask: BooleanArray = ids
            .iter()
            .zip(dates)
            .map(|(id, date)| {
                let last = id.as_ref().and_then(|id| checked.get(id));
                Some(match (last, date) {
                    (Some(last), Some(date)) => date > *last,
                    _ => true,
                })
            })
            .collect();
        report.retain_mask(&mask)
    }
}

/// Null out per-row averages whose divisor is zero.
pub fn invalidate_zero_divisors(report: &mut Report) -> Result<()> {
    for (average, divisor) in [
        (ReportColumn::AvgCpt, ReportColumn::Taps),
        (ReportColumn::AvgCpa, ReportColumn::Installs),
    ] {
        if !report.has_column(average.name()) || !report.has_column(divisor.name()) {
            continue;
        }
        let values = report.f64_values(average.name())?;
        let divisors = report.f64_values(divisor.name())?;
        let cleaned: Float64Array = values
            .into_iter()
            .zip(divisors)
            .map(|(value, divisor)| if divisor == Some(0.0) { None } else { value })
            .collect();
        report.set_column(average.name(), Arc::new(cleaned))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::tests::action_record;
    use crate::history::MemoryHistoryStore;
    use arrow::array::{Int64Array, TimestampMillisecondArray};
    use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
    use arrow::record_batch::RecordBatch;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn dated_report(ids: &[i64], dates: &[DateTime<Utc>], taps: &[i64]) -> Report {
        let schema = Schema::new(vec![
            Field::new("keywordId", DataType::Int64, false),
            Field::new("adGroupId", DataType::Int64, false),
            Field::new("date", DataType::Timestamp(TimeUnit::Millisecond, None), true),
            Field::new("taps", DataType::Int64, true),
            Field::new("avgCPT", DataType::Float64, true),
        ]);
        let batch = RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(Int64Array::from(ids.to_vec())),
                Arc::new(Int64Array::from(ids.iter().map(|id| id % 2).collect::<Vec<_>>())),
                Arc::new(TimestampMillisecondArray::from(
                    dates.iter().map(|d| d.timestamp_millis()).collect::<Vec<_>>(),
                )),
                Arc::new(Int64Array::from(taps.to_vec())),
                Arc::new(Float64Array::from(vec![1.5; ids.len()])),
            ],
        )
        .unwrap();
        Report::new(batch)
    }

    fn filter(now: DateTime<Utc>) -> ReportFilter {
        ReportFilter {
            report_type: ReportType::Keyword,
            rule_id: "r1".to_string(),
            ad_group_id: None,
            data_check_range: None,
            fetched_at: now,
            dynamic_window: false,
        }
    }

    #[tokio::test]
    async fn test_drops_rows_from_the_current_hour() {
        let now = Utc.with_ymd_and_hms(2024, 6, 2, 12, 30, 0).unwrap();
        let report = dated_report(
            &[1, 2, 3],
            &[now - Duration::hours(2), now - Duration::minutes(10), now],
            &[1, 1, 1],
        );
        let filtered = filter(now)
            .apply(report, &MemoryHistoryStore::new())
            .await
            .unwrap();
        assert_eq!(filtered.labels(), &[0]);
    }

    #[tokio::test]
    async fn test_undated_rows_survive_the_future_cutoff() {
        let now = Utc.with_ymd_and_hms(2024, 6, 2, 12, 30, 0).unwrap();
        let schema = Schema::new(vec![
            Field::new("keywordId", DataType::Int64, false),
            Field::new("date", DataType::Timestamp(TimeUnit::Millisecond, None), true),
        ]);
        let batch = RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3])),
                Arc::new(TimestampMillisecondArray::from(vec![
                    Some((now - Duration::days(1)).timestamp_millis()),
                    None,
                    Some(now.timestamp_millis()),
                ])),
            ],
        )
        .unwrap();
        let filtered = filter(now)
            .apply(Report::new(batch), &MemoryHistoryStore::new())
            .await
            .unwrap();
        assert_eq!(filtered.labels(), &[0, 1]);
    }

    #[tokio::test]
    async fn test_empty_report_without_dates_passes_through() {
        let now = Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap();
        let schema = Schema::new(vec![Field::new("keywordId", DataType::Int64, false)]);
        let report = Report::new(RecordBatch::new_empty(Arc::new(schema)));
        let mut f = filter(now);
        f.data_check_range = Some(Duration::days(2));
        f.ad_group_id = Some("1".to_string());
        f.dynamic_window = true;

        let filtered = f.apply(report, &MemoryHistoryStore::new()).await.unwrap();
        assert!(filtered.is_empty());
    }

    #[tokio::test]
    async fn test_processing_lag_and_ad_group() {
        let now = Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap();
        let report = dated_report(
            &[1, 2, 3, 4],
            &[
                now - Duration::days(4),
                now - Duration::days(3),
                now - Duration::days(2),
                now - Duration::days(1),
            ],
            &[1, 1, 1, 1],
        );
        let mut f = filter(now);
        f.data_check_range = Some(Duration::days(2));
        let lagged = f.apply(report.clone(), &MemoryHistoryStore::new()).await.unwrap();
        assert_eq!(lagged.labels(), &[2, 3]);

        f.data_check_range = None;
        f.ad_group_id = Some("1".to_string());
        let scoped = f.apply(report, &MemoryHistoryStore::new()).await.unwrap();
        assert_eq!(scoped.labels(), &[0, 2]);
    }

    #[tokio::test]
    async fn test_zero_divisor_averages_become_null() {
        let now = Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap();
        let report = dated_report(&[1, 2], &[now - Duration::days(1); 2], &[0, 3]);
        let filtered = filter(now).apply(report, &MemoryHistoryStore::new()).await.unwrap();
        assert_eq!(filtered.f64_values("avgCPT").unwrap(), vec![None, Some(1.5)]);
    }

    #[tokio::test]
    async fn test_dynamic_window_drops_checked_rows() {
        let now = Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap();
        let report = dated_report(
            &[1, 1, 2],
            &[now - Duration::days(3), now - Duration::days(1), now - Duration::days(3)],
            &[1, 1, 1],
        );
        let mut record = action_record("1", now - Duration::days(2));
        record.last_data_checked_date = Some(now - Duration::days(2));
        let history = MemoryHistoryStore::with_records(vec![record]);

        let mut f = filter(now);
        f.dynamic_window = true;
        let filtered = f.apply(report, &history).await.unwrap();
        assert_eq!(filtered.labels(), &[1, 2]);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_bounded_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            attempts: 3,
            delay: std::time::Duration::from_millis(1),
        };
        let result: Result<()> = policy
            .run(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("upstream unavailable")
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_recovers() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            attempts: 3,
            delay: std::time::Duration::from_millis(1),
        };
        let value = policy
            .run(move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("flaky");
                }
                Ok(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
