use crate::changeset::ChangeSet;
use crate::db::{ApplyPhase, ApplyTracker, Database, DatabaseOptions};
use crate::errors::{AppError, AppResult};
use crate::models::{ApplySummary, MetricType, MetricsBundle, ReferenceData, UnitOfMeasure};
use crate::session::MetricsGateway;
use crate::validation::validate_change_set;
use chrono::{NaiveDate, Utc};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

pub const DATABASE_FILE: &str = "metrics.sqlite";

/// Entry point for everything that reads or writes use case metrics.
#[derive(Debug, Clone)]
pub struct MetricsService {
    db: Arc<Database>,
}

impl MetricsService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn open(data_dir: &Path, options: &DatabaseOptions) -> AppResult<Self> {
        let db = Database::open(&data_dir.join(DATABASE_FILE), options)?;
        Ok(Self::new(Arc::new(db)))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn fetch_metrics(&self, use_case_id: i64) -> AppResult<MetricsBundle> {
        self.db.get_use_case_metrics(use_case_id)
    }

    pub fn metric_types(&self) -> AppResult<Vec<MetricType>> {
        self.db.list_metric_types()
    }

    pub fn units_of_measure(&self) -> AppResult<Vec<UnitOfMeasure>> {
        self.db.list_units_of_measure()
    }

    pub fn reference_data(&self) -> AppResult<ReferenceData> {
        Ok(ReferenceData::new(&self.metric_types()?, &self.units_of_measure()?))
    }

    pub fn apply_changes(&self, use_case_id: i64, change_set: &ChangeSet) -> AppResult<ApplySummary> {
        self.apply_changes_as_of(use_case_id, change_set, Utc::now().date_naive())
    }

    /// Validates and applies `change_set` with `today` as the reference date for target checks.
    pub fn apply_changes_as_of(
        &self,
        use_case_id: i64,
        change_set: &ChangeSet,
        today: NaiveDate,
    ) -> AppResult<ApplySummary> {
        if change_set.is_empty() {
            return Err(AppError::NoChanges);
        }

        let mut tracker = ApplyTracker::new(Uuid::new_v4().to_string());
        tracing::debug!(
            apply_id = tracker.apply_id(),
            use_case_id,
            operations = change_set.operation_count(),
            "received metrics change set"
        );

        tracker.advance(ApplyPhase::Validating);
        let validation = validate_change_set(change_set, today);
        let result = self.db.apply_metric_changes(use_case_id, validation, today, &mut tracker);

        match &result {
            Ok(summary) => tracing::info!(
                apply_id = tracker.apply_id(),
                use_case_id,
                phase = tracker.phase().as_str(),
                metrics_inserted = summary.metrics_inserted,
                metrics_updated = summary.metrics_updated,
                metrics_deleted = summary.metrics_deleted,
                reports_inserted = summary.reports_inserted,
                reports_updated = summary.reports_updated,
                reports_deleted = summary.reports_deleted,
                "applied metrics change set"
            ),
            Err(AppError::Validation(errors)) => tracing::warn!(
                apply_id = tracker.apply_id(),
                use_case_id,
                phase = tracker.phase().as_str(),
                error_count = errors.len(),
                "rejected metrics change set"
            ),
            Err(error) if error.is_client_fault() => tracing::warn!(
                apply_id = tracker.apply_id(),
                use_case_id,
                phase = tracker.phase().as_str(),
                error = %error,
                "metrics change set refused"
            ),
            Err(error) => tracing::error!(
                apply_id = tracker.apply_id(),
                use_case_id,
                phase = tracker.phase().as_str(),
                error = %error,
                "metrics change set failed"
            ),
        }
        if !tracker.phase().is_terminal() {
            tracing::warn!(apply_id = tracker.apply_id(), phase = tracker.phase().as_str(), "apply ended outside a terminal phase");
        }

        result
    }
}

impl MetricsGateway for MetricsService {
    fn fetch_metrics(&self, use_case_id: i64) -> AppResult<MetricsBundle> {
        MetricsService::fetch_metrics(self, use_case_id)
    }

    fn apply_changes(&self, use_case_id: i64, change_set: &ChangeSet) -> AppResult<ApplySummary> {
        MetricsService::apply_changes(self, use_case_id, change_set)
    }
}
