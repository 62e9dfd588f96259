use super::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{ApplySummary, IdentityMode};
use crate::validation::{
    validate_against_store, MetricPatch, MetricRef, NewMetricRecord, NewReportRecord, ReportPatch, StoredView,
    Validation, ValidatedChangeSet,
};
use chrono::{NaiveDate, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::HashMap;

/// Lifecycle of one apply call. `Failed` and `RolledBack` leave storage untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPhase {
    Pending,
    Validating,
    Failed,
    ReservingIds,
    Applying,
    Committed,
    RolledBack,
}

impl ApplyPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::Failed => "failed",
            Self::ReservingIds => "reserving-ids",
            Self::Applying => "applying",
            Self::Committed => "committed",
            Self::RolledBack => "rolled-back",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Committed | Self::RolledBack)
    }

    fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Validating)
                | (Self::Validating, Self::Failed)
                | (Self::Validating, Self::ReservingIds)
                | (Self::Validating, Self::RolledBack)
                | (Self::ReservingIds, Self::Applying)
                | (Self::ReservingIds, Self::RolledBack)
                | (Self::Applying, Self::Committed)
                | (Self::Applying, Self::RolledBack)
        )
    }
}

#[derive(Debug, Clone)]
pub struct ApplyTracker {
    apply_id: String,
    history: Vec<ApplyPhase>,
}

impl ApplyTracker {
    pub fn new(apply_id: impl Into<String>) -> Self {
        Self {
            apply_id: apply_id.into(),
            history: vec![ApplyPhase::Pending],
        }
    }

    pub fn apply_id(&self) -> &str {
        &self.apply_id
    }

    pub fn phase(&self) -> ApplyPhase {
        self.history.last().copied().unwrap_or(ApplyPhase::Pending)
    }

    pub fn history(&self) -> &[ApplyPhase] {
        &self.history
    }

    pub fn advance(&mut self, next: ApplyPhase) {
        let current = self.phase();
        if !current.can_advance_to(next) {
            tracing::warn!(
                apply_id = %self.apply_id,
                from = current.as_str(),
                to = next.as_str(),
                "unexpected apply phase transition"
            );
        }
        tracing::debug!(apply_id = %self.apply_id, phase = next.as_str(), "apply phase");
        self.history.push(next);
    }
}

/// Hands out ids for one table for the lifetime of a write transaction.
struct IdAllocator {
    mode: IdentityMode,
    next: i64,
}

impl IdAllocator {
    /// For sequential tables this reads `MAX(id)` while the transaction already holds the write lock,
    /// so no other writer can observe the same maximum until this one commits or rolls back.
    fn reserve(tx: &Transaction<'_>, table: &str, mode: IdentityMode) -> AppResult<Self> {
        let next = match mode {
            IdentityMode::Generated => 0,
            IdentityMode::Sequential => tx.query_row(
                &format!("SELECT COALESCE(MAX(id), 0) + 1 FROM {}", table),
                [],
                |row| row.get(0),
            )?,
        };
        Ok(Self { mode, next })
    }

    fn take(&mut self) -> Option<i64> {
        match self.mode {
            IdentityMode::Generated => None,
            IdentityMode::Sequential => {
                let id = self.next;
                self.next += 1;
                Some(id)
            }
        }
    }
}

impl Database {
    /// Applies a validated change set for one use case as a single write transaction.
    ///
    /// Store-dependent checks run inside the same transaction, before anything is written. Any
    /// failure after that point rolls the whole batch back.
    pub fn apply_metric_changes(
        &self,
        use_case_id: i64,
        validation: Validation,
        today: NaiveDate,
        tracker: &mut ApplyTracker,
    ) -> AppResult<ApplySummary> {
        let Validation { change_set, mut errors } = validation;

        let mut conn = match self.lock() {
            Ok(conn) => conn,
            Err(error) => {
                tracker.advance(ApplyPhase::RolledBack);
                return Err(error);
            }
        };
        // Waits up to the busy timeout for another writer to finish.
        let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
            Ok(tx) => tx,
            Err(error) => {
                tracker.advance(ApplyPhase::RolledBack);
                return Err(error.into());
            }
        };

        let stored = match load_stored_view(&tx, use_case_id, &change_set) {
            Ok(stored) => stored,
            Err(error) => {
                tracker.advance(ApplyPhase::RolledBack);
                return Err(error);
            }
        };
        errors.extend(validate_against_store(&change_set, &stored, today));
        if !errors.is_empty() {
            tracker.advance(ApplyPhase::Failed);
            return Err(AppError::Validation(errors));
        }

        tracker.advance(ApplyPhase::ReservingIds);
        let reserved = IdAllocator::reserve(&tx, "metrics", self.identity.metrics).and_then(|metric_ids| {
            IdAllocator::reserve(&tx, "reported_metrics", self.identity.reported_metrics)
                .map(|report_ids| (metric_ids, report_ids))
        });
        let (mut metric_ids, mut report_ids) = match reserved {
            Ok(reserved) => reserved,
            Err(error) => {
                tracker.advance(ApplyPhase::RolledBack);
                return Err(error);
            }
        };

        tracker.advance(ApplyPhase::Applying);
        let writer = BatchWriter {
            tx: &tx,
            use_case_id,
            editor: change_set.editor.as_deref(),
            now: Utc::now().to_rfc3339(),
        };
        let summary = match writer.write(&change_set, &mut metric_ids, &mut report_ids) {
            Ok(summary) => summary,
            Err(error) => {
                tracker.advance(ApplyPhase::RolledBack);
                return Err(error);
            }
        };

        if let Err(error) = tx.commit() {
            tracker.advance(ApplyPhase::RolledBack);
            return Err(error.into());
        }
        tracker.advance(ApplyPhase::Committed);
        Ok(summary)
    }
}

fn load_stored_view(tx: &Transaction<'_>, use_case_id: i64, change_set: &ValidatedChangeSet) -> AppResult<StoredView> {
    let mut stored = StoredView::default();

    let mut metric_stmt = tx.prepare_cached(
        "SELECT baseline_date, target_date FROM metrics WHERE use_case_id = ?1 AND id = ?2",
    )?;
    for metric_id in change_set.referenced_metric_ids() {
        let dates = metric_stmt
            .query_row(params![use_case_id, metric_id], |row| {
                Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .optional()?;
        if let Some(dates) = dates {
            stored.metric_dates.insert(metric_id, dates);
        }
    }

    let mut report_stmt =
        tx.prepare_cached("SELECT metric_id FROM reported_metrics WHERE use_case_id = ?1 AND id = ?2")?;
    for report_id in change_set.referenced_report_ids() {
        let metric_id = report_stmt
            .query_row(params![use_case_id, report_id], |row| row.get::<_, i64>(0))
            .optional()?;
        if let Some(metric_id) = metric_id {
            stored.report_metrics.insert(report_id, metric_id);
        }
    }

    let mut type_stmt = tx.prepare_cached("SELECT id FROM metric_types WHERE active = 1")?;
    stored.metric_type_ids = type_stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<Result<_, _>>()?;
    let mut unit_stmt = tx.prepare_cached("SELECT id FROM units_of_measure WHERE active = 1")?;
    stored.unit_ids = unit_stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .collect::<Result<_, _>>()?;

    Ok(stored)
}

struct BatchWriter<'a> {
    tx: &'a Transaction<'a>,
    use_case_id: i64,
    editor: Option<&'a str>,
    now: String,
}

impl BatchWriter<'_> {
    fn write(
        &self,
        change_set: &ValidatedChangeSet,
        metric_ids: &mut IdAllocator,
        report_ids: &mut IdAllocator,
    ) -> AppResult<ApplySummary> {
        let mut summary = ApplySummary::default();

        // Reports go before their metric: the tables carry a foreign key but no cascade.
        for metric_id in &change_set.delete_metric_ids {
            summary.reports_deleted += self.tx.execute(
                "DELETE FROM reported_metrics WHERE use_case_id = ?1 AND metric_id = ?2",
                params![self.use_case_id, metric_id],
            )?;
            summary.metrics_deleted += self.tx.execute(
                "DELETE FROM metrics WHERE use_case_id = ?1 AND id = ?2",
                params![self.use_case_id, metric_id],
            )?;
        }
        for report_id in &change_set.delete_report_ids {
            summary.reports_deleted += self.tx.execute(
                "DELETE FROM reported_metrics WHERE use_case_id = ?1 AND id = ?2",
                params![self.use_case_id, report_id],
            )?;
        }

        for patch in &change_set.update_metrics {
            summary.metrics_updated += self.update_metric(patch)?;
        }
        for patch in &change_set.update_reports {
            summary.reports_updated += self.update_report(patch)?;
        }

        let mut pending_ids = HashMap::new();
        for record in &change_set.new_metrics {
            let id = self.insert_metric(record, metric_ids.take())?;
            if let Some(client_id) = record.client_id {
                pending_ids.insert(client_id, id);
            }
            summary.metrics_inserted += 1;
        }
        for record in &change_set.new_reports {
            let metric_id = match record.metric {
                MetricRef::Stored(id) => id,
                MetricRef::Pending(client_id) => *pending_ids.get(&client_id).ok_or_else(|| {
                    AppError::Internal(format!("no metric was created for client id {}", client_id))
                })?,
            };
            self.insert_report(record, metric_id, report_ids.take())?;
            summary.reports_inserted += 1;
        }

        Ok(summary)
    }

    fn update_metric(&self, patch: &MetricPatch) -> AppResult<usize> {
        let mut update = PartialUpdate::new("metrics");
        update.set_opt("metric_type_id", patch.metric_type_id.map(SqlValue::Integer));
        update.set_opt("unit_of_measure_id", patch.unit_of_measure_id.map(SqlValue::Integer));
        update.set_opt("primary_success_metric_name", patch.name.clone().map(SqlValue::Text));
        update.set_opt("baseline_value", patch.baseline_value.clone().map(SqlValue::Text));
        update.set_opt("baseline_date", patch.baseline_date.map(format_date).map(SqlValue::Text));
        update.set_opt("target_value", patch.target_value.clone().map(SqlValue::Text));
        update.set_opt("target_date", patch.target_date.map(format_date).map(SqlValue::Text));
        update.execute(self, patch.id)
    }

    fn update_report(&self, patch: &ReportPatch) -> AppResult<usize> {
        let mut update = PartialUpdate::new("reported_metrics");
        update.set_opt("reported_value", patch.reported_value.clone().map(SqlValue::Text));
        update.set_opt("reported_date", patch.reported_date.map(format_date).map(SqlValue::Text));
        update.execute(self, patch.id)
    }

    fn insert_metric(&self, record: &NewMetricRecord, reserved_id: Option<i64>) -> AppResult<i64> {
        self.tx.execute(
            "INSERT INTO metrics (
               id, use_case_id, metric_type_id, unit_of_measure_id, primary_success_metric_name,
               baseline_value, baseline_date, target_value, target_date, created, modified, editor
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?11)",
            params![
                reserved_id,
                self.use_case_id,
                record.metric_type_id,
                record.unit_of_measure_id,
                record.name,
                record.baseline_value,
                format_date(record.baseline_date),
                record.target_value,
                format_date(record.target_date),
                self.now,
                self.editor,
            ],
        )?;
        Ok(reserved_id.unwrap_or_else(|| self.tx.last_insert_rowid()))
    }

    fn insert_report(&self, record: &NewReportRecord, metric_id: i64, reserved_id: Option<i64>) -> AppResult<i64> {
        self.tx.execute(
            "INSERT INTO reported_metrics (
               id, use_case_id, metric_id, reported_value, reported_date, created, modified, editor
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)",
            params![
                reserved_id,
                self.use_case_id,
                metric_id,
                record.reported_value,
                format_date(record.reported_date),
                self.now,
                self.editor,
            ],
        )?;
        Ok(reserved_id.unwrap_or_else(|| self.tx.last_insert_rowid()))
    }
}

/// `UPDATE` over only the columns a patch carries, plus the audit stamp.
struct PartialUpdate {
    table: &'static str,
    assignments: Vec<String>,
    values: Vec<SqlValue>,
}

impl PartialUpdate {
    fn new(table: &'static str) -> Self {
        Self {
            table,
            assignments: Vec::new(),
            values: Vec::new(),
        }
    }

    fn set_opt(&mut self, column: &str, value: Option<SqlValue>) {
        if let Some(value) = value {
            self.push(column, value);
        }
    }

    fn push(&mut self, column: &str, value: SqlValue) {
        self.values.push(value);
        self.assignments.push(format!("{} = ?{}", column, self.values.len()));
    }

    fn execute(mut self, writer: &BatchWriter<'_>, id: i64) -> AppResult<usize> {
        self.push("modified", SqlValue::Text(writer.now.clone()));
        // A missing editor keeps whoever edited the row last.
        self.values.push(
            writer
                .editor
                .map(|editor| SqlValue::Text(editor.to_string()))
                .unwrap_or(SqlValue::Null),
        );
        self.assignments
            .push(format!("editor = COALESCE(?{}, editor)", self.values.len()));

        self.values.push(SqlValue::Integer(id));
        let id_param = self.values.len();
        self.values.push(SqlValue::Integer(writer.use_case_id));
        let use_case_param = self.values.len();

        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{} AND use_case_id = ?{}",
            self.table,
            self.assignments.join(", "),
            id_param,
            use_case_param
        );
        let changed = writer
            .tx
            .execute(&sql, rusqlite::params_from_iter(self.values.iter()))?;
        Ok(changed)
    }
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
