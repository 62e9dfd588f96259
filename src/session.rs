use crate::changeset::ChangeSet;
use crate::diff::{diff, format_metric_date, EditSnapshot, MetricDraft, ReportDraft, WorkingCopy};
use crate::errors::{AppError, AppResult};
use crate::models::{ApplySummary, MetricsBundle, ReferenceData};

/// Where an edit session loads from and commits to.
pub trait MetricsGateway {
    fn fetch_metrics(&self, use_case_id: i64) -> AppResult<MetricsBundle>;
    fn apply_changes(&self, use_case_id: i64, change_set: &ChangeSet) -> AppResult<ApplySummary>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    NoChanges,
    Applied(ApplySummary),
}

/// One editing pass over a use case's metrics.
///
/// Holds the snapshot taken when editing began next to the working copy the user changes. Nothing
/// reaches storage until `commit`, which sends only the difference between the two.
#[derive(Debug, Clone)]
pub struct MetricsEditSession {
    use_case_id: i64,
    reference: ReferenceData,
    snapshot: EditSnapshot,
    working: WorkingCopy,
    editor_email: Option<String>,
    next_temp_id: i64,
}

impl MetricsEditSession {
    pub fn begin(use_case_id: i64, bundle: &MetricsBundle, reference: ReferenceData) -> Self {
        let snapshot = EditSnapshot::capture(bundle, &reference);
        let working = snapshot.working_copy();
        Self {
            use_case_id,
            reference,
            snapshot,
            working,
            editor_email: None,
            next_temp_id: -1,
        }
    }

    pub fn load(use_case_id: i64, gateway: &impl MetricsGateway, reference: ReferenceData) -> AppResult<Self> {
        let bundle = gateway.fetch_metrics(use_case_id)?;
        Ok(Self::begin(use_case_id, &bundle, reference))
    }

    pub fn with_editor(mut self, editor_email: impl Into<String>) -> Self {
        self.editor_email = Some(editor_email.into());
        self
    }

    pub fn use_case_id(&self) -> i64 {
        self.use_case_id
    }

    pub fn snapshot(&self) -> &EditSnapshot {
        &self.snapshot
    }

    pub fn working(&self) -> &WorkingCopy {
        &self.working
    }

    pub fn metric(&self, id: i64) -> Option<&MetricDraft> {
        self.working.metrics.iter().find(|metric| metric.id == id)
    }

    pub fn report(&self, metric_id: i64) -> Option<&ReportDraft> {
        self.working.reports.iter().find(|report| report.metric_id == metric_id)
    }

    /// Adds a metric under a fresh temporary id and returns that id.
    pub fn add_metric(&mut self, mut draft: MetricDraft) -> i64 {
        let id = self.take_temp_id();
        draft.id = id;
        draft.baseline_date = format_metric_date(Some(&draft.baseline_date));
        draft.target_date = format_metric_date(Some(&draft.target_date));
        self.working.metrics.push(draft);
        id
    }

    pub fn update_metric(&mut self, id: i64, edit: impl FnOnce(&mut MetricDraft)) -> AppResult<()> {
        let draft = self
            .working
            .metrics
            .iter_mut()
            .find(|metric| metric.id == id)
            .ok_or_else(|| AppError::NotFound(format!("metric {} is not part of this edit", id)))?;
        edit(draft);
        draft.id = id;
        draft.baseline_date = format_metric_date(Some(&draft.baseline_date));
        draft.target_date = format_metric_date(Some(&draft.target_date));
        Ok(())
    }

    /// Drops a metric together with its report.
    pub fn remove_metric(&mut self, id: i64) -> AppResult<()> {
        let before = self.working.metrics.len();
        self.working.metrics.retain(|metric| metric.id != id);
        if self.working.metrics.len() == before {
            return Err(AppError::NotFound(format!("metric {} is not part of this edit", id)));
        }
        self.working.reports.retain(|report| report.metric_id != id);
        Ok(())
    }

    pub fn set_report(&mut self, metric_id: i64, reported_value: &str, reported_date: &str) -> AppResult<()> {
        if self.metric(metric_id).is_none() {
            return Err(AppError::NotFound(format!("metric {} is not part of this edit", metric_id)));
        }
        let report = ReportDraft {
            metric_id,
            reported_value: reported_value.to_string(),
            reported_date: format_metric_date(Some(reported_date)),
        };
        match self.working.reports.iter_mut().find(|existing| existing.metric_id == metric_id) {
            Some(existing) => *existing = report,
            None => self.working.reports.push(report),
        }
        Ok(())
    }

    pub fn clear_report(&mut self, metric_id: i64) {
        self.working.reports.retain(|report| report.metric_id != metric_id);
    }

    pub fn change_set(&self) -> ChangeSet {
        let mut change_set = diff(&self.snapshot, &self.working, &self.reference);
        change_set.editor_email = self.editor_email.clone();
        change_set
    }

    pub fn is_dirty(&self) -> bool {
        !self.change_set().is_empty()
    }

    /// Throws away every local edit.
    pub fn cancel(&mut self) {
        self.working = self.snapshot.working_copy();
    }

    /// Sends the pending changes and rebases onto what storage now holds.
    ///
    /// On failure the working copy is left untouched so the user can correct it and retry.
    pub fn commit(&mut self, gateway: &impl MetricsGateway) -> AppResult<CommitOutcome> {
        let change_set = self.change_set();
        if change_set.is_empty() {
            return Ok(CommitOutcome::NoChanges);
        }

        let summary = gateway.apply_changes(self.use_case_id, &change_set)?;
        let bundle = gateway.fetch_metrics(self.use_case_id)?;
        self.snapshot = EditSnapshot::capture(&bundle, &self.reference);
        self.working = self.snapshot.working_copy();
        Ok(CommitOutcome::Applied(summary))
    }

    fn take_temp_id(&mut self) -> i64 {
        let id = self.next_temp_id;
        self.next_temp_id -= 1;
        id
    }
}
