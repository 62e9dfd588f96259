//! Snapshot differencing for the metrics editor.
//!
//! Pure functions only: given the snapshot captured when editing began and the editor's working
//! copy, produce the change set that turns one into the other.

use crate::changeset::{ChangeSet, MetricPatchInput, NewMetricInput, NewReportedMetricInput, ReportedMetricPatchInput};
use crate::models::{MetricsBundle, ReferenceData, ReportedMetric};
use crate::validation::parse_stored_date;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

/// A metric as the editor sees it: reference ids shown as labels, values as typed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricDraft {
    pub id: i64,
    pub metric_type: String,
    pub unit_of_measure: String,
    pub name: String,
    pub baseline_value: String,
    pub baseline_date: String,
    pub target_value: String,
    pub target_date: String,
}

/// The latest report of one metric, keyed by the metric rather than by the report row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportDraft {
    pub metric_id: i64,
    pub reported_value: String,
    pub reported_date: String,
}

impl ReportDraft {
    pub fn is_blank(&self) -> bool {
        self.reported_value.trim().is_empty() && self.reported_date.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingCopy {
    pub metrics: Vec<MetricDraft>,
    pub reports: Vec<ReportDraft>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditSnapshot {
    pub metrics: Vec<MetricDraft>,
    pub reports: Vec<ReportDraft>,
    /// Every stored report row; needed to map a metric's latest report back to its row id.
    pub report_rows: Vec<ReportedMetric>,
}

impl EditSnapshot {
    /// Flattens a fetched bundle to one draft per metric plus one report draft per metric with a report.
    pub fn capture(bundle: &MetricsBundle, reference: &ReferenceData) -> Self {
        let latest = latest_reports(&bundle.reported_metrics);
        let metrics = bundle
            .metrics
            .iter()
            .map(|metric| MetricDraft {
                id: metric.id,
                metric_type: reference.metric_type_label(metric.metric_type_id),
                unit_of_measure: reference.unit_label(metric.unit_of_measure_id),
                name: metric.primary_success_metric_name.clone(),
                baseline_value: metric.baseline_value.clone().unwrap_or_default(),
                baseline_date: format_metric_date(metric.baseline_date.as_deref()),
                target_value: metric.target_value.clone().unwrap_or_default(),
                target_date: format_metric_date(metric.target_date.as_deref()),
            })
            .collect::<Vec<_>>();
        let reports = metrics
            .iter()
            .filter_map(|metric| latest.get(&metric.id))
            .map(|report| ReportDraft {
                metric_id: report.metric_id,
                reported_value: report.reported_value.clone().unwrap_or_default(),
                reported_date: format_metric_date(report.reported_date.as_deref()),
            })
            .collect();

        Self {
            metrics,
            reports,
            report_rows: bundle.reported_metrics.clone(),
        }
    }

    pub fn working_copy(&self) -> WorkingCopy {
        WorkingCopy {
            metrics: self.metrics.clone(),
            reports: self.reports.clone(),
        }
    }
}

/// Most recent report row per metric id.
///
/// Ordered by reported date, then by the later of `modified`/`created`, then by row id, so rows with
/// unreadable dates still resolve the same way every time.
pub fn latest_reports(rows: &[ReportedMetric]) -> HashMap<i64, &ReportedMetric> {
    let mut latest: HashMap<i64, &ReportedMetric> = HashMap::new();
    for row in rows {
        match latest.get(&row.metric_id) {
            Some(current) if recency_key(current) >= recency_key(row) => {}
            _ => {
                latest.insert(row.metric_id, row);
            }
        }
    }
    latest
}

pub fn latest_report_ids(rows: &[ReportedMetric]) -> HashMap<i64, i64> {
    latest_reports(rows)
        .into_iter()
        .map(|(metric_id, row)| (metric_id, row.id))
        .collect()
}

fn recency_key(row: &ReportedMetric) -> (Option<NaiveDate>, Option<DateTime<Utc>>, i64) {
    let reported = row.reported_date.as_deref().and_then(parse_stored_date);
    (reported, row.modified.max(row.created), row.id)
}

/// Stored dates may carry a time part; the editor only deals in `YYYY-MM-DD`.
pub fn format_metric_date(raw: Option<&str>) -> String {
    let Some(raw) = raw.map(str::trim) else {
        return String::new();
    };
    match parse_stored_date(raw) {
        Some(date) => date.format("%Y-%m-%d").to_string(),
        None => raw.to_string(),
    }
}

/// Computes the change set that turns `snapshot` into `current`.
pub fn diff(snapshot: &EditSnapshot, current: &WorkingCopy, reference: &ReferenceData) -> ChangeSet {
    let snapshot_metrics: HashMap<i64, &MetricDraft> =
        snapshot.metrics.iter().map(|metric| (metric.id, metric)).collect();
    let current_metric_ids: HashSet<i64> = current.metrics.iter().map(|metric| metric.id).collect();

    let mut change_set = ChangeSet::default();

    change_set.delete_metric_ids = snapshot
        .metrics
        .iter()
        .filter(|metric| !current_metric_ids.contains(&metric.id))
        .map(|metric| json!(metric.id))
        .collect();

    for metric in &current.metrics {
        match snapshot_metrics.get(&metric.id) {
            None => change_set.new_metrics.push(new_metric(metric, reference)),
            Some(previous) => {
                if let Some(patch) = metric_patch(previous, metric, reference) {
                    change_set.update_metrics.push(patch);
                }
            }
        }
    }

    let latest_ids = latest_report_ids(&snapshot.report_rows);
    let snapshot_reports: HashMap<i64, &ReportDraft> =
        snapshot.reports.iter().map(|report| (report.metric_id, report)).collect();
    let current_reports: HashMap<i64, &ReportDraft> =
        current.reports.iter().map(|report| (report.metric_id, report)).collect();

    for previous in &snapshot.reports {
        // Reports of a deleted metric go with it.
        if !current_metric_ids.contains(&previous.metric_id) {
            continue;
        }
        let Some(report_id) = latest_ids.get(&previous.metric_id).copied() else {
            continue;
        };
        match current_reports.get(&previous.metric_id) {
            Some(report) if !report.is_blank() => {
                if let Some(patch) = report_patch(report_id, previous, report) {
                    change_set.update_reported_metrics.push(patch);
                }
            }
            _ => change_set.delete_reported_metric_ids.push(json!(report_id)),
        }
    }

    for report in &current.reports {
        if !current_metric_ids.contains(&report.metric_id) || report.is_blank() {
            continue;
        }
        let already_reported =
            snapshot_reports.contains_key(&report.metric_id) && latest_ids.contains_key(&report.metric_id);
        if !already_reported {
            change_set.new_reported_metrics.push(NewReportedMetricInput {
                metric_id: Some(json!(report.metric_id)),
                reported_value: Some(text_or_null(&report.reported_value)),
                reported_date: Some(text_or_null(&report.reported_date)),
            });
        }
    }

    change_set
}

fn new_metric(metric: &MetricDraft, reference: &ReferenceData) -> NewMetricInput {
    NewMetricInput {
        client_id: (metric.id < 0).then(|| json!(metric.id)),
        metric_type_id: Some(id_or_null(reference.metric_type_id(&metric.metric_type))),
        unit_of_measure_id: Some(id_or_null(reference.unit_id(&metric.unit_of_measure))),
        primary_success_metric_name: Some(json!(metric.name)),
        baseline_value: Some(text_or_null(&metric.baseline_value)),
        baseline_date: Some(text_or_null(&metric.baseline_date)),
        target_value: Some(text_or_null(&metric.target_value)),
        target_date: Some(text_or_null(&metric.target_date)),
    }
}

fn metric_patch(previous: &MetricDraft, metric: &MetricDraft, reference: &ReferenceData) -> Option<MetricPatchInput> {
    let mut patch = MetricPatchInput {
        id: Some(json!(metric.id)),
        ..MetricPatchInput::default()
    };
    let mut changed = false;

    if differs(&previous.name, &metric.name) {
        patch.primary_success_metric_name = Some(json!(metric.name));
        changed = true;
    }
    if differs(&previous.metric_type, &metric.metric_type) {
        patch.metric_type_id = Some(id_or_null(reference.metric_type_id(&metric.metric_type)));
        changed = true;
    }
    if differs(&previous.unit_of_measure, &metric.unit_of_measure) {
        patch.unit_of_measure_id = Some(id_or_null(reference.unit_id(&metric.unit_of_measure)));
        changed = true;
    }
    if differs(&previous.baseline_value, &metric.baseline_value) {
        patch.baseline_value = Some(text_or_null(&metric.baseline_value));
        changed = true;
    }
    if differs(&previous.baseline_date, &metric.baseline_date) {
        patch.baseline_date = Some(text_or_null(&metric.baseline_date));
        changed = true;
    }
    if differs(&previous.target_value, &metric.target_value) {
        patch.target_value = Some(text_or_null(&metric.target_value));
        changed = true;
    }
    if differs(&previous.target_date, &metric.target_date) {
        patch.target_date = Some(text_or_null(&metric.target_date));
        changed = true;
    }

    changed.then_some(patch)
}

fn report_patch(report_id: i64, previous: &ReportDraft, report: &ReportDraft) -> Option<ReportedMetricPatchInput> {
    let mut patch = ReportedMetricPatchInput {
        id: Some(json!(report_id)),
        ..ReportedMetricPatchInput::default()
    };
    let mut changed = false;

    if differs(&previous.reported_value, &report.reported_value) {
        patch.reported_value = Some(text_or_null(&report.reported_value));
        changed = true;
    }
    if differs(&previous.reported_date, &report.reported_date) {
        patch.reported_date = Some(text_or_null(&report.reported_date));
        changed = true;
    }

    changed.then_some(patch)
}

fn differs(before: &str, after: &str) -> bool {
    before.trim() != after.trim()
}

fn text_or_null(value: &str) -> Value {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Value::Null
    } else {
        json!(trimmed)
    }
}

fn id_or_null(id: Option<i64>) -> Value {
    id.map(|id| json!(id)).unwrap_or(Value::Null)
}
