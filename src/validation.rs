use crate::changeset::{ChangeSet, MetricPatchInput, NewMetricInput, NewReportedMetricInput, ReportedMetricPatchInput};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

static CALENDAR_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})$").expect("valid calendar date regex"));

// ─── Typed records ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct NewMetricRecord {
    pub client_id: Option<i64>,
    pub metric_type_id: i64,
    pub unit_of_measure_id: i64,
    pub name: String,
    pub baseline_value: String,
    pub baseline_date: NaiveDate,
    pub target_value: String,
    pub target_date: NaiveDate,
}

/// A partial metric update. `None` means the column is left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricPatch {
    pub id: i64,
    pub metric_type_id: Option<i64>,
    pub unit_of_measure_id: Option<i64>,
    pub name: Option<String>,
    pub baseline_value: Option<String>,
    pub baseline_date: Option<NaiveDate>,
    pub target_value: Option<String>,
    pub target_date: Option<NaiveDate>,
}

impl MetricPatch {
    pub fn touches_dates(&self) -> bool {
        self.baseline_date.is_some() || self.target_date.is_some()
    }
}

/// Which metric a new report belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricRef {
    Stored(i64),
    /// Temporary id of a metric created earlier in the same batch.
    Pending(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewReportRecord {
    pub metric: MetricRef,
    pub reported_value: String,
    pub reported_date: NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportPatch {
    pub id: i64,
    pub reported_value: Option<String>,
    pub reported_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidatedChangeSet {
    pub new_metrics: Vec<NewMetricRecord>,
    pub update_metrics: Vec<MetricPatch>,
    pub delete_metric_ids: Vec<i64>,
    pub new_reports: Vec<NewReportRecord>,
    pub update_reports: Vec<ReportPatch>,
    pub delete_report_ids: Vec<i64>,
    pub editor: Option<String>,
}

impl ValidatedChangeSet {
    /// Ids of stored metrics the batch reads or writes, for ownership and date checks.
    pub fn referenced_metric_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.update_metrics.iter().map(|patch| patch.id).collect();
        ids.extend(self.new_reports.iter().filter_map(|report| match report.metric {
            MetricRef::Stored(id) => Some(id),
            MetricRef::Pending(_) => None,
        }));
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn referenced_report_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.update_reports.iter().map(|patch| patch.id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Result of the request-only pass. Rows that failed are left out of `change_set`.
#[derive(Debug, Clone, Default)]
pub struct Validation {
    pub change_set: ValidatedChangeSet,
    pub errors: Vec<String>,
}

/// Stored state the second pass checks the batch against, read inside the apply transaction.
#[derive(Debug, Clone, Default)]
pub struct StoredView {
    /// Metrics of the use case keyed by id, with their raw stored (baseline, target) dates.
    pub metric_dates: HashMap<i64, (Option<String>, Option<String>)>,
    /// Reports of the use case keyed by id, with the metric each belongs to.
    pub report_metrics: HashMap<i64, i64>,
    pub metric_type_ids: HashSet<i64>,
    pub unit_ids: HashSet<i64>,
}

// ─── Request pass ───────────────────────────────────────────────────────────

/// Checks everything that can be decided from the request alone and collects every failure.
pub fn validate_change_set(change_set: &ChangeSet, today: NaiveDate) -> Validation {
    let mut errors = Vec::new();
    let mut validated = ValidatedChangeSet {
        editor: change_set.editor().map(ToString::to_string),
        ..ValidatedChangeSet::default()
    };

    for (index, input) in change_set.new_metrics.iter().enumerate() {
        let mut row = RowErrors::new(format!("newMetrics[{}]", index));
        if let Some(record) = check_new_metric(input, today, &mut row) {
            validated.new_metrics.push(record);
        }
        row.drain_into(&mut errors);
    }

    let mut client_ids = HashSet::new();
    for (index, record) in validated.new_metrics.iter().enumerate() {
        if let Some(client_id) = record.client_id {
            if !client_ids.insert(client_id) {
                errors.push(format!("newMetrics[{}].clientId: {} is used more than once", index, client_id));
            }
        }
    }

    validated.delete_metric_ids = collect_ids(&change_set.delete_metric_ids, "deleteMetricIds", &mut errors);
    validated.delete_report_ids =
        collect_ids(&change_set.delete_reported_metric_ids, "deleteReportedMetricIds", &mut errors);
    let deleted_metrics: HashSet<i64> = validated.delete_metric_ids.iter().copied().collect();
    let deleted_reports: HashSet<i64> = validated.delete_report_ids.iter().copied().collect();

    let mut patched_metrics = HashSet::new();
    for (index, input) in change_set.update_metrics.iter().enumerate() {
        let mut row = RowErrors::new(format!("updateMetrics[{}]", index));
        if let Some(patch) = check_metric_patch(input, &mut row) {
            if !patched_metrics.insert(patch.id) {
                row.push("id", format!("metric {} is updated more than once", patch.id));
            } else if deleted_metrics.contains(&patch.id) {
                row.push("id", format!("metric {} is both updated and deleted", patch.id));
            } else if row.is_empty() {
                validated.update_metrics.push(patch);
            }
        }
        row.drain_into(&mut errors);
    }

    for (index, input) in change_set.new_reported_metrics.iter().enumerate() {
        let mut row = RowErrors::new(format!("newReportedMetrics[{}]", index));
        if let Some(record) = check_new_report(input, &mut row) {
            match record.metric {
                MetricRef::Pending(client_id) if !client_ids.contains(&client_id) => {
                    row.push("metricId", format!("{} does not match a new metric in this request", client_id));
                }
                MetricRef::Stored(metric_id) if deleted_metrics.contains(&metric_id) => {
                    row.push("metricId", format!("metric {} is deleted in this request", metric_id));
                }
                _ => validated.new_reports.push(record),
            }
        }
        row.drain_into(&mut errors);
    }

    let mut patched_reports = HashSet::new();
    for (index, input) in change_set.update_reported_metrics.iter().enumerate() {
        let mut row = RowErrors::new(format!("updateReportedMetrics[{}]", index));
        if let Some(patch) = check_report_patch(input, &mut row) {
            if !patched_reports.insert(patch.id) {
                row.push("id", format!("report {} is updated more than once", patch.id));
            } else if deleted_reports.contains(&patch.id) {
                row.push("id", format!("report {} is both updated and deleted", patch.id));
            } else if row.is_empty() {
                validated.update_reports.push(patch);
            }
        }
        row.drain_into(&mut errors);
    }

    Validation {
        change_set: validated,
        errors,
    }
}

fn check_new_metric(input: &NewMetricInput, today: NaiveDate, row: &mut RowErrors) -> Option<NewMetricRecord> {
    let client_id = match &input.client_id {
        None | Some(Value::Null) => None,
        Some(raw) => match coerce_id(raw) {
            Some(id) if id < 0 => Some(id),
            _ => {
                row.push("clientId", "must be a negative temporary id");
                None
            }
        },
    };
    let metric_type_id = required_id(input.metric_type_id.as_ref(), "metricTypeId", row);
    let unit_of_measure_id = required_id(input.unit_of_measure_id.as_ref(), "unitOfMeasureId", row);
    let name = required_name(input.primary_success_metric_name.as_ref(), row);
    let baseline_value = required_value(input.baseline_value.as_ref(), "baselineValue", row);
    let baseline_date = required_date(input.baseline_date.as_ref(), "baselineDate", row);
    let target_value = required_value(input.target_value.as_ref(), "targetValue", row);
    let target_date = required_date(input.target_date.as_ref(), "targetDate", row);

    if let (Some(baseline), Some(target)) = (baseline_date, target_date) {
        check_date_order(Some(baseline), target, today, row);
    }
    if !row.is_empty() {
        return None;
    }

    Some(NewMetricRecord {
        client_id,
        metric_type_id: metric_type_id?,
        unit_of_measure_id: unit_of_measure_id?,
        name: name?,
        baseline_value: baseline_value?,
        baseline_date: baseline_date?,
        target_value: target_value?,
        target_date: target_date?,
    })
}

fn check_metric_patch(input: &MetricPatchInput, row: &mut RowErrors) -> Option<MetricPatch> {
    let id = required_id(input.id.as_ref(), "id", row);
    if let Some(id) = id {
        row.set_id(id);
    }
    let patch = MetricPatch {
        id: id.unwrap_or_default(),
        metric_type_id: input
            .metric_type_id
            .as_ref()
            .and_then(|raw| required_id(Some(raw), "metricTypeId", row)),
        unit_of_measure_id: input
            .unit_of_measure_id
            .as_ref()
            .and_then(|raw| required_id(Some(raw), "unitOfMeasureId", row)),
        name: input
            .primary_success_metric_name
            .as_ref()
            .and_then(|raw| required_name(Some(raw), row)),
        baseline_value: input
            .baseline_value
            .as_ref()
            .and_then(|raw| required_value(Some(raw), "baselineValue", row)),
        baseline_date: input
            .baseline_date
            .as_ref()
            .and_then(|raw| required_date(Some(raw), "baselineDate", row)),
        target_value: input
            .target_value
            .as_ref()
            .and_then(|raw| required_value(Some(raw), "targetValue", row)),
        target_date: input
            .target_date
            .as_ref()
            .and_then(|raw| required_date(Some(raw), "targetDate", row)),
    };
    id.map(|_| patch)
}

fn check_new_report(input: &NewReportedMetricInput, row: &mut RowErrors) -> Option<NewReportRecord> {
    let metric_id = required_id(input.metric_id.as_ref(), "metricId", row);
    let reported_value = required_value(input.reported_value.as_ref(), "reportedValue", row);
    let reported_date = required_date(input.reported_date.as_ref(), "reportedDate", row);

    let metric_id = metric_id?;
    let metric = if metric_id < 0 {
        MetricRef::Pending(metric_id)
    } else {
        MetricRef::Stored(metric_id)
    };
    Some(NewReportRecord {
        metric,
        reported_value: reported_value?,
        reported_date: reported_date?,
    })
}

fn check_report_patch(input: &ReportedMetricPatchInput, row: &mut RowErrors) -> Option<ReportPatch> {
    let id = required_id(input.id.as_ref(), "id", row);
    if let Some(id) = id {
        row.set_id(id);
    }
    let patch = ReportPatch {
        id: id.unwrap_or_default(),
        reported_value: input
            .reported_value
            .as_ref()
            .and_then(|raw| required_value(Some(raw), "reportedValue", row)),
        reported_date: input
            .reported_date
            .as_ref()
            .and_then(|raw| required_date(Some(raw), "reportedDate", row)),
    };
    id.map(|_| patch)
}

fn collect_ids(raw: &[Value], list: &str, errors: &mut Vec<String>) -> Vec<i64> {
    let mut ids = Vec::with_capacity(raw.len());
    for (index, value) in raw.iter().enumerate() {
        match coerce_id(value) {
            Some(id) => {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            None => errors.push(format!("{}[{}]: must be a numeric id", list, index)),
        }
    }
    ids
}

// ─── Store pass ─────────────────────────────────────────────────────────────

/// Checks the surviving rows against stored state: ownership, reference ids and the date ordering
/// for updates that change only one of the two dates.
pub fn validate_against_store(change_set: &ValidatedChangeSet, stored: &StoredView, today: NaiveDate) -> Vec<String> {
    let mut errors = Vec::new();

    for (index, record) in change_set.new_metrics.iter().enumerate() {
        let mut row = RowErrors::new(format!("newMetrics[{}]", index));
        check_reference(record.metric_type_id, &stored.metric_type_ids, "metricTypeId", &mut row);
        check_reference(record.unit_of_measure_id, &stored.unit_ids, "unitOfMeasureId", &mut row);
        row.drain_into(&mut errors);
    }

    for (index, patch) in change_set.update_metrics.iter().enumerate() {
        let mut row = RowErrors::new(format!("updateMetrics[{}]", index));
        row.set_id(patch.id);
        let Some((stored_baseline, stored_target)) = stored.metric_dates.get(&patch.id) else {
            row.push("id", format!("metric {} does not belong to this use case", patch.id));
            row.drain_into(&mut errors);
            continue;
        };
        if let Some(id) = patch.metric_type_id {
            check_reference(id, &stored.metric_type_ids, "metricTypeId", &mut row);
        }
        if let Some(id) = patch.unit_of_measure_id {
            check_reference(id, &stored.unit_ids, "unitOfMeasureId", &mut row);
        }
        if patch.touches_dates() {
            let baseline = match patch.baseline_date {
                Some(date) => Some(date),
                None => stored_date(stored_baseline.as_deref(), "baselineDate", &mut row),
            };
            let target = match patch.target_date {
                Some(date) => Some(date),
                None => stored_date(stored_target.as_deref(), "targetDate", &mut row),
            };
            if let Some(target) = target {
                check_date_order(baseline, target, today, &mut row);
            }
        }
        row.drain_into(&mut errors);
    }

    for (index, record) in change_set.new_reports.iter().enumerate() {
        if let MetricRef::Stored(metric_id) = record.metric {
            if !stored.metric_dates.contains_key(&metric_id) {
                errors.push(format!(
                    "newReportedMetrics[{}].metricId: metric {} does not belong to this use case",
                    index, metric_id
                ));
            }
        }
    }

    let deleted_metrics: HashSet<i64> = change_set.delete_metric_ids.iter().copied().collect();
    for (index, patch) in change_set.update_reports.iter().enumerate() {
        let mut row = RowErrors::new(format!("updateReportedMetrics[{}]", index));
        row.set_id(patch.id);
        match stored.report_metrics.get(&patch.id) {
            None => row.push("id", format!("report {} does not belong to this use case", patch.id)),
            Some(metric_id) if deleted_metrics.contains(metric_id) => row.push(
                "id",
                format!("report {} belongs to metric {}, which is deleted in this request", patch.id, metric_id),
            ),
            Some(_) => {}
        }
        row.drain_into(&mut errors);
    }

    errors
}

fn check_reference(id: i64, known: &HashSet<i64>, field: &str, row: &mut RowErrors) {
    if !known.contains(&id) {
        row.push(field, format!("unknown id {}", id));
    }
}

/// The stored half of a date pair the patch leaves alone; it still has to be a usable date.
fn stored_date(raw: Option<&str>, field: &str, row: &mut RowErrors) -> Option<NaiveDate> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        row.push(field, "is required; the stored value is empty");
        return None;
    };
    let date = parse_stored_date(raw);
    if date.is_none() {
        row.push(field, format!("stored value '{}' is not a valid YYYY-MM-DD date", raw));
    }
    date
}

fn check_date_order(baseline: Option<NaiveDate>, target: NaiveDate, today: NaiveDate, row: &mut RowErrors) {
    if let Some(baseline) = baseline {
        if target <= baseline {
            row.push("targetDate", "must be after baselineDate");
        }
    }
    if target <= today {
        row.push("targetDate", "must be after today");
    }
}

// ─── Coercion ───────────────────────────────────────────────────────────────

/// Accepts only `YYYY-MM-DD` naming a real calendar day.
pub fn parse_calendar_date(raw: &str) -> Option<NaiveDate> {
    let captures = CALENDAR_DATE.captures(raw.trim())?;
    let year = captures[1].parse::<i32>().ok()?;
    let month = captures[2].parse::<u32>().ok()?;
    let day = captures[3].parse::<u32>().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Dates read back from storage may carry a time part after the calendar day.
pub fn parse_stored_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    let day = raw.get(..10)?;
    let rest = raw.get(10..)?;
    if !(rest.is_empty() || rest.starts_with('T') || rest.starts_with(' ')) {
        return None;
    }
    parse_calendar_date(day)
}

/// Integer id from a JSON number or numeric string.
pub fn coerce_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.is_finite() && float.fract() == 0.0 && float.abs() < i64::MAX as f64)
                .map(|float| float as i64)
        }),
        Value::String(text) => {
            let text = text.trim();
            text.parse::<i64>().ok().or_else(|| {
                text.parse::<f64>()
                    .ok()
                    .filter(|float| float.is_finite() && float.fract() == 0.0 && float.abs() < i64::MAX as f64)
                    .map(|float| float as i64)
            })
        }
        _ => None,
    }
}

/// Non-blank text or a number, normalised to the text that gets stored.
pub fn coerce_value(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn required_id(raw: Option<&Value>, field: &str, row: &mut RowErrors) -> Option<i64> {
    let id = raw.and_then(coerce_id);
    if id.is_none() {
        row.push(field, "must be a numeric id");
    }
    id
}

fn required_name(raw: Option<&Value>, row: &mut RowErrors) -> Option<String> {
    let name = match raw {
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.trim().to_string()),
        _ => None,
    };
    if name.is_none() {
        row.push("primarySuccessMetricName", "is required");
    }
    name
}

fn required_value(raw: Option<&Value>, field: &str, row: &mut RowErrors) -> Option<String> {
    let value = raw.and_then(coerce_value);
    if value.is_none() {
        row.push(field, "is required");
    }
    value
}

fn required_date(raw: Option<&Value>, field: &str, row: &mut RowErrors) -> Option<NaiveDate> {
    match raw {
        None | Some(Value::Null) => {
            row.push(field, "is required");
            None
        }
        Some(Value::String(text)) if text.trim().is_empty() => {
            row.push(field, "is required");
            None
        }
        Some(Value::String(text)) => {
            let date = parse_calendar_date(text);
            if date.is_none() {
                row.push(field, format!("'{}' is not a valid YYYY-MM-DD date", text.trim()));
            }
            date
        }
        Some(_) => {
            row.push(field, "must be a YYYY-MM-DD string");
            None
        }
    }
}

struct RowErrors {
    label: String,
    id: Option<i64>,
    messages: Vec<String>,
}

impl RowErrors {
    fn new(label: String) -> Self {
        Self {
            label,
            id: None,
            messages: Vec::new(),
        }
    }

    fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    fn push(&mut self, field: &str, message: impl Into<String>) {
        let prefix = match self.id {
            Some(id) => format!("{} id={}", self.label, id),
            None => self.label.clone(),
        };
        self.messages.push(format!("{}.{}: {}", prefix, field, message.into()));
    }

    fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn drain_into(&mut self, errors: &mut Vec<String>) {
        errors.append(&mut self.messages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 15).expect("valid date")
    }

    fn decode(body: Value) -> ChangeSet {
        ChangeSet::from_json(body).expect("decode change set")
    }

    fn complete_metric(baseline_date: &str, target_date: &str) -> Value {
        json!({
            "metricTypeId": 1,
            "unitOfMeasureId": "2",
            "primarySuccessMetricName": "Hours saved",
            "baselineValue": 10,
            "baselineDate": baseline_date,
            "targetValue": "40",
            "targetDate": target_date
        })
    }

    #[test]
    fn accepts_complete_metric_with_future_target() {
        let validation = validate_change_set(&decode(json!({ "newMetrics": [complete_metric("2025-01-01", "2030-01-01")] })), today());
        assert!(validation.errors.is_empty(), "{:?}", validation.errors);
        let record = &validation.change_set.new_metrics[0];
        assert_eq!(record.unit_of_measure_id, 2);
        assert_eq!(record.baseline_value, "10");
        assert_eq!(record.target_date, NaiveDate::from_ymd_opt(2030, 1, 1).expect("date"));
    }

    #[test]
    fn rejects_target_before_baseline() {
        let validation = validate_change_set(&decode(json!({ "newMetrics": [complete_metric("2025-01-10", "2025-01-05")] })), today());
        assert!(validation.errors.iter().any(|error| error.contains("must be after baselineDate")));
        assert!(validation.change_set.new_metrics.is_empty());
    }

    #[test]
    fn rejects_target_today_or_in_the_past() {
        let validation = validate_change_set(&decode(json!({ "newMetrics": [complete_metric("2025-01-01", "2026-03-15")] })), today());
        assert_eq!(validation.errors, vec!["newMetrics[0].targetDate: must be after today".to_string()]);
    }

    #[test]
    fn rejects_impossible_calendar_dates() {
        assert_eq!(parse_calendar_date("2024-02-30"), None);
        assert_eq!(parse_calendar_date("2024-2-3"), None);
        assert_eq!(parse_calendar_date("2024-02-29T00:00:00"), None);
        assert_eq!(parse_calendar_date("2024-02-29"), NaiveDate::from_ymd_opt(2024, 2, 29));

        let validation = validate_change_set(&decode(json!({ "newMetrics": [complete_metric("2024-02-30", "2030-01-01")] })), today());
        assert_eq!(
            validation.errors,
            vec!["newMetrics[0].baselineDate: '2024-02-30' is not a valid YYYY-MM-DD date".to_string()]
        );
    }

    #[test]
    fn collects_every_failure_across_rows() {
        let validation = validate_change_set(
            &decode(json!({
                "newMetrics": [
                    { "metricTypeId": "abc", "primarySuccessMetricName": "  " },
                    complete_metric("2025-01-01", "2030-01-01")
                ],
                "newReportedMetrics": [{ "metricId": 4, "reportedValue": "" }],
                "deleteMetricIds": ["x"]
            })),
            today(),
        );

        let first_row = validation
            .errors
            .iter()
            .filter(|error| error.starts_with("newMetrics[0]"))
            .count();
        assert_eq!(first_row, 7);
        assert!(validation.errors.iter().any(|error| error == "newReportedMetrics[0].reportedValue: is required"));
        assert!(validation.errors.iter().any(|error| error == "newReportedMetrics[0].reportedDate: is required"));
        assert!(validation.errors.iter().any(|error| error == "deleteMetricIds[0]: must be a numeric id"));
        assert_eq!(validation.change_set.new_metrics.len(), 1);
    }

    #[test]
    fn patch_validates_only_present_fields() {
        let validation = validate_change_set(
            &decode(json!({ "updateReportedMetrics": [{ "id": 7, "reportedValue": "42" }] })),
            today(),
        );
        assert!(validation.errors.is_empty());
        assert_eq!(
            validation.change_set.update_reports,
            vec![ReportPatch {
                id: 7,
                reported_value: Some("42".to_string()),
                reported_date: None,
            }]
        );

        let validation = validate_change_set(
            &decode(json!({ "updateMetrics": [{ "id": 3, "baselineValue": null }] })),
            today(),
        );
        assert_eq!(validation.errors, vec!["updateMetrics[0] id=3.baselineValue: is required".to_string()]);
        assert!(validation.change_set.update_metrics.is_empty());
    }

    #[test]
    fn flags_conflicting_operations_in_one_batch() {
        let validation = validate_change_set(
            &decode(json!({
                "updateMetrics": [{ "id": 3, "primarySuccessMetricName": "Renamed" }],
                "deleteMetricIds": [3],
                "newReportedMetrics": [
                    { "metricId": 3, "reportedValue": 1, "reportedDate": "2026-01-01" },
                    { "metricId": -5, "reportedValue": 1, "reportedDate": "2026-01-01" }
                ]
            })),
            today(),
        );
        assert_eq!(validation.errors.len(), 3, "{:?}", validation.errors);
        assert!(validation.errors[0].contains("both updated and deleted"));
        assert!(validation.errors[1].contains("deleted in this request"));
        assert!(validation.errors[2].contains("does not match a new metric"));
    }

    #[test]
    fn pending_reports_link_to_new_metrics() {
        let mut metric = complete_metric("2025-01-01", "2030-01-01");
        metric["clientId"] = json!(-17);
        let validation = validate_change_set(
            &decode(json!({
                "newMetrics": [metric],
                "newReportedMetrics": [{ "metricId": "-17", "reportedValue": 12.5, "reportedDate": "2026-02-01" }]
            })),
            today(),
        );
        assert!(validation.errors.is_empty(), "{:?}", validation.errors);
        assert_eq!(validation.change_set.new_reports[0].metric, MetricRef::Pending(-17));
        assert_eq!(validation.change_set.new_reports[0].reported_value, "12.5");
    }

    #[test]
    fn single_date_update_is_checked_against_stored_sibling() {
        let validation = validate_change_set(
            &decode(json!({
                "updateMetrics": [
                    { "id": 3, "targetDate": "2028-01-01" },
                    { "id": 4, "baselineDate": "2031-01-01" },
                    { "id": 9, "targetValue": "3" }
                ],
                "updateReportedMetrics": [{ "id": 70, "reportedDate": "2026-01-01" }]
            })),
            today(),
        );
        assert!(validation.errors.is_empty());

        let mut stored = StoredView::default();
        stored
            .metric_dates
            .insert(3, (Some("2029-06-01".to_string()), Some("2030-01-01".to_string())));
        stored
            .metric_dates
            .insert(4, (Some("2025-01-01".to_string()), Some("2030-01-01".to_string())));

        let errors = validate_against_store(&validation.change_set, &stored, today());
        assert_eq!(
            errors,
            vec![
                "updateMetrics[0] id=3.targetDate: must be after baselineDate".to_string(),
                "updateMetrics[1] id=4.targetDate: must be after baselineDate".to_string(),
                "updateMetrics[2] id=9.id: metric 9 does not belong to this use case".to_string(),
                "updateReportedMetrics[0] id=70.id: report 70 does not belong to this use case".to_string(),
            ]
        );
    }

    #[test]
    fn stored_sibling_dates_with_time_or_missing_still_gate_the_patch() {
        let validation = validate_change_set(
            &decode(json!({
                "updateMetrics": [
                    { "id": 5, "baselineDate": "2028-06-01" },
                    { "id": 6, "baselineDate": "2028-06-01" },
                    { "id": 7, "targetDate": "2029-01-01" }
                ]
            })),
            today(),
        );
        assert!(validation.errors.is_empty());

        let mut stored = StoredView::default();
        stored
            .metric_dates
            .insert(5, (Some("2025-01-01".to_string()), Some("2027-01-01T00:00:00".to_string())));
        stored.metric_dates.insert(6, (Some("2025-01-01".to_string()), None));
        stored
            .metric_dates
            .insert(7, (Some("01/02/2025".to_string()), Some("2030-01-01".to_string())));

        let errors = validate_against_store(&validation.change_set, &stored, today());
        assert_eq!(
            errors,
            vec![
                "updateMetrics[0] id=5.targetDate: must be after baselineDate".to_string(),
                "updateMetrics[1] id=6.targetDate: is required; the stored value is empty".to_string(),
                "updateMetrics[2] id=7.baselineDate: stored value '01/02/2025' is not a valid YYYY-MM-DD date"
                    .to_string(),
            ]
        );
    }

    #[test]
    fn stored_dates_accept_a_trailing_time_only() {
        let day = NaiveDate::from_ymd_opt(2027, 1, 1).expect("date");
        assert_eq!(parse_stored_date("2027-01-01"), Some(day));
        assert_eq!(parse_stored_date("2027-01-01T00:00:00"), Some(day));
        assert_eq!(parse_stored_date("2027-01-01 08:30:00"), Some(day));
        assert_eq!(parse_stored_date("2027-01-012"), None);
        assert_eq!(parse_stored_date("2027-02-30T00:00:00"), None);
        assert_eq!(parse_stored_date("2027"), None);
    }

    #[test]
    fn report_update_under_a_deleted_metric_is_a_conflict() {
        let validation = validate_change_set(
            &decode(json!({
                "deleteMetricIds": [3],
                "updateReportedMetrics": [{ "id": 30, "reportedValue": "5" }, { "id": 40, "reportedValue": "6" }]
            })),
            today(),
        );
        assert!(validation.errors.is_empty());

        let mut stored = StoredView::default();
        stored.report_metrics.insert(30, 3);
        stored.report_metrics.insert(40, 4);
        let errors = validate_against_store(&validation.change_set, &stored, today());
        assert_eq!(
            errors,
            vec!["updateReportedMetrics[0] id=30.id: report 30 belongs to metric 3, which is deleted in this request"
                .to_string()]
        );
    }

    #[test]
    fn unknown_reference_ids_are_rejected() {
        let validation = validate_change_set(
            &decode(json!({ "newMetrics": [complete_metric("2025-01-01", "2030-01-01")] })),
            today(),
        );
        let mut stored = StoredView::default();
        stored.metric_type_ids.insert(1);
        let errors = validate_against_store(&validation.change_set, &stored, today());
        assert_eq!(errors, vec!["newMetrics[0].unitOfMeasureId: unknown id 2".to_string()]);
    }

    #[test]
    fn coerces_ids_and_values() {
        assert_eq!(coerce_id(&json!(" 12 ")), Some(12));
        assert_eq!(coerce_id(&json!(7.0)), Some(7));
        assert_eq!(coerce_id(&json!(7.5)), None);
        assert_eq!(coerce_id(&json!(true)), None);
        assert_eq!(coerce_value(&json!(0)), Some("0".to_string()));
        assert_eq!(coerce_value(&json!("  ")), None);
        assert_eq!(coerce_value(&Value::Null), None);
    }
}
