//! Wire shape of a metrics change set.
//!
//! Field values stay loosely typed (`serde_json::Value`) on the wire because clients send numbers as
//! strings and vice versa; `validation` coerces them into typed records. Every optional field keeps
//! the difference between "absent" (`None`) and "sent as null" (`Some(Value::Null)`), which is what
//! partial updates hinge on.

use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Deserializer, Serialize};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMetricInput {
    /// Temporary negative id the client gave the row; lets reports in the same batch point at it.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub metric_type_id: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub unit_of_measure_id: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub primary_success_metric_name: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub baseline_value: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub baseline_date: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub target_value: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub target_date: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricPatchInput {
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub metric_type_id: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub unit_of_measure_id: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub primary_success_metric_name: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub baseline_value: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub baseline_date: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub target_value: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub target_date: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReportedMetricInput {
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub metric_id: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub reported_value: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub reported_date: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedMetricPatchInput {
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub reported_value: Option<Value>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub reported_date: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub new_metrics: Vec<NewMetricInput>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub update_metrics: Vec<MetricPatchInput>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub delete_metric_ids: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub new_reported_metrics: Vec<NewReportedMetricInput>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub update_reported_metrics: Vec<ReportedMetricPatchInput>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub delete_reported_metric_ids: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub editor_email: Option<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.new_metrics.is_empty()
            && self.update_metrics.is_empty()
            && self.delete_metric_ids.is_empty()
            && self.new_reported_metrics.is_empty()
            && self.update_reported_metrics.is_empty()
            && self.delete_reported_metric_ids.is_empty()
    }

    pub fn operation_count(&self) -> usize {
        self.new_metrics.len()
            + self.update_metrics.len()
            + self.delete_metric_ids.len()
            + self.new_reported_metrics.len()
            + self.update_reported_metrics.len()
            + self.delete_reported_metric_ids.len()
    }

    /// Trimmed editor identity; blank counts as absent.
    pub fn editor(&self) -> Option<&str> {
        self.editor_email
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Decodes a request body, rejecting anything whose shape is wrong before any row is looked at.
    pub fn from_json(body: Value) -> AppResult<Self> {
        let Value::Object(mut body) = body else {
            return Err(AppError::ClientInput("request body must be a JSON object".to_string()));
        };

        let editor_email = match body.remove("editorEmail") {
            None | Some(Value::Null) => None,
            Some(Value::String(value)) => Some(value),
            Some(_) => {
                return Err(AppError::ClientInput("editorEmail must be a string".to_string()));
            }
        };

        Ok(Self {
            new_metrics: take_objects(&mut body, "newMetrics")?,
            update_metrics: take_objects(&mut body, "updateMetrics")?,
            delete_metric_ids: take_array(&mut body, "deleteMetricIds")?,
            new_reported_metrics: take_objects(&mut body, "newReportedMetrics")?,
            update_reported_metrics: take_objects(&mut body, "updateReportedMetrics")?,
            delete_reported_metric_ids: take_array(&mut body, "deleteReportedMetricIds")?,
            editor_email,
        })
    }
}

fn take_array(body: &mut Map<String, Value>, key: &str) -> AppResult<Vec<Value>> {
    match body.remove(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(AppError::ClientInput(format!("{} must be an array", key))),
    }
}

fn take_objects<T: DeserializeOwned>(body: &mut Map<String, Value>, key: &str) -> AppResult<Vec<T>> {
    take_array(body, key)?
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            if !item.is_object() {
                return Err(AppError::ClientInput(format!("{}[{}] must be an object", key, index)));
            }
            serde_json::from_value(item)
                .map_err(|error| AppError::ClientInput(format!("{}[{}]: {}", key, index, error)))
        })
        .collect()
}

fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::ChangeSet;
    use crate::errors::AppError;
    use serde_json::{json, Value};

    #[test]
    fn absent_and_null_fields_stay_distinct() {
        let change_set = ChangeSet::from_json(json!({
            "updateReportedMetrics": [{ "id": 7, "reportedValue": "42" }],
            "updateMetrics": [{ "id": "3", "targetDate": null }]
        }))
        .expect("decode");

        let report = &change_set.update_reported_metrics[0];
        assert_eq!(report.reported_value, Some(json!("42")));
        assert_eq!(report.reported_date, None);

        let metric = &change_set.update_metrics[0];
        assert_eq!(metric.target_date, Some(Value::Null));
        assert_eq!(metric.baseline_date, None);
    }

    #[test]
    fn rejects_non_array_lists() {
        let error = ChangeSet::from_json(json!({ "deleteMetricIds": 3 })).expect_err("shape error");
        assert!(matches!(error, AppError::ClientInput(message) if message.contains("deleteMetricIds")));

        let error = ChangeSet::from_json(json!({ "newMetrics": [1] })).expect_err("shape error");
        assert!(matches!(error, AppError::ClientInput(message) if message.contains("newMetrics[0]")));

        let error = ChangeSet::from_json(json!([])).expect_err("shape error");
        assert!(matches!(error, AppError::ClientInput(_)));
    }

    #[test]
    fn empty_lists_and_blank_editor() {
        let change_set = ChangeSet::from_json(json!({
            "newMetrics": [],
            "updateMetrics": null,
            "editorEmail": "   "
        }))
        .expect("decode");
        assert!(change_set.is_empty());
        assert_eq!(change_set.editor(), None);
    }

    #[test]
    fn serializes_only_non_empty_lists() {
        let change_set = ChangeSet {
            delete_metric_ids: vec![json!(4)],
            editor_email: Some("editor@example.com".to_string()),
            ..ChangeSet::default()
        };
        let encoded = serde_json::to_value(&change_set).expect("encode");
        assert_eq!(
            encoded,
            json!({ "deleteMetricIds": [4], "editorEmail": "editor@example.com" })
        );
    }
}
