use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ─── Persisted rows ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub id: i64,
    pub use_case_id: i64,
    pub metric_type_id: Option<i64>,
    pub unit_of_measure_id: Option<i64>,
    pub primary_success_metric_name: String,
    pub baseline_value: Option<String>,
    pub baseline_date: Option<String>,
    pub target_value: Option<String>,
    pub target_date: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub editor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedMetric {
    pub id: i64,
    pub use_case_id: i64,
    pub metric_id: i64,
    pub reported_value: Option<String>,
    pub reported_date: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub editor: Option<String>,
}

/// Everything stored for one use case: metric definitions plus every report row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsBundle {
    pub metrics: Vec<Metric>,
    pub reported_metrics: Vec<ReportedMetric>,
}

// ─── Reference data ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricType {
    pub id: i64,
    pub category: String,
    pub description: Option<String>,
    pub default_unit_of_measure_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitOfMeasure {
    pub id: i64,
    pub name: String,
    pub measure_type: Option<String>,
}

/// Id ↔ label lookups for the two reference tables a metric points at.
#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    metric_types: BTreeMap<i64, String>,
    units: BTreeMap<i64, String>,
}

impl ReferenceData {
    pub fn new(metric_types: &[MetricType], units: &[UnitOfMeasure]) -> Self {
        Self {
            metric_types: metric_types
                .iter()
                .map(|item| (item.id, item.category.clone()))
                .collect(),
            units: units.iter().map(|item| (item.id, item.name.clone())).collect(),
        }
    }

    pub fn metric_type_label(&self, id: Option<i64>) -> String {
        id.and_then(|id| self.metric_types.get(&id).cloned())
            .unwrap_or_default()
    }

    pub fn unit_label(&self, id: Option<i64>) -> String {
        id.and_then(|id| self.units.get(&id).cloned()).unwrap_or_default()
    }

    pub fn metric_type_id(&self, label: &str) -> Option<i64> {
        find_by_label(&self.metric_types, label)
    }

    pub fn unit_id(&self, label: &str) -> Option<i64> {
        find_by_label(&self.units, label)
    }
}

fn find_by_label(map: &BTreeMap<i64, String>, label: &str) -> Option<i64> {
    let label = label.trim();
    if label.is_empty() {
        return None;
    }
    map.iter()
        .find(|(_, candidate)| candidate.trim() == label)
        .map(|(id, _)| *id)
}

// ─── Identity ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityMode {
    /// The store assigns the id on insert.
    Generated,
    /// The caller reserves `MAX(id) + 1` under the write lock.
    Sequential,
}

impl IdentityMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generated => "generated",
            Self::Sequential => "sequential",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableIdentity {
    pub metrics: IdentityMode,
    pub reported_metrics: IdentityMode,
}

// ─── Responses ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplySummary {
    pub metrics_inserted: usize,
    pub metrics_updated: usize,
    pub metrics_deleted: usize,
    pub reports_inserted: usize,
    pub reports_updated: usize,
    pub reports_deleted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingItems<T> {
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}
