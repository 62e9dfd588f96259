mod apply;

pub use apply::{ApplyPhase, ApplyTracker};

use crate::errors::{AppError, AppResult};
use crate::models::{IdentityMode, Metric, MetricType, MetricsBundle, ReportedMetric, TableIdentity, UnitOfMeasure};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const DEFAULT_METRIC_TYPES: &[(i64, &str, &str, i64)] = &[
    (1, "Productivity", "Time or effort saved by the use case", 1),
    (2, "Cost Savings", "Spend avoided or reduced", 2),
    (3, "Revenue Growth", "Incremental revenue attributed to the use case", 2),
    (4, "Quality", "Error, defect or rework reduction", 3),
    (5, "Customer Experience", "Satisfaction or response-time improvement", 5),
    (6, "Risk Reduction", "Compliance or incident exposure reduced", 4),
];

const DEFAULT_UNITS: &[(i64, &str, &str)] = &[
    (1, "Hours", "duration"),
    (2, "USD", "currency"),
    (3, "Percent", "ratio"),
    (4, "Count", "quantity"),
    (5, "Score", "index"),
    (6, "Days", "duration"),
];

#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub busy_timeout: Duration,
    pub metrics_identity: Option<IdentityMode>,
    pub reported_metrics_identity: Option<IdentityMode>,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5_000),
            metrics_identity: None,
            reported_metrics_identity: None,
        }
    }
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    identity: TableIdentity,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        Self::open(path, &DatabaseOptions::default())
    }

    pub fn open(path: &Path, options: &DatabaseOptions) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.busy_timeout(options.busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        // Resolved once per process; the schema doesn't change underneath a running service.
        let identity = TableIdentity {
            metrics: match options.metrics_identity {
                Some(mode) => mode,
                None => detect_identity_mode(&conn, "metrics")?,
            },
            reported_metrics: match options.reported_metrics_identity {
                Some(mode) => mode,
                None => detect_identity_mode(&conn, "reported_metrics")?,
            },
        };
        tracing::info!(
            path = %path.display(),
            metrics_identity = identity.metrics.as_str(),
            reported_metrics_identity = identity.reported_metrics.as_str(),
            "opened metrics database"
        );

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
            identity,
        };
        db.seed_reference_data()?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn identity(&self) -> TableIdentity {
        self.identity
    }

    pub fn get_use_case_metrics(&self, use_case_id: i64) -> AppResult<MetricsBundle> {
        let conn = self.lock()?;

        let mut metric_stmt = conn.prepare(
            "SELECT id, use_case_id, metric_type_id, unit_of_measure_id, primary_success_metric_name,
                    baseline_value, baseline_date, target_value, target_date, created, modified, editor
             FROM metrics WHERE use_case_id = ?1 ORDER BY id ASC",
        )?;
        let metrics = metric_stmt
            .query_map([use_case_id], parse_metric_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut report_stmt = conn.prepare(
            "SELECT id, use_case_id, metric_id, reported_value, reported_date, created, modified, editor
             FROM reported_metrics WHERE use_case_id = ?1 ORDER BY metric_id ASC, id ASC",
        )?;
        let reported_metrics = report_stmt
            .query_map([use_case_id], parse_reported_metric_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MetricsBundle {
            metrics,
            reported_metrics,
        })
    }

    pub fn list_metric_types(&self) -> AppResult<Vec<MetricType>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, category, description, default_unit_of_measure_id
             FROM metric_types WHERE active = 1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(MetricType {
                id: row.get(0)?,
                category: row.get::<_, String>(1)?.trim().to_string(),
                description: row.get(2)?,
                default_unit_of_measure_id: row.get(3)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn list_units_of_measure(&self) -> AppResult<Vec<UnitOfMeasure>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, measure_type FROM units_of_measure WHERE active = 1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(UnitOfMeasure {
                id: row.get(0)?,
                name: row.get::<_, String>(1)?.trim().to_string(),
                measure_type: row.get(2)?,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    fn seed_reference_data(&self) -> AppResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let type_count: i64 = tx.query_row("SELECT COUNT(1) FROM metric_types", [], |row| row.get(0))?;
        if type_count == 0 {
            for (id, category, description, default_unit) in DEFAULT_METRIC_TYPES {
                tx.execute(
                    "INSERT INTO metric_types (id, category, description, default_unit_of_measure_id)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, category, description, default_unit],
                )?;
            }
        }

        let unit_count: i64 = tx.query_row("SELECT COUNT(1) FROM units_of_measure", [], |row| row.get(0))?;
        if unit_count == 0 {
            for (id, name, measure_type) in DEFAULT_UNITS {
                tx.execute(
                    "INSERT INTO units_of_measure (id, name, measure_type) VALUES (?1, ?2, ?3)",
                    params![id, name, measure_type],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }
}

/// A table whose only primary key column is declared exactly `INTEGER` aliases the rowid, so SQLite
/// assigns ids itself. Anything else needs ids supplied by the writer.
fn detect_identity_mode(conn: &Connection, table: &str) -> AppResult<IdentityMode> {
    let pragma = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    let mut key_columns = Vec::new();
    while let Some(row) = rows.next()? {
        let declared_type: String = row.get(2)?;
        let key_position: i64 = row.get(5)?;
        if key_position > 0 {
            key_columns.push(declared_type);
        }
    }
    match key_columns.as_slice() {
        [declared_type] if declared_type.eq_ignore_ascii_case("INTEGER") => Ok(IdentityMode::Generated),
        [] => Err(AppError::Internal(format!("table {} has no primary key", table))),
        _ => Ok(IdentityMode::Sequential),
    }
}

fn parse_metric_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Metric> {
    Ok(Metric {
        id: row.get(0)?,
        use_case_id: row.get(1)?,
        metric_type_id: row.get(2)?,
        unit_of_measure_id: row.get(3)?,
        primary_success_metric_name: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        baseline_value: row.get(5)?,
        baseline_date: row.get(6)?,
        target_value: row.get(7)?,
        target_date: row.get(8)?,
        created: parse_time(row.get::<_, Option<String>>(9)?.as_deref()),
        modified: parse_time(row.get::<_, Option<String>>(10)?.as_deref()),
        editor: row.get(11)?,
    })
}

fn parse_reported_metric_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReportedMetric> {
    Ok(ReportedMetric {
        id: row.get(0)?,
        use_case_id: row.get(1)?,
        metric_id: row.get(2)?,
        reported_value: row.get(3)?,
        reported_date: row.get(4)?,
        created: parse_time(row.get::<_, Option<String>>(5)?.as_deref()),
        modified: parse_time(row.get::<_, Option<String>>(6)?.as_deref()),
        editor: row.get(7)?,
    })
}

/// Audit columns written by older tooling aren't always RFC 3339; those read back as absent.
fn parse_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
