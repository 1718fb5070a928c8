//! Persistent work-unit state machine
//!
//! One row per (scenario, watershed) in `work_status`. Rows are inserted once
//! and never deleted; re-scheduling leaves existing rows untouched so a new
//! run resumes where the last one stopped. Failures are kept in a separate
//! `work_failure` table so a failed unit can be told apart from one that was
//! never attempted.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::fmt;

use super::store::{AccessMode, Execution, Fetch, SqlValue, StatusDb};

const CREATE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS work_status (
    scenario_id TEXT NOT NULL,
    watershed_id TEXT NOT NULL,
    watershed_area REAL NOT NULL,
    status TEXT NOT NULL,
    PRIMARY KEY (scenario_id, watershed_id)
);
CREATE TABLE IF NOT EXISTS work_failure (
    scenario_id TEXT NOT NULL,
    watershed_id TEXT NOT NULL,
    failed_at TEXT NOT NULL,
    reason TEXT NOT NULL,
    PRIMARY KEY (scenario_id, watershed_id)
);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    Scheduled,
    Computed,
    Complete,
    Failed,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Scheduled => "scheduled",
            WorkStatus::Computed => "computed",
            WorkStatus::Complete => "complete",
            WorkStatus::Failed => "failed",
        }
    }

    /// Parse a stored status
    ///
    /// Older stores wrote the failure message straight into the status column,
    /// so any unrecognized text reads back as `Failed`.
    pub fn from_stored(value: &str) -> Self {
        match value {
            "scheduled" => WorkStatus::Scheduled,
            "computed" => WorkStatus::Computed,
            "complete" => WorkStatus::Complete,
            _ => WorkStatus::Failed,
        }
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary key of a work unit
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitKey {
    pub scenario_id: String,
    pub watershed_id: String,
}

impl UnitKey {
    pub fn new(scenario_id: impl Into<String>, watershed_id: impl Into<String>) -> Self {
        Self {
            scenario_id: scenario_id.into(),
            watershed_id: watershed_id.into(),
        }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scenario_id, self.watershed_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkUnit {
    pub key: UnitKey,
    pub watershed_area: f64,
    pub status: WorkStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledUnit {
    pub key: UnitKey,
    pub watershed_area: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: WorkStatus,
    pub key: UnitKey,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub scenario_id: String,
    pub watershed_id: String,
    pub failed_at: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusCount {
    pub scenario_id: String,
    pub status: WorkStatus,
    pub count: u64,
}

/// Narrow interface over the work-status store
#[async_trait]
pub trait WorkStatusStore: Send + Sync {
    async fn create_schema_if_absent(&self) -> Result<()>;

    /// Insert rows that do not exist yet; existing rows keep their status and area
    async fn insert_scheduled(&self, units: &[ScheduledUnit]) -> Result<()>;

    async fn set_status(&self, key: &UnitKey, status: WorkStatus) -> Result<()>;

    /// Apply all updates in one batched statement
    async fn update_status_batch(&self, updates: &[StatusUpdate]) -> Result<()>;

    async fn record_failure(&self, key: &UnitKey, reason: &str) -> Result<()>;

    /// Units of a scenario that have not reached `Complete`
    async fn count_remaining(&self, scenario_id: &str) -> Result<u64>;

    /// Units of a scenario that have not reached `Complete`, largest first
    async fn select_remaining(&self, scenario_id: &str) -> Result<Vec<WorkUnit>>;

    async fn status_of(&self, key: &UnitKey) -> Result<Option<WorkStatus>>;

    async fn status_counts(&self, scenario_id: Option<&str>) -> Result<Vec<StatusCount>>;

    /// Failure records for units whose current status is `Failed`
    async fn failures(&self, scenario_id: Option<&str>) -> Result<Vec<FailureRecord>>;
}

fn key_args(key: &UnitKey) -> [SqlValue; 2] {
    [
        SqlValue::from(key.scenario_id.as_str()),
        SqlValue::from(key.watershed_id.as_str()),
    ]
}

fn unit_from_row(row: &SqliteRow) -> Result<WorkUnit> {
    Ok(WorkUnit {
        key: UnitKey {
            scenario_id: row.try_get("scenario_id")?,
            watershed_id: row.try_get("watershed_id")?,
        },
        watershed_area: row.try_get("watershed_area")?,
        status: WorkStatus::from_stored(row.try_get::<&str, _>("status")?),
    })
}

#[async_trait]
impl WorkStatusStore for StatusDb {
    async fn create_schema_if_absent(&self) -> Result<()> {
        self.execute(CREATE_SCHEMA, Execution::Script, AccessMode::Modify, Fetch::None)
            .await
            .context("Failed to create work status schema")?;
        Ok(())
    }

    async fn insert_scheduled(&self, units: &[ScheduledUnit]) -> Result<()> {
        if units.is_empty() {
            return Ok(());
        }
        let rows = units
            .iter()
            .map(|u| {
                vec![
                    SqlValue::from(u.key.scenario_id.as_str()),
                    SqlValue::from(u.key.watershed_id.as_str()),
                    SqlValue::Real(u.watershed_area),
                    SqlValue::from(WorkStatus::Scheduled.as_str()),
                ]
            })
            .collect();

        self.execute(
            "INSERT OR IGNORE INTO work_status \
             (scenario_id, watershed_id, watershed_area, status) VALUES (?, ?, ?, ?)",
            Execution::Many(rows),
            AccessMode::Modify,
            Fetch::None,
        )
        .await
        .context("Failed to schedule work units")?;
        Ok(())
    }

    async fn set_status(&self, key: &UnitKey, status: WorkStatus) -> Result<()> {
        let [scenario, watershed] = key_args(key);
        self.execute(
            "UPDATE work_status SET status = ? WHERE scenario_id = ? AND watershed_id = ?",
            Execution::Single(vec![status.as_str().into(), scenario, watershed]),
            AccessMode::Modify,
            Fetch::None,
        )
        .await
        .with_context(|| format!("Failed to mark {key} {status}"))?;
        Ok(())
    }

    async fn update_status_batch(&self, updates: &[StatusUpdate]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let rows = updates
            .iter()
            .map(|u| {
                let [scenario, watershed] = key_args(&u.key);
                vec![u.status.as_str().into(), scenario, watershed]
            })
            .collect();

        self.execute(
            "UPDATE work_status SET status = ? WHERE scenario_id = ? AND watershed_id = ?",
            Execution::Many(rows),
            AccessMode::Modify,
            Fetch::None,
        )
        .await
        .with_context(|| format!("Failed to apply {} status updates", updates.len()))?;
        Ok(())
    }

    async fn record_failure(&self, key: &UnitKey, reason: &str) -> Result<()> {
        let [scenario, watershed] = key_args(key);
        self.execute(
            "INSERT OR REPLACE INTO work_failure \
             (scenario_id, watershed_id, failed_at, reason) VALUES (?, ?, ?, ?)",
            Execution::Single(vec![
                scenario,
                watershed,
                Utc::now().to_rfc3339().into(),
                reason.into(),
            ]),
            AccessMode::Modify,
            Fetch::None,
        )
        .await
        .with_context(|| format!("Failed to record failure of {key}"))?;

        self.set_status(key, WorkStatus::Failed).await
    }

    async fn count_remaining(&self, scenario_id: &str) -> Result<u64> {
        let rows = self
            .execute(
                "SELECT count(1) FROM work_status WHERE scenario_id = ? AND status != ?",
                Execution::Single(vec![scenario_id.into(), WorkStatus::Complete.as_str().into()]),
                AccessMode::ReadOnly,
                Fetch::One,
            )
            .await
            .context("Failed to count remaining work")?;

        let count: i64 = match rows.first() {
            Some(row) => row.try_get(0)?,
            None => 0,
        };
        Ok(count.max(0) as u64)
    }

    async fn select_remaining(&self, scenario_id: &str) -> Result<Vec<WorkUnit>> {
        let rows = self
            .execute(
                "SELECT scenario_id, watershed_id, watershed_area, status FROM work_status \
                 WHERE scenario_id = ? AND status != ? ORDER BY watershed_area DESC",
                Execution::Single(vec![scenario_id.into(), WorkStatus::Complete.as_str().into()]),
                AccessMode::ReadOnly,
                Fetch::All,
            )
            .await
            .context("Failed to select remaining work")?;

        rows.iter().map(unit_from_row).collect()
    }

    async fn status_of(&self, key: &UnitKey) -> Result<Option<WorkStatus>> {
        let rows = self
            .execute(
                "SELECT status FROM work_status WHERE scenario_id = ? AND watershed_id = ?",
                Execution::Single(key_args(key).to_vec()),
                AccessMode::ReadOnly,
                Fetch::One,
            )
            .await
            .with_context(|| format!("Failed to read status of {key}"))?;

        match rows.first() {
            Some(row) => Ok(Some(WorkStatus::from_stored(row.try_get::<&str, _>(0)?))),
            None => Ok(None),
        }
    }

    async fn status_counts(&self, scenario_id: Option<&str>) -> Result<Vec<StatusCount>> {
        let (sql, args) = match scenario_id {
            Some(id) => (
                "SELECT scenario_id, status, count(1) FROM work_status \
                 WHERE scenario_id = ? GROUP BY scenario_id, status ORDER BY scenario_id, status",
                vec![SqlValue::from(id)],
            ),
            None => (
                "SELECT scenario_id, status, count(1) FROM work_status \
                 GROUP BY scenario_id, status ORDER BY scenario_id, status",
                vec![],
            ),
        };
        let rows = self
            .execute(sql, Execution::Single(args), AccessMode::ReadOnly, Fetch::All)
            .await
            .context("Failed to summarize work status")?;

        // Legacy failure text groups separately in SQL; fold it into one Failed bucket.
        let mut counts: Vec<StatusCount> = Vec::new();
        for row in &rows {
            let scenario_id: String = row.try_get(0)?;
            let status = WorkStatus::from_stored(row.try_get::<&str, _>(1)?);
            let count = row.try_get::<i64, _>(2)?.max(0) as u64;
            match counts
                .iter_mut()
                .find(|c| c.scenario_id == scenario_id && c.status == status)
            {
                Some(existing) => existing.count += count,
                None => counts.push(StatusCount {
                    scenario_id,
                    status,
                    count,
                }),
            }
        }
        counts.sort_by(|a, b| (&a.scenario_id, a.status).cmp(&(&b.scenario_id, b.status)));
        Ok(counts)
    }

    async fn failures(&self, scenario_id: Option<&str>) -> Result<Vec<FailureRecord>> {
        let base = "SELECT f.scenario_id, f.watershed_id, f.failed_at, f.reason \
                    FROM work_failure f JOIN work_status s \
                    ON f.scenario_id = s.scenario_id AND f.watershed_id = s.watershed_id \
                    WHERE s.status = 'failed'";
        let (sql, args) = match scenario_id {
            Some(id) => (
                format!("{base} AND f.scenario_id = ? ORDER BY f.failed_at"),
                vec![SqlValue::from(id)],
            ),
            None => (format!("{base} ORDER BY f.failed_at"), vec![]),
        };
        let rows = self
            .execute(&sql, Execution::Single(args), AccessMode::ReadOnly, Fetch::All)
            .await
            .context("Failed to read failure records")?;

        rows.iter()
            .map(|row| {
                Ok(FailureRecord {
                    scenario_id: row.try_get(0)?,
                    watershed_id: row.try_get(1)?,
                    failed_at: row.try_get(2)?,
                    reason: row.try_get(3)?,
                })
            })
            .collect()
    }
}
