//! Scan lifecycle hook.
//!
//! The scan engines own the `scan_jobs` table; the control plane only needs
//! to bulk-transition unfinished jobs to `stopped` when the platform stops.
//! [`ScanHalter`] is that seam, and [`ScanJobs`] implements it over the
//! shared database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::authz::TargetType;
use crate::error::ControlError;
use crate::store::encode_time;

/// Lifecycle state of a scan job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    /// Queued, not yet picked up.
    Pending,
    /// Executing.
    Running,
    /// Finished normally.
    Completed,
    /// Finished with an error.
    Failed,
    /// Halted by an emergency stop.
    Stopped,
}

impl ScanStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, ControlError> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(ControlError::InvalidEnum {
                field: "scan status",
                value: other.to_owned(),
            }),
        }
    }
}

/// Bulk halt of unfinished scans.
#[async_trait]
pub trait ScanHalter: Send + Sync {
    /// Move every pending or running scan to `stopped`, recording `reason`.
    ///
    /// Must be idempotent. Returns the number of scans transitioned.
    async fn halt_active(&self, reason: &str, at: DateTime<Utc>) -> Result<u64, ControlError>;
}

/// `scan_jobs` table accessor.
#[derive(Debug, Clone)]
pub struct ScanJobs {
    db: SqlitePool,
}

impl ScanJobs {
    /// Create an accessor over the shared pool.
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Queue a scan that has already been admitted.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn enqueue(
        &self,
        tenant_id: &str,
        target_type: TargetType,
        target_value: &str,
        at: DateTime<Utc>,
    ) -> Result<Uuid, ControlError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO scan_jobs (id, tenant_id, target_type, target_value, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
        )
        .bind(id.to_string())
        .bind(tenant_id)
        .bind(target_type.as_str())
        .bind(target_value)
        .bind(encode_time(at)?)
        .execute(&self.db)
        .await?;
        Ok(id)
    }

    /// Move an unfinished job to a new status. Terminal statuses stamp
    /// `completed_at`.
    ///
    /// Completed, failed and stopped jobs are final; a scan halted by an
    /// emergency stop is never revived.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] for an unknown id and
    /// [`ControlError::ScanFinished`] if the job already reached a final status.
    pub async fn set_status(
        &self,
        id: Uuid,
        status: ScanStatus,
        at: DateTime<Utc>,
    ) -> Result<(), ControlError> {
        let terminal = matches!(
            status,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Stopped
        );
        let result = sqlx::query(
            "UPDATE scan_jobs SET status = ?1, \
             completed_at = CASE WHEN ?2 THEN ?3 ELSE completed_at END \
             WHERE id = ?4 AND status IN ('pending', 'running')",
        )
        .bind(status.as_str())
        .bind(terminal)
        .bind(encode_time(at)?)
        .bind(id.to_string())
        .execute(&self.db)
        .await?;
        if result.rows_affected() == 0 {
            let (current, _) = self.status(id).await?;
            return Err(ControlError::ScanFinished {
                id: id.to_string(),
                status: current.as_str().to_owned(),
            });
        }
        Ok(())
    }

    /// Current status and error message of a job.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] for an unknown id.
    pub async fn status(&self, id: Uuid) -> Result<(ScanStatus, Option<String>), ControlError> {
        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT status, error_message FROM scan_jobs WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&self.db)
                .await?;
        let (status, message) = row.ok_or_else(|| ControlError::NotFound { id: id.to_string() })?;
        Ok((ScanStatus::parse(&status)?, message))
    }
}

#[async_trait]
impl ScanHalter for ScanJobs {
    async fn halt_active(&self, reason: &str, at: DateTime<Utc>) -> Result<u64, ControlError> {
        let result = sqlx::query(
            "UPDATE scan_jobs \
             SET status = 'stopped', \
                 error_message = 'Emergency stop activated: ' || ?1, \
                 completed_at = ?2 \
             WHERE status IN ('pending', 'running')",
        )
        .bind(reason)
        .bind(encode_time(at)?)
        .execute(&self.db)
        .await?;
        let stopped = result.rows_affected();
        info!(stopped, "unfinished scans halted");
        Ok(stopped)
    }
}
