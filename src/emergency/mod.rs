//! Platform-wide emergency stop.
//!
//! The flag is one row (`id = 1`) in the shared database, so every replica
//! sees the same state. Activation is an upsert: the last writer's reason and
//! duration win. Expiry is evaluated on read; there is no timer that clears
//! the row.

pub mod jobs;

use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::audit::{AuditRecord, AuditTrail, Severity};
use crate::clock::Clock;
use crate::config::{EmergencyConfig, MAX_STOP_MINUTES};
use crate::error::ControlError;
use crate::store::{decode_time, encode_time};

pub use self::jobs::{ScanHalter, ScanJobs, ScanStatus};

/// Result of an activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activation {
    /// When the stop lapses on its own.
    pub expires_at: DateTime<Utc>,
    /// Pending/running scans moved to `stopped`.
    pub scans_stopped: u64,
}

/// Result of a deactivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deactivation {
    /// Whether an unexpired stop was cleared.
    pub was_active: bool,
}

/// Snapshot of the flag.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EmergencyStatus {
    /// Whether new work is currently blocked.
    pub active: bool,
    /// Operator-supplied reason.
    pub reason: Option<String>,
    /// Who activated it.
    pub activated_by: Option<String>,
    /// When it was activated.
    pub activated_at: Option<DateTime<Utc>>,
    /// When it lapses.
    pub expires_at: Option<DateTime<Utc>>,
    /// Whole seconds until it lapses.
    pub expires_in_seconds: Option<i64>,
}

type StopRow = (String, String, String, String);

/// Owner of the shared stop flag.
#[derive(Clone)]
pub struct EmergencyStopController {
    db: SqlitePool,
    clock: Arc<dyn Clock>,
    audit: AuditTrail,
    halter: Arc<dyn ScanHalter>,
    config: EmergencyConfig,
}

impl std::fmt::Debug for EmergencyStopController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmergencyStopController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EmergencyStopController {
    /// Create a controller.
    pub fn new(
        db: SqlitePool,
        clock: Arc<dyn Clock>,
        audit: AuditTrail,
        halter: Arc<dyn ScanHalter>,
        config: EmergencyConfig,
    ) -> Self {
        Self {
            db,
            clock,
            audit,
            halter,
            config,
        }
    }

    /// Stop the platform for `duration_minutes` (default when `None` or 0).
    ///
    /// The flag is written before scans are halted. If the halt fails the
    /// flag stays set, the failure is audited, and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidInput`] for a blank reason or actor or
    /// a duration above [`MAX_STOP_MINUTES`], a database error if the flag
    /// cannot be written, or the halt/audit failure.
    pub async fn activate(
        &self,
        reason: &str,
        duration_minutes: Option<u32>,
        activated_by: &str,
    ) -> Result<Activation, ControlError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ControlError::InvalidInput("reason is required".to_owned()));
        }
        if activated_by.trim().is_empty() {
            return Err(ControlError::InvalidInput(
                "activated_by is required".to_owned(),
            ));
        }
        let minutes = duration_minutes
            .filter(|m| *m > 0)
            .unwrap_or(self.config.default_duration_minutes);
        if minutes > MAX_STOP_MINUTES {
            return Err(ControlError::InvalidInput(format!(
                "duration of {minutes} minutes exceeds the {MAX_STOP_MINUTES} minute limit"
            )));
        }
        let activated_at = self.clock.now().trunc_subsecs(6);
        let expires_at = activated_at
            .checked_add_signed(Duration::minutes(i64::from(minutes)))
            .ok_or_else(|| {
                ControlError::InvalidInput(format!("duration of {minutes} minutes is too long"))
            })?;

        sqlx::query(
            "INSERT INTO emergency_stop (id, reason, activated_by, activated_at, expires_at) \
             VALUES (1, ?1, ?2, ?3, ?4) \
             ON CONFLICT(id) DO UPDATE SET \
                reason = excluded.reason, \
                activated_by = excluded.activated_by, \
                activated_at = excluded.activated_at, \
                expires_at = excluded.expires_at",
        )
        .bind(reason)
        .bind(activated_by)
        .bind(encode_time(activated_at)?)
        .bind(encode_time(expires_at)?)
        .execute(&self.db)
        .await?;
        warn!(
            %reason,
            %activated_by,
            minutes,
            expires_at = %expires_at,
            "EMERGENCY STOP ACTIVATED"
        );

        let halted = self.halter.halt_active(reason, activated_at).await;
        let (scans_stopped, halt_error) = match &halted {
            Ok(n) => (Some(*n), None),
            Err(e) => {
                error!(error = %e, "failed to halt running scans");
                (None, Some(e.to_string()))
            }
        };

        self.audit
            .record(
                AuditRecord::new(activated_by, "emergency_stop_activated", "platform", "activated")
                    .severity(Severity::Critical)
                    .context(serde_json::json!({
                        "reason": reason,
                        "duration_minutes": minutes,
                        "expires_at": expires_at,
                        "scans_stopped": scans_stopped,
                        "halt_error": halt_error,
                    })),
            )
            .await?;

        Ok(Activation {
            expires_at,
            scans_stopped: halted?,
        })
    }

    /// Clear the flag immediately.
    ///
    /// Scans stopped by the activation stay stopped.
    ///
    /// # Errors
    ///
    /// Returns a database or audit error.
    pub async fn deactivate(&self, deactivated_by: &str) -> Result<Deactivation, ControlError> {
        if deactivated_by.trim().is_empty() {
            return Err(ControlError::InvalidInput(
                "deactivated_by is required".to_owned(),
            ));
        }
        let now = encode_time(self.clock.now())?;
        let cleared: Option<(String,)> =
            sqlx::query_as("DELETE FROM emergency_stop WHERE id = 1 RETURNING expires_at")
                .fetch_optional(&self.db)
                .await?;
        let was_active = cleared.is_some_and(|(expires_at,)| expires_at > now);
        info!(%deactivated_by, was_active, "emergency stop deactivated");

        self.audit
            .record(
                AuditRecord::new(
                    deactivated_by,
                    "emergency_stop_deactivated",
                    "platform",
                    "deactivated",
                )
                .severity(Severity::High)
                .context(serde_json::json!({ "was_active": was_active })),
            )
            .await?;
        Ok(Deactivation { was_active })
    }

    /// Full snapshot of the flag. An expired row reads as inactive.
    ///
    /// # Errors
    ///
    /// Returns a database error or [`ControlError::CorruptRow`].
    pub async fn status(&self) -> Result<EmergencyStatus, ControlError> {
        let now = self.clock.now();
        let row: Option<StopRow> = sqlx::query_as(
            "SELECT reason, activated_by, activated_at, expires_at FROM emergency_stop \
             WHERE id = 1 AND expires_at > ?1",
        )
        .bind(encode_time(now)?)
        .fetch_optional(&self.db)
        .await?;
        let Some((reason, activated_by, activated_at, expires_at)) = row else {
            return Ok(EmergencyStatus::default());
        };
        let activated_at = decode_time("emergency_stop.activated_at", &activated_at)?;
        let expires_at = decode_time("emergency_stop.expires_at", &expires_at)?;
        Ok(EmergencyStatus {
            active: true,
            reason: Some(reason),
            activated_by: Some(activated_by),
            activated_at: Some(activated_at),
            expires_at: Some(expires_at),
            expires_in_seconds: Some(expires_at.signed_duration_since(now).num_seconds().max(0)),
        })
    }

    /// Whether new work is blocked. One read of the shared row.
    ///
    /// # Errors
    ///
    /// Returns a database error. Callers gating work must treat an error as
    /// "stopped".
    pub async fn is_active(&self) -> Result<bool, ControlError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM emergency_stop WHERE id = 1 AND expires_at > ?1")
                .bind(encode_time(self.clock.now())?)
                .fetch_optional(&self.db)
                .await?;
        Ok(row.is_some())
    }

    /// Request-middleware check: `false` while stopped.
    ///
    /// A storage fault follows `emergency.fail_open_on_status_error`.
    pub async fn permits_request(&self) -> bool {
        match self.is_active().await {
            Ok(active) => !active,
            Err(e) if self.config.fail_open_on_status_error => {
                warn!(error = %e, "emergency status unreadable, letting request through");
                true
            }
            Err(e) => {
                error!(error = %e, "emergency status unreadable, refusing request");
                false
            }
        }
    }
}
