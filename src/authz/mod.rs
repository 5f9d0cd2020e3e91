//! Permission-to-scan registry.
//!
//! A tenant submits documented permission to operate against a target; a
//! verifier approves or rejects it exactly once. Scans are only admitted
//! against targets with an approved record whose validity window contains
//! the current instant. "Expired" is never stored: it is derived from
//! `valid_until` at query time.

pub mod target;

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::ControlError;
use crate::store::{decode_opt_time, decode_time, encode_time};

pub use self::target::TargetType;

/// Verification status stored for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    /// Awaiting review.
    Pending,
    /// Approved by a verifier.
    Approved,
    /// Rejected by a verifier.
    Rejected,
}

impl AuthorizationStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// Parse from a stored or user-supplied value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, ControlError> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(ControlError::InvalidEnum {
                field: "status",
                value: other.to_owned(),
            }),
        }
    }
}

/// Status as observed at a given instant, including the derived `expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectiveStatus {
    /// Awaiting review.
    Pending,
    /// Approved and not past its window.
    Approved,
    /// Rejected by a verifier.
    Rejected,
    /// Approved, but `valid_until` has passed.
    Expired,
}

/// A verifier's verdict on a pending record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Grant permission.
    Approve,
    /// Refuse permission; requires a reason.
    Reject,
}

impl Decision {
    /// Parse `approve` or `reject`.
    ///
    /// # Errors
    ///
    /// Returns an error for any other action.
    pub fn parse(s: &str) -> Result<Self, ControlError> {
        match s {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            other => Err(ControlError::InvalidEnum {
                field: "action",
                value: other.to_owned(),
            }),
        }
    }

    fn resulting_status(self) -> AuthorizationStatus {
        match self {
            Self::Approve => AuthorizationStatus::Approved,
            Self::Reject => AuthorizationStatus::Rejected,
        }
    }
}

/// Input for [`AuthorizationRegistry::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitAuthorization {
    /// Kind of target.
    pub target_type: TargetType,
    /// Address, domain, range or URL.
    pub target_value: String,
    /// Name/role of the human who signed the authorization.
    pub authorized_by: String,
    /// Reference to the signed document.
    #[serde(alias = "authorization_document_url")]
    pub document_ref: String,
    /// Start of the permitted window.
    pub valid_from: DateTime<Utc>,
    /// End of the permitted window.
    pub valid_until: DateTime<Utc>,
    /// Scope limitations noted on the document.
    #[serde(default, alias = "scope_limitations")]
    pub scope_notes: Option<String>,
}

/// A stored permission-to-scan record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationTarget {
    /// Record id.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: String,
    /// Kind of target.
    pub target_type: TargetType,
    /// Normalized target value.
    pub target_value: String,
    /// Reference to the signed document.
    pub document_ref: String,
    /// SHA-256 of the document reference, proof of submission.
    pub document_hash: String,
    /// Human signer.
    pub authorized_by: String,
    /// Scope limitations.
    pub scope_notes: Option<String>,
    /// Start of the permitted window.
    pub valid_from: DateTime<Utc>,
    /// End of the permitted window.
    pub valid_until: DateTime<Utc>,
    /// Stored verification status.
    pub status: AuthorizationStatus,
    /// Verifier, set together with `verified_at`.
    pub verified_by: Option<String>,
    /// Decision time, set together with `verified_by`.
    pub verified_at: Option<DateTime<Utc>>,
    /// Present iff rejected.
    pub rejection_reason: Option<String>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
}

impl AuthorizationTarget {
    /// Approved, but the window has closed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == AuthorizationStatus::Approved && now > self.valid_until
    }

    /// Stored status with the computed `expired` overlay.
    pub fn effective_status(&self, now: DateTime<Utc>) -> EffectiveStatus {
        match self.status {
            AuthorizationStatus::Pending => EffectiveStatus::Pending,
            AuthorizationStatus::Rejected => EffectiveStatus::Rejected,
            AuthorizationStatus::Approved if self.is_expired(now) => EffectiveStatus::Expired,
            AuthorizationStatus::Approved => EffectiveStatus::Approved,
        }
    }

    /// Approved and `at` lies within `[valid_from, valid_until]`.
    pub fn permits_at(&self, at: DateTime<Utc>) -> bool {
        self.status == AuthorizationStatus::Approved
            && self.valid_from <= at
            && at <= self.valid_until
    }
}

/// Answer to "is this target authorized right now?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationCheck {
    /// Whether a matching approved record exists.
    pub authorized: bool,
    /// The record that matched.
    pub authorization_id: Option<Uuid>,
}

/// SHA-256 hex digest of a document reference.
pub fn document_hash(document_ref: &str) -> String {
    hex::encode(Sha256::digest(document_ref.as_bytes()))
}

/// Raw row tuple from the `authorized_targets` table.
type TargetRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
);

const SELECT_COLUMNS: &str = "SELECT id, tenant_id, target_type, target_value, document_ref, \
     document_hash, authorized_by, scope_notes, valid_from, valid_until, status, verified_by, \
     verified_at, rejection_reason, created_at FROM authorized_targets";

fn row_into_target(row: TargetRow) -> Result<AuthorizationTarget, ControlError> {
    let (
        id,
        tenant_id,
        target_type,
        target_value,
        document_ref,
        document_hash,
        authorized_by,
        scope_notes,
        valid_from,
        valid_until,
        status,
        verified_by,
        verified_at,
        rejection_reason,
        created_at,
    ) = row;
    Ok(AuthorizationTarget {
        id: Uuid::parse_str(&id).map_err(|_| ControlError::CorruptRow {
            field: "authorized_targets.id",
            value: id.clone(),
        })?,
        tenant_id,
        target_type: TargetType::parse(&target_type)?,
        target_value,
        document_ref,
        document_hash,
        authorized_by,
        scope_notes,
        valid_from: decode_time("valid_from", &valid_from)?,
        valid_until: decode_time("valid_until", &valid_until)?,
        status: AuthorizationStatus::parse(&status)?,
        verified_by,
        verified_at: decode_opt_time("verified_at", verified_at.as_deref())?,
        rejection_reason,
        created_at: decode_time("created_at", &created_at)?,
    })
}

fn require_non_blank(field: &str, value: &str) -> Result<(), ControlError> {
    if value.trim().is_empty() {
        return Err(ControlError::InvalidInput(format!("{field} is required")));
    }
    Ok(())
}

/// Registry of per-target authorization records.
#[derive(Clone)]
pub struct AuthorizationRegistry {
    db: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AuthorizationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationRegistry").finish_non_exhaustive()
    }
}

impl AuthorizationRegistry {
    /// Create a registry over the shared pool.
    pub fn new(db: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Record a new pending authorization.
    ///
    /// Hashes the document reference; the document itself is not fetched.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidRange`] when `valid_until` is not after
    /// `valid_from` at microsecond precision, [`ControlError::InvalidInput`]
    /// for blank or malformed fields, [`ControlError::TimeOutOfRange`] for a
    /// window past year 9999, or a database error. Nothing is persisted on failure.
    pub async fn submit(
        &self,
        tenant_id: &str,
        request: SubmitAuthorization,
    ) -> Result<AuthorizationTarget, ControlError> {
        require_non_blank("tenant_id", tenant_id)?;
        require_non_blank("authorized_by", &request.authorized_by)?;
        require_non_blank("document_ref", &request.document_ref)?;
        // Compare at stored precision so sub-microsecond windows cannot collapse.
        let valid_from = request.valid_from.trunc_subsecs(6);
        let valid_until = request.valid_until.trunc_subsecs(6);
        if valid_until <= valid_from {
            return Err(ControlError::InvalidRange {
                valid_from,
                valid_until,
            });
        }
        let target_value = request.target_type.normalize(&request.target_value)?;

        let record = AuthorizationTarget {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_owned(),
            target_type: request.target_type,
            target_value,
            document_hash: document_hash(&request.document_ref),
            document_ref: request.document_ref,
            authorized_by: request.authorized_by,
            scope_notes: request.scope_notes.filter(|s| !s.trim().is_empty()),
            valid_from,
            valid_until,
            status: AuthorizationStatus::Pending,
            verified_by: None,
            verified_at: None,
            rejection_reason: None,
            created_at: self.clock.now().trunc_subsecs(6),
        };

        sqlx::query(
            "INSERT INTO authorized_targets (id, tenant_id, target_type, target_value, \
             document_ref, document_hash, authorized_by, scope_notes, valid_from, valid_until, \
             status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'pending', ?11)",
        )
        .bind(record.id.to_string())
        .bind(&record.tenant_id)
        .bind(record.target_type.as_str())
        .bind(&record.target_value)
        .bind(&record.document_ref)
        .bind(&record.document_hash)
        .bind(&record.authorized_by)
        .bind(&record.scope_notes)
        .bind(encode_time(record.valid_from)?)
        .bind(encode_time(record.valid_until)?)
        .bind(encode_time(record.created_at)?)
        .execute(&self.db)
        .await?;

        info!(
            id = %record.id,
            tenant = %record.tenant_id,
            target_type = record.target_type.as_str(),
            target = %record.target_value,
            "authorization submitted for review"
        );
        Ok(record)
    }

    /// List a tenant's records, newest first, optionally filtered by status.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or a row cannot be decoded.
    pub async fn list(
        &self,
        tenant_id: &str,
        status: Option<AuthorizationStatus>,
    ) -> Result<Vec<AuthorizationTarget>, ControlError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE tenant_id = ?1 AND (?2 IS NULL OR status = ?2) \
             ORDER BY created_at DESC, rowid DESC"
        );
        let rows: Vec<TargetRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&self.db)
            .await?;
        rows.into_iter().map(row_into_target).collect()
    }

    /// Fetch one record by id.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] for an unknown id.
    pub async fn get(&self, id: Uuid) -> Result<AuthorizationTarget, ControlError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        let row: Option<TargetRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.db)
            .await?;
        match row {
            Some(row) => row_into_target(row),
            None => Err(ControlError::NotFound { id: id.to_string() }),
        }
    }

    /// Approve or reject a pending record.
    ///
    /// The update only matches while the record is still pending, so of
    /// several concurrent decisions exactly one takes effect.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::MissingReason`] when rejecting without a
    /// reason, [`ControlError::NotFound`] for an unknown id, or
    /// [`ControlError::AlreadyDecided`] when the record is not pending.
    pub async fn decide(
        &self,
        id: Uuid,
        verifier_id: &str,
        decision: Decision,
        reason: Option<&str>,
    ) -> Result<AuthorizationTarget, ControlError> {
        require_non_blank("verifier_id", verifier_id)?;
        let rejection_reason = match decision {
            Decision::Approve => None,
            Decision::Reject => match reason.map(str::trim) {
                Some(r) if !r.is_empty() => Some(r.to_owned()),
                _ => return Err(ControlError::MissingReason),
            },
        };
        let status = decision.resulting_status();

        let result = sqlx::query(
            "UPDATE authorized_targets \
             SET status = ?1, verified_by = ?2, verified_at = ?3, rejection_reason = ?4 \
             WHERE id = ?5 AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(verifier_id)
        .bind(encode_time(self.clock.now())?)
        .bind(&rejection_reason)
        .bind(id.to_string())
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            let current = self.get(id).await?;
            debug!(%id, status = current.status.as_str(), "decision refused, record not pending");
            return Err(ControlError::AlreadyDecided {
                id: id.to_string(),
                status: current.status.as_str().to_owned(),
            });
        }

        info!(%id, verifier = %verifier_id, status = status.as_str(), "authorization decided");
        self.get(id).await
    }

    /// Whether an approved record covers the target at `at`.
    ///
    /// Overlapping approved records are not an error; the oldest match wins.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails. A malformed target value is
    /// simply not authorized.
    pub async fn is_authorized(
        &self,
        tenant_id: &str,
        target_type: TargetType,
        target_value: &str,
        at: DateTime<Utc>,
    ) -> Result<AuthorizationCheck, ControlError> {
        let Ok(normalized) = target_type.normalize(target_value) else {
            return Ok(AuthorizationCheck {
                authorized: false,
                authorization_id: None,
            });
        };
        let at = encode_time(at)?;
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM authorized_targets \
             WHERE tenant_id = ?1 AND target_type = ?2 AND target_value = ?3 \
               AND status = 'approved' AND valid_from <= ?4 AND valid_until >= ?4 \
             ORDER BY created_at ASC, rowid ASC \
             LIMIT 1",
        )
        .bind(tenant_id)
        .bind(target_type.as_str())
        .bind(&normalized)
        .bind(&at)
        .fetch_optional(&self.db)
        .await?;

        let authorization_id = row
            .map(|(id,)| {
                Uuid::parse_str(&id).map_err(|_| ControlError::CorruptRow {
                    field: "authorized_targets.id",
                    value: id.clone(),
                })
            })
            .transpose()?;
        Ok(AuthorizationCheck {
            authorized: authorization_id.is_some(),
            authorization_id,
        })
    }
}
