//! Session store shared by the gate and the pulse monitor.

use std::sync::Arc;

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::ControlError;
use crate::store::{decode_opt_time, decode_time, encode_time};

/// An authenticated principal's lease on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationSession {
    /// Session id.
    pub id: Uuid,
    /// Authenticated actor.
    pub actor_id: String,
    /// Tenant the actor acts for.
    pub tenant_id: String,
    /// Features granted at login.
    pub features: Vec<String>,
    /// Login time.
    pub issued_at: DateTime<Utc>,
    /// End of the lease.
    pub expires_at: DateTime<Utc>,
    /// Last successful revalidation.
    pub last_pulse_at: Option<DateTime<Utc>>,
    /// Whether the session was revoked.
    pub revoked: bool,
    /// When it was revoked.
    pub revoked_at: Option<DateTime<Utc>>,
    /// Why it was revoked.
    pub revocation_reason: Option<String>,
}

impl AuthorizationSession {
    /// Not revoked and the lease has not run out.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now < self.expires_at
    }
}

type SessionRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    bool,
    Option<String>,
    Option<String>,
);

const SELECT_COLUMNS: &str = "SELECT id, actor_id, tenant_id, features, issued_at, expires_at, \
     last_pulse_at, revoked, revoked_at, revocation_reason FROM sessions";

fn row_into_session(row: SessionRow) -> Result<AuthorizationSession, ControlError> {
    let (
        id,
        actor_id,
        tenant_id,
        features,
        issued_at,
        expires_at,
        last_pulse_at,
        revoked,
        revoked_at,
        revocation_reason,
    ) = row;
    Ok(AuthorizationSession {
        id: Uuid::parse_str(&id).map_err(|_| ControlError::CorruptRow {
            field: "sessions.id",
            value: id.clone(),
        })?,
        actor_id,
        tenant_id,
        features: serde_json::from_str(&features)?,
        issued_at: decode_time("sessions.issued_at", &issued_at)?,
        expires_at: decode_time("sessions.expires_at", &expires_at)?,
        last_pulse_at: decode_opt_time("sessions.last_pulse_at", last_pulse_at.as_deref())?,
        revoked,
        revoked_at: decode_opt_time("sessions.revoked_at", revoked_at.as_deref())?,
        revocation_reason,
    })
}

/// Sessions table accessor.
#[derive(Clone)]
pub struct SessionStore {
    db: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Create a store over the shared pool.
    pub fn new(db: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Open a session leased for `lease` from now.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidInput`] for a blank actor or tenant or a
    /// non-positive lease, or a database error.
    pub async fn login(
        &self,
        actor_id: &str,
        tenant_id: &str,
        features: Vec<String>,
        lease: Duration,
    ) -> Result<AuthorizationSession, ControlError> {
        if actor_id.trim().is_empty() || tenant_id.trim().is_empty() {
            return Err(ControlError::InvalidInput(
                "actor_id and tenant_id are required".to_owned(),
            ));
        }
        if lease <= Duration::zero() {
            return Err(ControlError::InvalidInput("lease must be positive".to_owned()));
        }
        let issued_at = self.clock.now().trunc_subsecs(6);
        let expires_at = issued_at
            .checked_add_signed(lease)
            .ok_or_else(|| ControlError::InvalidInput("lease is too long".to_owned()))?;

        let session = AuthorizationSession {
            id: Uuid::new_v4(),
            actor_id: actor_id.to_owned(),
            tenant_id: tenant_id.to_owned(),
            features,
            issued_at,
            expires_at,
            last_pulse_at: None,
            revoked: false,
            revoked_at: None,
            revocation_reason: None,
        };
        sqlx::query(
            "INSERT INTO sessions (id, actor_id, tenant_id, features, issued_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(session.id.to_string())
        .bind(&session.actor_id)
        .bind(&session.tenant_id)
        .bind(serde_json::to_string(&session.features)?)
        .bind(encode_time(session.issued_at)?)
        .bind(encode_time(session.expires_at)?)
        .execute(&self.db)
        .await?;

        info!(session = %session.id, actor = %session.actor_id, tenant = %session.tenant_id, "session opened");
        Ok(session)
    }

    /// Fetch a session, revoked or not.
    ///
    /// # Errors
    ///
    /// Returns a database error or [`ControlError::CorruptRow`].
    pub async fn get(&self, id: Uuid) -> Result<Option<AuthorizationSession>, ControlError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        let row: Option<SessionRow> = sqlx::query_as(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.db)
            .await?;
        row.map(row_into_session).transpose()
    }

    /// Sessions that are unrevoked and unexpired at `now`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a database error or [`ControlError::CorruptRow`].
    pub async fn live_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<AuthorizationSession>, ControlError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE revoked = 0 AND expires_at > ?1 ORDER BY issued_at ASC"
        );
        let rows: Vec<SessionRow> = sqlx::query_as(&sql)
            .bind(encode_time(now)?)
            .fetch_all(&self.db)
            .await?;
        rows.into_iter().map(row_into_session).collect()
    }

    /// Stamp a successful revalidation. Returns `false` if the session is
    /// gone or revoked.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    pub async fn record_pulse(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, ControlError> {
        let result =
            sqlx::query("UPDATE sessions SET last_pulse_at = ?1 WHERE id = ?2 AND revoked = 0")
                .bind(encode_time(at)?)
                .bind(id.to_string())
                .execute(&self.db)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Revoke one session and cut its lease short. Returns `false` if it was
    /// already revoked or does not exist.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    pub async fn revoke(
        &self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, ControlError> {
        let result = sqlx::query(
            "UPDATE sessions SET revoked = 1, revoked_at = ?1, revocation_reason = ?2, \
             expires_at = min(expires_at, ?1) \
             WHERE id = ?3 AND revoked = 0",
        )
        .bind(encode_time(at)?)
        .bind(reason)
        .bind(id.to_string())
        .execute(&self.db)
        .await?;
        let revoked = result.rows_affected() > 0;
        if revoked {
            info!(session = %id, %reason, "session revoked");
        }
        Ok(revoked)
    }

    /// Revoke every unrevoked session and cut the leases short. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    pub async fn revoke_all(&self, reason: &str, at: DateTime<Utc>) -> Result<u64, ControlError> {
        let result = sqlx::query(
            "UPDATE sessions SET revoked = 1, revoked_at = ?1, revocation_reason = ?2, \
             expires_at = min(expires_at, ?1) \
             WHERE revoked = 0",
        )
        .bind(encode_time(at)?)
        .bind(reason)
        .execute(&self.db)
        .await?;
        let count = result.rows_affected();
        warn!(count, %reason, "all sessions revoked");
        Ok(count)
    }

    /// Destroy a session. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    pub async fn logout(&self, id: Uuid) -> Result<bool, ControlError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
