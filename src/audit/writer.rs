//! Single-writer actor for audit appends.
//!
//! All appends flow through this actor via an [`mpsc`] channel so entries
//! from one process are chained in arrival order. Each append additionally
//! runs under `BEGIN IMMEDIATE`, which takes the database write lock before
//! reading the chain head; writers in other processes queue on that lock
//! instead of chaining from a stale head.

use std::sync::Arc;

use chrono::SubsecRound;
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, trace, warn};
use uuid::Uuid;

use super::{AuditEntry, AuditRecord, SigningKey, GENESIS_SIGNATURE};
use crate::clock::Clock;
use crate::error::ControlError;
use crate::store::encode_time;

/// Operations that can be sent to the writer actor.
#[derive(Debug)]
pub(super) enum WriteOp {
    /// Sequence, sign and persist a record.
    Append {
        /// Content to append.
        record: AuditRecord,
        /// Receives the committed entry or the failure.
        reply: oneshot::Sender<Result<AuditEntry, ControlError>>,
    },
}

/// Run the writer loop until every sender is dropped.
pub(super) async fn run_writer(
    db: SqlitePool,
    key: Arc<SigningKey>,
    clock: Arc<dyn Clock>,
    mut rx: mpsc::Receiver<WriteOp>,
) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Append { record, reply } => {
                let result = append(&db, &key, clock.as_ref(), record).await;
                if let Err(ref err) = result {
                    error!(error = %err, "audit append failed");
                }
                // The caller may have given up waiting; the entry is committed either way.
                let _ = reply.send(result);
            }
        }
    }
    trace!("audit writer actor stopped");
}

async fn append(
    db: &SqlitePool,
    key: &SigningKey,
    clock: &dyn Clock,
    record: AuditRecord,
) -> Result<AuditEntry, ControlError> {
    let mut conn = db.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

    let result = match append_locked(&mut conn, key, clock, record).await {
        Ok(entry) => sqlx::query("COMMIT")
            .execute(&mut *conn)
            .await
            .map(|_| entry)
            .map_err(ControlError::from),
        Err(err) => Err(err),
    };

    match result {
        Ok(entry) => {
            trace!(seq = entry.seq, action = %entry.action, "audit entry committed");
            Ok(entry)
        }
        Err(err) => {
            // Never hand a connection back to the pool mid-transaction.
            if let Err(rollback_err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                warn!(error = %rollback_err, "audit rollback failed");
            }
            Err(err)
        }
    }
}

async fn append_locked(
    conn: &mut SqliteConnection,
    key: &SigningKey,
    clock: &dyn Clock,
    record: AuditRecord,
) -> Result<AuditEntry, ControlError> {
    let head: Option<(i64, String)> =
        sqlx::query_as("SELECT seq, signature FROM audit_log ORDER BY seq DESC LIMIT 1")
            .fetch_optional(&mut *conn)
            .await?;
    let (prev_seq, prev_signature) = head.unwrap_or((0, GENESIS_SIGNATURE.to_owned()));

    let mut entry = AuditEntry {
        seq: prev_seq.saturating_add(1),
        id: Uuid::new_v4(),
        // Stored with microsecond precision; truncate so the signed value matches.
        timestamp: clock.now().trunc_subsecs(6),
        actor_id: record.actor_id,
        tenant_id: record.tenant_id,
        action: record.action,
        target: record.target,
        decision: record.decision,
        severity: record.severity,
        context: record.context,
        prev_signature,
        signature: String::new(),
    };
    entry.signature = key.sign(&entry)?;

    sqlx::query(
        "INSERT INTO audit_log (seq, id, ts, actor_id, tenant_id, action, target, decision, \
         severity, context, prev_signature, signature) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )
    .bind(entry.seq)
    .bind(entry.id.to_string())
    .bind(encode_time(entry.timestamp)?)
    .bind(&entry.actor_id)
    .bind(&entry.tenant_id)
    .bind(&entry.action)
    .bind(&entry.target)
    .bind(&entry.decision)
    .bind(entry.severity.as_str())
    .bind(entry.context.to_string())
    .bind(&entry.prev_signature)
    .bind(&entry.signature)
    .execute(&mut *conn)
    .await?;

    Ok(entry)
}
