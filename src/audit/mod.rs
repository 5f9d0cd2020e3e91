//! Tamper-evident audit trail.
//!
//! Every security-relevant decision becomes one [`AuditEntry`]. Entries form
//! an HMAC-SHA256 chain: each signature covers the entry content plus the
//! previous entry's signature, so editing, deleting or reordering rows breaks
//! verification from that point on.
//!
//! Reads (export, verification) go straight to the pool. Appends go through
//! a single-writer actor (see [`writer`]) which also takes an immediate
//! SQLite write lock, so concurrent writers in other processes cannot fork
//! the chain.

mod writer;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::ControlError;
use crate::store::{decode_time, encode_time};

use self::writer::WriteOp;

type HmacSha256 = Hmac<Sha256>;

/// Signature the first entry chains from.
pub const GENESIS_SIGNATURE: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Writer channel capacity. Bounded to provide backpressure.
const WRITER_CHANNEL_CAPACITY: usize = 1024;

/// Export row cap when the query does not set one.
const DEFAULT_EXPORT_LIMIT: u32 = 10_000;

/// Severity attached to an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Routine allow decisions and reads.
    Info,
    /// Low impact changes.
    Low,
    /// Denials and review decisions.
    Medium,
    /// Platform resume, session revocation.
    High,
    /// Platform-wide stop.
    Critical,
}

impl Severity {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    fn rank(self) -> i64 {
        match self {
            Self::Info => 0,
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
            Self::Critical => 4,
        }
    }

    /// Parse from a stored or user-supplied value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised severity.
    pub fn parse(s: &str) -> Result<Self, ControlError> {
        match s {
            "info" => Ok(Self::Info),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(ControlError::InvalidEnum {
                field: "severity",
                value: other.to_owned(),
            }),
        }
    }
}

/// Content of an entry before it is sequenced and signed.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    /// Who caused the decision (user id or `system:*`).
    pub actor_id: String,
    /// Tenant the decision concerns, if any.
    pub tenant_id: Option<String>,
    /// What happened, e.g. `scan_admission`.
    pub action: String,
    /// What it happened to.
    pub target: String,
    /// Outcome, e.g. `allow`, `deny`, `approved`.
    pub decision: String,
    /// Severity.
    pub severity: Severity,
    /// Free-form structured context.
    pub context: serde_json::Value,
}

impl AuditRecord {
    /// Start a record with `info` severity and empty context.
    pub fn new(
        actor_id: impl Into<String>,
        action: impl Into<String>,
        target: impl Into<String>,
        decision: impl Into<String>,
    ) -> Self {
        Self {
            actor_id: actor_id.into(),
            tenant_id: None,
            action: action.into(),
            target: target.into(),
            decision: decision.into(),
            severity: Severity::Info,
            context: serde_json::json!({}),
        }
    }

    /// Attach a tenant.
    #[must_use]
    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Set the severity.
    #[must_use]
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Set the structured context.
    #[must_use]
    pub fn context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// A sequenced, signed audit fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the chain, starting at 1.
    pub seq: i64,
    /// Unique entry id.
    pub id: Uuid,
    /// When the decision was recorded.
    pub timestamp: DateTime<Utc>,
    /// Who caused the decision.
    pub actor_id: String,
    /// Tenant, if any.
    pub tenant_id: Option<String>,
    /// What happened.
    pub action: String,
    /// What it happened to.
    pub target: String,
    /// Outcome.
    pub decision: String,
    /// Severity.
    pub severity: Severity,
    /// Structured context.
    pub context: serde_json::Value,
    /// Signature of the previous entry ([`GENESIS_SIGNATURE`] for the first).
    pub prev_signature: String,
    /// Hex HMAC-SHA256 over the content and `prev_signature`.
    pub signature: String,
}

/// Fields covered by the signature, in a fixed order.
#[derive(Serialize)]
struct SignedContent<'a> {
    seq: i64,
    id: &'a Uuid,
    timestamp: String,
    actor_id: &'a str,
    tenant_id: Option<&'a str>,
    action: &'a str,
    target: &'a str,
    decision: &'a str,
    severity: &'a str,
    context: &'a serde_json::Value,
    prev_signature: &'a str,
}

impl AuditEntry {
    fn signed_bytes(&self) -> Result<Vec<u8>, ControlError> {
        let content = SignedContent {
            seq: self.seq,
            id: &self.id,
            timestamp: encode_time(self.timestamp)?,
            actor_id: &self.actor_id,
            tenant_id: self.tenant_id.as_deref(),
            action: &self.action,
            target: &self.target,
            decision: &self.decision,
            severity: self.severity.as_str(),
            context: &self.context,
            prev_signature: &self.prev_signature,
        };
        Ok(serde_json::to_vec(&content)?)
    }
}

/// HMAC key used to sign the chain.
#[derive(Clone)]
pub struct SigningKey(Vec<u8>);

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SigningKey").field(&"[REDACTED]").finish()
    }
}

impl SigningKey {
    /// Minimum accepted key length in bytes.
    pub const MIN_LEN: usize = 16;

    /// Build a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Signing`] if the key is shorter than
    /// [`Self::MIN_LEN`].
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self, ControlError> {
        let bytes = bytes.into();
        if bytes.len() < Self::MIN_LEN {
            return Err(ControlError::Signing(format!(
                "signing key must be at least {} bytes",
                Self::MIN_LEN
            )));
        }
        Ok(Self(bytes))
    }

    /// Compute the hex signature of an entry.
    fn sign(&self, entry: &AuditEntry) -> Result<String, ControlError> {
        let mut mac = HmacSha256::new_from_slice(&self.0)
            .map_err(|e| ControlError::Signing(e.to_string()))?;
        mac.update(&entry.signed_bytes()?);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check an entry's stored signature in constant time.
    fn verify(&self, entry: &AuditEntry) -> Result<bool, ControlError> {
        let Ok(expected) = hex::decode(&entry.signature) else {
            return Ok(false);
        };
        let mut mac = HmacSha256::new_from_slice(&self.0)
            .map_err(|e| ControlError::Signing(e.to_string()))?;
        mac.update(&entry.signed_bytes()?);
        Ok(mac.verify_slice(&expected).is_ok())
    }
}

/// Filters for a regulatory export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditQuery {
    /// Inclusive lower bound.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub until: Option<DateTime<Utc>>,
    /// Only entries by this actor.
    pub actor_id: Option<String>,
    /// Only entries for this tenant.
    pub tenant_id: Option<String>,
    /// Only entries with this action.
    pub action: Option<String>,
    /// Only entries at or above this severity.
    #[serde(alias = "severity")]
    pub min_severity: Option<Severity>,
    /// Row cap.
    pub limit: Option<u32>,
}

/// Result of replaying the chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    /// Number of entries examined.
    pub entries: u64,
    /// `true` when every link and signature checks out.
    pub intact: bool,
    /// First sequence number at which the chain no longer verifies.
    pub first_broken_seq: Option<i64>,
}

/// Raw row tuple from the `audit_log` table.
type AuditRow = (
    i64,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
);

/// SQL expression ordering the stored severity text; mirrors [`Severity::rank`].
const SEVERITY_RANK: &str = "CASE severity WHEN 'info' THEN 0 WHEN 'low' THEN 1 \
     WHEN 'medium' THEN 2 WHEN 'high' THEN 3 WHEN 'critical' THEN 4 END";

const SELECT_COLUMNS: &str = "SELECT seq, id, ts, actor_id, tenant_id, action, target, decision, \
     severity, context, prev_signature, signature FROM audit_log";

fn row_into_entry(row: AuditRow) -> Result<AuditEntry, ControlError> {
    let (
        seq,
        id,
        ts,
        actor_id,
        tenant_id,
        action,
        target,
        decision,
        severity,
        context,
        prev_signature,
        signature,
    ) = row;
    Ok(AuditEntry {
        seq,
        id: Uuid::parse_str(&id).map_err(|_| ControlError::CorruptRow {
            field: "audit_log.id",
            value: id.clone(),
        })?,
        timestamp: decode_time("audit_log.ts", &ts)?,
        actor_id,
        tenant_id,
        action,
        target,
        decision,
        severity: Severity::parse(&severity)?,
        context: serde_json::from_str(&context)?,
        prev_signature,
        signature,
    })
}

/// Append-only audit trail over the shared database.
///
/// Cheap to clone; clones share one writer actor.
#[derive(Clone)]
pub struct AuditTrail {
    db: SqlitePool,
    key: Arc<SigningKey>,
    writer_tx: mpsc::Sender<WriteOp>,
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail").finish_non_exhaustive()
    }
}

impl AuditTrail {
    /// Create the trail and spawn its writer actor.
    ///
    /// Must be called from within a Tokio runtime. The actor stops once every
    /// handle to the trail is dropped.
    pub fn new(db: SqlitePool, key: SigningKey, clock: Arc<dyn Clock>) -> Self {
        let key = Arc::new(key);
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        tokio::spawn(writer::run_writer(
            db.clone(),
            Arc::clone(&key),
            clock,
            writer_rx,
        ));
        info!("audit trail initialised");
        Self { db, key, writer_tx }
    }

    /// Append one entry and wait until it is committed.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::AuditWriterClosed`] if the actor stopped, or
    /// the storage/signing error that prevented the append.
    pub async fn record(&self, record: AuditRecord) -> Result<AuditEntry, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.writer_tx
            .send(WriteOp::Append { record, reply })
            .await
            .map_err(|_| ControlError::AuditWriterClosed)?;
        rx.await.map_err(|_| ControlError::AuditWriterClosed)?
    }

    /// Read entries matching `query`, oldest first. Read-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or a row cannot be decoded.
    pub async fn export(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, ControlError> {
        let sql = format!(
            "{SELECT_COLUMNS} \
             WHERE (?1 IS NULL OR ts >= ?1) \
               AND (?2 IS NULL OR ts < ?2) \
               AND (?3 IS NULL OR actor_id = ?3) \
               AND (?4 IS NULL OR tenant_id = ?4) \
               AND (?5 IS NULL OR action = ?5) \
               AND (?6 IS NULL OR {SEVERITY_RANK} >= ?6) \
             ORDER BY seq ASC \
             LIMIT ?7"
        );
        let limit = i64::from(query.limit.unwrap_or(DEFAULT_EXPORT_LIMIT));
        let from = query.from.map(encode_time).transpose()?;
        let until = query.until.map(encode_time).transpose()?;
        let rows: Vec<AuditRow> = sqlx::query_as(&sql)
            .bind(from)
            .bind(until)
            .bind(query.actor_id.as_deref())
            .bind(query.tenant_id.as_deref())
            .bind(query.action.as_deref())
            .bind(query.min_severity.map(|s| s.rank()))
            .bind(limit)
            .fetch_all(&self.db)
            .await?;
        rows.into_iter().map(row_into_entry).collect()
    }

    /// Number of stored entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub async fn count(&self) -> Result<u64, ControlError> {
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM audit_log")
            .fetch_one(&self.db)
            .await?;
        // count(*) is never negative.
        Ok(row.0.unsigned_abs())
    }

    /// Replay the whole chain and report the first broken link.
    ///
    /// A link is broken when a sequence number is skipped, when
    /// `prev_signature` does not match the preceding entry, or when the
    /// entry's own signature does not verify.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or a row cannot be decoded.
    pub async fn verify_chain(&self) -> Result<ChainReport, ControlError> {
        let sql = format!("{SELECT_COLUMNS} ORDER BY seq ASC");
        let rows: Vec<AuditRow> = sqlx::query_as(&sql).fetch_all(&self.db).await?;

        let mut expected_seq: i64 = 1;
        let mut expected_prev = GENESIS_SIGNATURE.to_owned();
        let mut entries: u64 = 0;
        let mut first_broken_seq = None;

        for row in rows {
            let entry = row_into_entry(row)?;
            entries = entries.saturating_add(1);
            if first_broken_seq.is_some() {
                continue;
            }
            let linked = entry.seq == expected_seq && entry.prev_signature == expected_prev;
            if !linked || !self.key.verify(&entry)? {
                first_broken_seq = Some(entry.seq);
                continue;
            }
            expected_seq = entry.seq.saturating_add(1);
            expected_prev = entry.signature;
        }

        Ok(ChainReport {
            entries,
            intact: first_broken_seq.is_none(),
            first_broken_seq,
        })
    }
}
