//! Transport-agnostic control plane surface.
//!
//! [`ControlPlane`] wires every component over one shared database and
//! exposes the operations a gateway would route to, with serde request and
//! response shapes. It performs the audit writes that belong to the
//! operation rather than to a component (submission and review decisions).

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditQuery, AuditRecord, AuditTrail, ChainReport, Severity, SigningKey};
use crate::authz::{
    AuthorizationCheck, AuthorizationRegistry, AuthorizationStatus, AuthorizationTarget,
    Decision, SubmitAuthorization, TargetType,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::emergency::{EmergencyStatus, EmergencyStopController, ScanHalter, ScanJobs};
use crate::error::ControlError;
use crate::gate::{Admission, AdmissionRequest, ScanGate};
use crate::pulse::{
    AuthorizationSession, HttpPulseAuthority, PulseAuthority, PulseMonitor, PulseMonitorDeps,
    SessionStore,
};

/// Response to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    /// New record id.
    pub id: Uuid,
    /// Always `pending`.
    pub status: AuthorizationStatus,
}

/// A verifier's review of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecideRequest {
    /// Record under review.
    pub id: Uuid,
    /// `approve` or `reject`.
    pub action: Decision,
    /// Required when rejecting.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Result of a review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecideResponse {
    /// Record id.
    pub id: Uuid,
    /// New stored status.
    pub status: AuthorizationStatus,
}

/// Target to check without side effects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightRequest {
    /// Kind of target.
    pub target_type: TargetType,
    /// Target value.
    pub target_value: String,
}

/// Request to stop the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateRequest {
    /// Why the platform is being stopped.
    pub reason: String,
    /// Minutes until the stop lapses; the configured default when absent or 0.
    #[serde(default)]
    pub duration_minutes: Option<u32>,
}

/// Result of stopping the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateResponse {
    /// Human-readable summary.
    pub message: String,
    /// Scans moved to `stopped`.
    pub scans_stopped: u64,
    /// When the stop lapses.
    pub expires_at: DateTime<Utc>,
}

/// Result of resuming the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivateResponse {
    /// Human-readable summary.
    pub message: String,
}

/// Result of admitting and queueing a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStart {
    /// The gate's verdict.
    pub admission: Admission,
    /// Queued job, present only when admitted.
    pub scan_id: Option<Uuid>,
}

/// Every control plane component over one database.
#[derive(Clone)]
pub struct ControlPlane {
    registry: AuthorizationRegistry,
    emergency: EmergencyStopController,
    sessions: SessionStore,
    gate: ScanGate,
    audit: AuditTrail,
    scans: ScanJobs,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Read the audit signing key from the environment variable named in config.
///
/// # Errors
///
/// Returns an error if the variable is unset or the key is too short.
pub fn signing_key_from_env(config: &Config) -> anyhow::Result<SigningKey> {
    let var = &config.audit.signing_key_env;
    let secret = std::env::var(var)
        .with_context(|| format!("audit signing key not set: export {var}"))?;
    SigningKey::from_bytes(secret.into_bytes())
        .with_context(|| format!("invalid audit signing key in {var}"))
}

impl ControlPlane {
    /// Open the configured database and wire everything with the system clock.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the signing key
    /// is missing.
    pub async fn from_config(config: Config) -> anyhow::Result<Self> {
        let db_path = config.db_path()?;
        let db = crate::store::open(&db_path, &config.store).await?;
        let key = signing_key_from_env(&config)?;
        Ok(Self::new(db, key, Arc::new(SystemClock), config))
    }

    /// Wire components over an open pool. Scans are halted through the
    /// `scan_jobs` table.
    pub fn new(db: SqlitePool, key: SigningKey, clock: Arc<dyn Clock>, config: Config) -> Self {
        let scans = ScanJobs::new(db.clone());
        Self::with_halter(db, key, clock, Arc::new(scans), config)
    }

    /// Wire components with a custom scan-lifecycle hook.
    pub fn with_halter(
        db: SqlitePool,
        key: SigningKey,
        clock: Arc<dyn Clock>,
        halter: Arc<dyn ScanHalter>,
        config: Config,
    ) -> Self {
        let audit = AuditTrail::new(db.clone(), key, Arc::clone(&clock));
        let registry = AuthorizationRegistry::new(db.clone(), Arc::clone(&clock));
        let sessions = SessionStore::new(db.clone(), Arc::clone(&clock));
        let emergency = EmergencyStopController::new(
            db.clone(),
            Arc::clone(&clock),
            audit.clone(),
            halter,
            config.emergency.clone(),
        );
        let gate = ScanGate::new(
            emergency.clone(),
            sessions.clone(),
            registry.clone(),
            audit.clone(),
            Arc::clone(&clock),
        );
        Self {
            registry,
            emergency,
            sessions,
            gate,
            audit,
            scans: ScanJobs::new(db),
            clock,
            config,
        }
    }

    /// Build a pulse monitor against `authority`.
    pub fn pulse_monitor(&self, authority: Arc<dyn PulseAuthority>) -> PulseMonitor {
        PulseMonitor::new(
            PulseMonitorDeps {
                sessions: self.sessions.clone(),
                authority,
                emergency: self.emergency.clone(),
                audit: self.audit.clone(),
                clock: Arc::clone(&self.clock),
            },
            self.config.pulse.clone(),
        )
    }

    /// Build the HTTP pulse monitor, or `None` when disabled or no
    /// authority URL is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn http_pulse_monitor(&self) -> Result<Option<PulseMonitor>, ControlError> {
        let pulse = &self.config.pulse;
        let Some(url) = pulse.authority_url.as_deref().filter(|_| pulse.enabled) else {
            return Ok(None);
        };
        let authority = HttpPulseAuthority::new(url, pulse.request_timeout())?;
        Ok(Some(self.pulse_monitor(Arc::new(authority))))
    }

    /// Record a document-backed authorization for review.
    ///
    /// # Errors
    ///
    /// Validation errors leave no trace; storage and audit faults propagate.
    pub async fn submit_authorization(
        &self,
        tenant_id: &str,
        submitted_by: &str,
        request: SubmitAuthorization,
    ) -> Result<SubmitResponse, ControlError> {
        let record = self.registry.submit(tenant_id, request).await?;
        self.audit
            .record(
                AuditRecord::new(
                    submitted_by,
                    "authorization_submitted",
                    format!("{}:{}", record.target_type, record.target_value),
                    "pending",
                )
                .tenant(tenant_id)
                .severity(Severity::Low)
                .context(serde_json::json!({
                    "authorization_id": record.id,
                    "document_hash": record.document_hash,
                    "authorized_by": record.authorized_by,
                    "valid_from": record.valid_from,
                    "valid_until": record.valid_until,
                })),
            )
            .await?;
        Ok(SubmitResponse {
            id: record.id,
            status: record.status,
        })
    }

    /// A tenant's authorizations, newest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn list_authorizations(
        &self,
        tenant_id: &str,
        status: Option<AuthorizationStatus>,
    ) -> Result<Vec<AuthorizationTarget>, ControlError> {
        self.registry.list(tenant_id, status).await
    }

    /// Approve or reject a pending authorization.
    ///
    /// # Errors
    ///
    /// `MissingReason`, `NotFound` and `AlreadyDecided` leave no trace;
    /// storage and audit faults propagate.
    pub async fn decide_authorization(
        &self,
        request: DecideRequest,
        verifier_id: &str,
    ) -> Result<DecideResponse, ControlError> {
        let record = self
            .registry
            .decide(request.id, verifier_id, request.action, request.reason.as_deref())
            .await?;
        let action = match request.action {
            Decision::Approve => "authorization_approved",
            Decision::Reject => "authorization_rejected",
        };
        self.audit
            .record(
                AuditRecord::new(
                    verifier_id,
                    action,
                    format!("{}:{}", record.target_type, record.target_value),
                    record.status.as_str(),
                )
                .tenant(&record.tenant_id)
                .severity(Severity::Medium)
                .context(serde_json::json!({
                    "authorization_id": record.id,
                    "rejection_reason": record.rejection_reason,
                })),
            )
            .await?;
        Ok(DecideResponse {
            id: record.id,
            status: record.status,
        })
    }

    /// Whether a target is authorized right now. Not audited.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn preflight(
        &self,
        tenant_id: &str,
        request: &PreflightRequest,
    ) -> Result<AuthorizationCheck, ControlError> {
        self.gate
            .preflight(tenant_id, request.target_type, &request.target_value)
            .await
    }

    /// Stop the platform.
    ///
    /// # Errors
    ///
    /// See [`EmergencyStopController::activate`].
    pub async fn activate_emergency_stop(
        &self,
        request: &ActivateRequest,
        actor_id: &str,
    ) -> Result<ActivateResponse, ControlError> {
        let activation = self
            .emergency
            .activate(&request.reason, request.duration_minutes, actor_id)
            .await?;
        Ok(ActivateResponse {
            message: "Emergency stop activated. All scans have been stopped.".to_owned(),
            scans_stopped: activation.scans_stopped,
            expires_at: activation.expires_at,
        })
    }

    /// Resume the platform.
    ///
    /// # Errors
    ///
    /// See [`EmergencyStopController::deactivate`].
    pub async fn deactivate_emergency_stop(
        &self,
        actor_id: &str,
    ) -> Result<DeactivateResponse, ControlError> {
        let outcome = self.emergency.deactivate(actor_id).await?;
        let message = if outcome.was_active {
            "Emergency stop deactivated. Platform operations resumed."
        } else {
            "Emergency stop was not active."
        };
        Ok(DeactivateResponse {
            message: message.to_owned(),
        })
    }

    /// Current stop flag.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn emergency_status(&self) -> Result<EmergencyStatus, ControlError> {
        self.emergency.status().await
    }

    /// Middleware check for ordinary requests.
    pub async fn permits_request(&self) -> bool {
        self.emergency.permits_request().await
    }

    /// Regulatory export.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn export_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, ControlError> {
        self.audit.export(query).await
    }

    /// Replay the audit chain.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn verify_audit_chain(&self) -> Result<ChainReport, ControlError> {
        self.audit.verify_chain().await
    }

    /// Open a session leased for `sessions.lease_minutes`.
    ///
    /// # Errors
    ///
    /// Returns a validation or storage error.
    pub async fn login(
        &self,
        actor_id: &str,
        tenant_id: &str,
        features: Vec<String>,
    ) -> Result<AuthorizationSession, ControlError> {
        let lease = Duration::minutes(i64::from(self.config.sessions.lease_minutes));
        self.sessions.login(actor_id, tenant_id, features, lease).await
    }

    /// End a session. Returns `false` if it did not exist.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn logout(&self, session_id: Uuid) -> Result<bool, ControlError> {
        self.sessions.logout(session_id).await
    }

    /// Admission decision for one scan.
    ///
    /// # Errors
    ///
    /// See [`ScanGate::admit`].
    pub async fn admit(&self, request: &AdmissionRequest) -> Result<Admission, ControlError> {
        self.gate.admit(request).await
    }

    /// Admit a scan and, if allowed, queue it.
    ///
    /// # Errors
    ///
    /// Returns the admission or queueing error. Nothing is queued on error.
    pub async fn start_scan(&self, request: &AdmissionRequest) -> Result<ScanStart, ControlError> {
        let admission = self.gate.admit(request).await?;
        if !admission.is_allowed() {
            return Ok(ScanStart {
                admission,
                scan_id: None,
            });
        }
        let normalized = request.target_type.normalize(&request.target_value)?;
        let scan_id = self
            .scans
            .enqueue(
                &request.tenant_id,
                request.target_type,
                &normalized,
                self.clock.now(),
            )
            .await?;
        info!(%scan_id, tenant = %request.tenant_id, "scan queued");
        Ok(ScanStart {
            admission,
            scan_id: Some(scan_id),
        })
    }

    /// Authorization registry.
    pub fn registry(&self) -> &AuthorizationRegistry {
        &self.registry
    }

    /// Emergency stop controller.
    pub fn emergency(&self) -> &EmergencyStopController {
        &self.emergency
    }

    /// Session store.
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Admission gate.
    pub fn gate(&self) -> &ScanGate {
        &self.gate
    }

    /// Audit trail.
    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Scan job table.
    pub fn scans(&self) -> &ScanJobs {
        &self.scans
    }
}
