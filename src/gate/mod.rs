//! Scan admission.
//!
//! [`ScanGate::admit`] is the single point every scan must pass before it
//! starts. Checks run in a fixed order (emergency stop, session, target
//! authorization) and every call leaves exactly one `scan_admission` entry
//! in the audit trail, including calls that fail on infrastructure.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::audit::{AuditRecord, AuditTrail, Severity};
use crate::authz::{AuthorizationCheck, AuthorizationRegistry, TargetType};
use crate::clock::Clock;
use crate::emergency::EmergencyStopController;
use crate::error::ControlError;
use crate::pulse::{AuthorizationSession, SessionStore};

/// A request to start one scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Tenant the scan runs for.
    pub tenant_id: String,
    /// Session of the requesting actor.
    pub session_id: Uuid,
    /// Kind of target.
    pub target_type: TargetType,
    /// Target address, domain, range or URL.
    pub target_value: String,
}

/// Why a scan was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The platform is stopped.
    EmergencyStop,
    /// The session is unknown, revoked, expired or belongs to another tenant.
    SessionInvalid,
    /// No approved authorization covers the target right now.
    TargetNotAuthorized,
}

impl DenyReason {
    /// Human-readable reason.
    pub fn message(&self) -> &'static str {
        match self {
            Self::EmergencyStop => "platform emergency stop",
            Self::SessionInvalid => "session invalid",
            Self::TargetNotAuthorized => "target not authorized",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Verdict of [`ScanGate::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "detail", rename_all = "lowercase")]
pub enum Admission {
    /// The scan may start.
    Allow {
        /// The authorization record that permitted it.
        authorization_id: Uuid,
    },
    /// The scan must not start.
    Deny(DenyReason),
}

impl Admission {
    /// Whether the scan may start.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Admission facade over the stop flag, sessions and the registry.
#[derive(Clone)]
pub struct ScanGate {
    emergency: EmergencyStopController,
    sessions: SessionStore,
    registry: AuthorizationRegistry,
    audit: AuditTrail,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ScanGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanGate").finish_non_exhaustive()
    }
}

impl ScanGate {
    /// Create a gate.
    pub fn new(
        emergency: EmergencyStopController,
        sessions: SessionStore,
        registry: AuthorizationRegistry,
        audit: AuditTrail,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            emergency,
            sessions,
            registry,
            audit,
            clock,
        }
    }

    /// Decide whether a scan may start, and audit the decision.
    ///
    /// # Errors
    ///
    /// Returns an error when a check or the audit append could not be
    /// completed. The caller must not start the scan.
    pub async fn admit(&self, request: &AdmissionRequest) -> Result<Admission, ControlError> {
        let target = format!("{}:{}", request.target_type, request.target_value);
        let evaluated = self.evaluate(request).await;

        let (actor, admission) = match evaluated {
            Ok(pair) => pair,
            Err(err) => {
                let record = AuditRecord::new(
                    request.session_id.to_string(),
                    "scan_admission",
                    &target,
                    "error",
                )
                .tenant(&request.tenant_id)
                .severity(Severity::High)
                .context(serde_json::json!({
                    "session_id": request.session_id,
                    "error": err.to_string(),
                }));
                if let Err(audit_err) = self.audit.record(record).await {
                    error!(error = %audit_err, "failed to audit admission fault");
                }
                error!(error = %err, tenant = %request.tenant_id, %target, "admission check failed");
                return Err(err);
            }
        };

        let (decision, severity, context) = match admission {
            Admission::Allow { authorization_id } => (
                "allow",
                Severity::Info,
                serde_json::json!({
                    "session_id": request.session_id,
                    "authorization_id": authorization_id,
                }),
            ),
            Admission::Deny(reason) => (
                "deny",
                Severity::Medium,
                serde_json::json!({
                    "session_id": request.session_id,
                    "reason": reason,
                    "message": reason.message(),
                }),
            ),
        };
        self.audit
            .record(
                AuditRecord::new(actor, "scan_admission", &target, decision)
                    .tenant(&request.tenant_id)
                    .severity(severity)
                    .context(context),
            )
            .await?;

        match admission {
            Admission::Allow { authorization_id } => {
                info!(tenant = %request.tenant_id, %target, %authorization_id, "scan admitted");
            }
            Admission::Deny(reason) => {
                info!(tenant = %request.tenant_id, %target, %reason, "scan denied");
            }
        }
        Ok(admission)
    }

    /// Returns the acting principal (for the audit entry) and the verdict.
    async fn evaluate(
        &self,
        request: &AdmissionRequest,
    ) -> Result<(String, Admission), ControlError> {
        let now = self.clock.now();
        let actor_of = |session: Option<&AuthorizationSession>| {
            session.map_or_else(|| request.session_id.to_string(), |s| s.actor_id.clone())
        };

        if self.emergency.is_active().await? {
            // The session only names the actor here; failing to read it does
            // not change the verdict.
            let session = self.sessions.get(request.session_id).await.ok().flatten();
            return Ok((
                actor_of(session.as_ref()),
                Admission::Deny(DenyReason::EmergencyStop),
            ));
        }

        let session = self.sessions.get(request.session_id).await?;
        let actor = actor_of(session.as_ref());
        let session_ok = session
            .as_ref()
            .is_some_and(|s| s.tenant_id == request.tenant_id && s.is_valid(now));
        if !session_ok {
            debug!(session = %request.session_id, "session missing, revoked, expired or foreign");
            return Ok((actor, Admission::Deny(DenyReason::SessionInvalid)));
        }

        let check = self
            .registry
            .is_authorized(
                &request.tenant_id,
                request.target_type,
                &request.target_value,
                now,
            )
            .await?;
        let admission = match check.authorization_id {
            Some(authorization_id) if check.authorized => Admission::Allow { authorization_id },
            _ => Admission::Deny(DenyReason::TargetNotAuthorized),
        };
        Ok((actor, admission))
    }

    /// Read-only target check. Not audited.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry cannot be read.
    pub async fn preflight(
        &self,
        tenant_id: &str,
        target_type: TargetType,
        target_value: &str,
    ) -> Result<AuthorizationCheck, ControlError> {
        self.registry
            .is_authorized(tenant_id, target_type, target_value, self.clock.now())
            .await
    }
}
