//! Session pulse monitor.
//!
//! Runs as a background Tokio task. Each tick revalidates every live session
//! against the external [`PulseAuthority`]. A session the authority denies or
//! revokes, or an authority that stays unreachable past the retry budget,
//! makes the tick unhealthy: every local session is revoked and the platform
//! emergency stop is activated. This is the only path that stops the
//! platform without a human.

pub mod authority;
pub mod sessions;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditRecord, AuditTrail, Severity};
use crate::clock::Clock;
use crate::config::PulseConfig;
use crate::emergency::EmergencyStopController;
use crate::error::ControlError;

pub use self::authority::{HttpPulseAuthority, PulseAuthority, PulseVerdict};
pub use self::sessions::{AuthorizationSession, SessionStore};

/// Actor recorded for autonomous remediation.
pub const PULSE_MONITOR_ACTOR: &str = "system:pulse-monitor";

/// Where the monitor is in its tick cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    /// Waiting for the next tick.
    Running,
    /// Probing sessions.
    Validating,
    /// Last tick found every session authorized.
    Healthy,
    /// Last tick found a failure; remediation is about to start.
    Unhealthy,
    /// Revoking sessions and stopping the platform.
    Remediating,
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Every live session was revalidated.
    Healthy {
        /// Sessions probed.
        checked: usize,
    },
    /// A failure was found and remediated.
    Remediated {
        /// Why the tick failed.
        reason: String,
        /// Sessions revoked.
        sessions_revoked: u64,
        /// Scans halted by the emergency stop.
        scans_stopped: u64,
    },
    /// Shutdown was signalled mid-tick. Nothing was remediated.
    Cancelled,
}

/// Exponential retry delay with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
}

impl Backoff {
    /// Create a policy starting at `initial` and capped at `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Policy from the `[pulse]` section.
    pub fn from_config(config: &PulseConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    /// Delay before retry number `retry` (0-based): `initial * 2^retry`
    /// capped at `max`, jittered down by up to half.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry);
        let ceiling = self.initial.saturating_mul(factor).min(self.max);
        let millis = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        let jittered = rand::thread_rng().gen_range(millis / 2..=millis);
        Duration::from_millis(jittered)
    }
}

enum Probe {
    Verdict(PulseVerdict),
    Unreachable(String),
    Cancelled,
}

/// Dependencies of the monitor.
pub struct PulseMonitorDeps {
    /// Session store to revalidate and revoke.
    pub sessions: SessionStore,
    /// External authority.
    pub authority: Arc<dyn PulseAuthority>,
    /// Platform stop used for remediation.
    pub emergency: EmergencyStopController,
    /// Audit sink.
    pub audit: AuditTrail,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// Periodic session revalidation.
pub struct PulseMonitor {
    deps: PulseMonitorDeps,
    config: PulseConfig,
    backoff: Backoff,
    state: watch::Sender<MonitorState>,
}

impl std::fmt::Debug for PulseMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulseMonitor")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PulseMonitor {
    /// Create a monitor. It does nothing until [`run`](Self::run) or
    /// [`tick`](Self::tick) is called.
    pub fn new(deps: PulseMonitorDeps, config: PulseConfig) -> Self {
        let (state, _) = watch::channel(MonitorState::Running);
        Self {
            backoff: Backoff::from_config(&config),
            deps,
            config,
            state,
        }
    }

    /// Current state.
    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<MonitorState> {
        self.state.subscribe()
    }

    /// Run ticks every `pulse.interval_secs` until shutdown is signalled or
    /// the shutdown sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.config.interval();
        info!(interval_secs = period.as_secs(), "pulse monitor started");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick(&mut shutdown).await {
                        Ok(TickOutcome::Cancelled) => break,
                        Ok(outcome) => debug!(?outcome, "pulse tick finished"),
                        Err(e) => error!(error = %e, "pulse tick failed"),
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.state.send_replace(MonitorState::Running);
        info!("pulse monitor stopped");
    }

    /// Execute a single tick.
    ///
    /// Shutdown is observed between probes and while backing off, never in
    /// the middle of a probe.
    ///
    /// # Errors
    ///
    /// Returns an error if sessions cannot be read or remediation fails.
    /// A healthy tick leaves the state at `Healthy`; every other outcome
    /// returns it to `Running`.
    pub async fn tick(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<TickOutcome, ControlError> {
        self.state.send_replace(MonitorState::Validating);
        let result = self.validate_and_remediate(shutdown).await;
        if !matches!(result, Ok(TickOutcome::Healthy { .. })) {
            self.state.send_replace(MonitorState::Running);
        }
        result
    }

    async fn validate_and_remediate(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<TickOutcome, ControlError> {
        let live = self.deps.sessions.live_sessions(self.deps.clock.now()).await?;
        debug!(sessions = live.len(), "pulse tick validating");

        for session in &live {
            if *shutdown.borrow() {
                return Ok(TickOutcome::Cancelled);
            }
            let failure = match self.probe(session, shutdown).await {
                Probe::Cancelled => return Ok(TickOutcome::Cancelled),
                Probe::Verdict(PulseVerdict::Authorized) => {
                    self.deps
                        .sessions
                        .record_pulse(session.id, self.deps.clock.now())
                        .await?;
                    continue;
                }
                Probe::Verdict(PulseVerdict::Denied(reason)) => {
                    format!("authority denied session {}: {reason}", session.id)
                }
                Probe::Verdict(PulseVerdict::Revoked(reason)) => {
                    format!("authority revoked session {}: {reason}", session.id)
                }
                Probe::Unreachable(err) => format!(
                    "authority unreachable after {} attempts: {err}",
                    self.config.max_attempts
                ),
            };
            self.state.send_replace(MonitorState::Unhealthy);
            warn!(session = %session.id, reason = %failure, "pulse check failed");
            return self.remediate(failure).await;
        }

        self.state.send_replace(MonitorState::Healthy);
        Ok(TickOutcome::Healthy {
            checked: live.len(),
        })
    }

    async fn probe(
        &self,
        session: &AuthorizationSession,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Probe {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.deps.authority.check(session).await {
                Ok(verdict) => return Probe::Verdict(verdict),
                Err(e) => {
                    last_error = e.to_string();
                    if attempt == attempts {
                        break;
                    }
                    let delay = self.backoff.delay(attempt.saturating_sub(1));
                    warn!(
                        session = %session.id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "pulse probe failed, retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait_for(|stop| *stop) => return Probe::Cancelled,
                    }
                }
            }
        }
        Probe::Unreachable(last_error)
    }

    async fn remediate(&self, reason: String) -> Result<TickOutcome, ControlError> {
        self.state.send_replace(MonitorState::Remediating);
        let now = self.deps.clock.now();

        let revoked = self.deps.sessions.revoke_all(&reason, now).await;
        if let Err(e) = &revoked {
            error!(error = %e, "failed to revoke sessions during remediation");
        }
        // The stop goes in even if revocation failed.
        let activation = self
            .deps
            .emergency
            .activate(&reason, None, PULSE_MONITOR_ACTOR)
            .await?;
        let sessions_revoked = revoked?;

        self.deps
            .audit
            .record(
                AuditRecord::new(PULSE_MONITOR_ACTOR, "pulse_check_failed", "platform", "remediated")
                    .severity(Severity::Critical)
                    .context(serde_json::json!({
                        "reason": reason,
                        "sessions_revoked": sessions_revoked,
                        "scans_stopped": activation.scans_stopped,
                        "stop_expires_at": activation.expires_at,
                    })),
            )
            .await?;

        Ok(TickOutcome::Remediated {
            reason,
            sessions_revoked,
            scans_stopped: activation.scans_stopped,
        })
    }
}
