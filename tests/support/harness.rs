//! Shared setup: a control plane over a temporary database and a manual clock.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

use scanguard::audit::SigningKey;
use scanguard::authz::{Decision, SubmitAuthorization, TargetType};
use scanguard::clock::{Clock, ManualClock};
use scanguard::config::Config;
use scanguard::emergency::ScanHalter;
use scanguard::gate::AdmissionRequest;
use scanguard::pulse::AuthorizationSession;
use scanguard::service::{ControlPlane, DecideRequest};

/// HMAC key used by every test trail.
pub const SIGNING_KEY: &[u8] = b"integration-test-signing-key-0001";

/// Fixed starting instant for the manual clock.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
        .single()
        .expect("valid instant")
}

/// A wired control plane plus handles tests poke at directly.
pub struct Harness {
    pub plane: ControlPlane,
    pub clock: Arc<ManualClock>,
    pub db: SqlitePool,
    pub config: Config,
    pub dir: TempDir,
}

/// Defaults with a temp database path and millisecond backoff.
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.store.db_path = Some(dir.path().join("control.db"));
    config.pulse.initial_backoff_ms = 1;
    config.pulse.max_backoff_ms = 5;
    config
}

pub async fn harness() -> Harness {
    harness_with(|_| {}, None).await
}

pub async fn harness_with(
    tweak: impl FnOnce(&mut Config),
    halter: Option<Arc<dyn ScanHalter>>,
) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(&dir);
    tweak(&mut config);
    let db_path = config.db_path().expect("db path");
    let db = scanguard::store::open(&db_path, &config.store)
        .await
        .expect("store should open");
    let clock = Arc::new(ManualClock::new(t0()));
    let key = SigningKey::from_bytes(SIGNING_KEY.to_vec()).expect("key");
    let plane = match halter {
        Some(halter) => ControlPlane::with_halter(
            db.clone(),
            key,
            Arc::clone(&clock) as Arc<dyn Clock>,
            halter,
            config.clone(),
        ),
        None => ControlPlane::new(
            db.clone(),
            key,
            Arc::clone(&clock) as Arc<dyn Clock>,
            config.clone(),
        ),
    };
    Harness {
        plane,
        clock,
        db,
        config,
        dir,
    }
}

impl Harness {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Submission valid from now for `hours`.
    pub fn submission(&self, target_type: TargetType, value: &str, hours: i64) -> SubmitAuthorization {
        SubmitAuthorization {
            target_type,
            target_value: value.to_owned(),
            authorized_by: "Jane Doe, CISO".to_owned(),
            document_ref: format!("https://docs.example.com/authz/{value}.pdf"),
            valid_from: self.now(),
            valid_until: self.now() + Duration::hours(hours),
            scope_notes: None,
        }
    }

    /// Submit and approve a 24 hour authorization.
    pub async fn approved(&self, tenant: &str, target_type: TargetType, value: &str) -> Uuid {
        let submitted = self
            .plane
            .submit_authorization(tenant, "submitter", self.submission(target_type, value, 24))
            .await
            .expect("submit");
        self.plane
            .decide_authorization(
                DecideRequest {
                    id: submitted.id,
                    action: Decision::Approve,
                    reason: None,
                },
                "verifier",
            )
            .await
            .expect("approve");
        submitted.id
    }

    pub async fn session(&self, actor: &str, tenant: &str) -> AuthorizationSession {
        self.plane
            .login(actor, tenant, vec!["scans".to_owned()])
            .await
            .expect("login")
    }

    pub async fn audit_count(&self) -> u64 {
        self.plane.audit().count().await.expect("count")
    }

    /// Insert a scan job row with the given status.
    pub async fn scan_job(&self, status: &str) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO scan_jobs (id, tenant_id, target_type, target_value, status, created_at) \
             VALUES (?1, 'acme', 'domain', 'api.example.com', ?2, '2026-03-02T08:00:00.000000Z')",
        )
        .bind(id.to_string())
        .bind(status)
        .execute(&self.db)
        .await
        .expect("insert scan job");
        id
    }
}

pub fn admission(
    tenant: &str,
    session_id: Uuid,
    target_type: TargetType,
    value: &str,
) -> AdmissionRequest {
    AdmissionRequest {
        tenant_id: tenant.to_owned(),
        session_id,
        target_type,
        target_value: value.to_owned(),
    }
}
