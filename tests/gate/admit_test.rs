//! Tests for `ScanGate::admit`, `preflight` and `ControlPlane::start_scan`.

use chrono::Duration;
use uuid::Uuid;

use scanguard::audit::{AuditQuery, Severity};
use scanguard::authz::TargetType;
use scanguard::emergency::ScanStatus;
use scanguard::gate::{Admission, DenyReason};

use crate::harness::{admission, harness, Harness};

async fn admissions(h: &Harness) -> Vec<scanguard::audit::AuditEntry> {
    h.plane
        .audit()
        .export(&AuditQuery {
            action: Some("scan_admission".to_owned()),
            ..AuditQuery::default()
        })
        .await
        .expect("export")
}

#[tokio::test]
async fn authorized_target_with_live_session_is_allowed() {
    let h = harness().await;
    let authz = h.approved("acme", TargetType::Domain, "api.example.com").await;
    let session = h.session("alice", "acme").await;

    let verdict = h
        .plane
        .admit(&admission("acme", session.id, TargetType::Domain, "api.example.com"))
        .await
        .expect("admit");
    assert_eq!(verdict, Admission::Allow { authorization_id: authz });

    let audit = admissions(&h).await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].actor_id, "alice");
    assert_eq!(audit[0].tenant_id.as_deref(), Some("acme"));
    assert_eq!(audit[0].decision, "allow");
    assert_eq!(audit[0].severity, Severity::Info);
    assert_eq!(audit[0].target, "domain:api.example.com");
}

#[tokio::test]
async fn admission_resumes_after_manual_deactivation() {
    let h = harness().await;
    let authz = h.approved("acme", TargetType::Domain, "api.example.com").await;
    let session = h.session("alice", "acme").await;
    let request = admission("acme", session.id, TargetType::Domain, "api.example.com");

    h.plane
        .emergency()
        .activate("incident", Some(30), "ops-1")
        .await
        .expect("activate");
    assert_eq!(
        h.plane.admit(&request).await.expect("admit"),
        Admission::Deny(DenyReason::EmergencyStop)
    );

    h.plane
        .emergency()
        .deactivate("ops-2")
        .await
        .expect("deactivate");
    assert_eq!(
        h.plane.admit(&request).await.expect("admit"),
        Admission::Allow { authorization_id: authz }
    );

    let decisions: Vec<String> = admissions(&h).await.into_iter().map(|e| e.decision).collect();
    assert_eq!(decisions, vec!["deny".to_owned(), "allow".to_owned()]);
}

#[tokio::test]
async fn refused_long_stop_leaves_admission_unchanged() {
    let h = harness().await;
    let authz = h.approved("acme", TargetType::Domain, "api.example.com").await;
    let session = h.session("alice", "acme").await;
    let request = admission("acme", session.id, TargetType::Domain, "api.example.com");

    assert!(h
        .plane
        .emergency()
        .activate("incident", Some(u32::MAX), "ops-1")
        .await
        .is_err());
    assert_eq!(
        h.plane.admit(&request).await.expect("admit"),
        Admission::Allow { authorization_id: authz }
    );

    h.plane
        .emergency()
        .activate("incident", Some(525_600), "ops-1")
        .await
        .expect("activate");
    assert_eq!(
        h.plane.admit(&request).await.expect("admit"),
        Admission::Deny(DenyReason::EmergencyStop)
    );
}

#[tokio::test]
async fn emergency_stop_wins_over_everything() {
    let h = harness().await;
    h.approved("acme", TargetType::Domain, "api.example.com").await;
    let session = h.session("alice", "acme").await;
    h.plane
        .emergency()
        .activate("incident", Some(10), "ops-1")
        .await
        .expect("activate");

    let verdict = h
        .plane
        .admit(&admission("acme", session.id, TargetType::Domain, "api.example.com"))
        .await
        .expect("admit");
    assert_eq!(verdict, Admission::Deny(DenyReason::EmergencyStop));

    // The stop is checked first, so even an unknown session reads as a stop.
    let verdict = h
        .plane
        .admit(&admission("acme", Uuid::new_v4(), TargetType::Domain, "api.example.com"))
        .await
        .expect("admit");
    assert_eq!(verdict, Admission::Deny(DenyReason::EmergencyStop));

    let audit = admissions(&h).await;
    assert_eq!(audit.len(), 2);
    assert_eq!(audit[0].actor_id, "alice");
    assert_eq!(audit[0].decision, "deny");
    assert_eq!(audit[0].severity, Severity::Medium);
    assert_eq!(audit[0].context["reason"], "emergency_stop");
}

#[tokio::test]
async fn unusable_sessions_are_denied() {
    let h = harness().await;
    h.approved("acme", TargetType::Domain, "api.example.com").await;

    let revoked = h.session("alice", "acme").await;
    h.plane
        .sessions()
        .revoke(revoked.id, "logout elsewhere", h.now())
        .await
        .expect("revoke");
    let foreign = h.session("mallory", "globex").await;
    let expiring = h.session("bob", "acme").await;

    for session_id in [Uuid::new_v4(), revoked.id, foreign.id] {
        let verdict = h
            .plane
            .admit(&admission("acme", session_id, TargetType::Domain, "api.example.com"))
            .await
            .expect("admit");
        assert_eq!(verdict, Admission::Deny(DenyReason::SessionInvalid));
    }

    h.clock
        .advance(Duration::minutes(i64::from(h.config.sessions.lease_minutes)) + Duration::seconds(1));
    let verdict = h
        .plane
        .admit(&admission("acme", expiring.id, TargetType::Domain, "api.example.com"))
        .await
        .expect("admit");
    assert_eq!(verdict, Admission::Deny(DenyReason::SessionInvalid));

    assert_eq!(admissions(&h).await.len(), 4);
}

#[tokio::test]
async fn unauthorized_target_is_denied() {
    let h = harness().await;
    h.approved("acme", TargetType::Domain, "api.example.com").await;
    let session = h.session("alice", "acme").await;

    for (target_type, value) in [
        (TargetType::Domain, "other.example.com"),
        (TargetType::Ip, "10.0.0.1"),
        (TargetType::Domain, "not a domain"),
    ] {
        let verdict = h
            .plane
            .admit(&admission("acme", session.id, target_type, value))
            .await
            .expect("admit");
        assert_eq!(verdict, Admission::Deny(DenyReason::TargetNotAuthorized));
    }
}

#[tokio::test]
async fn every_admission_leaves_exactly_one_entry() {
    let h = harness().await;
    h.approved("acme", TargetType::Domain, "api.example.com").await;
    let session = h.session("alice", "acme").await;
    let before = h.audit_count().await;

    let mut handles = Vec::new();
    for i in 0..12 {
        let plane = h.plane.clone();
        let value = if i % 3 == 0 { "api.example.com" } else { "x.example.com" };
        let request = admission("acme", session.id, TargetType::Domain, value);
        handles.push(tokio::spawn(async move { plane.admit(&request).await }));
    }
    for handle in handles {
        handle.await.expect("task").expect("admit");
    }

    assert_eq!(h.audit_count().await, before + 12);
    assert!(h.plane.verify_audit_chain().await.expect("verify").intact);
}

#[tokio::test]
async fn storage_fault_is_an_error_not_an_allow() {
    let h = harness().await;
    let session = h.session("alice", "acme").await;
    h.db.close().await;

    let err = h
        .plane
        .admit(&admission("acme", session.id, TargetType::Domain, "api.example.com"))
        .await
        .expect_err("closed store");
    assert!(err.is_infrastructure());
}

#[tokio::test]
async fn preflight_is_not_audited() {
    let h = harness().await;
    let id = h.approved("acme", TargetType::Ip, "192.0.2.10").await;
    let before = h.audit_count().await;

    let check = h
        .plane
        .gate()
        .preflight("acme", TargetType::Ip, "192.0.2.10")
        .await
        .expect("preflight");
    assert!(check.authorized);
    assert_eq!(check.authorization_id, Some(id));
    assert_eq!(h.audit_count().await, before);
}

#[tokio::test]
async fn start_scan_queues_only_admitted_scans() {
    let h = harness().await;
    h.approved("acme", TargetType::Domain, "api.example.com").await;
    let session = h.session("alice", "acme").await;

    let started = h
        .plane
        .start_scan(&admission("acme", session.id, TargetType::Domain, "API.example.com"))
        .await
        .expect("start");
    assert!(started.admission.is_allowed());
    let scan_id = started.scan_id.expect("queued");
    assert_eq!(
        h.plane.scans().status(scan_id).await.expect("status").0,
        ScanStatus::Pending
    );

    let refused = h
        .plane
        .start_scan(&admission("acme", session.id, TargetType::Domain, "evil.example.com"))
        .await
        .expect("start");
    assert_eq!(refused.admission, Admission::Deny(DenyReason::TargetNotAuthorized));
    assert!(refused.scan_id.is_none());

    let queued: (i64,) = sqlx::query_as("SELECT count(*) FROM scan_jobs")
        .fetch_one(&h.db)
        .await
        .expect("count");
    assert_eq!(queued.0, 1);
}
