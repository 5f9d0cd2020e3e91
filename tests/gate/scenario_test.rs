//! End-to-end flows across the registry, the stop flag and the gate.

use chrono::Duration;

use scanguard::authz::{Decision, TargetType};
use scanguard::gate::{Admission, DenyReason};
use scanguard::service::{ActivateRequest, DecideRequest, PreflightRequest};

use crate::harness::{admission, harness};

#[tokio::test]
async fn authorization_lifecycle_over_a_day() {
    let h = harness().await;
    let preflight = PreflightRequest {
        target_type: TargetType::Domain,
        target_value: "api.example.com".to_owned(),
    };

    let submitted = h
        .plane
        .submit_authorization(
            "acme",
            "alice",
            h.submission(TargetType::Domain, "api.example.com", 24),
        )
        .await
        .expect("submit");
    let check = h.plane.preflight("acme", &preflight).await.expect("preflight");
    assert!(!check.authorized, "pending records do not authorize");

    h.plane
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
    let check = h.plane.preflight("acme", &preflight).await.expect("preflight");
    assert!(check.authorized);
    assert_eq!(check.authorization_id, Some(submitted.id));

    h.clock.advance(Duration::hours(24) + Duration::seconds(1));
    let check = h.plane.preflight("acme", &preflight).await.expect("preflight");
    assert!(!check.authorized, "window closed");
}

#[tokio::test]
async fn one_minute_drill_lapses_without_intervention() {
    let h = harness().await;
    let authz = h.approved("acme", TargetType::Domain, "api.example.com").await;
    let session = h.session("alice", "acme").await;
    let request = admission("acme", session.id, TargetType::Domain, "api.example.com");

    h.plane
        .activate_emergency_stop(
            &ActivateRequest {
                reason: "drill".to_owned(),
                duration_minutes: Some(1),
            },
            "ops-1",
        )
        .await
        .expect("activate");
    assert_eq!(
        h.plane.admit(&request).await.expect("admit"),
        Admission::Deny(DenyReason::EmergencyStop)
    );

    h.clock.advance(Duration::seconds(61));
    assert_eq!(
        h.plane.admit(&request).await.expect("admit"),
        Admission::Allow { authorization_id: authz }
    );
    assert!(h.plane.verify_audit_chain().await.expect("verify").intact);
}
