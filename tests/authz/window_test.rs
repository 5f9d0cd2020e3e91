//! Tests for `AuthorizationRegistry::is_authorized` and the derived expiry.

use chrono::Duration;

use scanguard::authz::{AuthorizationStatus, Decision, EffectiveStatus, TargetType};

use crate::harness::harness;

#[tokio::test]
async fn window_edges_are_inclusive() {
    let h = harness().await;
    let id = h.approved("acme", TargetType::Domain, "api.example.com").await;
    let record = h.plane.registry().get(id).await.expect("get");
    let registry = h.plane.registry();

    for (at, expected) in [
        (record.valid_from - Duration::microseconds(1), false),
        (record.valid_from, true),
        (record.valid_from + Duration::hours(12), true),
        (record.valid_until, true),
        (record.valid_until + Duration::microseconds(1), false),
    ] {
        let check = registry
            .is_authorized("acme", TargetType::Domain, "api.example.com", at)
            .await
            .expect("check");
        assert_eq!(check.authorized, expected, "at {at}");
        assert_eq!(check.authorization_id.is_some(), expected);
    }
}

#[tokio::test]
async fn lookup_normalizes_the_value() {
    let h = harness().await;
    let id = h.approved("acme", TargetType::Domain, "api.example.com").await;

    let check = h
        .plane
        .registry()
        .is_authorized("acme", TargetType::Domain, "API.EXAMPLE.COM.", h.now())
        .await
        .expect("check");
    assert_eq!(check.authorization_id, Some(id));

    let wrong_type = h
        .plane
        .registry()
        .is_authorized("acme", TargetType::Url, "api.example.com", h.now())
        .await
        .expect("malformed values are just unauthorized");
    assert!(!wrong_type.authorized);
}

#[tokio::test]
async fn pending_rejected_and_foreign_records_do_not_authorize() {
    let h = harness().await;
    let registry = h.plane.registry();

    registry
        .submit("acme", h.submission(TargetType::Domain, "pending.example.com", 24))
        .await
        .expect("submit");
    let rejected = registry
        .submit("acme", h.submission(TargetType::Domain, "rejected.example.com", 24))
        .await
        .expect("submit");
    registry
        .decide(rejected.id, "verifier", Decision::Reject, Some("wrong owner"))
        .await
        .expect("reject");
    h.approved("globex", TargetType::Domain, "foreign.example.com").await;

    for value in ["pending.example.com", "rejected.example.com", "foreign.example.com"] {
        let check = registry
            .is_authorized("acme", TargetType::Domain, value, h.now())
            .await
            .expect("check");
        assert!(!check.authorized, "{value}");
    }
}

#[tokio::test]
async fn overlapping_records_resolve_to_the_oldest() {
    let h = harness().await;
    let first = h.approved("acme", TargetType::Ip, "10.0.0.5").await;
    h.clock.advance(Duration::minutes(5));
    let second = h.approved("acme", TargetType::Ip, "10.0.0.5").await;
    assert_ne!(first, second);

    let check = h
        .plane
        .registry()
        .is_authorized("acme", TargetType::Ip, "10.0.0.5", h.now())
        .await
        .expect("check");
    assert_eq!(check.authorization_id, Some(first));

    // Once the older window closes the newer record takes over.
    h.clock.advance(Duration::hours(24) - Duration::minutes(2));
    let check = h
        .plane
        .registry()
        .is_authorized("acme", TargetType::Ip, "10.0.0.5", h.now())
        .await
        .expect("check");
    assert_eq!(check.authorization_id, Some(second));
}

#[tokio::test]
async fn expiry_is_computed_without_touching_storage() {
    let h = harness().await;
    let id = h.approved("acme", TargetType::Cidr, "10.1.0.0/16").await;

    h.clock.advance(Duration::hours(25));
    let check = h
        .plane
        .registry()
        .is_authorized("acme", TargetType::Cidr, "10.1.0.0/16", h.now())
        .await
        .expect("check");
    assert!(!check.authorized);

    let record = h.plane.registry().get(id).await.expect("get");
    assert_eq!(record.status, AuthorizationStatus::Approved);
    assert_eq!(record.effective_status(h.now()), EffectiveStatus::Expired);
    assert!(record.is_expired(h.now()));
}
