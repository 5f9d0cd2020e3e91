//! Tests for `SessionStore`.

use chrono::Duration;
use uuid::Uuid;

use scanguard::error::ControlError;

use crate::harness::harness;

#[tokio::test]
async fn login_opens_a_leased_session() {
    let h = harness().await;
    let session = h
        .plane
        .sessions()
        .login("alice", "acme", vec!["scans".to_owned(), "reports".to_owned()], Duration::hours(2))
        .await
        .expect("login");

    assert_eq!(session.issued_at, h.now());
    assert_eq!(session.expires_at, h.now() + Duration::hours(2));
    assert!(session.is_valid(h.now()));

    let stored = h.plane.sessions().get(session.id).await.expect("get");
    assert_eq!(stored, Some(session));
}

#[tokio::test]
async fn login_rejects_blank_identity_and_empty_lease() {
    let h = harness().await;
    let sessions = h.plane.sessions();
    assert!(matches!(
        sessions.login(" ", "acme", Vec::new(), Duration::hours(1)).await,
        Err(ControlError::InvalidInput(_))
    ));
    assert!(matches!(
        sessions.login("alice", "acme", Vec::new(), Duration::zero()).await,
        Err(ControlError::InvalidInput(_))
    ));
    assert!(matches!(
        sessions.login("alice", "acme", Vec::new(), Duration::days(2_920_000)).await,
        Err(ControlError::TimeOutOfRange(_))
    ));
    assert!(sessions.live_sessions(h.now()).await.expect("live").is_empty());
}

#[tokio::test]
async fn live_sessions_skip_revoked_and_expired() {
    let h = harness().await;
    let sessions = h.plane.sessions();
    let short = sessions
        .login("alice", "acme", Vec::new(), Duration::minutes(5))
        .await
        .expect("login");
    let revoked = h.session("bob", "acme").await;
    let live = h.session("carol", "acme").await;
    assert!(sessions.revoke(revoked.id, "offboarded", h.now()).await.expect("revoke"));

    h.clock.advance(Duration::minutes(10));
    let ids: Vec<Uuid> = sessions
        .live_sessions(h.now())
        .await
        .expect("live")
        .iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids, vec![live.id]);
    assert!(!ids.contains(&short.id));
}

#[tokio::test]
async fn revocation_cuts_the_lease_and_is_one_shot() {
    let h = harness().await;
    let sessions = h.plane.sessions();
    let session = h.session("alice", "acme").await;

    assert!(sessions.revoke(session.id, "stolen token", h.now()).await.expect("revoke"));
    assert!(!sessions.revoke(session.id, "again", h.now()).await.expect("revoke"));

    let stored = sessions.get(session.id).await.expect("get").expect("exists");
    assert!(stored.revoked);
    assert_eq!(stored.revoked_at, Some(h.now()));
    assert_eq!(stored.expires_at, h.now());
    assert_eq!(stored.revocation_reason.as_deref(), Some("stolen token"));
    assert!(!sessions.record_pulse(session.id, h.now()).await.expect("pulse"));
}

#[tokio::test]
async fn revoke_all_is_idempotent() {
    let h = harness().await;
    let sessions = h.plane.sessions();
    h.session("alice", "acme").await;
    h.session("bob", "globex").await;

    assert_eq!(sessions.revoke_all("platform stop", h.now()).await.expect("revoke"), 2);
    assert_eq!(sessions.revoke_all("platform stop", h.now()).await.expect("revoke"), 0);
    assert!(sessions.live_sessions(h.now()).await.expect("live").is_empty());
}

#[tokio::test]
async fn logout_destroys_the_session() {
    let h = harness().await;
    let session = h.session("alice", "acme").await;

    assert!(h.plane.logout(session.id).await.expect("logout"));
    assert!(!h.plane.logout(session.id).await.expect("logout"));
    assert!(h.plane.sessions().get(session.id).await.expect("get").is_none());
}
