//! Tests for `AuditTrail::export`.

use chrono::Duration;

use scanguard::audit::{AuditQuery, AuditRecord, Severity};

use crate::harness::harness;

#[tokio::test]
async fn export_filters_combine() {
    let h = harness().await;
    let trail = h.plane.audit();
    let start = h.now();

    trail
        .record(AuditRecord::new("alice", "scan_admission", "ip:10.0.0.1", "allow").tenant("acme"))
        .await
        .expect("record");
    h.clock.advance(Duration::minutes(1));
    trail
        .record(
            AuditRecord::new("bob", "scan_admission", "ip:10.0.0.2", "deny")
                .tenant("globex")
                .severity(Severity::Medium),
        )
        .await
        .expect("record");
    h.clock.advance(Duration::minutes(1));
    trail
        .record(
            AuditRecord::new("ops", "emergency_stop_activated", "platform", "activated")
                .severity(Severity::Critical),
        )
        .await
        .expect("record");

    let all = trail.export(&AuditQuery::default()).await.expect("export");
    assert_eq!(all.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);

    let by_tenant = trail
        .export(&AuditQuery {
            tenant_id: Some("acme".to_owned()),
            ..AuditQuery::default()
        })
        .await
        .expect("export");
    assert_eq!(by_tenant.len(), 1);
    assert_eq!(by_tenant[0].actor_id, "alice");

    let by_action = trail
        .export(&AuditQuery {
            action: Some("scan_admission".to_owned()),
            actor_id: Some("bob".to_owned()),
            ..AuditQuery::default()
        })
        .await
        .expect("export");
    assert_eq!(by_action.len(), 1);
    assert_eq!(by_action[0].decision, "deny");

    let severe = trail
        .export(&AuditQuery {
            min_severity: Some(Severity::Medium),
            ..AuditQuery::default()
        })
        .await
        .expect("export");
    assert_eq!(severe.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2, 3]);

    let window = trail
        .export(&AuditQuery {
            from: Some(start + Duration::minutes(1)),
            until: Some(start + Duration::minutes(2)),
            ..AuditQuery::default()
        })
        .await
        .expect("export");
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].seq, 2);
}

#[tokio::test]
async fn limit_caps_oldest_first() {
    let h = harness().await;
    for i in 0..5 {
        h.plane
            .audit()
            .record(AuditRecord::new(format!("user-{i}"), "scan_admission", "ip:10.0.0.1", "allow"))
            .await
            .expect("record");
    }

    let limited = h
        .plane
        .audit()
        .export(&AuditQuery {
            limit: Some(2),
            ..AuditQuery::default()
        })
        .await
        .expect("export");
    assert_eq!(limited.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
}

#[tokio::test]
async fn export_is_read_only() {
    let h = harness().await;
    h.plane
        .audit()
        .record(AuditRecord::new("alice", "scan_admission", "ip:10.0.0.1", "allow"))
        .await
        .expect("record");

    h.plane
        .export_audit(&AuditQuery::default())
        .await
        .expect("export");
    assert_eq!(h.audit_count().await, 1);
}

#[test]
fn query_accepts_severity_alias() {
    let query: AuditQuery =
        serde_json::from_value(serde_json::json!({ "severity": "high", "limit": 10 }))
            .expect("decode");
    assert_eq!(query.min_severity, Some(Severity::High));
    assert_eq!(query.limit, Some(10));
}
