//! Tests for `HttpPulseAuthority` against a one-shot local HTTP server.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use scanguard::error::ControlError;
use scanguard::pulse::{HttpPulseAuthority, PulseAuthority, PulseVerdict};

use crate::harness::harness;

/// Accept one connection, answer with `status` and `body`, and return the
/// raw request that was received.
async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut raw = Vec::new();
        let mut buf = [0_u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.expect("read");
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= end + 4 + length {
                    break;
                }
            }
        }
        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await.expect("write");
        stream.shutdown().await.ok();
        String::from_utf8_lossy(&raw).into_owned()
    });
    (format!("http://{addr}"), handle)
}

#[tokio::test]
async fn authorized_answer_posts_session_details() {
    let h = harness().await;
    let session = h.session("alice", "acme").await;
    let (base, server) = serve_once("200 OK", r#"{"authorized": true}"#).await;

    let authority = HttpPulseAuthority::new(&base, Duration::from_secs(5)).expect("client");
    let verdict = authority.check(&session).await.expect("check");
    assert_eq!(verdict, PulseVerdict::Authorized);

    let request = server.await.expect("server");
    assert!(request.starts_with("POST /v1/pulse"), "{request}");
    assert!(request.contains(&session.id.to_string()));
    assert!(request.contains("\"tenant_id\":\"acme\""));
}

#[tokio::test]
async fn revocation_in_body_is_revoked() {
    let h = harness().await;
    let session = h.session("alice", "acme").await;
    let (base, _server) = serve_once(
        "200 OK",
        r#"{"authorized": false, "revoked": true, "reason": "contract ended"}"#,
    )
    .await;

    let authority = HttpPulseAuthority::new(&base, Duration::from_secs(5)).expect("client");
    assert_eq!(
        authority.check(&session).await.expect("check"),
        PulseVerdict::Revoked("contract ended".to_owned())
    );
}

#[tokio::test]
async fn forbidden_status_is_a_denial() {
    let h = harness().await;
    let session = h.session("alice", "acme").await;
    let (base, _server) = serve_once("403 Forbidden", "{}").await;

    let authority = HttpPulseAuthority::new(&base, Duration::from_secs(5)).expect("client");
    assert!(matches!(
        authority.check(&session).await.expect("check"),
        PulseVerdict::Denied(_)
    ));
}

#[tokio::test]
async fn server_errors_and_garbage_are_retryable_errors() {
    let h = harness().await;
    let session = h.session("alice", "acme").await;

    let (base, _server) = serve_once("503 Service Unavailable", "{}").await;
    let authority = HttpPulseAuthority::new(&base, Duration::from_secs(5)).expect("client");
    assert!(matches!(
        authority.check(&session).await,
        Err(ControlError::Authority(_))
    ));

    let (base, _server) = serve_once("200 OK", "not json").await;
    let authority = HttpPulseAuthority::new(&base, Duration::from_secs(5)).expect("client");
    assert!(matches!(
        authority.check(&session).await,
        Err(ControlError::Authority(_))
    ));
}

#[tokio::test]
async fn unreachable_authority_is_an_error() {
    let h = harness().await;
    let session = h.session("alice", "acme").await;
    let authority =
        HttpPulseAuthority::new("http://127.0.0.1:1", Duration::from_secs(2)).expect("client");
    let err = authority.check(&session).await.expect_err("refused");
    assert!(err.is_infrastructure());
}
