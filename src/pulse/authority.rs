//! External authority consulted by the pulse monitor.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::sessions::AuthorizationSession;
use crate::error::ControlError;

/// The authority's answer for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PulseVerdict {
    /// Still authorized for its feature set.
    Authorized,
    /// No longer authorized.
    Denied(String),
    /// Authorization was explicitly withdrawn.
    Revoked(String),
}

/// Answers "is session S still authorized for feature set F".
#[async_trait]
pub trait PulseAuthority: Send + Sync {
    /// Probe one session.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::Authority`] when the authority could not be
    /// reached or answered garbage. The monitor retries these.
    async fn check(&self, session: &AuthorizationSession) -> Result<PulseVerdict, ControlError>;
}

/// Request body for `POST /v1/pulse`.
#[doc(hidden)]
#[derive(Debug, Serialize)]
pub struct PulseRequest<'a> {
    /// Session being revalidated.
    pub session_id: String,
    /// Session actor.
    pub actor_id: &'a str,
    /// Session tenant.
    pub tenant_id: &'a str,
    /// Features granted to the session.
    pub features: &'a [String],
}

/// Response body from `POST /v1/pulse`.
#[doc(hidden)]
#[derive(Debug, Deserialize)]
pub struct PulseResponse {
    /// Whether the session is still authorized.
    pub authorized: bool,
    /// Whether authorization was explicitly withdrawn.
    #[serde(default)]
    pub revoked: bool,
    /// Explanation for a negative answer.
    #[serde(default)]
    pub reason: Option<String>,
}

impl PulseResponse {
    /// Map the wire answer onto a verdict.
    pub fn into_verdict(self) -> PulseVerdict {
        let reason = || {
            self.reason
                .clone()
                .unwrap_or_else(|| "no reason given".to_owned())
        };
        if self.revoked {
            PulseVerdict::Revoked(reason())
        } else if self.authorized {
            PulseVerdict::Authorized
        } else {
            PulseVerdict::Denied(reason())
        }
    }
}

/// [`PulseAuthority`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPulseAuthority {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpPulseAuthority {
    /// Create a client for `{base_url}/v1/pulse`.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidInput`] for a malformed URL, or
    /// [`ControlError::Authority`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ControlError> {
        let endpoint = format!("{}/v1/pulse", base_url.trim_end_matches('/'));
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| ControlError::InvalidInput(format!("authority_url: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ControlError::Authority(e.to_string()))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl PulseAuthority for HttpPulseAuthority {
    async fn check(&self, session: &AuthorizationSession) -> Result<PulseVerdict, ControlError> {
        let body = PulseRequest {
            session_id: session.id.to_string(),
            actor_id: &session.actor_id,
            tenant_id: &session.tenant_id,
            features: &session.features,
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| ControlError::Authority(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Ok(PulseVerdict::Denied(format!("authority returned {status}")));
        }
        if !status.is_success() {
            return Err(ControlError::Authority(format!(
                "authority returned {status}"
            )));
        }
        let answer: PulseResponse = response
            .json()
            .await
            .map_err(|e| ControlError::Authority(format!("malformed pulse response: {e}")))?;
        debug!(session = %session.id, authorized = answer.authorized, "pulse answered");
        Ok(answer.into_verdict())
    }
}
