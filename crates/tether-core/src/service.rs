//! Request-level facade
//!
//! [`LinkService`] is what a request surface (HTTP, CLI, RPC) talks to. It
//! combines the session manager, the cooldown limiter and the dispatch
//! pipeline, and turns results into the flat `{success, message, ...}`
//! shapes callers expect.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

use crate::clock::unix_millis;
use crate::dispatch::{DispatchPipeline, DispatchReport, Variant};
use crate::error::{LinkError, Result};
use crate::rate_limiter::{CooldownLimiter, RateDecision, SweeperHandle};
use crate::session::SessionStatus;
use crate::session_manager::{PairingOutcome, SessionManager};

/// Operator identity used when a request carries none
pub const ANONYMOUS_OPERATOR: &str = "anonymous";

/// A dispatch request as received from the caller
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    /// Recipient phone number, any accepted form
    pub target: String,
    /// Variant tag; unknown or missing tags use the default variant
    #[serde(default)]
    pub version: Option<String>,
    /// Operator identity for rate limiting
    #[serde(default)]
    pub user_id: Option<String>,
    /// Attempt count; the configured default when absent
    #[serde(default)]
    pub attempts: Option<u32>,
}

impl SendRequest {
    /// Request for `target` with defaults for everything else
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    /// Operator key for rate limiting
    #[must_use]
    pub fn operator(&self) -> &str {
        self.user_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .unwrap_or(ANONYMOUS_OPERATOR)
    }
}

/// Outcome of [`LinkService::send`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The job ran; see the report for per-attempt results
    Dispatched(DispatchReport),
    /// The operator is cooling down
    RateLimited {
        /// When the operator may dispatch again
        next_available: SystemTime,
    },
}

/// Flat response body for request surfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Whether the operation succeeded
    pub success: bool,
    /// Human-readable detail
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Pairing code, for pairing requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,
    /// Milliseconds since the Unix epoch at which a rate-limited operator may retry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_available: Option<u64>,
    /// Dispatch details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<DispatchReport>,
}

impl Response {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            pairing_code: None,
            next_available: None,
            report: None,
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::ok(message)
        }
    }

    /// Response for a pairing-code request
    #[must_use]
    pub fn from_pairing(result: &Result<PairingOutcome>) -> Self {
        match result {
            Ok(PairingOutcome::Code(code)) => Self {
                pairing_code: Some(code.clone()),
                ..Self::ok("Enter the pairing code on your device")
            },
            Ok(PairingOutcome::Connected) => Self::ok("Already linked"),
            Err(e) => Self::failure(e.to_string()),
        }
    }

    /// Response for a dispatch request
    #[must_use]
    pub fn from_send(result: &Result<SendOutcome>) -> Self {
        match result {
            Ok(SendOutcome::Dispatched(report)) => Self {
                success: report.success,
                report: Some(report.clone()),
                ..Self::ok(report.message.clone())
            },
            Ok(SendOutcome::RateLimited { next_available }) => Self {
                next_available: Some(unix_millis(*next_available)),
                ..Self::failure("Rate limit reached, try again later")
            },
            Err(e) => Self::failure(e.to_string()),
        }
    }

    /// Response for a session clear
    #[must_use]
    pub fn from_clear(result: &Result<()>) -> Self {
        match result {
            Ok(()) => Self::ok("Session cleared"),
            Err(e) => Self::failure(e.to_string()),
        }
    }
}

/// Session, limiter and pipeline behind one handle
#[derive(Debug, Clone)]
pub struct LinkService {
    session: SessionManager,
    limiter: Arc<CooldownLimiter>,
    pipeline: DispatchPipeline,
}

impl LinkService {
    /// Combine the three components
    #[must_use]
    pub fn new(
        session: SessionManager,
        limiter: Arc<CooldownLimiter>,
        pipeline: DispatchPipeline,
    ) -> Self {
        Self {
            session,
            limiter,
            pipeline,
        }
    }

    /// Session manager
    #[must_use]
    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Cooldown limiter
    #[must_use]
    pub fn limiter(&self) -> &Arc<CooldownLimiter> {
        &self.limiter
    }

    /// Start the limiter's periodic sweep. Dropping the handle stops it.
    #[must_use]
    pub fn start_sweeper(&self) -> SweeperHandle {
        self.limiter.spawn_sweeper()
    }

    /// Current session status
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    /// Request a pairing code for `identity`
    ///
    /// # Errors
    ///
    /// See [`SessionManager::request_pairing_code`].
    pub async fn pair(&self, identity: &str) -> Result<PairingOutcome> {
        self.session.request_pairing_code(identity).await
    }

    /// Clear the session
    ///
    /// # Errors
    ///
    /// See [`SessionManager::clear_session`].
    pub async fn clear(&self) -> Result<()> {
        self.session.clear_session().await
    }

    /// Rate-check the operator, then run a dispatch job.
    ///
    /// The cooldown is reserved before the job runs and released again if
    /// the job errors or its report is unsuccessful, so only successful jobs
    /// count against the operator.
    ///
    /// # Errors
    ///
    /// Validation and session errors from [`DispatchPipeline::dispatch`].
    pub async fn send(&self, request: &SendRequest) -> Result<SendOutcome> {
        let config = self.session.config();
        let variant = Variant::from_tag_or_default(request.version.as_deref());
        let attempts = request.attempts.unwrap_or(config.default_attempts);
        let operator = request.operator();

        let reservation = match self.limiter.check_and_reserve(operator) {
            RateDecision::Allowed(reservation) => reservation,
            RateDecision::Denied { retry_after } => {
                tracing::info!(operator, "Dispatch rate limited");
                return Ok(SendOutcome::RateLimited {
                    next_available: retry_after,
                });
            }
        };

        let result = self
            .pipeline
            .dispatch(
                &self.session,
                &request.target,
                variant,
                attempts,
                config.attempt_delay,
            )
            .await;

        match result {
            Ok(report) => {
                if !report.success {
                    self.limiter.release(reservation);
                }
                Ok(SendOutcome::Dispatched(report))
            }
            Err(e) => {
                self.limiter.release(reservation);
                Err(e)
            }
        }
    }
}

impl From<LinkError> for Response {
    fn from(e: LinkError) -> Self {
        Self::failure(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_request_deserialize() {
        let request: SendRequest =
            serde_json::from_str(r#"{"target":"0812-3456-789","version":"v2","userId":"op-7"}"#)
                .unwrap();
        assert_eq!(request.target, "0812-3456-789");
        assert_eq!(request.version.as_deref(), Some("v2"));
        assert_eq!(request.operator(), "op-7");
        assert_eq!(request.attempts, None);
    }

    #[test]
    fn test_operator_defaults_to_anonymous() {
        assert_eq!(SendRequest::new("1").operator(), ANONYMOUS_OPERATOR);

        let blank = SendRequest {
            user_id: Some("  ".into()),
            ..SendRequest::new("1")
        };
        assert_eq!(blank.operator(), ANONYMOUS_OPERATOR);
    }

    #[test]
    fn test_rate_limited_response_shape() {
        let at = SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(1_700_000_900_000);
        let response = Response::from_send(&Ok(SendOutcome::RateLimited { next_available: at }));
        let json = serde_json::to_value(&response).unwrap();

        assert_eq!(json["success"], false);
        assert_eq!(json["nextAvailable"], 1_700_000_900_000u64);
        assert!(json.get("report").is_none());
        assert!(json.get("pairingCode").is_none());
    }

    #[test]
    fn test_error_response_shape() {
        let response = Response::from_send(&Err(LinkError::NotConnected));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], "Session is not connected");
    }

    #[test]
    fn test_pairing_response_shape() {
        let response = Response::from_pairing(&Ok(PairingOutcome::Code("ABCD1234".into())));
        assert!(response.success);
        assert_eq!(response.pairing_code.as_deref(), Some("ABCD1234"));

        let response = Response::from_pairing(&Err(LinkError::AlreadyConnected));
        assert!(!response.success);
    }
}
