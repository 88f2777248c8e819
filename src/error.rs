use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::collections::HashMap;

/// Reasons a signature header can fail authentication.
///
/// All of these are permanent for the request that carried them: the caller
/// answers with a 4xx and never processes the payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    /// Header is missing the timestamp or the digest, or a field can't be decoded
    #[error("Malformed signature header: {0}")]
    MalformedSignature(String),

    /// Timestamp lies outside the accepted tolerance window
    #[error("Stale signature: timestamp {timestamp} is more than {tolerance_secs}s from {now}")]
    StaleSignature {
        timestamp: i64,
        now: i64,
        tolerance_secs: u64,
    },

    /// Digest does not match the recomputed value
    #[error("Signature mismatch")]
    SignatureMismatch,
}

/// The main error type for tidehook
#[derive(Debug, thiserror::Error)]
pub enum TidehookError {
    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Event {event_id} is already being processed")]
    ProcessingInFlight { event_id: String },

    #[error("Processing failed: {0}")]
    TransientProcessing(String),

    #[error("Processing of {event_type} event {event_id} failed after {attempts} attempts: {message}")]
    ExhaustedRetries {
        event_type: String,
        event_id: String,
        attempts: u32,
        message: String,
    },

    #[error("Processing deadline of {0:?} exceeded")]
    DeadlineExceeded(std::time::Duration),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Error context for additional error information
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Unique error ID for tracking
    pub error_id: Option<String>,
    /// Additional error details
    pub details: Option<String>,
    /// Contextual key-value pairs
    pub context: HashMap<String, String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error_id(mut self, id: impl Into<String>) -> Self {
        self.error_id = Some(id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.details = Some(detail.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Attach the identifying fields of a webhook event
    pub fn for_event(self, event_type: &str, event_id: &str) -> Self {
        self.with_context("event_type", event_type)
            .with_context("event_id", event_id)
    }
}

/// Error with attached context
///
/// Converts back into a plain [`TidehookError`] via `Into`, or renders the
/// context into the JSON body when used as a response.
#[derive(Debug)]
pub struct ErrorWithContext {
    error: TidehookError,
    context: ErrorContext,
}

impl ErrorWithContext {
    pub fn new(error: TidehookError, context: ErrorContext) -> Self {
        Self { error, context }
    }

    pub fn error(&self) -> &TidehookError {
        &self.error
    }

    pub fn context(&self) -> &ErrorContext {
        &self.context
    }
}

impl std::fmt::Display for ErrorWithContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)?;
        if let Some(ref details) = self.context.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorWithContext {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<ErrorWithContext> for TidehookError {
    fn from(err: ErrorWithContext) -> Self {
        err.error
    }
}

impl IntoResponse for ErrorWithContext {
    fn into_response(self) -> Response {
        self.error.into_response_with_context(Some(self.context))
    }
}

/// JSON body returned for failed webhook deliveries
#[derive(Serialize)]
pub struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<HashMap<String, String>>,
}

impl TidehookError {
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientProcessing(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn with_context(self, context: ErrorContext) -> ErrorWithContext {
        ErrorWithContext::new(self, context)
    }

    /// Whether the failure is permanent for this delivery.
    ///
    /// Permanent errors must not be retried by the provider with the same
    /// bytes; they map to 4xx responses.
    pub fn is_permanent(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Convert error to a response, merging in optional context
    ///
    /// Server errors (5xx) return a generic message; the full error is only
    /// written to the server log.
    pub fn into_response_with_context(self, context: Option<ErrorContext>) -> Response {
        let status = self.status_code();

        let mut response = ErrorResponse {
            error: self.safe_message(),
            error_id: None,
            details: None,
            context: None,
        };

        if let Some(ctx) = context {
            response.error_id = ctx.error_id;
            response.details = ctx.details;
            if !ctx.context.is_empty() {
                response.context = Some(ctx.context);
            }
        }

        let error_id = response
            .error_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        response.error_id = Some(error_id.clone());

        if status.is_server_error() {
            tracing::error!(
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Webhook delivery failed"
            );
        } else {
            tracing::warn!(
                status = status.as_u16(),
                error_id = %error_id,
                error = %self,
                "Webhook delivery rejected"
            );
        }

        (status, Json(response)).into_response()
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Signature(SignatureError::SignatureMismatch) => StatusCode::UNAUTHORIZED,
            Self::Signature(_) => StatusCode::BAD_REQUEST,
            Self::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            Self::ProcessingInFlight { .. } => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::DeadlineExceeded(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::TransientProcessing(_)
            | Self::ExhaustedRetries { .. }
            | Self::Config(_)
            | Self::Internal(_)
            | Self::Anyhow(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message that is safe to send back to the webhook provider
    fn safe_message(&self) -> String {
        match self {
            // Client errors carry no secret material
            Self::Signature(err) => err.to_string(),
            Self::InvalidPayload(msg) => format!("Invalid payload: {}", msg),
            Self::ProcessingInFlight { .. } => self.to_string(),
            Self::NotFound(msg) => format!("Not found: {}", msg),

            Self::DeadlineExceeded(_) => "Service unavailable".to_string(),
            Self::TransientProcessing(_)
            | Self::ExhaustedRetries { .. }
            | Self::Config(_)
            | Self::Internal(_)
            | Self::Anyhow(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for TidehookError {
    fn into_response(self) -> Response {
        self.into_response_with_context(None)
    }
}

/// Result type alias for tidehook operations
pub type Result<T> = std::result::Result<T, TidehookError>;

impl From<serde_json::Error> for TidehookError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            TidehookError::InvalidPayload(format!("JSON error: {}", err))
        } else {
            TidehookError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_error_status_codes() {
        let malformed: TidehookError =
            SignatureError::MalformedSignature("missing t".to_string()).into();
        assert_eq!(malformed.status_code(), StatusCode::BAD_REQUEST);

        let stale: TidehookError = SignatureError::StaleSignature {
            timestamp: 0,
            now: 1_000,
            tolerance_secs: 300,
        }
        .into();
        assert_eq!(stale.status_code(), StatusCode::BAD_REQUEST);

        let mismatch: TidehookError = SignatureError::SignatureMismatch.into();
        assert_eq!(mismatch.status_code(), StatusCode::UNAUTHORIZED);
        assert!(mismatch.is_permanent());
    }

    #[test]
    fn test_exhausted_retries_is_server_error() {
        let err = TidehookError::ExhaustedRetries {
            event_type: "payment.succeeded".to_string(),
            event_id: "evt_1".to_string(),
            attempts: 4,
            message: "db down".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.is_permanent());
        assert_eq!(
            err.to_string(),
            "Processing of payment.succeeded event evt_1 failed after 4 attempts: db down"
        );
    }

    #[test]
    fn test_in_flight_is_conflict() {
        let err = TidehookError::ProcessingInFlight {
            event_id: "evt_1".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_deadline_is_unavailable() {
        let err = TidehookError::DeadlineExceeded(std::time::Duration::from_secs(10));
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_safe_message_hides_server_details() {
        let err = TidehookError::transient("connection to 10.0.0.4 refused");
        assert_eq!(err.safe_message(), "Internal server error");

        let err = TidehookError::invalid_payload("missing id");
        assert_eq!(err.safe_message(), "Invalid payload: missing id");
    }

    #[test]
    fn test_anyhow_error() {
        let err: TidehookError = anyhow::anyhow!("Something unexpected").into();
        assert!(matches!(err, TidehookError::Anyhow(_)));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_json_syntax_error_is_invalid_payload() {
        let err: TidehookError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, TidehookError::InvalidPayload(_)));
    }

    #[test]
    fn test_error_context_for_event() {
        let ctx = ErrorContext::new().for_event("payment.succeeded", "evt_9");
        assert_eq!(ctx.context.get("event_type").unwrap(), "payment.succeeded");
        assert_eq!(ctx.context.get("event_id").unwrap(), "evt_9");
    }

    #[test]
    fn test_error_with_context_display() {
        let err = TidehookError::not_found("metric")
            .with_context(ErrorContext::new().with_detail("no events of type refund"));
        assert_eq!(err.to_string(), "Not found: metric (no events of type refund)");

        let plain: TidehookError = err.into();
        assert!(matches!(plain, TidehookError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_response_body_contains_error_id() {
        let response = TidehookError::from(SignatureError::SignatureMismatch).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Signature mismatch");
        assert!(body["error_id"].is_string());
    }
}
