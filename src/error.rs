use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// JSON body of every non-streaming error response
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "server", derive(utoipa::ToSchema))]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Failures that happen before a stream is committed
///
/// Once a stream has started, errors travel as `error` events instead; see
/// [`crate::relay`].
#[derive(Debug)]
pub enum RelayError {
    BadJson(String),
    MissingMessage,
    MethodNotAllowed,
    RateLimited { retry_after: Duration },
    UpstreamConnect(String),
    UpstreamStatus { status: u16, detail: String },
}

impl fmt::Display for RelayError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            RelayError::BadJson(msg) => write!(f, "Invalid JSON body: {}", msg),
            RelayError::MissingMessage => write!(f, "Request has no message"),
            RelayError::MethodNotAllowed => write!(f, "Method not allowed"),
            RelayError::RateLimited { retry_after } => {
                write!(f, "Rate limited, retry in {}ms", retry_after.as_millis())
            }
            RelayError::UpstreamConnect(msg) => write!(f, "Could not reach upstream: {}", msg),
            RelayError::UpstreamStatus { status, detail } => {
                write!(f, "Upstream returned {}: {}", status, detail)
            }
        }
    }
}

impl std::error::Error for RelayError {}

impl RelayError {
    pub fn bad_json(msg: impl Into<String>) -> Self {
        RelayError::BadJson(msg.into())
    }

    pub fn upstream_connect(msg: impl Into<String>) -> Self {
        RelayError::UpstreamConnect(msg.into())
    }

    /// Stable machine-readable code used as the `error` field
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            RelayError::BadJson(_) => "bad_json",
            RelayError::MissingMessage => "missing_message",
            RelayError::MethodNotAllowed => "method_not_allowed",
            RelayError::RateLimited { .. } => "rate_limited",
            RelayError::UpstreamConnect(_) => "openai_connect_error",
            RelayError::UpstreamStatus { .. } => "openai_error",
        }
    }

    /// HTTP status for the JSON error response.
    ///
    /// Upstream client errors keep their status; upstream server errors and anything
    /// outside the error range become 502.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            RelayError::BadJson(_) | RelayError::MissingMessage => 400,
            RelayError::MethodNotAllowed => 405,
            RelayError::RateLimited { .. } => 429,
            RelayError::UpstreamConnect(_) => 502,
            RelayError::UpstreamStatus { status, .. } => {
                if (400..500).contains(status) {
                    *status
                } else {
                    502
                }
            }
        }
    }

    #[must_use]
    pub fn to_error_response(&self) -> ErrorResponse {
        let detail = match self {
            RelayError::BadJson(msg) | RelayError::UpstreamConnect(msg) => Some(msg.clone()),
            RelayError::UpstreamStatus { detail, .. } => Some(detail.clone()),
            RelayError::MissingMessage | RelayError::MethodNotAllowed | RelayError::RateLimited { .. } => None,
        };

        ErrorResponse {
            error: self.code().to_string(),
            detail,
        }
    }

    /// Seconds for a `Retry-After` header, if any
    #[must_use]
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RelayError::RateLimited { retry_after } => Some(retry_after.as_secs_f64().ceil().max(1.0) as u64),
            _ => None,
        }
    }
}

#[cfg(feature = "server")]
impl actix_web::ResponseError for RelayError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        actix_web::http::StatusCode::from_u16(self.http_status())
            .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> actix_web::HttpResponse {
        let mut builder = actix_web::HttpResponse::build(actix_web::ResponseError::status_code(self));
        if let Some(secs) = self.retry_after_secs() {
            builder.insert_header((actix_web::http::header::RETRY_AFTER, secs.to_string()));
        }
        builder.json(self.to_error_response())
    }
}
