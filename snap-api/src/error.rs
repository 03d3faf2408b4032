use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use snap_core::{QueueError, StoreError};

use crate::credits::LedgerError;
use crate::limiter::{DenyReason, LimiterError};
use crate::validate::ValidationError;

/// Failure modes of the admission path, surfaced to API callers as tagged
/// results rather than exceptions.
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("request validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("rate limited ({reason}), retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        reason: DenyReason,
    },
    #[error("insufficient credits: need {required}, have {available}")]
    InsufficientCredits { required: u32, available: i64 },
    #[error("not authorized for this resource")]
    AuthRejected,
    #[error("job is not in a retryable state")]
    NotRetryable,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<LedgerError> for AdmissionError {
    fn from(error: LedgerError) -> Self {
        match error {
            LedgerError::InsufficientCredits {
                required,
                available,
            } => AdmissionError::InsufficientCredits {
                required,
                available,
            },
            other => AdmissionError::Internal(other.to_string()),
        }
    }
}

impl From<LimiterError> for AdmissionError {
    fn from(error: LimiterError) -> Self {
        match error {
            LimiterError::Ledger(ledger) => ledger.into(),
            LimiterError::Plan(plan) => AdmissionError::Internal(plan.to_string()),
        }
    }
}

impl AdmissionError {
    pub fn to_metric_tag(&self) -> &'static str {
        match self {
            AdmissionError::Validation(_) => "validation",
            AdmissionError::RateLimited { .. } => "rate_limited",
            AdmissionError::InsufficientCredits { .. } => "insufficient_credits",
            AdmissionError::AuthRejected => "auth_rejected",
            AdmissionError::NotRetryable => "not_retryable",
            AdmissionError::Store(_) => "store",
            AdmissionError::Queue(_) => "queue",
            AdmissionError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        metrics::counter!(
            "admission_errors_total",
            &[("reason", self.to_metric_tag())]
        )
        .increment(1);

        match self {
            AdmissionError::Validation(_) | AdmissionError::NotRetryable => {
                (StatusCode::BAD_REQUEST, self.to_string()).into_response()
            }
            AdmissionError::RateLimited { retry_after, .. } => {
                let mut response =
                    (StatusCode::TOO_MANY_REQUESTS, self.to_string()).into_response();
                if let Ok(value) = retry_after.as_secs().to_string().parse() {
                    response.headers_mut().insert("Retry-After", value);
                }
                response
            }
            AdmissionError::InsufficientCredits { .. } => {
                (StatusCode::PAYMENT_REQUIRED, self.to_string()).into_response()
            }
            AdmissionError::AuthRejected => {
                (StatusCode::UNAUTHORIZED, self.to_string()).into_response()
            }
            AdmissionError::Store(_)
            | AdmissionError::Queue(_)
            | AdmissionError::Internal(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "transient error, please retry".to_string())
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_carries_a_retry_after_header() {
        let error = AdmissionError::RateLimited {
            retry_after: Duration::from_secs(42),
            reason: DenyReason::HourlyCapReached,
        };
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("Retry-After").unwrap(),
            &"42".parse::<axum::http::HeaderValue>().unwrap()
        );
    }

    #[test]
    fn internal_errors_do_not_leak_details() {
        let response = AdmissionError::Internal("pg went away".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
