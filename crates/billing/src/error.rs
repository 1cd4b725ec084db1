//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Network failure, timeout or 5xx from the payment gateway. Retryable.
    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// 4xx from the payment gateway (unknown payment, invalid item). Not retryable.
    #[error("Payment gateway rejected the request (status {status}): {body}")]
    GatewayRejected { status: u16, body: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Insufficient credits: {available} available, {required} required")]
    InsufficientCredits { available: i64, required: i64 },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    /// Whether re-attempting the same operation later can succeed.
    ///
    /// The webhook endpoint answers with a server error for these so the
    /// gateway re-delivers the notification.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::GatewayUnavailable(_) | BillingError::Database(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        // Anything that did not produce an HTTP status is a transport problem
        match e.status() {
            Some(status) if status.is_client_error() => BillingError::GatewayRejected {
                status: status.as_u16(),
                body: e.to_string(),
            },
            _ => BillingError::GatewayUnavailable(e.to_string()),
        }
    }
}
