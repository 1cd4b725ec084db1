//! HTTP error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fitledger_billing::BillingError;
use serde_json::json;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    PaymentRequired(String),
    #[error("{0}")]
    NotFound(String),
    #[error("Payment provider error")]
    BadGateway,
    #[error("Payment provider temporarily unavailable")]
    ServiceUnavailable,
    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadGateway => StatusCode::BAD_GATEWAY,
            ApiError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::GatewayUnavailable(detail) => {
                tracing::warn!(error = %detail, "Payment gateway unavailable");
                ApiError::ServiceUnavailable
            }
            BillingError::GatewayRejected { status, body } => {
                tracing::error!(status, body = %body, "Payment gateway rejected request");
                ApiError::BadGateway
            }
            BillingError::NotFound(what) => ApiError::NotFound(format!("{} not found", what)),
            e @ (BillingError::InvalidPlan(_) | BillingError::InvalidInput(_)) => {
                ApiError::BadRequest(e.to_string())
            }
            e @ BillingError::InsufficientCredits { .. } => ApiError::PaymentRequired(e.to_string()),
            e @ (BillingError::Database(_) | BillingError::Config(_)) => {
                tracing::error!(error = %e, "Billing operation failed");
                ApiError::Internal
            }
        }
    }
}
