//! Payment gateway webhook endpoint
//!
//! Answers 200 for everything that re-delivery cannot fix and a server error
//! for everything it can, so the gateway's own retry loop does the retrying.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use fitledger_billing::{InboundWebhook, NotificationQuery, WebhookOutcome};
use serde_json::Value;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const SIGNATURE_HEADER: &str = "x-signature";
const REQUEST_ID_HEADER: &str = "x-request-id";

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

pub async fn payment_webhook(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookOutcome>> {
    // Some notifications carry everything in the query string and an empty body
    let body: Value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or_else(|e| {
            tracing::debug!(error = %e, "Webhook body is not JSON, using query only");
            Value::Null
        })
    };

    let inbound = InboundWebhook {
        body,
        query,
        signature: header(&headers, SIGNATURE_HEADER),
        request_id: header(&headers, REQUEST_ID_HEADER),
    };

    match state.billing.webhooks.handle(inbound).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) if e.is_retryable() => {
            tracing::error!(error = %e, "Webhook processing failed, gateway will re-deliver");
            Err(ApiError::from(e))
        }
        Err(e) => {
            tracing::warn!(error = %e, "Webhook dropped");
            Ok(Json(WebhookOutcome::Ignored {
                reason: e.to_string(),
            }))
        }
    }
}
