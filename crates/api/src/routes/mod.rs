//! HTTP routes

pub mod billing;
pub mod webhooks;


use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::{auth::require_auth, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/checkout/plan", post(billing::create_plan_checkout))
        .route("/checkout/credits", post(billing::create_credit_checkout))
        .route("/payments/{payment_id}", get(billing::get_payment_status))
        .route("/transactions", get(billing::list_transactions))
        .route("/subscription", get(billing::get_subscription))
        .route("/subscription/cancel", post(billing::cancel_subscription))
        .route("/subscription/history", get(billing::subscription_history))
        .route("/credits/consume", post(billing::consume_credits))
        .route("/credits/history", get(billing::credit_history))
        .route_layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ));

    let public = Router::new()
        .route("/plans", get(billing::list_plans))
        .route("/webhook", post(webhooks::payment_webhook));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1/billing", public.merge(authenticated))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let Some(pool) = &state.pool else {
        return (StatusCode::OK, Json(json!({ "status": "ok" })));
    };

    match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "database": "ok" })),
        ),
        Err(e) => {
            tracing::error!(error = ?e, "Health check: database unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "database": "unreachable" })),
            )
        }
    }
}
