//! Billing routes: catalog, checkout, payment status, subscription, credits

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use fitledger_billing::{
    AccountSubscription, ConsumeCreditsRequest, ConsumptionReceipt, CreditConsumption, CreditPack,
    PaymentStatusView, PlanInfo, PlanType, Purchase, PurchaseIntent, SubscriptionHistoryEntry,
    SubscriptionStatus, Transaction, TransactionKind, TransactionStatus,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

const DEFAULT_PAGE_SIZE: i64 = 20;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlansResponse {
    pub plans: Vec<PlanInfo>,
    pub credit_packs: Vec<CreditPack>,
}

pub async fn list_plans(State(state): State<AppState>) -> Json<PlansResponse> {
    let catalog = &state.billing.catalog;
    Json(PlansResponse {
        plans: catalog.plans().to_vec(),
        credit_packs: catalog.credit_packs().to_vec(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanCheckoutRequest {
    pub plan_id: PlanType,
}

#[derive(Debug, Deserialize)]
pub struct CreditCheckoutRequest {
    pub amount: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    #[serde(flatten)]
    pub intent: PurchaseIntent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credits: Option<CreditPack>,
}

pub async fn create_plan_checkout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<PlanCheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let intent = state
        .billing
        .checkout
        .create_purchase_intent(user.user_id, Purchase::Plan(req.plan_id))
        .await?;
    let plan = state.billing.catalog.plan(req.plan_id)?.clone();

    Ok(Json(CheckoutResponse {
        intent,
        plan: Some(plan),
        credits: None,
    }))
}

pub async fn create_credit_checkout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CreditCheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let intent = state
        .billing
        .checkout
        .create_purchase_intent(user.user_id, Purchase::Credits(req.amount))
        .await?;
    let pack = *state.billing.catalog.credit_pack(req.amount)?;

    Ok(Json(CheckoutResponse {
        intent,
        plan: None,
        credits: Some(pack),
    }))
}

pub async fn get_payment_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(payment_id): Path<String>,
) -> ApiResult<Json<PaymentStatusView>> {
    let view = state
        .billing
        .checkout
        .payment_status(user.user_id, &payment_id)
        .await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
}

impl PageQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE)
    }
}

/// Transaction as shown to its owner
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSummary {
    pub id: Uuid,
    pub kind: TransactionKind,
    pub plan_id: Option<PlanType>,
    pub credits_amount: Option<i64>,
    pub amount_cents: i64,
    pub status: TransactionStatus,
    pub payment_method: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<Transaction> for TransactionSummary {
    fn from(tx: Transaction) -> Self {
        Self {
            id: tx.id,
            kind: tx.kind,
            plan_id: tx.plan_id,
            credits_amount: tx.credits_amount,
            amount_cents: tx.amount_cents,
            status: tx.status,
            payment_method: tx.payment_method,
            created_at: tx.created_at,
        }
    }
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<TransactionSummary>>> {
    let transactions = state
        .billing
        .transactions
        .list_for_user(user.user_id, page.limit())
        .await?;
    Ok(Json(transactions.into_iter().map(Into::into).collect()))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSummary {
    pub plan_type: PlanType,
    pub plan_name: String,
    pub subscription_status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub subscription_end_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub credits_reset_date: Option<OffsetDateTime>,
    pub credits: i64,
    pub subscription_credits: i64,
    pub purchased_credits: i64,
    pub generations_used_cycle: i32,
    pub generation_limit: i32,
    pub has_paid_access: bool,
}

fn summarize(state: &AppState, account: AccountSubscription) -> ApiResult<SubscriptionSummary> {
    let plan = state.billing.catalog.plan(account.plan_type)?;

    Ok(SubscriptionSummary {
        plan_type: account.plan_type,
        plan_name: plan.name.clone(),
        subscription_status: account.subscription_status,
        subscription_end_date: account.subscription_end_date,
        credits_reset_date: account.credits_reset_date,
        credits: account.credits,
        subscription_credits: account.subscription_credits,
        purchased_credits: account.purchased_credits,
        generations_used_cycle: account.generations_used_cycle,
        generation_limit: plan.generation_limit,
        has_paid_access: account.has_paid_access(OffsetDateTime::now_utc()),
    })
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionSummary>> {
    let account = state.billing.ledger.account(user.user_id).await?;
    Ok(Json(summarize(&state, account)?))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<SubscriptionSummary>> {
    let outcome = state.billing.ledger.cancel(user.user_id).await?;
    tracing::info!(
        user_id = %user.user_id,
        plan = %outcome.account.plan_type,
        "Subscription cancelled by user"
    );
    Ok(Json(summarize(&state, outcome.account)?))
}

pub async fn subscription_history(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<SubscriptionHistoryEntry>>> {
    Ok(Json(
        state
            .billing
            .ledger
            .history(user.user_id, page.limit())
            .await?,
    ))
}

pub async fn consume_credits(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<ConsumeCreditsRequest>,
) -> ApiResult<Json<ConsumptionReceipt>> {
    Ok(Json(state.billing.credits.consume(user.user_id, req).await?))
}

pub async fn credit_history(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Vec<CreditConsumption>>> {
    Ok(Json(
        state
            .billing
            .credits
            .history(user.user_id, page.limit())
            .await?,
    ))
}
