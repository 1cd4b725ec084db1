//! Credit consumption
//!
//! Each plan includes a number of free generations per cycle. Past that,
//! actions cost credits, drawn from the monthly grant before purchased ones.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::account::CreditConsumption;
use crate::catalog::PlanCatalog;
use crate::error::{BillingError, BillingResult};
use crate::ledger::LedgerOp;
use crate::store::BillingStore;

const MAX_REASON_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeCreditsRequest {
    pub cost: i64,
    pub reason: String,
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "api".to_string()
}

/// Balances after a consumption and what it cost
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumptionReceipt {
    pub was_free: bool,
    pub credits_consumed: i64,
    pub credits: i64,
    pub subscription_credits: i64,
    pub purchased_credits: i64,
    pub generations_used_cycle: i32,
}

#[derive(Clone)]
pub struct CreditService {
    store: Arc<dyn BillingStore>,
    catalog: Arc<PlanCatalog>,
}

impl CreditService {
    pub fn new(store: Arc<dyn BillingStore>, catalog: Arc<PlanCatalog>) -> Self {
        Self { store, catalog }
    }

    pub async fn consume(
        &self,
        user_id: Uuid,
        request: ConsumeCreditsRequest,
    ) -> BillingResult<ConsumptionReceipt> {
        self.consume_at(user_id, request, OffsetDateTime::now_utc())
            .await
    }

    pub async fn consume_at(
        &self,
        user_id: Uuid,
        request: ConsumeCreditsRequest,
        now: OffsetDateTime,
    ) -> BillingResult<ConsumptionReceipt> {
        let reason = request.reason.trim();
        if reason.is_empty() || reason.len() > MAX_REASON_LEN {
            return Err(BillingError::InvalidInput(
                "Reason must be 1-200 characters".to_string(),
            ));
        }

        let op = LedgerOp::ConsumeCredits {
            cost: request.cost,
            reason: reason.to_string(),
            source: request.source,
        };
        let outcome = match self
            .store
            .apply_ledger_op(user_id, &op, &self.catalog, now)
            .await
        {
            Err(e @ BillingError::InsufficientCredits { .. }) => {
                tracing::info!(user_id = %user_id, error = %e, "Credit consumption refused");
                return Err(e);
            }
            other => other?,
        };

        let record = outcome.effect.consumption.ok_or_else(|| {
            BillingError::Database("Consumption applied without a record".to_string())
        })?;
        let account = outcome.account;

        tracing::debug!(
            user_id = %user_id,
            was_free = record.was_free,
            credits_consumed = record.credits_consumed,
            remaining = account.credits,
            "Credits consumed"
        );

        Ok(ConsumptionReceipt {
            was_free: record.was_free,
            credits_consumed: record.credits_consumed,
            credits: account.credits,
            subscription_credits: account.subscription_credits,
            purchased_credits: account.purchased_credits,
            generations_used_cycle: account.generations_used_cycle,
        })
    }

    pub async fn history(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<CreditConsumption>> {
        self.store
            .credit_consumption(user_id, limit.clamp(1, 100))
            .await
    }
}
