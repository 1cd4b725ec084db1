//! Hosted checkout
//!
//! Validates what is being bought against the catalog, tags it with a fresh
//! external reference, asks the gateway for a checkout preference and records
//! the intent as a `PENDING` transaction.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::account::AccountSubscription;
use crate::catalog::PlanCatalog;
use crate::client::{GatewayPayment, PaymentGateway, PurchaseIntent, PurchaseIntentRequest};
use crate::error::{BillingError, BillingResult};
use crate::notification::PaymentId;
use crate::reference::{ExternalReference, Purchase};
use crate::store::BillingStore;
use crate::transactions::Transaction;

/// Payment details safe to show to the paying user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusView {
    pub id: String,
    pub status: String,
    pub status_detail: Option<String>,
    pub external_reference: Option<String>,
    pub payment_method_id: Option<String>,
    pub amount_cents: i64,
}

impl From<GatewayPayment> for PaymentStatusView {
    fn from(payment: GatewayPayment) -> Self {
        Self {
            id: payment.id,
            status: payment.status,
            status_detail: payment.status_detail,
            external_reference: payment.external_reference,
            payment_method_id: payment.payment_method_id,
            amount_cents: payment.amount_cents,
        }
    }
}

#[derive(Clone)]
pub struct CheckoutService {
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn BillingStore>,
    catalog: Arc<PlanCatalog>,
}

impl CheckoutService {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn BillingStore>,
        catalog: Arc<PlanCatalog>,
    ) -> Self {
        Self {
            gateway,
            store,
            catalog,
        }
    }

    /// Line item for a purchase: (item id, title, price in cents)
    fn line_item(&self, purchase: Purchase) -> BillingResult<(String, String, i64)> {
        match purchase {
            Purchase::Plan(plan) => {
                let info = self.catalog.purchasable_plan(plan)?;
                Ok((
                    format!("plan_{}", plan.as_str().to_ascii_lowercase()),
                    format!("{} plan - 1 month", info.name),
                    info.monthly_price_cents,
                ))
            }
            Purchase::Credits(amount) => {
                let pack = self.catalog.credit_pack(amount)?;
                Ok((
                    format!("credits_{}", pack.credits),
                    format!("{} credits", pack.credits),
                    pack.price_cents,
                ))
            }
        }
    }

    pub async fn create_purchase_intent(
        &self,
        user_id: Uuid,
        purchase: Purchase,
    ) -> BillingResult<PurchaseIntent> {
        self.create_purchase_intent_at(user_id, purchase, OffsetDateTime::now_utc())
            .await
    }

    pub async fn create_purchase_intent_at(
        &self,
        user_id: Uuid,
        purchase: Purchase,
        now: OffsetDateTime,
    ) -> BillingResult<PurchaseIntent> {
        let (item_id, title, price_cents) = self.line_item(purchase)?;

        let account: AccountSubscription = self
            .store
            .get_account(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Account {}", user_id)))?;

        let reference = ExternalReference::new(user_id, purchase, now);
        let intent = self
            .gateway
            .create_purchase_intent(PurchaseIntentRequest {
                external_reference: reference.encode(),
                item_id,
                title,
                unit_price_cents: price_cents,
                payer_email: Some(account.email),
            })
            .await?;

        let transaction = Transaction::pending(
            &reference,
            price_cents,
            Some(intent.preference_id.clone()),
            now,
        );
        self.store.insert_transaction(&transaction).await?;

        tracing::info!(
            user_id = %user_id,
            external_reference = %transaction.external_reference,
            preference_id = %intent.preference_id,
            amount_cents = price_cents,
            "Checkout started"
        );
        Ok(intent)
    }

    /// Gateway view of a payment, only if it belongs to `user_id`
    pub async fn payment_status(
        &self,
        user_id: Uuid,
        payment_id: &str,
    ) -> BillingResult<PaymentStatusView> {
        let payment_id = PaymentId::parse(payment_id)
            .ok_or_else(|| BillingError::InvalidInput("Invalid payment id".to_string()))?;

        let payment = match self.gateway.fetch_payment(&payment_id).await {
            Err(BillingError::GatewayRejected { .. }) => {
                return Err(BillingError::NotFound(format!("Payment {}", payment_id)))
            }
            other => other?,
        };

        let owner = match payment.external_reference.as_deref() {
            Some(reference) => match self.store.find_transaction_by_reference(reference).await? {
                Some(transaction) => Some(transaction.user_id),
                None => ExternalReference::decode(reference).map(|r| r.user_id),
            },
            None => None,
        };

        // Someone else's payment looks the same as a missing one
        if owner != Some(user_id) {
            return Err(BillingError::NotFound(format!("Payment {}", payment_id)));
        }
        Ok(payment.into())
    }
}
