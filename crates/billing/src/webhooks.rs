//! Payment webhook handling
//!
//! A notification only tells us which payment changed. The payment itself is
//! always re-fetched from the gateway, and that fetched record is the sole
//! input to status mirroring and entitlement grants. Idempotency lives in the
//! store: the transaction row is locked and an entitlement is granted only on
//! its transition into `APPROVED`, so replays and concurrent duplicates are
//! harmless.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::catalog::PlanCatalog;
use crate::client::PaymentGateway;
use crate::email::{BillingNotifier, PaymentApprovedNotice};
use crate::error::{BillingError, BillingResult};
use crate::notification::{NotificationQuery, PaymentId, WebhookNotification};
use crate::reference::Purchase;
use crate::signature::{SignatureCheck, WebhookSignatureVerifier};
use crate::store::{BillingStore, SettlementOutcome};
use crate::transactions::{Transaction, TransactionKind, TransactionStatus};

/// Everything the HTTP layer extracts from a webhook request
#[derive(Debug, Clone, Default)]
pub struct InboundWebhook {
    pub body: Value,
    pub query: NotificationQuery,
    pub signature: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Not a payment notification, or nothing we can act on
    Ignored { reason: String },
    /// The gateway refused the payment lookup; re-delivery cannot help
    Acknowledged { payment_id: String, reason: String },
    Processed {
        payment_id: String,
        external_reference: String,
        status: TransactionStatus,
        entitlement_granted: bool,
    },
}

impl WebhookOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        WebhookOutcome::Ignored {
            reason: reason.into(),
        }
    }
}

#[derive(Clone)]
pub struct WebhookProcessor {
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn BillingStore>,
    catalog: Arc<PlanCatalog>,
    verifier: WebhookSignatureVerifier,
    notifier: Arc<dyn BillingNotifier>,
}

impl WebhookProcessor {
    pub fn new(
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn BillingStore>,
        catalog: Arc<PlanCatalog>,
        verifier: WebhookSignatureVerifier,
        notifier: Arc<dyn BillingNotifier>,
    ) -> Self {
        Self {
            gateway,
            store,
            catalog,
            verifier,
            notifier,
        }
    }

    /// Process one notification.
    ///
    /// `Err` is returned only for retryable failures (gateway unreachable,
    /// database errors) so the caller can ask the gateway to re-deliver.
    pub async fn handle(&self, inbound: InboundWebhook) -> BillingResult<WebhookOutcome> {
        self.handle_at(inbound, OffsetDateTime::now_utc()).await
    }

    pub async fn handle_at(
        &self,
        inbound: InboundWebhook,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        let notification = WebhookNotification::parse(&inbound.body, &inbound.query);
        let Some(payment_id) = notification.payment_id() else {
            tracing::info!(
                topic = notification.topic().unwrap_or("unknown"),
                "Webhook ignored: no payment id"
            );
            return Ok(WebhookOutcome::ignored("no payment id"));
        };

        self.check_signature(&inbound, &payment_id);

        let payment = match self.gateway.fetch_payment(&payment_id).await {
            Ok(payment) => payment,
            Err(BillingError::GatewayRejected { status, body }) => {
                tracing::warn!(
                    payment_id = %payment_id,
                    status,
                    body = %body,
                    "Gateway refused payment lookup, acknowledging webhook"
                );
                return Ok(WebhookOutcome::Acknowledged {
                    payment_id: payment_id.to_string(),
                    reason: format!("payment lookup rejected with status {}", status),
                });
            }
            Err(e) => {
                tracing::error!(payment_id = %payment_id, error = %e, "Payment lookup failed");
                return Err(e);
            }
        };

        let Some(external_reference) = payment.external_reference.clone() else {
            tracing::warn!(payment_id = %payment_id, "Payment has no external reference");
            return Ok(WebhookOutcome::ignored("payment has no external reference"));
        };

        let outcome = self
            .store
            .settle_payment(&external_reference, &payment, &self.catalog, now)
            .await;

        let settlement = match outcome {
            Ok(settlement) => settlement,
            Err(e) if e.is_retryable() => {
                tracing::error!(
                    payment_id = %payment_id,
                    external_reference = %external_reference,
                    error = %e,
                    "Settlement failed"
                );
                return Err(e);
            }
            Err(e) => {
                // Nothing a re-delivery would change (unknown user, bad row)
                tracing::error!(
                    payment_id = %payment_id,
                    external_reference = %external_reference,
                    error = %e,
                    "Settlement refused"
                );
                return Ok(WebhookOutcome::Acknowledged {
                    payment_id: payment_id.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let SettlementOutcome::Settled {
            transaction,
            transition,
            synthesized,
            entitlement,
        } = settlement
        else {
            tracing::warn!(
                payment_id = %payment_id,
                external_reference = %external_reference,
                "No transaction for payment and reference is not ours"
            );
            return Ok(WebhookOutcome::ignored("unknown external reference"));
        };

        if synthesized {
            tracing::warn!(
                payment_id = %payment_id,
                external_reference = %external_reference,
                "Transaction synthesized from payment reference"
            );
        }
        if payment.amount_cents != transaction.amount_cents && !synthesized {
            tracing::warn!(
                payment_id = %payment_id,
                paid_cents = payment.amount_cents,
                "Paid amount differs from purchase intent"
            );
        }

        tracing::info!(
            payment_id = %payment_id,
            external_reference = %external_reference,
            previous_status = %transition.previous,
            status = %transition.current,
            entitlement_granted = entitlement.is_some(),
            "Payment webhook processed"
        );

        if let Some(granted) = &entitlement {
            self.notify_approved(&transaction, granted.account.email.clone());
        }

        Ok(WebhookOutcome::Processed {
            payment_id: payment_id.to_string(),
            external_reference,
            status: transition.current,
            entitlement_granted: entitlement.is_some(),
        })
    }

    /// Log-only: processing continues whatever the result
    fn check_signature(&self, inbound: &InboundWebhook, payment_id: &PaymentId) -> SignatureCheck {
        // The gateway signs the id it put in the query string
        let signed_id = inbound
            .query
            .data_id
            .as_deref()
            .unwrap_or(payment_id.as_str());

        let check = self.verifier.verify(
            inbound.signature.as_deref(),
            inbound.request_id.as_deref(),
            signed_id,
        );

        match check {
            SignatureCheck::Verified => {
                tracing::debug!(payment_id = %payment_id, "Webhook signature verified");
            }
            SignatureCheck::NotConfigured => {
                tracing::debug!(payment_id = %payment_id, "Webhook signature check disabled");
            }
            SignatureCheck::MissingHeader => {
                tracing::info!(
                    payment_id = %payment_id,
                    "Webhook without signature, relying on payment lookup"
                );
            }
            SignatureCheck::Invalid(reason) => {
                tracing::warn!(
                    security_alert = true,
                    payment_id = %payment_id,
                    reason,
                    "Webhook signature invalid, relying on payment lookup"
                );
            }
        }
        check
    }

    fn notify_approved(&self, transaction: &Transaction, email: String) {
        let purchase = match (transaction.kind, transaction.plan_id, transaction.credits_amount) {
            (TransactionKind::Subscription, Some(plan), _) => Purchase::Plan(plan),
            (TransactionKind::Credits, _, Some(amount)) => Purchase::Credits(amount),
            _ => return,
        };
        let notice = PaymentApprovedNotice {
            user_id: transaction.user_id,
            email,
            purchase,
            amount_cents: transaction.amount_cents,
        };
        let notifier = self.notifier.clone();

        tokio::spawn(async move {
            if let Err(e) = notifier.payment_approved(&notice).await {
                tracing::warn!(user_id = %notice.user_id, error = %e, "Payment confirmation email failed");
            }
        });
    }
}
