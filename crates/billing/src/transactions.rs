//! Purchase transactions
//!
//! One row per purchase intent, keyed by its external reference. The row
//! mirrors the gateway's view of the payment and doubles as the idempotency
//! guard: an entitlement is granted only on the transition into `APPROVED`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanType;
use crate::client::GatewayPayment;
use crate::error::{BillingError, BillingResult};
use crate::ledger::LedgerOp;
use crate::reference::{ExternalReference, Purchase};
use crate::store::BillingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionKind {
    Subscription,
    Credits,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Subscription => "SUBSCRIPTION",
            TransactionKind::Credits => "CREDITS",
        }
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUBSCRIPTION" => Ok(TransactionKind::Subscription),
            "CREDITS" => Ok(TransactionKind::Credits),
            other => Err(BillingError::Database(format!(
                "Unknown transaction kind '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Approved => "APPROVED",
            TransactionStatus::Rejected => "REJECTED",
            TransactionStatus::Cancelled => "CANCELLED",
        }
    }

    /// Map a gateway payment status onto the local status set.
    ///
    /// In-flight states (`in_process`, `authorized`, `in_mediation`) stay
    /// pending; refunds and chargebacks read as cancelled.
    pub fn from_gateway(status: &str) -> Self {
        match status {
            "approved" => TransactionStatus::Approved,
            "rejected" => TransactionStatus::Rejected,
            "cancelled" | "refunded" | "charged_back" => TransactionStatus::Cancelled,
            _ => TransactionStatus::Pending,
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransactionStatus::Pending),
            "APPROVED" => Ok(TransactionStatus::Approved),
            "REJECTED" => Ok(TransactionStatus::Rejected),
            "CANCELLED" => Ok(TransactionStatus::Cancelled),
            other => Err(BillingError::Database(format!(
                "Unknown transaction status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub external_reference: String,
    pub provider_preference_id: Option<String>,
    pub provider_payment_id: Option<String>,
    pub kind: TransactionKind,
    pub plan_id: Option<PlanType>,
    pub credits_amount: Option<i64>,
    pub status: TransactionStatus,
    pub amount_cents: i64,
    pub payment_method: Option<String>,
    /// When the approval's entitlement was applied. A payment can leave
    /// `APPROVED` (mediation, chargeback) and come back; this stays set.
    #[serde(with = "time::serde::rfc3339::option")]
    pub entitlement_granted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Result of mirroring a gateway payment onto a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTransition {
    pub previous: TransactionStatus,
    pub current: TransactionStatus,
    first_approval: bool,
}

impl StatusTransition {
    /// True exactly once per transaction: the first time it reads `APPROVED`
    pub fn is_new_approval(&self) -> bool {
        self.first_approval
    }
}

impl Transaction {
    /// A fresh `PENDING` row for a purchase intent
    pub fn pending(
        reference: &ExternalReference,
        amount_cents: i64,
        preference_id: Option<String>,
        now: OffsetDateTime,
    ) -> Self {
        let (kind, plan_id, credits_amount) = match reference.purchase {
            Purchase::Plan(plan) => (TransactionKind::Subscription, Some(plan), None),
            Purchase::Credits(amount) => (TransactionKind::Credits, None, Some(amount)),
        };

        Self {
            id: Uuid::new_v4(),
            user_id: reference.user_id,
            external_reference: reference.encode(),
            provider_preference_id: preference_id,
            provider_payment_id: None,
            kind,
            plan_id,
            credits_amount,
            status: TransactionStatus::Pending,
            amount_cents,
            payment_method: None,
            entitlement_granted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A row for a payment that arrived without a locally recorded intent
    pub fn synthesized(
        reference: &ExternalReference,
        payment: &GatewayPayment,
        now: OffsetDateTime,
    ) -> Self {
        let mut tx = Self::pending(reference, payment.amount_cents, None, now);
        tx.provider_payment_id = Some(payment.id.clone());
        tx
    }

    /// Copy the gateway's view of the payment onto this row. The amount is
    /// left as the price of the intent.
    ///
    /// The first approval stamps `entitlement_granted_at`; callers must persist
    /// the row in the same unit as the grant.
    pub fn mirror(&mut self, payment: &GatewayPayment, now: OffsetDateTime) -> StatusTransition {
        let previous = self.status;
        self.status = TransactionStatus::from_gateway(&payment.status);

        let first_approval =
            self.status == TransactionStatus::Approved && self.entitlement_granted_at.is_none();
        if first_approval {
            self.entitlement_granted_at = Some(now);
        }
        self.provider_payment_id = Some(payment.id.clone());
        if payment.payment_method_id.is_some() {
            self.payment_method = payment.payment_method_id.clone();
        }
        self.updated_at = now;

        StatusTransition {
            previous,
            current: self.status,
            first_approval,
        }
    }

    /// The ledger op an approval of this transaction grants
    pub fn entitlement(&self) -> BillingResult<LedgerOp> {
        match (self.kind, self.plan_id, self.credits_amount) {
            (TransactionKind::Subscription, Some(plan), _) => Ok(LedgerOp::ActivateOrRenew { plan }),
            (TransactionKind::Credits, _, Some(amount)) => {
                Ok(LedgerOp::AddPurchasedCredits { amount })
            }
            _ => Err(BillingError::Database(format!(
                "Transaction {} has no purchasable item",
                self.external_reference
            ))),
        }
    }
}

/// Read side; rows are written by checkout and settlement
#[derive(Clone)]
pub struct TransactionService {
    store: Arc<dyn BillingStore>,
}

impl TransactionService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Newest first
    pub async fn list_for_user(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<Transaction>> {
        self.store.list_transactions(user_id, limit.clamp(1, 100)).await
    }
}
