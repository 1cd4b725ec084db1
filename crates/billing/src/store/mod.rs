//! Persistence for accounts, transactions and audit logs
//!
//! Every mutating method is a single atomic unit: the affected rows are
//! locked, the change is applied and the audit rows are written before the
//! lock is released. Two backends implement the trait: Postgres for
//! production and an in-memory store for tests and local runs.

mod memory;
mod postgres;

pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::account::{AccountSubscription, CreditConsumption, SubscriptionHistoryEntry};
use crate::catalog::PlanCatalog;
use crate::client::GatewayPayment;
use crate::error::BillingResult;
use crate::ledger::{LedgerOp, LedgerOutcome};
use crate::reference::ExternalReference;
use crate::transactions::{StatusTransition, Transaction};

/// Result of settling one gateway payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// No local transaction and the reference does not decode to a purchase
    Unresolvable,
    Settled {
        transaction: Transaction,
        transition: StatusTransition,
        /// The row was created from the payment's reference
        synthesized: bool,
        /// Present only when this call granted the entitlement
        entitlement: Option<LedgerOutcome>,
    },
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn get_account(&self, user_id: Uuid) -> BillingResult<Option<AccountSubscription>>;

    /// Lock the account, apply `op` and persist the result with its audit rows
    async fn apply_ledger_op(
        &self,
        user_id: Uuid,
        op: &LedgerOp,
        catalog: &PlanCatalog,
        now: OffsetDateTime,
    ) -> BillingResult<LedgerOutcome>;

    /// Accounts past their end date that still hold a paid status
    async fn find_overdue_accounts(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<AccountSubscription>>;

    /// Newest first
    async fn subscription_history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionHistoryEntry>>;

    /// Newest first
    async fn credit_consumption(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<CreditConsumption>>;

    async fn insert_transaction(&self, transaction: &Transaction) -> BillingResult<()>;

    async fn find_transaction_by_reference(
        &self,
        external_reference: &str,
    ) -> BillingResult<Option<Transaction>>;

    /// Newest first
    async fn list_transactions(&self, user_id: Uuid, limit: i64)
        -> BillingResult<Vec<Transaction>>;

    /// Mirror `payment` onto the transaction for `external_reference` and, on
    /// its first approval, grant the entitlement in the same atomic unit.
    ///
    /// A missing transaction is synthesized from the decoded reference.
    async fn settle_payment(
        &self,
        external_reference: &str,
        payment: &GatewayPayment,
        catalog: &PlanCatalog,
        now: OffsetDateTime,
    ) -> BillingResult<SettlementOutcome>;
}

/// Row to insert when a payment has no local transaction yet
fn synthesize_transaction(
    external_reference: &str,
    payment: &GatewayPayment,
    now: OffsetDateTime,
) -> Option<Transaction> {
    let reference = ExternalReference::decode(external_reference)?;
    let mut transaction = Transaction::synthesized(&reference, payment, now);
    // Keep the key exactly as the gateway relays it
    transaction.external_reference = external_reference.to_string();
    Some(transaction)
}
