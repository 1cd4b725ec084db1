//! In-memory store
//!
//! A single mutex serializes every operation, which gives the same atomicity
//! the Postgres store gets from row locks.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{synthesize_transaction, BillingStore, SettlementOutcome};
use crate::account::{AccountSubscription, CreditConsumption, SubscriptionHistoryEntry};
use crate::catalog::PlanCatalog;
use crate::client::GatewayPayment;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{LedgerOp, LedgerOutcome};
use crate::transactions::Transaction;

#[derive(Default)]
struct State {
    accounts: HashMap<Uuid, AccountSubscription>,
    transactions: HashMap<String, Transaction>,
    history: Vec<SubscriptionHistoryEntry>,
    consumption: Vec<CreditConsumption>,
}

impl State {
    fn apply(
        &mut self,
        user_id: Uuid,
        op: &LedgerOp,
        catalog: &PlanCatalog,
        now: OffsetDateTime,
    ) -> BillingResult<LedgerOutcome> {
        let current = self
            .accounts
            .get(&user_id)
            .ok_or_else(|| BillingError::NotFound(format!("Account {}", user_id)))?;

        // Work on a copy so a failed op leaves the stored account untouched
        let mut account = current.clone();
        let effect = op.apply(&mut account, catalog, now)?;

        if effect.applied {
            self.accounts.insert(user_id, account.clone());
        }
        if let Some(entry) = &effect.history {
            self.history.push(entry.clone());
        }
        if let Some(record) = &effect.consumption {
            self.consumption.push(record.clone());
        }

        Ok(LedgerOutcome { account, effect })
    }
}

#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<State>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace an account
    pub async fn put_account(&self, account: AccountSubscription) {
        self.state
            .lock()
            .await
            .accounts
            .insert(account.user_id, account);
    }
}

fn newest_first<T>(mut items: Vec<T>, created_at: impl Fn(&T) -> OffsetDateTime) -> Vec<T> {
    items.sort_by_key(|item| std::cmp::Reverse(created_at(item)));
    items
}

fn clamp_limit(limit: i64) -> usize {
    usize::try_from(limit.max(0)).unwrap_or(usize::MAX)
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn get_account(&self, user_id: Uuid) -> BillingResult<Option<AccountSubscription>> {
        Ok(self.state.lock().await.accounts.get(&user_id).cloned())
    }

    async fn apply_ledger_op(
        &self,
        user_id: Uuid,
        op: &LedgerOp,
        catalog: &PlanCatalog,
        now: OffsetDateTime,
    ) -> BillingResult<LedgerOutcome> {
        self.state.lock().await.apply(user_id, op, catalog, now)
    }

    async fn find_overdue_accounts(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<AccountSubscription>> {
        let state = self.state.lock().await;
        let mut overdue: Vec<AccountSubscription> = state
            .accounts
            .values()
            .filter(|a| a.plan_type.is_paid() && a.is_overdue(now))
            .cloned()
            .collect();
        overdue.sort_by_key(|a| a.subscription_end_date);
        Ok(overdue)
    }

    async fn subscription_history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionHistoryEntry>> {
        let state = self.state.lock().await;
        let entries = state
            .history
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        let mut entries = newest_first(entries, |e| e.created_at);
        entries.truncate(clamp_limit(limit));
        Ok(entries)
    }

    async fn credit_consumption(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<CreditConsumption>> {
        let state = self.state.lock().await;
        let records = state
            .consumption
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        let mut records = newest_first(records, |c| c.created_at);
        records.truncate(clamp_limit(limit));
        Ok(records)
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if state
            .transactions
            .contains_key(&transaction.external_reference)
        {
            return Err(BillingError::Database(format!(
                "Duplicate external reference {}",
                transaction.external_reference
            )));
        }
        state
            .transactions
            .insert(transaction.external_reference.clone(), transaction.clone());
        Ok(())
    }

    async fn find_transaction_by_reference(
        &self,
        external_reference: &str,
    ) -> BillingResult<Option<Transaction>> {
        Ok(self
            .state
            .lock()
            .await
            .transactions
            .get(external_reference)
            .cloned())
    }

    async fn list_transactions(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<Transaction>> {
        let state = self.state.lock().await;
        let rows = state
            .transactions
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        let mut rows = newest_first(rows, |t| t.created_at);
        rows.truncate(clamp_limit(limit));
        Ok(rows)
    }

    async fn settle_payment(
        &self,
        external_reference: &str,
        payment: &GatewayPayment,
        catalog: &PlanCatalog,
        now: OffsetDateTime,
    ) -> BillingResult<SettlementOutcome> {
        let mut state = self.state.lock().await;

        let (mut transaction, synthesized) = match state.transactions.get(external_reference) {
            Some(existing) => (existing.clone(), false),
            None => match synthesize_transaction(external_reference, payment, now) {
                Some(created) if state.accounts.contains_key(&created.user_id) => (created, true),
                Some(created) => {
                    return Err(BillingError::NotFound(format!("Account {}", created.user_id)))
                }
                None => return Ok(SettlementOutcome::Unresolvable),
            },
        };

        let transition = transaction.mirror(payment, now);

        // Grant before writing the row back so a failed grant leaves both untouched
        let entitlement = if transition.is_new_approval() {
            let op = transaction.entitlement()?;
            Some(state.apply(transaction.user_id, &op, catalog, now)?)
        } else {
            None
        };

        state
            .transactions
            .insert(external_reference.to_string(), transaction.clone());

        Ok(SettlementOutcome::Settled {
            transaction,
            transition,
            synthesized,
            entitlement,
        })
    }
}
