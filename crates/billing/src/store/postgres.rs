//! Postgres store
//!
//! Each mutating call runs in one database transaction. Account rows are
//! locked with `SELECT ... FOR UPDATE` before the ledger op is applied, and
//! transaction rows are claimed the same way, so concurrent deliveries of the
//! same payment serialize on the row and only the first sees the approval.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{synthesize_transaction, BillingStore, SettlementOutcome};
use crate::account::{AccountSubscription, CreditConsumption, SubscriptionHistoryEntry};
use crate::catalog::{PlanCatalog, PlanType};
use crate::client::GatewayPayment;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{LedgerOp, LedgerOutcome};
use crate::transactions::Transaction;

type PgTx<'c> = sqlx::Transaction<'c, Postgres>;

const ACCOUNT_COLUMNS: &str = "id, email, plan_type, subscription_status, subscription_end_date, \
     credits_reset_date, subscription_credits, purchased_credits, credits, \
     generations_used_cycle, updated_at";

const TRANSACTION_COLUMNS: &str = "id, user_id, external_reference, provider_preference_id, \
     provider_payment_id, kind, plan_id, credits_amount, status, amount_cents, payment_method, \
     entitlement_granted_at, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    email: String,
    plan_type: String,
    subscription_status: String,
    subscription_end_date: Option<OffsetDateTime>,
    credits_reset_date: Option<OffsetDateTime>,
    subscription_credits: i64,
    purchased_credits: i64,
    credits: i64,
    generations_used_cycle: i32,
    updated_at: OffsetDateTime,
}

impl TryFrom<AccountRow> for AccountSubscription {
    type Error = BillingError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Self {
            user_id: row.id,
            email: row.email,
            plan_type: parse_plan(&row.plan_type)?,
            subscription_status: row.subscription_status.parse()?,
            subscription_end_date: row.subscription_end_date,
            credits_reset_date: row.credits_reset_date,
            subscription_credits: row.subscription_credits,
            purchased_credits: row.purchased_credits,
            credits: row.credits,
            generations_used_cycle: row.generations_used_cycle,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    user_id: Uuid,
    external_reference: String,
    provider_preference_id: Option<String>,
    provider_payment_id: Option<String>,
    kind: String,
    plan_id: Option<String>,
    credits_amount: Option<i64>,
    status: String,
    amount_cents: i64,
    payment_method: Option<String>,
    entitlement_granted_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = BillingError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            external_reference: row.external_reference,
            provider_preference_id: row.provider_preference_id,
            provider_payment_id: row.provider_payment_id,
            kind: row.kind.parse()?,
            plan_id: row.plan_id.as_deref().map(parse_plan).transpose()?,
            credits_amount: row.credits_amount,
            status: row.status.parse()?,
            amount_cents: row.amount_cents,
            payment_method: row.payment_method,
            entitlement_granted_at: row.entitlement_granted_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: Uuid,
    user_id: Uuid,
    old_plan: Option<String>,
    new_plan: String,
    reason: String,
    created_at: OffsetDateTime,
}

impl TryFrom<HistoryRow> for SubscriptionHistoryEntry {
    type Error = BillingError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            old_plan: match row.old_plan.as_deref() {
                Some(plan) => parse_plan(plan)?,
                None => PlanType::Free,
            },
            new_plan: parse_plan(&row.new_plan)?,
            reason: row.reason.parse()?,
            created_at: row.created_at,
        })
    }
}

/// Stored values are always canonical; anything else is a corrupt row
fn parse_plan(raw: &str) -> BillingResult<PlanType> {
    raw.parse()
        .map_err(|_| BillingError::Database(format!("Unknown plan '{}' in database", raw)))
}

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_account(tx: &mut PgTx<'_>, user_id: Uuid) -> BillingResult<AccountSubscription> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM users WHERE id = $1 FOR UPDATE",
            ACCOUNT_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;

        row.ok_or_else(|| BillingError::NotFound(format!("Account {}", user_id)))?
            .try_into()
    }

    /// Apply `op` inside an open transaction; the caller commits
    async fn apply_in_tx(
        tx: &mut PgTx<'_>,
        user_id: Uuid,
        op: &LedgerOp,
        catalog: &PlanCatalog,
        now: OffsetDateTime,
    ) -> BillingResult<LedgerOutcome> {
        let mut account = Self::lock_account(tx, user_id).await?;
        let effect = op.apply(&mut account, catalog, now)?;

        if !effect.applied {
            return Ok(LedgerOutcome { account, effect });
        }

        sqlx::query(
            r#"
            UPDATE users
            SET plan_type = $2,
                subscription_status = $3,
                subscription_end_date = $4,
                credits_reset_date = $5,
                subscription_credits = $6,
                purchased_credits = $7,
                credits = $8,
                generations_used_cycle = $9,
                updated_at = $10
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(account.plan_type.as_str())
        .bind(account.subscription_status.as_str())
        .bind(account.subscription_end_date)
        .bind(account.credits_reset_date)
        .bind(account.subscription_credits)
        .bind(account.purchased_credits)
        .bind(account.credits)
        .bind(account.generations_used_cycle)
        .bind(account.updated_at)
        .execute(&mut **tx)
        .await?;

        if let Some(entry) = &effect.history {
            sqlx::query(
                r#"
                INSERT INTO subscription_history (id, user_id, old_plan, new_plan, reason, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(entry.id)
            .bind(entry.user_id)
            .bind(entry.old_plan.as_str())
            .bind(entry.new_plan.as_str())
            .bind(entry.reason.as_str())
            .bind(entry.created_at)
            .execute(&mut **tx)
            .await?;
        }

        if let Some(record) = &effect.consumption {
            sqlx::query(
                r#"
                INSERT INTO credit_consumption_history
                    (id, user_id, reason, credits_consumed, was_free, source, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(record.id)
            .bind(record.user_id)
            .bind(&record.reason)
            .bind(record.credits_consumed)
            .bind(record.was_free)
            .bind(&record.source)
            .bind(record.created_at)
            .execute(&mut **tx)
            .await?;
        }

        Ok(LedgerOutcome { account, effect })
    }

    async fn lock_transaction(
        tx: &mut PgTx<'_>,
        external_reference: &str,
    ) -> BillingResult<Option<Transaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM transactions WHERE external_reference = $1 FOR UPDATE",
            TRANSACTION_COLUMNS
        ))
        .bind(external_reference)
        .fetch_optional(&mut **tx)
        .await?;

        row.map(Transaction::try_from).transpose()
    }

    async fn insert_transaction_in_tx(
        tx: &mut PgTx<'_>,
        transaction: &Transaction,
        on_conflict_do_nothing: bool,
    ) -> BillingResult<()> {
        let sql = format!(
            r#"
            INSERT INTO transactions ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            {}
            "#,
            TRANSACTION_COLUMNS,
            if on_conflict_do_nothing {
                "ON CONFLICT (external_reference) DO NOTHING"
            } else {
                ""
            }
        );

        sqlx::query(&sql)
            .bind(transaction.id)
            .bind(transaction.user_id)
            .bind(&transaction.external_reference)
            .bind(&transaction.provider_preference_id)
            .bind(&transaction.provider_payment_id)
            .bind(transaction.kind.as_str())
            .bind(transaction.plan_id.map(|p| p.as_str()))
            .bind(transaction.credits_amount)
            .bind(transaction.status.as_str())
            .bind(transaction.amount_cents)
            .bind(&transaction.payment_method)
            .bind(transaction.entitlement_granted_at)
            .bind(transaction.created_at)
            .bind(transaction.updated_at)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_account(&self, user_id: Uuid) -> BillingResult<Option<AccountSubscription>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {} FROM users WHERE id = $1",
            ACCOUNT_COLUMNS
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AccountSubscription::try_from).transpose()
    }

    async fn apply_ledger_op(
        &self,
        user_id: Uuid,
        op: &LedgerOp,
        catalog: &PlanCatalog,
        now: OffsetDateTime,
    ) -> BillingResult<LedgerOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = Self::apply_in_tx(&mut tx, user_id, op, catalog, now).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn find_overdue_accounts(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<AccountSubscription>> {
        let rows: Vec<AccountRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM users
            WHERE subscription_end_date < $1
              AND subscription_status IN ('ACTIVE', 'CANCELED')
              AND plan_type <> 'FREE'
            ORDER BY subscription_end_date
            "#,
            ACCOUNT_COLUMNS
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AccountSubscription::try_from).collect()
    }

    async fn subscription_history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionHistoryEntry>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, old_plan, new_plan, reason, created_at
            FROM subscription_history
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(SubscriptionHistoryEntry::try_from)
            .collect()
    }

    async fn credit_consumption(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<CreditConsumption>> {
        let rows: Vec<(Uuid, Uuid, String, i64, bool, String, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT id, user_id, reason, credits_consumed, was_free, source, created_at
            FROM credit_consumption_history
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, user_id, reason, credits_consumed, was_free, source, created_at)| {
                    CreditConsumption {
                        id,
                        user_id,
                        reason,
                        credits_consumed,
                        was_free,
                        source,
                        created_at,
                    }
                },
            )
            .collect())
    }

    async fn insert_transaction(&self, transaction: &Transaction) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_transaction_in_tx(&mut tx, transaction, false).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_transaction_by_reference(
        &self,
        external_reference: &str,
    ) -> BillingResult<Option<Transaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM transactions WHERE external_reference = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(external_reference)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Transaction::try_from).transpose()
    }

    async fn list_transactions(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<Transaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM transactions WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
            TRANSACTION_COLUMNS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Transaction::try_from).collect()
    }

    async fn settle_payment(
        &self,
        external_reference: &str,
        payment: &GatewayPayment,
        catalog: &PlanCatalog,
        now: OffsetDateTime,
    ) -> BillingResult<SettlementOutcome> {
        let mut tx = self.pool.begin().await?;

        let (mut transaction, synthesized) =
            match Self::lock_transaction(&mut tx, external_reference).await? {
                Some(existing) => (existing, false),
                None => {
                    let Some(created) = synthesize_transaction(external_reference, payment, now)
                    else {
                        tx.rollback().await?;
                        return Ok(SettlementOutcome::Unresolvable);
                    };
                    // The row references users(id); a reference naming an unknown
                    // user would fail the insert as a database error forever.
                    if let Err(e) = Self::lock_account(&mut tx, created.user_id).await {
                        tx.rollback().await?;
                        return Err(e);
                    }
                    // A concurrent delivery may insert the same row first; either
                    // way the SELECT below locks the single surviving row.
                    Self::insert_transaction_in_tx(&mut tx, &created, true).await?;
                    let locked = Self::lock_transaction(&mut tx, external_reference)
                        .await?
                        .ok_or_else(|| {
                            BillingError::Database(format!(
                                "Transaction {} vanished after insert",
                                external_reference
                            ))
                        })?;
                    let synthesized = locked.id == created.id;
                    (locked, synthesized)
                }
            };

        let transition = transaction.mirror(payment, now);

        sqlx::query(
            r#"
            UPDATE transactions
            SET status = $2,
                provider_payment_id = $3,
                payment_method = $4,
                updated_at = $5,
                entitlement_granted_at = $6
            WHERE id = $1
            "#,
        )
        .bind(transaction.id)
        .bind(transaction.status.as_str())
        .bind(&transaction.provider_payment_id)
        .bind(&transaction.payment_method)
        .bind(transaction.updated_at)
        .bind(transaction.entitlement_granted_at)
        .execute(&mut *tx)
        .await?;

        let entitlement = if transition.is_new_approval() {
            let op = transaction.entitlement()?;
            Some(Self::apply_in_tx(&mut tx, transaction.user_id, &op, catalog, now).await?)
        } else {
            None
        };

        tx.commit().await?;

        Ok(SettlementOutcome::Settled {
            transaction,
            transition,
            synthesized,
            entitlement,
        })
    }
}
