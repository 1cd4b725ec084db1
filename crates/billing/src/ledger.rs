//! Subscription ledger
//!
//! Every change to an account's plan or credit balances is expressed as a
//! [`LedgerOp`] and applied by [`LedgerOp::apply`], a pure function over the
//! account row. Stores call it while holding the row lock, so the effect of an
//! op, its history entry and its consumption record always land together.

use std::sync::Arc;

use time::{Date, Duration, Month, OffsetDateTime};
use uuid::Uuid;

use crate::account::{
    AccountSubscription, CreditConsumption, HistoryReason, SubscriptionHistoryEntry,
    SubscriptionStatus,
};
use crate::catalog::{PlanCatalog, PlanType};
use crate::error::{BillingError, BillingResult};
use crate::store::BillingStore;

/// A single state transition on an account
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerOp {
    /// Grant a paid month of `plan`: renews when already on it, switches otherwise
    ActivateOrRenew { plan: PlanType },
    AddPurchasedCredits { amount: i64 },
    /// Stop renewing; access continues until the end date
    Cancel,
    DowngradeToFree,
    /// Downgrade only if the account is still overdue when the lock is held
    ExpireIfOverdue,
    ConsumeCredits {
        cost: i64,
        reason: String,
        source: String,
    },
}

/// What an applied op recorded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerEffect {
    pub applied: bool,
    pub history: Option<SubscriptionHistoryEntry>,
    pub consumption: Option<CreditConsumption>,
}

impl LedgerEffect {
    fn noop() -> Self {
        Self::default()
    }
}

/// Account state after an op plus what it recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerOutcome {
    pub account: AccountSubscription,
    pub effect: LedgerEffect,
}

/// Same wall-clock time one calendar month later, clamping the day to the
/// target month (Jan 31 -> Feb 28/29).
pub fn add_one_month(at: OffsetDateTime) -> OffsetDateTime {
    let (year, month) = match at.month() {
        Month::December => (at.year() + 1, Month::January),
        other => (at.year(), other.next()),
    };
    let day = at.day().min(time::util::days_in_year_month(year, month));

    match Date::from_calendar_date(year, month, day) {
        Ok(date) => at.replace_date(date),
        Err(_) => at + Duration::days(30),
    }
}

impl LedgerOp {
    /// Apply to `account` in place. On error the account is left untouched.
    pub fn apply(
        &self,
        account: &mut AccountSubscription,
        catalog: &PlanCatalog,
        now: OffsetDateTime,
    ) -> BillingResult<LedgerEffect> {
        let effect = match self {
            LedgerOp::ActivateOrRenew { plan } => activate_or_renew(account, catalog, *plan, now)?,
            LedgerOp::AddPurchasedCredits { amount } => {
                if *amount <= 0 {
                    return Err(BillingError::InvalidInput(format!(
                        "Credit amount must be positive, got {}",
                        amount
                    )));
                }
                account.purchased_credits += amount;
                account.recompute_credits();
                LedgerEffect {
                    applied: true,
                    ..LedgerEffect::default()
                }
            }
            LedgerOp::Cancel => cancel(account, now)?,
            LedgerOp::DowngradeToFree => downgrade_to_free(account, now),
            LedgerOp::ExpireIfOverdue => {
                if !account.is_overdue(now) {
                    return Ok(LedgerEffect::noop());
                }
                downgrade_to_free(account, now)
            }
            LedgerOp::ConsumeCredits {
                cost,
                reason,
                source,
            } => consume(account, catalog, *cost, reason, source, now)?,
        };

        if effect.applied {
            account.updated_at = now;
        }
        Ok(effect)
    }
}

fn activate_or_renew(
    account: &mut AccountSubscription,
    catalog: &PlanCatalog,
    plan: PlanType,
    now: OffsetDateTime,
) -> BillingResult<LedgerEffect> {
    let info = catalog.purchasable_plan(plan)?;
    let old_plan = account.plan_type;

    let renewing = old_plan == plan
        && account.subscription_status == SubscriptionStatus::Active
        && account.subscription_end_date.is_some_and(|end| end > now);

    let (end_date, reason) = match account.subscription_end_date {
        Some(current_end) if renewing => (add_one_month(current_end), HistoryReason::Renewal),
        _ => {
            let reason = if old_plan == PlanType::Free || old_plan == plan {
                HistoryReason::Subscription
            } else if plan.rank() > old_plan.rank() {
                HistoryReason::Upgrade
            } else {
                HistoryReason::Downgrade
            };
            (add_one_month(now), reason)
        }
    };

    account.plan_type = plan;
    account.subscription_status = SubscriptionStatus::Active;
    account.subscription_end_date = Some(end_date);
    account.credits_reset_date = Some(end_date);
    account.subscription_credits = info.monthly_credits;
    account.generations_used_cycle = 0;
    account.recompute_credits();

    Ok(LedgerEffect {
        applied: true,
        history: Some(SubscriptionHistoryEntry::new(
            account.user_id,
            old_plan,
            plan,
            reason,
            now,
        )),
        consumption: None,
    })
}

fn cancel(account: &mut AccountSubscription, now: OffsetDateTime) -> BillingResult<LedgerEffect> {
    if !account.plan_type.is_paid() || account.subscription_status != SubscriptionStatus::Active {
        return Err(BillingError::InvalidInput(
            "No active paid subscription to cancel".to_string(),
        ));
    }

    account.subscription_status = SubscriptionStatus::Canceled;
    Ok(LedgerEffect {
        applied: true,
        history: Some(SubscriptionHistoryEntry::new(
            account.user_id,
            account.plan_type,
            account.plan_type,
            HistoryReason::Cancellation,
            now,
        )),
        consumption: None,
    })
}

fn downgrade_to_free(account: &mut AccountSubscription, now: OffsetDateTime) -> LedgerEffect {
    let old_plan = account.plan_type;

    account.plan_type = PlanType::Free;
    account.subscription_status = SubscriptionStatus::Inactive;
    account.subscription_credits = 0;
    account.recompute_credits();
    // The free allowance runs on its own cycle from here
    account.generations_used_cycle = 0;
    account.credits_reset_date = Some(add_one_month(now));

    LedgerEffect {
        applied: true,
        history: Some(SubscriptionHistoryEntry::new(
            account.user_id,
            old_plan,
            PlanType::Free,
            HistoryReason::ExpirationAutoDowngrade,
            now,
        )),
        consumption: None,
    }
}

fn consume(
    account: &mut AccountSubscription,
    catalog: &PlanCatalog,
    cost: i64,
    reason: &str,
    source: &str,
    now: OffsetDateTime,
) -> BillingResult<LedgerEffect> {
    if cost < 0 {
        return Err(BillingError::InvalidInput(format!(
            "Credit cost must not be negative, got {}",
            cost
        )));
    }

    let limit = catalog.plan(account.plan_type)?.generation_limit;

    // Roll a lapsed cycle; the counter is only committed if the spend succeeds
    let mut used = account.generations_used_cycle;
    let mut reset_date = account.credits_reset_date;
    if !reset_date.is_some_and(|reset| reset > now) {
        used = 0;
        reset_date = Some(add_one_month(now));
    }

    let was_free = used < limit;
    let charged = if was_free { 0 } else { cost };

    if charged > account.credits {
        return Err(BillingError::InsufficientCredits {
            available: account.credits,
            required: charged,
        });
    }

    // Monthly grant first; it is the balance that gets reset
    let from_subscription = charged.min(account.subscription_credits);
    account.subscription_credits -= from_subscription;
    account.purchased_credits -= charged - from_subscription;
    account.recompute_credits();
    account.credits_reset_date = reset_date;
    account.generations_used_cycle = used.saturating_add(1);

    Ok(LedgerEffect {
        applied: true,
        history: None,
        consumption: Some(CreditConsumption {
            id: Uuid::new_v4(),
            user_id: account.user_id,
            reason: reason.to_string(),
            credits_consumed: charged,
            was_free,
            source: source.to_string(),
            created_at: now,
        }),
    })
}

/// Named entry points over [`BillingStore::apply_ledger_op`]
#[derive(Clone)]
pub struct SubscriptionLedger {
    store: Arc<dyn BillingStore>,
    catalog: Arc<PlanCatalog>,
}

impl SubscriptionLedger {
    pub fn new(store: Arc<dyn BillingStore>, catalog: Arc<PlanCatalog>) -> Self {
        Self { store, catalog }
    }

    pub async fn account(&self, user_id: Uuid) -> BillingResult<AccountSubscription> {
        self.store
            .get_account(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Account {}", user_id)))
    }

    /// Newest first
    pub async fn history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionHistoryEntry>> {
        self.store
            .subscription_history(user_id, limit.clamp(1, 100))
            .await
    }

    pub async fn apply(
        &self,
        user_id: Uuid,
        op: LedgerOp,
        now: OffsetDateTime,
    ) -> BillingResult<LedgerOutcome> {
        let outcome = self
            .store
            .apply_ledger_op(user_id, &op, &self.catalog, now)
            .await?;

        if let Some(entry) = &outcome.effect.history {
            tracing::info!(
                user_id = %user_id,
                old_plan = %entry.old_plan,
                new_plan = %entry.new_plan,
                reason = %entry.reason,
                "Subscription changed"
            );
        }
        Ok(outcome)
    }

    pub async fn cancel(&self, user_id: Uuid) -> BillingResult<LedgerOutcome> {
        self.apply(user_id, LedgerOp::Cancel, OffsetDateTime::now_utc())
            .await
    }
}
