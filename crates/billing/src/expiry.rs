//! Subscription expiry sweep
//!
//! Downgrades every account whose paid period has ended, cancelled or not.
//! The overdue condition is re-checked under the row lock, so an account
//! renewed between the scan and the downgrade is left alone. Accounts are
//! processed independently: one failure never stops the rest of the batch.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::catalog::PlanCatalog;
use crate::email::{BillingNotifier, PlanExpiredNotice};
use crate::error::BillingResult;
use crate::ledger::LedgerOp;
use crate::store::BillingStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub candidates: usize,
    pub downgraded: usize,
    /// Renewed or otherwise no longer overdue by the time the lock was held
    pub skipped: usize,
    pub failed: usize,
    pub notification_failures: usize,
}

#[derive(Clone)]
pub struct ExpirySweep {
    store: Arc<dyn BillingStore>,
    catalog: Arc<PlanCatalog>,
    notifier: Arc<dyn BillingNotifier>,
}

impl ExpirySweep {
    pub fn new(
        store: Arc<dyn BillingStore>,
        catalog: Arc<PlanCatalog>,
        notifier: Arc<dyn BillingNotifier>,
    ) -> Self {
        Self {
            store,
            catalog,
            notifier,
        }
    }

    pub async fn run(&self) -> BillingResult<SweepReport> {
        self.run_at(OffsetDateTime::now_utc()).await
    }

    /// Fails only if the candidate scan itself fails
    pub async fn run_at(&self, now: OffsetDateTime) -> BillingResult<SweepReport> {
        let candidates = self.store.find_overdue_accounts(now).await?;
        let mut report = SweepReport {
            candidates: candidates.len(),
            ..SweepReport::default()
        };

        if candidates.is_empty() {
            tracing::debug!("No expired subscriptions");
            return Ok(report);
        }

        for candidate in candidates {
            let user_id = candidate.user_id;
            let old_plan = candidate.plan_type;

            let outcome = match self
                .store
                .apply_ledger_op(user_id, &LedgerOp::ExpireIfOverdue, &self.catalog, now)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(user_id = %user_id, error = %e, "Failed to expire subscription");
                    report.failed += 1;
                    continue;
                }
            };

            if !outcome.effect.applied {
                tracing::info!(user_id = %user_id, "Subscription no longer overdue, skipping");
                report.skipped += 1;
                continue;
            }

            report.downgraded += 1;
            tracing::info!(
                user_id = %user_id,
                old_plan = %old_plan,
                purchased_credits = outcome.account.purchased_credits,
                "Subscription expired, downgraded to FREE"
            );

            let notice = PlanExpiredNotice {
                user_id,
                email: outcome.account.email,
                old_plan,
            };
            if let Err(e) = self.notifier.plan_expired(&notice).await {
                tracing::warn!(user_id = %user_id, error = %e, "Expiry email failed");
                report.notification_failures += 1;
            }
        }

        tracing::info!(
            candidates = report.candidates,
            downgraded = report.downgraded,
            skipped = report.skipped,
            failed = report.failed,
            "Expiry sweep complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountSubscription, HistoryReason, SubscriptionStatus};
    use crate::catalog::PlanType;
    use crate::email::MockBillingNotifier;
    use crate::error::BillingError;
    use crate::store::InMemoryBillingStore;
    use time::macros::datetime;
    use time::Duration;
    use uuid::Uuid;

    const NOW: OffsetDateTime = datetime!(2025-07-01 03:00 UTC);

    fn paid(
        plan: PlanType,
        status: SubscriptionStatus,
        end: OffsetDateTime,
    ) -> AccountSubscription {
        let mut account = AccountSubscription::new_free(Uuid::new_v4(), "p@example.com", NOW);
        account.plan_type = plan;
        account.subscription_status = status;
        account.subscription_end_date = Some(end);
        account.subscription_credits = 40;
        account.purchased_credits = 15;
        account.credits = 55;
        account
    }

    #[tokio::test]
    async fn test_sweep_downgrades_overdue_and_keeps_purchased_credits() {
        let store = Arc::new(InMemoryBillingStore::new());
        let expired = paid(PlanType::Pro, SubscriptionStatus::Canceled, NOW - Duration::hours(1));
        let current = paid(PlanType::Pro, SubscriptionStatus::Active, NOW + Duration::days(3));
        store.put_account(expired.clone()).await;
        store.put_account(current.clone()).await;

        let mut notifier = MockBillingNotifier::new();
        notifier
            .expect_plan_expired()
            .withf(|notice| notice.old_plan == PlanType::Pro)
            .times(1)
            .returning(|_| Ok(()));

        let sweep = ExpirySweep::new(
            store.clone(),
            Arc::new(PlanCatalog::builtin()),
            Arc::new(notifier),
        );
        let report = sweep.run_at(NOW).await.unwrap();

        assert_eq!(report.candidates, 1);
        assert_eq!(report.downgraded, 1);

        let after = store.get_account(expired.user_id).await.unwrap().unwrap();
        assert_eq!(after.plan_type, PlanType::Free);
        assert_eq!(after.subscription_status, SubscriptionStatus::Inactive);
        assert_eq!(after.subscription_credits, 0);
        assert_eq!(after.purchased_credits, 15);
        assert_eq!(after.credits, 15);

        let history = store.subscription_history(expired.user_id, 50).await.unwrap();
        assert_eq!(history[0].reason, HistoryReason::ExpirationAutoDowngrade);

        let untouched = store.get_account(current.user_id).await.unwrap().unwrap();
        assert_eq!(untouched, current);
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_stop_sweep() {
        let store = Arc::new(InMemoryBillingStore::new());
        for _ in 0..3 {
            store
                .put_account(paid(
                    PlanType::Starter,
                    SubscriptionStatus::Active,
                    NOW - Duration::days(2),
                ))
                .await;
        }

        let mut notifier = MockBillingNotifier::new();
        notifier
            .expect_plan_expired()
            .times(3)
            .returning(|_| Err(BillingError::GatewayUnavailable("smtp down".into())));

        let sweep = ExpirySweep::new(
            store.clone(),
            Arc::new(PlanCatalog::builtin()),
            Arc::new(notifier),
        );
        let report = sweep.run_at(NOW).await.unwrap();

        assert_eq!(report.downgraded, 3);
        assert_eq!(report.notification_failures, 3);
        assert!(store.find_overdue_accounts(NOW).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_run_is_a_noop() {
        let store = Arc::new(InMemoryBillingStore::new());
        store
            .put_account(paid(
                PlanType::Studio,
                SubscriptionStatus::Active,
                NOW - Duration::minutes(1),
            ))
            .await;

        let mut notifier = MockBillingNotifier::new();
        notifier.expect_plan_expired().times(1).returning(|_| Ok(()));

        let sweep = ExpirySweep::new(
            store.clone(),
            Arc::new(PlanCatalog::builtin()),
            Arc::new(notifier),
        );
        assert_eq!(sweep.run_at(NOW).await.unwrap().downgraded, 1);
        assert_eq!(sweep.run_at(NOW).await.unwrap(), SweepReport::default());
    }
}
