// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Tests critical boundary conditions and race conditions in:
//! - Webhook idempotency (BILL-W01 to BILL-W05)
//! - Subscription periods (BILL-S01 to BILL-S04)
//! - Credit consumption (BILL-C01 to BILL-C03)

#[cfg(test)]
mod support {
    use std::sync::Arc;

    use time::macros::datetime;
    use time::OffsetDateTime;
    use uuid::Uuid;

    use crate::account::AccountSubscription;
    use crate::catalog::PlanCatalog;
    use crate::client::{GatewayPayment, MockPaymentGateway};
    use crate::email::MockBillingNotifier;
    use crate::signature::WebhookSignatureVerifier;
    use crate::store::InMemoryBillingStore;
    use crate::webhooks::{InboundWebhook, WebhookProcessor};

    pub const NOW: OffsetDateTime = datetime!(2025-08-15 12:00 UTC);

    pub fn approved(id: &str, reference: &str) -> GatewayPayment {
        GatewayPayment {
            id: id.into(),
            status: "approved".into(),
            status_detail: Some("accredited".into()),
            external_reference: Some(reference.into()),
            payment_method_id: Some("pix".into()),
            amount_cents: 5990,
        }
    }

    pub fn notification(payment_id: &str) -> InboundWebhook {
        InboundWebhook {
            body: serde_json::json!({"type": "payment", "data": {"id": payment_id}}),
            ..Default::default()
        }
    }

    pub fn quiet_notifier() -> Arc<MockBillingNotifier> {
        let mut notifier = MockBillingNotifier::new();
        notifier.expect_payment_approved().returning(|_| Ok(()));
        notifier.expect_plan_expired().returning(|_| Ok(()));
        Arc::new(notifier)
    }

    pub async fn store_with_free_user() -> (Arc<InMemoryBillingStore>, Uuid) {
        let store = Arc::new(InMemoryBillingStore::new());
        let user_id = Uuid::new_v4();
        store
            .put_account(AccountSubscription::new_free(user_id, "edge@example.com", NOW))
            .await;
        (store, user_id)
    }

    pub fn processor(
        gateway: MockPaymentGateway,
        store: Arc<InMemoryBillingStore>,
    ) -> WebhookProcessor {
        WebhookProcessor::new(
            Arc::new(gateway),
            store,
            Arc::new(PlanCatalog::builtin()),
            WebhookSignatureVerifier::new(None),
            quiet_notifier(),
        )
    }
}

#[cfg(test)]
mod webhook_idempotency_tests {
    use std::sync::Arc;

    use super::support::*;
    use crate::account::HistoryReason;
    use crate::catalog::PlanType;
    use crate::client::MockPaymentGateway;
    use crate::reference::{ExternalReference, Purchase};
    use crate::store::BillingStore;
    use crate::transactions::TransactionStatus;
    use crate::webhooks::WebhookOutcome;

    // =========================================================================
    // BILL-W01: 10 concurrent deliveries of one approval - exactly one grant
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_duplicate_approvals_grant_once() {
        use tokio::sync::Barrier;

        let (store, user_id) = store_with_free_user().await;
        let reference = ExternalReference::new(user_id, Purchase::Credits(50), NOW).encode();
        let payment = approved("9001", &reference);

        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_fetch_payment()
            .times(10)
            .returning(move |_| Ok(payment.clone()));
        let processor = processor(gateway, store.clone());

        let barrier = Arc::new(Barrier::new(10));
        let mut handles = vec![];
        for _ in 0..10 {
            let processor = processor.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                processor.handle_at(notification("9001"), NOW).await
            }));
        }

        let mut grants = 0;
        for handle in handles {
            if let WebhookOutcome::Processed {
                entitlement_granted: true,
                ..
            } = handle.await.unwrap().unwrap()
            {
                grants += 1;
            }
        }

        assert_eq!(grants, 1, "Exactly one delivery should grant");
        let account = store.get_account(user_id).await.unwrap().unwrap();
        assert_eq!(account.purchased_credits, 50);
        assert_eq!(account.credits, 50);
    }

    // =========================================================================
    // BILL-W02: Legacy and structured notifications for the same payment
    // =========================================================================
    #[tokio::test]
    async fn test_both_notification_shapes_grant_once() {
        let (store, user_id) = store_with_free_user().await;
        let reference =
            ExternalReference::new(user_id, Purchase::Plan(PlanType::Starter), NOW).encode();
        let payment = approved("9002", &reference);

        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_fetch_payment()
            .times(2)
            .returning(move |_| Ok(payment.clone()));
        let processor = processor(gateway, store.clone());

        processor
            .handle_at(notification("9002"), NOW)
            .await
            .unwrap();
        let legacy = crate::webhooks::InboundWebhook {
            body: serde_json::json!({
                "topic": "payment",
                "resource": "https://api.mercadolibre.com/collections/notifications/9002"
            }),
            ..Default::default()
        };
        processor.handle_at(legacy, NOW).await.unwrap();

        let history = store.subscription_history(user_id, 50).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, HistoryReason::Subscription);
    }

    // =========================================================================
    // BILL-W03: Approval arriving after a refund notice - no grant from replay
    // =========================================================================
    #[tokio::test]
    async fn test_replay_after_approval_mirrors_status_only() {
        let (store, user_id) = store_with_free_user().await;
        let reference = ExternalReference::new(user_id, Purchase::Credits(10), NOW).encode();
        let approved_payment = approved("9003", &reference);
        let reapproved = approved_payment.clone();
        let mut refunded = approved_payment.clone();
        refunded.status = "refunded".into();

        let mut gateway = MockPaymentGateway::new();
        let mut seq = mockall::Sequence::new();
        gateway
            .expect_fetch_payment()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(approved_payment.clone()));
        gateway
            .expect_fetch_payment()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(refunded.clone()));
        gateway
            .expect_fetch_payment()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |_| Ok(reapproved.clone()));
        let processor = processor(gateway, store.clone());

        processor
            .handle_at(notification("9003"), NOW)
            .await
            .unwrap();
        processor
            .handle_at(notification("9003"), NOW)
            .await
            .unwrap();

        let tx = store
            .find_transaction_by_reference(&reference)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Cancelled);
        // Entitlements are never clawed back by status mirroring
        let account = store.get_account(user_id).await.unwrap().unwrap();
        assert_eq!(account.purchased_credits, 10);

        // A stale approval delivered after the refund mirrors, never re-grants
        processor
            .handle_at(notification("9003"), NOW)
            .await
            .unwrap();
        let tx = store
            .find_transaction_by_reference(&reference)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Approved);
        let account = store.get_account(user_id).await.unwrap().unwrap();
        assert_eq!(account.purchased_credits, 10);
    }

    // =========================================================================
    // BILL-W03b: Dispute cycle (mediation, chargeback) grants exactly once
    // =========================================================================
    #[tokio::test]
    async fn test_dispute_cycle_grants_credits_once() {
        let (store, user_id) = store_with_free_user().await;
        let reference = ExternalReference::new(user_id, Purchase::Credits(30), NOW).encode();
        let base = approved("9013", &reference);

        let mut gateway = MockPaymentGateway::new();
        let mut seq = mockall::Sequence::new();
        for status in ["approved", "in_mediation", "approved", "charged_back", "approved"] {
            let mut payment = base.clone();
            payment.status = status.into();
            gateway
                .expect_fetch_payment()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(payment.clone()));
        }
        let processor = processor(gateway, store.clone());

        for _ in 0..5 {
            processor
                .handle_at(notification("9013"), NOW)
                .await
                .unwrap();
        }

        let account = store.get_account(user_id).await.unwrap().unwrap();
        assert_eq!(account.purchased_credits, 30);
        let tx = store
            .find_transaction_by_reference(&reference)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Approved);
        assert!(tx.entitlement_granted_at.is_some());
    }

    // =========================================================================
    // BILL-W04: Pending intent recorded at checkout is reused, not duplicated
    // =========================================================================
    #[tokio::test]
    async fn test_existing_pending_row_is_settled_in_place() {
        let (store, user_id) = store_with_free_user().await;
        let reference = ExternalReference::new(user_id, Purchase::Plan(PlanType::Pro), NOW);
        let pending = crate::transactions::Transaction::pending(
            &reference,
            5990,
            Some("pref-1".into()),
            NOW,
        );
        store.insert_transaction(&pending).await.unwrap();

        let payment = approved("9004", &pending.external_reference);
        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_fetch_payment()
            .returning(move |_| Ok(payment.clone()));
        let processor = processor(gateway, store.clone());

        processor
            .handle_at(notification("9004"), NOW)
            .await
            .unwrap();

        let rows = store.list_transactions(user_id, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, pending.id);
        assert_eq!(rows[0].status, TransactionStatus::Approved);
        assert_eq!(rows[0].provider_preference_id.as_deref(), Some("pref-1"));
        assert_eq!(rows[0].provider_payment_id.as_deref(), Some("9004"));
    }

    // =========================================================================
    // BILL-W05: Reference naming a user that does not exist - acknowledged
    // =========================================================================
    #[tokio::test]
    async fn test_reference_for_unknown_user_is_acknowledged() {
        let (store, _) = store_with_free_user().await;
        let ghost = uuid::Uuid::new_v4();
        let reference = ExternalReference::new(ghost, Purchase::Credits(10), NOW).encode();
        let payment = approved("9005", &reference);

        let mut gateway = MockPaymentGateway::new();
        gateway
            .expect_fetch_payment()
            .returning(move |_| Ok(payment.clone()));
        let processor = processor(gateway, store.clone());

        let outcome = processor
            .handle_at(notification("9005"), NOW)
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Acknowledged { .. }));
        assert!(store
            .find_transaction_by_reference(&reference)
            .await
            .unwrap()
            .is_none());
    }
}

#[cfg(test)]
mod subscription_period_tests {
    use std::sync::Arc;

    use time::macros::datetime;
    use time::Duration;

    use super::support::*;
    use crate::account::{AccountSubscription, SubscriptionStatus};
    use crate::catalog::{PlanCatalog, PlanType};
    use crate::expiry::ExpirySweep;
    use crate::ledger::{LedgerOp, SubscriptionLedger};
    use crate::store::{BillingStore, InMemoryBillingStore};

    fn pro_ending(end: time::OffsetDateTime) -> AccountSubscription {
        let mut account = AccountSubscription::new_free(uuid::Uuid::new_v4(), "p@example.com", NOW);
        account.plan_type = PlanType::Pro;
        account.subscription_status = SubscriptionStatus::Active;
        account.subscription_end_date = Some(end);
        account.subscription_credits = 20;
        account.credits = 20;
        account
    }

    // =========================================================================
    // BILL-S01: Renewals chained from Jan 31 clamp, then stay on the 28th
    // =========================================================================
    #[tokio::test]
    async fn test_chained_renewals_from_month_end() {
        let store = Arc::new(InMemoryBillingStore::new());
        let account = pro_ending(datetime!(2025-01-31 00:00 UTC));
        let user_id = account.user_id;
        store.put_account(account).await;
        let ledger = SubscriptionLedger::new(store.clone(), Arc::new(PlanCatalog::builtin()));

        let op = LedgerOp::ActivateOrRenew {
            plan: PlanType::Pro,
        };
        ledger
            .apply(user_id, op.clone(), datetime!(2025-01-20 00:00 UTC))
            .await
            .unwrap();
        let after_first = ledger
            .apply(user_id, op, datetime!(2025-02-20 00:00 UTC))
            .await
            .unwrap();

        assert_eq!(
            after_first.account.subscription_end_date,
            Some(datetime!(2025-03-28 00:00 UTC))
        );
    }

    // =========================================================================
    // BILL-S02: Account ending exactly at sweep time is not yet overdue
    // =========================================================================
    #[tokio::test]
    async fn test_end_date_equal_to_now_is_not_overdue() {
        let store = Arc::new(InMemoryBillingStore::new());
        store.put_account(pro_ending(NOW)).await;

        assert!(store.find_overdue_accounts(NOW).await.unwrap().is_empty());
        assert_eq!(
            store
                .find_overdue_accounts(NOW + Duration::seconds(1))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    // =========================================================================
    // BILL-S03: Sweep racing a renewal - renewal always survives
    // =========================================================================
    #[tokio::test]
    async fn test_sweep_racing_renewal_keeps_paid_plan() {
        for _ in 0..20 {
            let store = Arc::new(InMemoryBillingStore::new());
            let account = pro_ending(NOW - Duration::hours(1));
            let user_id = account.user_id;
            store.put_account(account).await;

            let catalog = Arc::new(PlanCatalog::builtin());
            let sweep = ExpirySweep::new(store.clone(), catalog.clone(), quiet_notifier());
            let ledger = SubscriptionLedger::new(store.clone(), catalog);

            let sweep_task = tokio::spawn(async move { sweep.run_at(NOW).await });
            let renew_task = tokio::spawn(async move {
                ledger
                    .apply(
                        user_id,
                        LedgerOp::ActivateOrRenew {
                            plan: PlanType::Pro,
                        },
                        NOW,
                    )
                    .await
            });
            sweep_task.await.unwrap().unwrap();
            renew_task.await.unwrap().unwrap();

            let account = store.get_account(user_id).await.unwrap().unwrap();
            assert_eq!(account.plan_type, PlanType::Pro);
            assert_eq!(account.subscription_status, SubscriptionStatus::Active);
            assert_eq!(
                account.subscription_end_date,
                Some(datetime!(2025-09-15 12:00 UTC))
            );
            assert_eq!(account.subscription_credits, 150);
        }
    }

    // =========================================================================
    // BILL-S04: Cancel then expire - history shows both steps in order
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_then_expire_history() {
        let store = Arc::new(InMemoryBillingStore::new());
        let account = pro_ending(NOW + Duration::days(1));
        let user_id = account.user_id;
        store.put_account(account).await;
        let catalog = Arc::new(PlanCatalog::builtin());
        let ledger = SubscriptionLedger::new(store.clone(), catalog.clone());

        ledger.apply(user_id, LedgerOp::Cancel, NOW).await.unwrap();
        let sweep = ExpirySweep::new(store.clone(), catalog, quiet_notifier());
        let report = sweep.run_at(NOW + Duration::days(2)).await.unwrap();
        assert_eq!(report.downgraded, 1);

        let history = store.subscription_history(user_id, 50).await.unwrap();
        let reasons: Vec<_> = history.iter().map(|h| h.reason.as_str()).collect();
        assert_eq!(reasons, vec!["EXPIRATION_AUTO_DOWNGRADE", "CANCELLATION"]);
    }
}

#[cfg(test)]
mod credit_consumption_tests {
    use std::sync::Arc;

    use super::support::*;
    use crate::catalog::PlanCatalog;
    use crate::credits::{ConsumeCreditsRequest, CreditService};
    use crate::error::BillingError;
    use crate::store::BillingStore;

    fn request(cost: i64) -> ConsumeCreditsRequest {
        ConsumeCreditsRequest {
            cost,
            reason: "generation".into(),
            source: "edge".into(),
        }
    }

    // =========================================================================
    // BILL-C01: 20 parallel spends against 10 credits - exactly 10 succeed
    // =========================================================================
    #[tokio::test]
    async fn test_concurrent_consumption_never_overdraws() {
        use tokio::sync::Barrier;

        let (store, user_id) = store_with_free_user().await;
        let mut account = store.get_account(user_id).await.unwrap().unwrap();
        account.generations_used_cycle = 3;
        account.purchased_credits = 10;
        account.credits = 10;
        store.put_account(account).await;

        let service = CreditService::new(store.clone(), Arc::new(PlanCatalog::builtin()));
        let barrier = Arc::new(Barrier::new(20));
        let mut handles = vec![];
        for _ in 0..20 {
            let service = service.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                service.consume_at(user_id, request(1), NOW).await
            }));
        }

        let mut ok = 0;
        let mut refused = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(BillingError::InsufficientCredits { .. }) => refused += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(ok, 10);
        assert_eq!(refused, 10);
        let account = store.get_account(user_id).await.unwrap().unwrap();
        assert_eq!(account.credits, 0);
        assert!(account.is_conserved());
    }

    // =========================================================================
    // BILL-C02: Last free generation then first paid one
    // =========================================================================
    #[tokio::test]
    async fn test_free_allowance_boundary() {
        let (store, user_id) = store_with_free_user().await;
        let mut account = store.get_account(user_id).await.unwrap().unwrap();
        account.generations_used_cycle = 2;
        account.purchased_credits = 5;
        account.credits = 5;
        store.put_account(account).await;

        let service = CreditService::new(store.clone(), Arc::new(PlanCatalog::builtin()));
        let last_free = service.consume_at(user_id, request(3), NOW).await.unwrap();
        let first_paid = service.consume_at(user_id, request(3), NOW).await.unwrap();

        assert!(last_free.was_free);
        assert_eq!(last_free.credits, 5);
        assert!(!first_paid.was_free);
        assert_eq!(first_paid.credits, 2);
    }

    // =========================================================================
    // BILL-C03: Negative cost rejected without touching the account
    // =========================================================================
    #[tokio::test]
    async fn test_negative_cost_rejected() {
        let (store, user_id) = store_with_free_user().await;
        let before = store.get_account(user_id).await.unwrap().unwrap();

        let service = CreditService::new(store.clone(), Arc::new(PlanCatalog::builtin()));
        assert!(matches!(
            service.consume_at(user_id, request(-5), NOW).await,
            Err(BillingError::InvalidInput(_))
        ));
        assert_eq!(store.get_account(user_id).await.unwrap().unwrap(), before);
    }
}
