// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Fitledger Billing Module
//!
//! Subscription plans and a credit ledger paid through a hosted-checkout
//! payment gateway.
//!
//! ## Features
//!
//! - **Checkout**: Purchase intents for monthly plans and credit packs
//! - **Webhooks**: Idempotent payment settlement from gateway notifications
//! - **Subscription Ledger**: Renewals, plan switches, cancellation, downgrade
//! - **Credits**: Monthly grants plus purchased credits, with per-cycle free usage
//! - **Expiry Sweep**: Daily downgrade of lapsed subscriptions
//! - **Invariants**: Runnable consistency checks over the billing tables

pub mod account;
pub mod catalog;
pub mod checkout;
pub mod client;
pub mod credits;
pub mod email;
pub mod error;
pub mod expiry;
pub mod invariants;
pub mod ledger;
pub mod notification;
pub mod reference;
pub mod signature;
pub mod store;
pub mod transactions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Account
pub use account::{
    AccountSubscription, CreditConsumption, HistoryReason, SubscriptionHistoryEntry,
    SubscriptionStatus,
};

// Catalog
pub use catalog::{CreditPack, PlanCatalog, PlanInfo, PlanType};

// Checkout
pub use checkout::{CheckoutService, PaymentStatusView};

// Client
pub use client::{
    GatewayClient, GatewayConfig, GatewayPayment, PaymentGateway, PurchaseIntent,
    PurchaseIntentRequest,
};

// Credits
pub use credits::{ConsumeCreditsRequest, ConsumptionReceipt, CreditService};

// Email
pub use email::{
    BillingEmailService, BillingNotifier, EmailConfig, PaymentApprovedNotice, PlanExpiredNotice,
};

// Error
pub use error::{BillingError, BillingResult};

// Expiry
pub use expiry::{ExpirySweep, SweepReport};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{add_one_month, LedgerEffect, LedgerOp, LedgerOutcome, SubscriptionLedger};

// Notifications and signatures
pub use notification::{NotificationQuery, PaymentId, WebhookNotification};
pub use signature::{SignatureCheck, WebhookSignatureVerifier};

// Reference
pub use reference::{ExternalReference, Purchase};

// Store
pub use store::{BillingStore, InMemoryBillingStore, PgBillingStore, SettlementOutcome};

// Transactions
pub use transactions::{
    StatusTransition, Transaction, TransactionKind, TransactionService, TransactionStatus,
};

// Webhooks
pub use webhooks::{InboundWebhook, WebhookOutcome, WebhookProcessor};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub catalog: Arc<PlanCatalog>,
    pub checkout: CheckoutService,
    pub credits: CreditService,
    pub ledger: SubscriptionLedger,
    pub transactions: TransactionService,
    pub webhooks: WebhookProcessor,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let gateway = GatewayClient::from_env()?;
        let verifier = WebhookSignatureVerifier::new(gateway.config().webhook_secret.clone());

        Ok(Self::new(
            Arc::new(PgBillingStore::new(pool)),
            Arc::new(gateway),
            Arc::new(BillingEmailService::from_env()?),
            Arc::new(PlanCatalog::load_from_env()?),
            verifier,
        ))
    }

    /// Wire the services over explicit components
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn BillingNotifier>,
        catalog: Arc<PlanCatalog>,
        verifier: WebhookSignatureVerifier,
    ) -> Self {
        Self {
            checkout: CheckoutService::new(gateway.clone(), store.clone(), catalog.clone()),
            credits: CreditService::new(store.clone(), catalog.clone()),
            ledger: SubscriptionLedger::new(store.clone(), catalog.clone()),
            transactions: TransactionService::new(store.clone()),
            webhooks: WebhookProcessor::new(gateway, store, catalog.clone(), verifier, notifier),
            catalog,
        }
    }
}
