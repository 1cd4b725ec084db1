//! Application state

use fitledger_billing::{BillingResult, BillingService};
use sqlx::PgPool;
use std::sync::Arc;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Used by the health check; absent when the billing store is not Postgres
    pub pool: Option<PgPool>,
    pub config: Config,
    pub jwt_manager: JwtManager,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> BillingResult<Self> {
        let billing = BillingService::from_env(pool.clone())?;
        tracing::info!(
            plans = billing.catalog.plans().len(),
            credit_packs = billing.catalog.credit_packs().len(),
            "Billing service initialized"
        );

        Ok(Self::with_billing(Some(pool), config, billing))
    }

    pub fn with_billing(pool: Option<PgPool>, config: Config, billing: BillingService) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);

        Self {
            pool,
            config,
            jwt_manager,
            billing: Arc::new(billing),
        }
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }
}
