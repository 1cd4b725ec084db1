//! Billing notifications
//!
//! Email is best-effort: callers log failures and move on. The Resend-backed
//! service is disabled (every send is a no-op) when `RESEND_API_KEY` is unset.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use crate::catalog::PlanType;
use crate::error::{BillingError, BillingResult};
use crate::reference::Purchase;

const RESEND_API_URL: &str = "https://api.resend.com/emails";
const DEFAULT_FROM: &str = "Billing <billing@localhost>";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanExpiredNotice {
    pub user_id: Uuid,
    pub email: String,
    pub old_plan: PlanType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentApprovedNotice {
    pub user_id: Uuid,
    pub email: String,
    pub purchase: Purchase,
    pub amount_cents: i64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BillingNotifier: Send + Sync {
    async fn plan_expired(&self, notice: &PlanExpiredNotice) -> BillingResult<()>;

    async fn payment_approved(&self, notice: &PaymentApprovedNotice) -> BillingResult<()>;
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: Option<String>,
    pub from: String,
    pub api_url: String,
    /// Whole-request limit; a stalled send must not hold up the expiry sweep
    pub timeout: Duration,
}

impl EmailConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("RESEND_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            from: std::env::var("EMAIL_FROM").unwrap_or_else(|_| DEFAULT_FROM.to_string()),
            api_url: RESEND_API_URL.to_string(),
            timeout: std::env::var("EMAIL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
        }
    }

    pub fn disabled() -> Self {
        Self {
            api_key: None,
            from: DEFAULT_FROM.to_string(),
            api_url: RESEND_API_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

/// Transactional email through the Resend API
#[derive(Clone)]
pub struct BillingEmailService {
    http: reqwest::Client,
    config: EmailConfig,
}

fn format_amount(cents: i64) -> String {
    format!("{}.{:02}", cents / 100, (cents % 100).abs())
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> BillingResult<Self> {
        if config.api_key.is_none() {
            tracing::warn!("Billing email notifications not configured (missing RESEND_API_KEY)");
        }
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("Cannot build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(EmailConfig::from_env())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.api_key.is_some()
    }

    async fn send(&self, to: &str, subject: &str, html: String) -> BillingResult<()> {
        let Some(api_key) = &self.config.api_key else {
            tracing::debug!(subject, "Email disabled, skipping");
            return Ok(());
        };

        let resp = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(api_key)
            .json(&json!({
                "from": self.config.from,
                "to": [to],
                "subject": subject,
                "html": html,
            }))
            .send()
            .await
            .map_err(|e| BillingError::GatewayUnavailable(format!("Email send failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(BillingError::GatewayRejected { status, body });
        }

        tracing::info!(subject, "Billing email sent");
        Ok(())
    }
}

#[async_trait]
impl BillingNotifier for BillingEmailService {
    async fn plan_expired(&self, notice: &PlanExpiredNotice) -> BillingResult<()> {
        let html = format!(
            "<p>Your {} plan has ended and your account is now on the Free plan.</p>\
             <p>Credits you purchased separately are still available.</p>",
            notice.old_plan
        );
        self.send(&notice.email, "Your subscription has ended", html)
            .await
    }

    async fn payment_approved(&self, notice: &PaymentApprovedNotice) -> BillingResult<()> {
        let item = match notice.purchase {
            Purchase::Plan(plan) => format!("{} plan", plan),
            Purchase::Credits(amount) => format!("{} credits", amount),
        };
        let html = format!(
            "<p>Payment of {} confirmed for {}.</p>",
            format_amount(notice.amount_cents),
            item
        );
        self.send(&notice.email, "Payment confirmed", html).await
    }
}
