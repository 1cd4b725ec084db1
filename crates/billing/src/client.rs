//! Payment gateway client
//!
//! Thin reqwest wrapper over the two gateway calls the subsystem needs:
//! creating a hosted-checkout preference and fetching a payment by id.
//! Transport errors and 5xx map to [`BillingError::GatewayUnavailable`],
//! 4xx to [`BillingError::GatewayRejected`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};
use crate::notification::PaymentId;

const DEFAULT_API_BASE: &str = "https://api.mercadopago.com";
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CURRENCY: &str = "BRL";

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub access_token: String,
    pub api_base: String,
    /// Shared secret for webhook signatures; verification is skipped when unset
    pub webhook_secret: Option<String>,
    pub currency: String,
    pub timeout: Duration,
    pub notification_url: Option<String>,
    pub success_url: Option<String>,
    pub failure_url: Option<String>,
    pub pending_url: Option<String>,
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let access_token = std::env::var("GATEWAY_ACCESS_TOKEN")
            .map_err(|_| BillingError::Config("GATEWAY_ACCESS_TOKEN not set".to_string()))?;

        let optional = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        let timeout = optional("GATEWAY_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS));

        Ok(Self {
            access_token,
            api_base: optional("GATEWAY_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            webhook_secret: optional("GATEWAY_WEBHOOK_SECRET"),
            currency: optional("GATEWAY_CURRENCY").unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            timeout,
            notification_url: optional("GATEWAY_NOTIFICATION_URL"),
            success_url: optional("CHECKOUT_SUCCESS_URL"),
            failure_url: optional("CHECKOUT_FAILURE_URL"),
            pending_url: optional("CHECKOUT_PENDING_URL"),
        })
    }

    /// Minimal configuration pointing at `api_base`
    pub fn for_base_url(access_token: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            api_base: api_base.into(),
            webhook_secret: None,
            currency: DEFAULT_CURRENCY.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            notification_url: None,
            success_url: None,
            failure_url: None,
            pending_url: None,
        }
    }
}

/// One-item hosted checkout request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseIntentRequest {
    pub external_reference: String,
    pub item_id: String,
    pub title: String,
    pub unit_price_cents: i64,
    pub payer_email: Option<String>,
}

/// Created checkout preference
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseIntent {
    pub preference_id: String,
    pub checkout_url: String,
    pub sandbox_checkout_url: Option<String>,
    pub external_reference: String,
}

/// Payment as reported by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayPayment {
    pub id: String,
    pub status: String,
    pub status_detail: Option<String>,
    pub external_reference: Option<String>,
    pub payment_method_id: Option<String>,
    pub amount_cents: i64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_purchase_intent(
        &self,
        request: PurchaseIntentRequest,
    ) -> BillingResult<PurchaseIntent>;

    /// Authoritative payment state; the only source trusted for entitlements
    async fn fetch_payment(&self, payment_id: &PaymentId) -> BillingResult<GatewayPayment>;
}

#[derive(Debug, Serialize)]
struct PreferenceBody<'a> {
    items: [PreferenceItem<'a>; 1],
    external_reference: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payer: Option<PreferencePayer<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notification_url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    back_urls: Option<BackUrls<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auto_return: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct PreferenceItem<'a> {
    id: &'a str,
    title: &'a str,
    quantity: u32,
    currency_id: &'a str,
    unit_price: f64,
}

#[derive(Debug, Serialize)]
struct PreferencePayer<'a> {
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct BackUrls<'a> {
    success: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct PreferenceResponse {
    id: String,
    init_point: String,
    sandbox_init_point: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentResponse {
    id: Value,
    status: String,
    status_detail: Option<String>,
    external_reference: Option<String>,
    payment_method_id: Option<String>,
    #[serde(default)]
    transaction_amount: f64,
}

/// Convert cents to the decimal amount the gateway expects
fn cents_to_decimal(cents: i64) -> f64 {
    cents as f64 / 100.0
}

fn decimal_to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

/// reqwest-backed gateway
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("Cannot build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(GatewayConfig::from_env()?)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    /// Turn a non-2xx response into the matching error
    async fn check_status(resp: reqwest::Response, context: &str) -> BillingResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), context, body = %body, "Gateway call failed");

        if status.is_client_error() {
            Err(BillingError::GatewayRejected {
                status: status.as_u16(),
                body,
            })
        } else {
            Err(BillingError::GatewayUnavailable(format!(
                "{} returned {}",
                context, status
            )))
        }
    }

    async fn post_preference(&self, request: &PurchaseIntentRequest) -> BillingResult<PurchaseIntent> {
        let back_urls = self.config.success_url.as_deref().map(|success| BackUrls {
            success,
            failure: self.config.failure_url.as_deref(),
            pending: self.config.pending_url.as_deref(),
        });
        let body = PreferenceBody {
            items: [PreferenceItem {
                id: &request.item_id,
                title: &request.title,
                quantity: 1,
                currency_id: &self.config.currency,
                unit_price: cents_to_decimal(request.unit_price_cents),
            }],
            external_reference: &request.external_reference,
            payer: request
                .payer_email
                .as_deref()
                .map(|email| PreferencePayer { email }),
            notification_url: self.config.notification_url.as_deref(),
            auto_return: back_urls.as_ref().map(|_| "approved"),
            back_urls,
        };

        let resp = self
            .http
            .post(self.url("/checkout/preferences"))
            .header(AUTHORIZATION, format!("Bearer {}", self.config.access_token))
            .json(&body)
            .send()
            .await?;
        let resp = Self::check_status(resp, "create preference").await?;

        let preference: PreferenceResponse = resp.json().await.map_err(|e| {
            BillingError::GatewayUnavailable(format!("Invalid preference response: {}", e))
        })?;

        Ok(PurchaseIntent {
            preference_id: preference.id,
            checkout_url: preference.init_point,
            sandbox_checkout_url: preference.sandbox_init_point,
            external_reference: request.external_reference.clone(),
        })
    }

    async fn get_payment(&self, payment_id: &PaymentId) -> BillingResult<GatewayPayment> {
        let resp = self
            .http
            .get(self.url(&format!("/v1/payments/{}", payment_id)))
            .header(AUTHORIZATION, format!("Bearer {}", self.config.access_token))
            .send()
            .await?;
        let resp = Self::check_status(resp, "fetch payment").await?;

        let payment: PaymentResponse = resp.json().await.map_err(|e| {
            BillingError::GatewayUnavailable(format!("Invalid payment response: {}", e))
        })?;

        let id = match payment.id {
            Value::String(s) => s,
            other => other.to_string(),
        };

        Ok(GatewayPayment {
            id,
            status: payment.status,
            status_detail: payment.status_detail,
            external_reference: payment.external_reference.filter(|r| !r.is_empty()),
            payment_method_id: payment.payment_method_id,
            amount_cents: decimal_to_cents(payment.transaction_amount),
        })
    }

    /// Short backoff for transient failures; rejections are returned at once
    fn retry_strategy() -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(10).map(jitter).take(2)
    }
}

fn is_transient(err: &BillingError) -> bool {
    matches!(err, BillingError::GatewayUnavailable(_))
}

#[async_trait]
impl PaymentGateway for GatewayClient {
    async fn create_purchase_intent(
        &self,
        request: PurchaseIntentRequest,
    ) -> BillingResult<PurchaseIntent> {
        // Not retried: a lost response would leave a second preference behind
        let intent = self.post_preference(&request).await?;
        tracing::info!(
            preference_id = %intent.preference_id,
            external_reference = %intent.external_reference,
            "Purchase intent created"
        );
        Ok(intent)
    }

    async fn fetch_payment(&self, payment_id: &PaymentId) -> BillingResult<GatewayPayment> {
        RetryIf::spawn(
            Self::retry_strategy(),
            || self.get_payment(payment_id),
            is_transient,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_for(server: &mockito::ServerGuard) -> GatewayClient {
        GatewayClient::new(GatewayConfig::for_base_url("test-token", server.url())).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_payment_parses_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/payments/123")
            .match_header("authorization", "Bearer test-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id": 123, "status": "approved", "status_detail": "accredited",
                    "external_reference": "user_x_plan_PRO_1", "payment_method_id": "pix",
                    "transaction_amount": 59.9}"#,
            )
            .create_async()
            .await;

        let payment = client_for(&server)
            .fetch_payment(&PaymentId::parse("123").unwrap())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(payment.id, "123");
        assert_eq!(payment.status, "approved");
        assert_eq!(payment.amount_cents, 5990);
        assert_eq!(payment.external_reference.as_deref(), Some("user_x_plan_PRO_1"));
    }

    #[tokio::test]
    async fn test_fetch_payment_client_error_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/payments/404")
            .with_status(404)
            .with_body(r#"{"message": "Payment not found"}"#)
            .expect(1)
            .create_async()
            .await;

        let err = client_for(&server)
            .fetch_payment(&PaymentId::parse("404").unwrap())
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, BillingError::GatewayRejected { status: 404, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_fetch_payment_server_error_is_retried_then_unavailable() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/payments/500")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let err = client_for(&server)
            .fetch_payment(&PaymentId::parse("500").unwrap())
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, BillingError::GatewayUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_create_purchase_intent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/checkout/preferences")
            .match_header("authorization", "Bearer test-token")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "external_reference": "user_abc_credits_30_1"
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id": "pref-1", "init_point": "https://pay.example/pref-1",
                    "sandbox_init_point": "https://sandbox.example/pref-1"}"#,
            )
            .create_async()
            .await;

        let intent = client_for(&server)
            .create_purchase_intent(PurchaseIntentRequest {
                external_reference: "user_abc_credits_30_1".into(),
                item_id: "credits_30".into(),
                title: "30 credits".into(),
                unit_price_cents: 2490,
                payer_email: None,
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(intent.preference_id, "pref-1");
        assert_eq!(intent.checkout_url, "https://pay.example/pref-1");
        assert_eq!(intent.external_reference, "user_abc_credits_30_1");
    }

    #[test]
    fn test_amount_conversion() {
        assert_eq!(decimal_to_cents(59.9), 5990);
        assert_eq!(decimal_to_cents(0.1 + 0.2), 30);
        assert!((cents_to_decimal(2490) - 24.9).abs() < f64::EPSILON);
    }
}
