//! Inbound payment notification shapes
//!
//! The gateway delivers two notification formats:
//!
//! - structured: `{"type": "payment", "data": {"id": "123"}}`
//! - legacy: `{"topic": "payment", "resource": "123"}` where `resource` may
//!   also be a URL ending in the id
//!
//! Legacy notifications sometimes arrive with an empty body and everything in
//! the query string (`?topic=payment&id=123`). Only the payment id is taken
//! from a notification; everything else is fetched from the gateway.

use serde::Deserialize;
use serde_json::Value;

const PAYMENT_TOPIC: &str = "payment";

/// A gateway payment id, restricted to characters that are safe in a URL path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PaymentId(String);

impl PaymentId {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty()
            || trimmed.len() > 64
            || !trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PaymentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Query parameters the gateway appends to the notification URL
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub topic: Option<String>,
    pub id: Option<String>,
    #[serde(rename = "data.id")]
    pub data_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookNotification {
    Structured { kind: String, data_id: Option<String> },
    Legacy { topic: String, resource: String },
    Unrecognized,
}

impl WebhookNotification {
    /// Classify a notification from its JSON body, falling back to the query
    /// string when the body carries neither shape.
    pub fn parse(body: &Value, query: &NotificationQuery) -> Self {
        if let Some(kind) = body.get("type").and_then(Value::as_str) {
            let data_id = body
                .get("data")
                .and_then(|data| data.get("id"))
                .and_then(id_as_string);
            return WebhookNotification::Structured {
                kind: kind.to_string(),
                data_id,
            };
        }

        if let (Some(topic), Some(resource)) = (
            body.get("topic").and_then(Value::as_str),
            body.get("resource").and_then(id_as_string),
        ) {
            return WebhookNotification::Legacy {
                topic: topic.to_string(),
                resource,
            };
        }

        match (&query.kind, &query.topic) {
            (Some(kind), _) => WebhookNotification::Structured {
                kind: kind.clone(),
                data_id: query.data_id.clone().or_else(|| query.id.clone()),
            },
            (None, Some(topic)) => match &query.id {
                Some(id) => WebhookNotification::Legacy {
                    topic: topic.clone(),
                    resource: id.clone(),
                },
                None => WebhookNotification::Unrecognized,
            },
            (None, None) => WebhookNotification::Unrecognized,
        }
    }

    /// The payment id this notification refers to, if it is about a payment
    pub fn payment_id(&self) -> Option<PaymentId> {
        match self {
            WebhookNotification::Structured { kind, data_id } if kind == PAYMENT_TOPIC => {
                data_id.as_deref().and_then(PaymentId::parse)
            }
            WebhookNotification::Legacy { topic, resource } if topic == PAYMENT_TOPIC => {
                let last_segment = resource.trim_end_matches('/').rsplit('/').next()?;
                PaymentId::parse(last_segment)
            }
            _ => None,
        }
    }

    pub fn topic(&self) -> Option<&str> {
        match self {
            WebhookNotification::Structured { kind, .. } => Some(kind),
            WebhookNotification::Legacy { topic, .. } => Some(topic),
            WebhookNotification::Unrecognized => None,
        }
    }
}

fn id_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
