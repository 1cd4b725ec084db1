//! External reference codec
//!
//! The correlation token attached to every purchase intent and echoed back by
//! the gateway on payments:
//!
//! - `user_{userId}_plan_{planId}_{epochMillis}`
//! - `user_{userId}_credits_{amount}_{epochMillis}`
//!
//! The token travels through the gateway, so decoding treats it as untrusted
//! and yields `None` for anything malformed. The millisecond suffix only makes
//! tokens unique; it is never interpreted.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanType;

const DELIMITER: char = '_';

/// What a purchase intent is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purchase {
    Plan(PlanType),
    Credits(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalReference {
    pub user_id: Uuid,
    pub purchase: Purchase,
    suffix: String,
}

impl ExternalReference {
    pub fn new(user_id: Uuid, purchase: Purchase, issued_at: OffsetDateTime) -> Self {
        let millis = issued_at.unix_timestamp_nanos() / 1_000_000;
        Self {
            user_id,
            purchase,
            suffix: millis.to_string(),
        }
    }

    pub fn encode(&self) -> String {
        match self.purchase {
            Purchase::Plan(plan) => format!("user_{}_plan_{}_{}", self.user_id, plan, self.suffix),
            Purchase::Credits(amount) => {
                format!("user_{}_credits_{}_{}", self.user_id, amount, self.suffix)
            }
        }
    }

    /// Decode a gateway-relayed token. Never panics; malformed input gives `None`.
    pub fn decode(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.trim().split(DELIMITER).collect();
        let [prefix, user, kind, value, suffix] = parts.as_slice() else {
            return None;
        };

        if *prefix != "user" || suffix.is_empty() {
            return None;
        }

        let user_id = Uuid::parse_str(user).ok()?;
        let purchase = match *kind {
            "plan" => Purchase::Plan(value.parse().ok()?),
            "credits" => {
                let amount: i64 = value.parse().ok()?;
                if amount <= 0 {
                    return None;
                }
                Purchase::Credits(amount)
            }
            _ => return None,
        };

        Some(Self {
            user_id,
            purchase,
            suffix: (*suffix).to_string(),
        })
    }
}

impl std::fmt::Display for ExternalReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_encode_plan_reference() {
        let user_id = Uuid::parse_str("6f1c2a4e-1b2c-4d5e-8f90-123456789abc").unwrap();
        let at = datetime!(2025-03-01 12:00:00 UTC);
        let reference = ExternalReference::new(user_id, Purchase::Plan(PlanType::Pro), at);

        assert_eq!(
            reference.encode(),
            "user_6f1c2a4e-1b2c-4d5e-8f90-123456789abc_plan_PRO_1740830400000"
        );
    }

    #[test]
    fn test_decode_credit_reference() {
        let user_id = Uuid::new_v4();
        let raw = format!("user_{}_credits_30_1740830400000", user_id);

        let reference = ExternalReference::decode(&raw).unwrap();
        assert_eq!(reference.user_id, user_id);
        assert_eq!(reference.purchase, Purchase::Credits(30));
        assert_eq!(reference.encode(), raw);
    }

    #[test]
    fn test_decode_malformed_references() {
        let user_id = Uuid::new_v4();
        let cases = vec![
            String::new(),
            "garbage".to_string(),
            format!("user_{}_plan_PRO", user_id),
            format!("user_{}_plan_GOLD_1", user_id),
            "user_not-a-uuid_plan_PRO_1".to_string(),
            format!("customer_{}_plan_PRO_1", user_id),
            format!("user_{}_credits_abc_1", user_id),
            format!("user_{}_credits_-5_1", user_id),
            format!("user_{}_bundle_5_1", user_id),
            format!("user_{}_plan_PRO_1_extra", user_id),
            format!("user_{}_plan_PRO_", user_id),
        ];

        for raw in cases {
            assert!(
                ExternalReference::decode(&raw).is_none(),
                "expected {:?} to be rejected",
                raw
            );
        }
    }

    #[test]
    fn test_suffix_is_not_interpreted() {
        // Non-numeric suffixes are accepted: the suffix carries no meaning
        let user_id = Uuid::new_v4();
        let raw = format!("user_{}_plan_STARTER_debug", user_id);
        let reference = ExternalReference::decode(&raw).unwrap();
        assert_eq!(reference.purchase, Purchase::Plan(PlanType::Starter));
    }
}
