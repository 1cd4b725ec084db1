//! Account subscription state and its audit records

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanType;
use crate::error::BillingError;
use crate::ledger::add_one_month;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionStatus {
    Inactive,
    Active,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Inactive => "INACTIVE",
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Canceled => "CANCELED",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INACTIVE" => Ok(SubscriptionStatus::Inactive),
            "ACTIVE" => Ok(SubscriptionStatus::Active),
            "CANCELED" => Ok(SubscriptionStatus::Canceled),
            other => Err(BillingError::Database(format!(
                "Unknown subscription status '{}'",
                other
            ))),
        }
    }
}

/// Subscription fields of a user account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSubscription {
    pub user_id: Uuid,
    pub email: String,
    pub plan_type: PlanType,
    pub subscription_status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub subscription_end_date: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub credits_reset_date: Option<OffsetDateTime>,
    pub subscription_credits: i64,
    pub purchased_credits: i64,
    /// Always `subscription_credits + purchased_credits`
    pub credits: i64,
    pub generations_used_cycle: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl AccountSubscription {
    /// A fresh account on the free tier; its first allowance cycle starts now
    pub fn new_free(user_id: Uuid, email: impl Into<String>, now: OffsetDateTime) -> Self {
        Self {
            user_id,
            email: email.into(),
            plan_type: PlanType::Free,
            subscription_status: SubscriptionStatus::Inactive,
            subscription_end_date: None,
            credits_reset_date: Some(add_one_month(now)),
            subscription_credits: 0,
            purchased_credits: 0,
            credits: 0,
            generations_used_cycle: 0,
            updated_at: now,
        }
    }

    pub(crate) fn recompute_credits(&mut self) {
        self.credits = self.subscription_credits + self.purchased_credits;
    }

    /// Ledger conservation: the cached total matches its two components
    pub fn is_conserved(&self) -> bool {
        self.credits == self.subscription_credits + self.purchased_credits
            && self.subscription_credits >= 0
            && self.purchased_credits >= 0
    }

    /// Paid access lasts until the end date, cancelled or not
    pub fn has_paid_access(&self, now: OffsetDateTime) -> bool {
        self.plan_type.is_paid()
            && matches!(
                self.subscription_status,
                SubscriptionStatus::Active | SubscriptionStatus::Canceled
            )
            && self.subscription_end_date.is_some_and(|end| end > now)
    }

    /// Still holding a paid status although the paid period is over
    pub fn is_overdue(&self, now: OffsetDateTime) -> bool {
        matches!(
            self.subscription_status,
            SubscriptionStatus::Active | SubscriptionStatus::Canceled
        ) && self.subscription_end_date.is_some_and(|end| end < now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryReason {
    Subscription,
    Upgrade,
    Downgrade,
    Renewal,
    Cancellation,
    ExpirationAutoDowngrade,
}

impl HistoryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryReason::Subscription => "SUBSCRIPTION",
            HistoryReason::Upgrade => "UPGRADE",
            HistoryReason::Downgrade => "DOWNGRADE",
            HistoryReason::Renewal => "RENEWAL",
            HistoryReason::Cancellation => "CANCELLATION",
            HistoryReason::ExpirationAutoDowngrade => "EXPIRATION_AUTO_DOWNGRADE",
        }
    }
}

impl std::fmt::Display for HistoryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HistoryReason {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUBSCRIPTION" => Ok(HistoryReason::Subscription),
            "UPGRADE" => Ok(HistoryReason::Upgrade),
            "DOWNGRADE" => Ok(HistoryReason::Downgrade),
            "RENEWAL" => Ok(HistoryReason::Renewal),
            "CANCELLATION" => Ok(HistoryReason::Cancellation),
            "EXPIRATION_AUTO_DOWNGRADE" => Ok(HistoryReason::ExpirationAutoDowngrade),
            other => Err(BillingError::Database(format!(
                "Unknown history reason '{}'",
                other
            ))),
        }
    }
}

/// Append-only plan change record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionHistoryEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub old_plan: PlanType,
    pub new_plan: PlanType,
    pub reason: HistoryReason,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl SubscriptionHistoryEntry {
    pub fn new(
        user_id: Uuid,
        old_plan: PlanType,
        new_plan: PlanType,
        reason: HistoryReason,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            old_plan,
            new_plan,
            reason,
            created_at: now,
        }
    }
}

/// Append-only record of one credit-spending action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditConsumption {
    pub id: Uuid,
    pub user_id: Uuid,
    pub reason: String,
    pub credits_consumed: i64,
    pub was_free: bool,
    pub source: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}
