//! Billing Invariants Module
//!
//! Runnable consistency checks over the billing tables. Each check is a
//! read-only SQL query; violations carry enough context to debug. The worker
//! runs them nightly after the expiry sweep.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Balances are wrong; users may be over- or under-served
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, violations: Vec<InvariantViolation>) -> Self {
        let checks_run = InvariantChecker::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();

        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BalanceRow {
    id: Uuid,
    subscription_credits: i64,
    purchased_credits: i64,
    credits: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct PlanStateRow {
    id: Uuid,
    plan_type: String,
    subscription_status: String,
    subscription_end_date: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct ApprovedWithoutPaymentRow {
    id: Uuid,
    user_id: Uuid,
    external_reference: String,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_credits_conserved().await?);
        violations.extend(self.check_non_negative_balances().await?);
        violations.extend(self.check_paid_plan_has_end_date().await?);
        violations.extend(self.check_free_plan_inactive().await?);
        violations.extend(self.check_approved_has_payment_id().await?);
        violations.extend(self.check_no_stale_overdue().await?);

        Ok(InvariantCheckSummary::from_violations(now, violations))
    }

    /// credits = subscription_credits + purchased_credits
    async fn check_credits_conserved(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BalanceRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_credits, purchased_credits, credits
            FROM users
            WHERE credits <> subscription_credits + purchased_credits
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "credits_conserved".to_string(),
                user_ids: vec![row.id],
                description: format!(
                    "Cached credits {} differ from {} subscription + {} purchased",
                    row.credits, row.subscription_credits, row.purchased_credits
                ),
                context: serde_json::json!({
                    "credits": row.credits,
                    "subscription_credits": row.subscription_credits,
                    "purchased_credits": row.purchased_credits,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_non_negative_balances(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BalanceRow> = sqlx::query_as(
            r#"
            SELECT id, subscription_credits, purchased_credits, credits
            FROM users
            WHERE subscription_credits < 0 OR purchased_credits < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "non_negative_balances".to_string(),
                user_ids: vec![row.id],
                description: "Credit balance below zero".to_string(),
                context: serde_json::json!({
                    "subscription_credits": row.subscription_credits,
                    "purchased_credits": row.purchased_credits,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// A paid plan without an end date would never expire
    async fn check_paid_plan_has_end_date(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PlanStateRow> = sqlx::query_as(
            r#"
            SELECT id, plan_type, subscription_status, subscription_end_date
            FROM users
            WHERE plan_type <> 'FREE'
              AND subscription_status IN ('ACTIVE', 'CANCELED')
              AND subscription_end_date IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_plan_has_end_date".to_string(),
                user_ids: vec![row.id],
                description: format!(
                    "{} subscription in status {} has no end date",
                    row.plan_type, row.subscription_status
                ),
                context: serde_json::json!({
                    "plan_type": row.plan_type,
                    "subscription_status": row.subscription_status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_free_plan_inactive(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PlanStateRow> = sqlx::query_as(
            r#"
            SELECT id, plan_type, subscription_status, subscription_end_date
            FROM users
            WHERE plan_type = 'FREE' AND subscription_status <> 'INACTIVE'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "free_plan_inactive".to_string(),
                user_ids: vec![row.id],
                description: format!("FREE plan with status {}", row.subscription_status),
                context: serde_json::json!({
                    "subscription_status": row.subscription_status,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Approvals are only ever recorded from a fetched payment
    async fn check_approved_has_payment_id(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ApprovedWithoutPaymentRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, external_reference
            FROM transactions
            WHERE status = 'APPROVED' AND provider_payment_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "approved_has_payment_id".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Transaction {} is APPROVED without a gateway payment id",
                    row.external_reference
                ),
                context: serde_json::json!({
                    "transaction_id": row.id,
                    "external_reference": row.external_reference,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Overdue by more than two days means the sweep has been missing runs
    async fn check_no_stale_overdue(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PlanStateRow> = sqlx::query_as(
            r#"
            SELECT id, plan_type, subscription_status, subscription_end_date
            FROM users
            WHERE plan_type <> 'FREE'
              AND subscription_status IN ('ACTIVE', 'CANCELED')
              AND subscription_end_date < NOW() - INTERVAL '2 days'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_stale_overdue".to_string(),
                user_ids: vec![row.id],
                description: format!(
                    "{} subscription ended but was never downgraded",
                    row.plan_type
                ),
                context: serde_json::json!({
                    "plan_type": row.plan_type,
                    "subscription_end_date": row.subscription_end_date.map(|d| d.to_string()),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "credits_conserved" => self.check_credits_conserved().await,
            "non_negative_balances" => self.check_non_negative_balances().await,
            "paid_plan_has_end_date" => self.check_paid_plan_has_end_date().await,
            "free_plan_inactive" => self.check_free_plan_inactive().await,
            "approved_has_payment_id" => self.check_approved_has_payment_id().await,
            "no_stale_overdue" => self.check_no_stale_overdue().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "credits_conserved",
            "non_negative_balances",
            "paid_plan_has_end_date",
            "free_plan_inactive",
            "approved_has_payment_id",
            "no_stale_overdue",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn violation(invariant: &str) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            user_ids: vec![Uuid::new_v4()],
            description: String::new(),
            context: serde_json::Value::Null,
            severity: ViolationSeverity::High,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"credits_conserved"));
        assert!(checks.contains(&"approved_has_payment_id"));
    }

    #[test]
    fn test_summary_counts_failed_checks_once() {
        let at = datetime!(2025-01-01 00:00 UTC);
        let summary = InvariantCheckSummary::from_violations(
            at,
            vec![
                violation("credits_conserved"),
                violation("credits_conserved"),
                violation("free_plan_inactive"),
            ],
        );
        assert_eq!(summary.checks_run, 6);
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 4);
        assert!(!summary.healthy);

        let clean = InvariantCheckSummary::from_violations(at, vec![]);
        assert!(clean.healthy);
        assert_eq!(clean.checks_passed, 6);
    }
}
