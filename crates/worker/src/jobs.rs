//! Scheduled job bodies and their logging

use fitledger_billing::{ExpirySweep, InvariantCheckSummary, InvariantChecker, SweepReport};
use tracing::{error, info, warn};

/// 03:00 UTC daily
pub const DEFAULT_EXPIRY_SWEEP_CRON: &str = "0 0 3 * * *";
/// Half an hour after the sweep, so a healthy run leaves nothing stale
pub const DEFAULT_INVARIANT_CHECK_CRON: &str = "0 30 3 * * *";

pub fn cron_or_default(value: Option<String>, default: &str) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub fn cron_from_env(name: &str, default: &str) -> String {
    cron_or_default(std::env::var(name).ok(), default)
}

pub async fn run_expiry_sweep(sweep: &ExpirySweep) {
    info!("Running subscription expiry sweep");
    match sweep.run().await {
        Ok(report) => log_sweep_report(&report),
        Err(e) => error!(error = %e, "Expiry sweep could not list overdue subscriptions"),
    }
}

fn log_sweep_report(report: &SweepReport) {
    if report.failed > 0 {
        // Left for tomorrow's run; the accounts are still overdue
        warn!(
            failed = report.failed,
            downgraded = report.downgraded,
            "Expiry sweep finished with failures"
        );
    }
    if report.notification_failures > 0 {
        warn!(
            notification_failures = report.notification_failures,
            "Some expiry emails were not sent"
        );
    }
}

pub async fn run_invariant_checks(checker: &InvariantChecker) {
    info!("Running billing invariant checks");
    match checker.run_all_checks().await {
        Ok(summary) => log_invariant_summary(&summary),
        Err(e) => error!(error = %e, "Invariant checks failed to run"),
    }
}

fn log_invariant_summary(summary: &InvariantCheckSummary) {
    info!(
        checks_run = summary.checks_run,
        checks_passed = summary.checks_passed,
        checks_failed = summary.checks_failed,
        healthy = summary.healthy,
        "Invariant check cycle complete"
    );

    for violation in &summary.violations {
        error!(
            invariant = %violation.invariant,
            severity = %violation.severity,
            user_ids = ?violation.user_ids,
            context = %violation.context,
            "{}",
            violation.description
        );
    }
}
