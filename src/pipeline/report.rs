//! Daily summary of failed sends.

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::error::Result;
use crate::mail::{MailProvider, OutgoingMail};
use crate::pipeline::types::FailedDeliveryRecord;
use crate::store::Database;

pub const NO_FAILURES: &str = "No failures to report.";

const REPORT_WINDOW_HOURS: i64 = 24;

/// One `recipient - category - error` line per failure.
pub fn format_failure_report(failures: &[FailedDeliveryRecord]) -> String {
    failures
        .iter()
        .map(|f| format!("{} - {} - {}", f.recipient, f.category, f.error_message))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Mail the last day's failures to `report_address`.
/// Returns the report body, or [`NO_FAILURES`] when nothing was sent.
pub async fn send_failure_report(
    db: &dyn Database,
    mail: &dyn MailProvider,
    token: &str,
    report_address: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    let failures = db
        .failed_deliveries_since(now - Duration::hours(REPORT_WINDOW_HOURS))
        .await?;
    if failures.is_empty() {
        return Ok(NO_FAILURES.to_string());
    }

    let body = format_failure_report(&failures);
    let report = OutgoingMail {
        to: report_address.to_string(),
        subject: format!("Daily Failed Email Report - {}", now.format("%Y-%m-%d")),
        body: body.clone(),
    };
    mail.send_mail(token, &report).await?;

    info!(failures = failures.len(), to = %report_address, "Failure report sent");
    Ok(body)
}
