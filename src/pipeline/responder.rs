//! Batch reply generation for a category, on demand or on a schedule.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Timelike};
use tracing::{error, info, warn};

use crate::compose::ResponseComposer;
use crate::error::DatabaseError;
use crate::pipeline::types::{AiResponse, EmailStatus, ScheduledResponseSpec};
use crate::store::{Database, EmailFilter};

pub struct BatchResponder {
    db: Arc<dyn Database>,
    composer: Arc<ResponseComposer>,
}

impl BatchResponder {
    pub fn new(db: Arc<dyn Database>, composer: Arc<ResponseComposer>) -> Self {
        Self { db, composer }
    }

    /// Compose replies for every categorized record of `category` and tag
    /// them with `folder`. Returns how many records were processed.
    pub async fn respond_category(
        &self,
        category: &str,
        folder: &str,
    ) -> Result<usize, DatabaseError> {
        let filter = EmailFilter::category(category).with_status(EmailStatus::Categorized);
        let emails = self.db.list_emails(&filter).await?;

        let mut processed = 0;
        for email in emails.iter().filter(|e| e.is_composable()) {
            if email.body.trim().is_empty() {
                continue;
            }

            let reply = self.composer.compose(&email.body).await;
            let status = if reply.error.is_some() {
                EmailStatus::Failed
            } else {
                EmailStatus::Responded
            };

            match self
                .db
                .store_ai_response(
                    &email.id,
                    &AiResponse::Structured(reply),
                    EmailStatus::Categorized,
                    status,
                    Some(folder),
                )
                .await
            {
                Ok(true) => processed += 1,
                Ok(false) => {
                    info!(id = %email.id, "Email changed while its reply was composed, reply dropped")
                }
                Err(e) => warn!(id = %email.id, error = %e, "Failed to store reply"),
            }
        }

        info!(category, folder, processed, "Batch response run complete");
        Ok(processed)
    }

    /// Persist a schedule and run it once right away.
    pub async fn schedule(&self, spec: &ScheduledResponseSpec) -> crate::error::Result<usize> {
        self.db.insert_schedule(spec).await?;
        info!(
            category = %spec.category,
            hour = spec.hour,
            minute = spec.minute,
            "Scheduled batch response"
        );
        Ok(self.respond_category(&spec.category, &spec.folder).await?)
    }

    /// Run every schedule registered for this time of day. A failing
    /// schedule is logged and does not hold back the others.
    pub async fn run_due(&self, hour: u32, minute: u32) -> Result<usize, DatabaseError> {
        let mut total = 0;
        for spec in self.db.schedules_at(hour, minute).await? {
            match self.respond_category(&spec.category, &spec.folder).await {
                Ok(processed) => total += processed,
                Err(e) => error!(
                    category = %spec.category,
                    folder = %spec.folder,
                    error = %e,
                    "Scheduled response run failed"
                ),
            }
        }
        Ok(total)
    }
}

/// Check the schedule table once a minute, in local time, and run what is due.
pub fn spawn_schedule_ticker(responder: Arc<BatchResponder>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        let mut last_run: Option<(u32, u32)> = None;

        loop {
            ticker.tick().await;
            let now = Local::now();
            let slot = (now.hour(), now.minute());
            // Interval drift can land two ticks in one minute.
            if last_run == Some(slot) {
                continue;
            }
            last_run = Some(slot);

            match responder.run_due(slot.0, slot.1).await {
                Ok(0) => {}
                Ok(processed) => info!(processed, "Scheduled responses generated"),
                Err(e) => error!(error = %e, "Could not load due schedules"),
            }
        }
    })
}
