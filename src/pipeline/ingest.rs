//! Inbox ingestion: fetch, dedupe, categorize, persist.
//!
//! Each provider message is inserted at most once. Duplicates within a batch
//! are dropped in memory, duplicates across runs are caught by an existence
//! check before the categorizer runs and, for racing ingestions, by the
//! insert-if-absent write itself.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::IngestError;
use crate::mail::{BodyType, MailProvider, ProviderMessage};
use crate::pipeline::categorizer::Categorizer;
use crate::pipeline::types::{AiResponse, EmailRecord, EmailStatus, PENDING};
use crate::store::Database;

const HTML_WRAP_WIDTH: usize = 120;

/// Outcome of one ingestion run.
#[derive(Debug, Default, Serialize)]
pub struct IngestReport {
    pub fetched: usize,
    pub duplicates: usize,
    /// Only the records written by this run.
    pub inserted: Vec<EmailRecord>,
}

pub struct IngestPipeline {
    db: Arc<dyn Database>,
    mail: Arc<dyn MailProvider>,
    categorizer: Arc<Categorizer>,
}

impl IngestPipeline {
    pub fn new(
        db: Arc<dyn Database>,
        mail: Arc<dyn MailProvider>,
        categorizer: Arc<Categorizer>,
    ) -> Self {
        Self {
            db,
            mail,
            categorizer,
        }
    }

    /// Pull the inbox with the caller's token and ingest it. A failed fetch
    /// persists nothing.
    pub async fn fetch_and_ingest(&self, token: &str) -> Result<IngestReport, IngestError> {
        let messages = self.mail.fetch_inbox(token).await?;
        Ok(self.ingest(messages).await)
    }

    pub async fn ingest(&self, messages: Vec<ProviderMessage>) -> IngestReport {
        let mut report = IngestReport {
            fetched: messages.len(),
            ..IngestReport::default()
        };
        let mut seen = HashSet::new();

        for message in messages {
            if !seen.insert(message.id.clone()) {
                report.duplicates += 1;
                continue;
            }

            match self.db.email_exists(&message.id).await {
                Ok(true) => {
                    report.duplicates += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(id = %message.id, error = %e, "Existence check failed, skipping message");
                    continue;
                }
            }

            let category = self.categorizer.categorize(&message.subject).await;
            let record = new_record(message, category);

            match self.db.insert_email_if_absent(&record).await {
                Ok(true) => {
                    debug!(id = %record.id, category = %record.category, "Email ingested");
                    report.inserted.push(record);
                }
                Ok(false) => {
                    debug!(id = %record.id, "Email inserted concurrently, skipping");
                    report.duplicates += 1;
                }
                Err(e) => {
                    warn!(id = %record.id, error = %e, "Failed to store email, skipping");
                }
            }
        }

        info!(
            fetched = report.fetched,
            inserted = report.inserted.len(),
            duplicates = report.duplicates,
            "Ingestion complete"
        );
        report
    }
}

fn new_record(message: ProviderMessage, category: String) -> EmailRecord {
    let raw_body = extract_text(message.body_type, &message.body);
    let body = clean_text(&raw_body);
    let now = Utc::now();

    EmailRecord {
        id: message.id,
        subject: message.subject,
        sender: message.from_address,
        sender_name: message.from_name,
        reply_to: message.reply_to,
        raw_body,
        body,
        category,
        status: EmailStatus::Categorized,
        ai_response: AiResponse::Pending,
        folder: Some(PENDING.to_string()),
        received_at: message.received_at,
        created_at: now,
        updated_at: now,
        approved_at: None,
    }
}

/// Plain text for a provider body. HTML goes through html2text, with a
/// tag-stripping fallback if rendering fails.
pub fn extract_text(body_type: BodyType, content: &str) -> String {
    match body_type {
        BodyType::Text => content.to_string(),
        BodyType::Html => html2text::from_read(content.as_bytes(), HTML_WRAP_WIDTH)
            .unwrap_or_else(|e| {
                warn!(error = %e, "html2text failed, stripping tags");
                strip_html_tags(content)
            }),
    }
}

fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

/// Drop control characters and collapse whitespace runs to single spaces.
pub fn clean_text(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_whitespace() || !c.is_control())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
