//! Persistence traits.
//!
//! `Database` covers the triage workflow itself (emails, failed deliveries,
//! schedules). `RecordStore` is the read side over client records that
//! replies are composed from. `LibSqlBackend` implements both.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::compose::record::{ClientRecord, QuerySpec};
use crate::error::DatabaseError;
use crate::pipeline::types::{
    AiResponse, EmailRecord, EmailStatus, FailedDeliveryRecord, ScheduledResponseSpec,
};

/// Optional narrowing for email listings.
#[derive(Debug, Clone, Default)]
pub struct EmailFilter {
    pub category: Option<String>,
    pub status: Option<EmailStatus>,
}

impl EmailFilter {
    pub fn category(category: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
            status: None,
        }
    }

    pub fn with_status(mut self, status: EmailStatus) -> Self {
        self.status = Some(status);
        self
    }
}

#[async_trait]
pub trait Database: Send + Sync {
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Emails ──────────────────────────────────────────────────────

    /// Insert unless an email with the same id exists. Returns whether a row was written.
    async fn insert_email_if_absent(&self, email: &EmailRecord) -> Result<bool, DatabaseError>;

    async fn email_exists(&self, id: &str) -> Result<bool, DatabaseError>;

    async fn get_email(&self, id: &str) -> Result<Option<EmailRecord>, DatabaseError>;

    /// Oldest first.
    async fn list_emails(&self, filter: &EmailFilter) -> Result<Vec<EmailRecord>, DatabaseError>;

    /// Move `id` from `from` to `to`. Returns false when no row with that id
    /// is currently in `from`.
    async fn update_email_status(
        &self,
        id: &str,
        from: EmailStatus,
        to: EmailStatus,
    ) -> Result<bool, DatabaseError>;

    /// Store a reply and move the record from `from` to `to`, in one write.
    /// Returns false when the record is missing or no longer in `from`.
    async fn store_ai_response(
        &self,
        id: &str,
        response: &AiResponse,
        from: EmailStatus,
        to: EmailStatus,
        folder: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Moved → Approved, stamping the approval time.
    async fn mark_approved(&self, id: &str, approved_at: DateTime<Utc>)
    -> Result<bool, DatabaseError>;

    async fn delete_email(&self, id: &str) -> Result<bool, DatabaseError>;

    // ── Failed deliveries ───────────────────────────────────────────

    async fn insert_failed_delivery(
        &self,
        record: &FailedDeliveryRecord,
    ) -> Result<(), DatabaseError>;

    async fn failed_deliveries_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<FailedDeliveryRecord>, DatabaseError>;

    // ── Schedules ───────────────────────────────────────────────────

    async fn insert_schedule(&self, spec: &ScheduledResponseSpec) -> Result<(), DatabaseError>;

    async fn schedules_at(
        &self,
        hour: u32,
        minute: u32,
    ) -> Result<Vec<ScheduledResponseSpec>, DatabaseError>;
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Collections that hold at least one record, sorted by name.
    async fn collection_names(&self) -> Result<Vec<String>, DatabaseError>;

    /// Field names of one sample record, or `None` for an empty collection.
    async fn sample_fields(&self, collection: &str) -> Result<Option<Vec<String>>, DatabaseError>;

    /// First record, in insertion order, matching the query.
    async fn find_one(&self, query: &QuerySpec) -> Result<Option<ClientRecord>, DatabaseError>;

    /// Store a JSON object document. Returns the generated record id.
    async fn insert_record(
        &self,
        collection: &str,
        document: &serde_json::Value,
    ) -> Result<String, DatabaseError>;
}
