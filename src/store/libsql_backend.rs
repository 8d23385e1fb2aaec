//! libSQL backend implementing both `Database` and `RecordStore`.
//!
//! Supports local file and in-memory databases. Client records are kept as
//! JSON documents per collection and filtered in process, since the filter
//! language (anchored case-insensitive patterns) has no SQL equivalent.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::compose::record::{ClientRecord, QuerySpec};
use crate::error::DatabaseError;
use crate::pipeline::types::{
    AiResponse, EmailRecord, EmailStatus, FailedDeliveryRecord, ScheduledResponseSpec,
};
use crate::store::migrations;
use crate::store::traits::{Database, EmailFilter, RecordStore};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

fn response_to_column(response: &AiResponse) -> Result<String, DatabaseError> {
    serde_json::to_string(&response.to_json())
        .map_err(|e| DatabaseError::Serialization(format!("ai_response: {e}")))
}

fn response_from_column(raw: &str) -> AiResponse {
    // Columns written by hand or by older tools may hold bare text.
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => AiResponse::from_json(value),
        Err(_) => AiResponse::from_json(serde_json::Value::String(raw.to_string())),
    }
}

const EMAIL_COLUMNS: &str = "external_id, subject, sender, sender_name, reply_to, raw_body, body, \
     category, status, ai_response, folder, received_at, created_at, updated_at, approved_at";

fn row_to_email(row: &libsql::Row) -> Result<EmailRecord, DatabaseError> {
    let parse = |e: libsql::Error| DatabaseError::Query(format!("email row parse: {e}"));

    let status_str: String = row.get(8).map_err(parse)?;
    let status = status_str
        .parse::<EmailStatus>()
        .map_err(DatabaseError::Serialization)?;
    let response_str: String = row.get(9).map_err(parse)?;
    let created_str: String = row.get(12).map_err(parse)?;
    let updated_str: String = row.get(13).map_err(parse)?;

    Ok(EmailRecord {
        id: row.get(0).map_err(parse)?,
        subject: row.get(1).map_err(parse)?,
        sender: row.get(2).ok(),
        sender_name: row.get(3).ok(),
        reply_to: row.get(4).ok(),
        raw_body: row.get(5).map_err(parse)?,
        body: row.get(6).map_err(parse)?,
        category: row.get(7).map_err(parse)?,
        status,
        ai_response: response_from_column(&response_str),
        folder: row.get(10).ok(),
        received_at: parse_optional_datetime(row.get(11).ok()),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        approved_at: parse_optional_datetime(row.get(14).ok()),
    })
}

fn row_to_failed_delivery(row: &libsql::Row) -> Result<FailedDeliveryRecord, libsql::Error> {
    let created_str: String = row.get(5)?;
    Ok(FailedDeliveryRecord {
        id: row.get(0)?,
        email_id: row.get(1)?,
        recipient: row.get(2)?,
        category: row.get(3)?,
        error_message: row.get(4)?,
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_schedule(row: &libsql::Row) -> Result<ScheduledResponseSpec, libsql::Error> {
    let hour: i64 = row.get(2)?;
    let minute: i64 = row.get(3)?;
    let created_str: String = row.get(5)?;
    Ok(ScheduledResponseSpec {
        id: row.get(0)?,
        category: row.get(1)?,
        hour: hour as u32,
        minute: minute as u32,
        folder: row.get(4)?,
        created_at: parse_datetime(&created_str),
    })
}

fn document_to_record(raw: &str) -> Option<ClientRecord> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Some(ClientRecord::from_json_object(&map)),
        _ => None,
    }
}

// ── Database ────────────────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn insert_email_if_absent(&self, email: &EmailRecord) -> Result<bool, DatabaseError> {
        let response = response_to_column(&email.ai_response)?;
        let changed = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO emails ({EMAIL_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                     ON CONFLICT(external_id) DO NOTHING"
                ),
                params![
                    email.id.as_str(),
                    email.subject.as_str(),
                    opt_text(email.sender.as_deref()),
                    opt_text(email.sender_name.as_deref()),
                    opt_text(email.reply_to.as_deref()),
                    email.raw_body.as_str(),
                    email.body.as_str(),
                    email.category.as_str(),
                    email.status.as_str(),
                    response,
                    opt_text(email.folder.as_deref()),
                    opt_datetime(email.received_at),
                    email.created_at.to_rfc3339(),
                    email.updated_at.to_rfc3339(),
                    opt_datetime(email.approved_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_email_if_absent: {e}")))?;

        debug!(id = %email.id, inserted = changed > 0, "Email upsert");
        Ok(changed > 0)
    }

    async fn email_exists(&self, id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT 1 FROM emails WHERE external_id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("email_exists: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("email_exists: {e}"))),
        }
    }

    async fn get_email(&self, id: &str) -> Result<Option<EmailRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE external_id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_email: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_email(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_email: {e}"))),
        }
    }

    async fn list_emails(&self, filter: &EmailFilter) -> Result<Vec<EmailRecord>, DatabaseError> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(category) = &filter.category {
            values.push(libsql::Value::Text(category.clone()));
            clauses.push(format!("category = ?{}", values.len()));
        }
        if let Some(status) = filter.status {
            values.push(libsql::Value::Text(status.as_str().to_string()));
            clauses.push(format!("status = ?{}", values.len()));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };

        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {EMAIL_COLUMNS} FROM emails{where_clause} ORDER BY rowid ASC"),
                libsql::params::Params::Positional(values),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_emails: {e}")))?;

        let mut emails = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_email(&row) {
                Ok(email) => emails.push(email),
                Err(e) => tracing::warn!("Skipping email row: {e}"),
            }
        }
        Ok(emails)
    }

    async fn update_email_status(
        &self,
        id: &str,
        from: EmailStatus,
        to: EmailStatus,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE emails SET status = ?1, updated_at = ?2
                 WHERE external_id = ?3 AND status = ?4",
                params![to.as_str(), Utc::now().to_rfc3339(), id, from.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_email_status: {e}")))?;

        debug!(id = %id, from = %from, to = %to, changed, "Email status update");
        Ok(changed > 0)
    }

    async fn store_ai_response(
        &self,
        id: &str,
        response: &AiResponse,
        from: EmailStatus,
        to: EmailStatus,
        folder: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE emails
                 SET ai_response = ?1, status = ?2, folder = COALESCE(?3, folder), updated_at = ?4
                 WHERE external_id = ?5 AND status = ?6",
                params![
                    response_to_column(response)?,
                    to.as_str(),
                    opt_text(folder),
                    Utc::now().to_rfc3339(),
                    id,
                    from.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("store_ai_response: {e}")))?;
        Ok(changed > 0)
    }

    async fn mark_approved(
        &self,
        id: &str,
        approved_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE emails SET status = ?1, approved_at = ?2, updated_at = ?2
                 WHERE external_id = ?3 AND status = ?4",
                params![
                    EmailStatus::Approved.as_str(),
                    approved_at.to_rfc3339(),
                    id,
                    EmailStatus::Moved.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_approved: {e}")))?;
        Ok(changed > 0)
    }

    async fn delete_email(&self, id: &str) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute("DELETE FROM emails WHERE external_id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_email: {e}")))?;
        Ok(changed > 0)
    }

    async fn insert_failed_delivery(
        &self,
        record: &FailedDeliveryRecord,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO failed_deliveries (id, email_id, recipient, category, error_message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id.as_str(),
                    record.email_id.as_str(),
                    record.recipient.as_str(),
                    record.category.as_str(),
                    record.error_message.as_str(),
                    record.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_failed_delivery: {e}")))?;
        Ok(())
    }

    async fn failed_deliveries_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<FailedDeliveryRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, email_id, recipient, category, error_message, created_at
                 FROM failed_deliveries ORDER BY created_at ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("failed_deliveries_since: {e}")))?;

        // Compared as timestamps: rows written by other tools may not be RFC 3339.
        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_failed_delivery(&row) {
                Ok(record) if record.created_at >= since => records.push(record),
                Ok(_) => {}
                Err(e) => tracing::warn!("Skipping failed delivery row: {e}"),
            }
        }
        Ok(records)
    }

    async fn insert_schedule(&self, spec: &ScheduledResponseSpec) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO scheduled_responses (id, category, scheduled_hour, scheduled_minute, folder_name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    spec.id.as_str(),
                    spec.category.as_str(),
                    spec.hour as i64,
                    spec.minute as i64,
                    spec.folder.as_str(),
                    spec.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_schedule: {e}")))?;
        Ok(())
    }

    async fn schedules_at(
        &self,
        hour: u32,
        minute: u32,
    ) -> Result<Vec<ScheduledResponseSpec>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, category, scheduled_hour, scheduled_minute, folder_name, created_at
                 FROM scheduled_responses
                 WHERE scheduled_hour = ?1 AND scheduled_minute = ?2
                 ORDER BY created_at ASC",
                params![hour as i64, minute as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("schedules_at: {e}")))?;

        let mut specs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_schedule(&row) {
                Ok(spec) => specs.push(spec),
                Err(e) => tracing::warn!("Skipping schedule row: {e}"),
            }
        }
        Ok(specs)
    }
}

// ── RecordStore ─────────────────────────────────────────────────────

#[async_trait]
impl RecordStore for LibSqlBackend {
    async fn collection_names(&self) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT DISTINCT collection FROM client_records ORDER BY collection",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("collection_names: {e}")))?;

        let mut names = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(name) = row.get::<String>(0) {
                names.push(name);
            }
        }
        Ok(names)
    }

    async fn sample_fields(&self, collection: &str) -> Result<Option<Vec<String>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT document FROM client_records WHERE collection = ?1 ORDER BY rowid ASC LIMIT 1",
                params![collection],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("sample_fields: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let raw: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("sample_fields row parse: {e}")))?;
                Ok(document_to_record(&raw)
                    .map(|record| record.iter().map(|(k, _)| k.to_string()).collect()))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("sample_fields: {e}"))),
        }
    }

    async fn find_one(&self, query: &QuerySpec) -> Result<Option<ClientRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT document FROM client_records WHERE collection = ?1 ORDER BY rowid ASC",
                params![query.collection.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_one: {e}")))?;

        while let Ok(Some(row)) = rows.next().await {
            let Ok(raw) = row.get::<String>(0) else {
                continue;
            };
            if let Some(record) = document_to_record(&raw)
                && query.matches(&record)
            {
                return Ok(Some(record));
            }
        }

        debug!(collection = %query.collection, "No client record matched");
        Ok(None)
    }

    async fn insert_record(
        &self,
        collection: &str,
        document: &serde_json::Value,
    ) -> Result<String, DatabaseError> {
        if !document.is_object() {
            return Err(DatabaseError::Serialization(
                "client record must be a JSON object".to_string(),
            ));
        }
        let id = Uuid::new_v4().to_string();
        let raw = serde_json::to_string(document)
            .map_err(|e| DatabaseError::Serialization(format!("client record: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO client_records (id, collection, document, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id.as_str(), collection, raw, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_record: {e}")))?;
        Ok(id)
    }
}
