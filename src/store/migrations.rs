//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS emails (
                external_id TEXT NOT NULL,
                subject TEXT NOT NULL DEFAULT '',
                sender TEXT,
                sender_name TEXT,
                reply_to TEXT,
                raw_body TEXT NOT NULL DEFAULT '',
                body TEXT NOT NULL DEFAULT '',
                category TEXT NOT NULL DEFAULT 'Pending',
                status TEXT NOT NULL DEFAULT 'Categorized',
                ai_response TEXT NOT NULL DEFAULT '"Pending"',
                folder TEXT,
                received_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                approved_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_emails_external_id ON emails(external_id ASC);
            CREATE INDEX IF NOT EXISTS idx_emails_category_status ON emails(category, status);

            CREATE TABLE IF NOT EXISTS failed_deliveries (
                id TEXT PRIMARY KEY,
                email_id TEXT NOT NULL,
                recipient TEXT NOT NULL,
                category TEXT NOT NULL,
                error_message TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_failed_deliveries_created ON failed_deliveries(created_at);
        "#,
    },
    Migration {
        version: 2,
        name: "scheduled_responses",
        sql: r#"
            CREATE TABLE IF NOT EXISTS scheduled_responses (
                id TEXT PRIMARY KEY,
                category TEXT NOT NULL,
                scheduled_hour INTEGER NOT NULL,
                scheduled_minute INTEGER NOT NULL,
                folder_name TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scheduled_responses_time
                ON scheduled_responses(scheduled_hour, scheduled_minute);
        "#,
    },
    Migration {
        version: 3,
        name: "client_records",
        sql: r#"
            CREATE TABLE IF NOT EXISTS client_records (
                id TEXT PRIMARY KEY,
                collection TEXT NOT NULL,
                document TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_client_records_collection ON client_records(collection);
        "#,
    },
];

/// Apply all pending migrations.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    if tracing::enabled!(tracing::Level::DEBUG) {
        let version = get_current_version(conn).await?;
        tracing::debug!(version = version, "Database migrations complete");
    }
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
