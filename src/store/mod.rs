//! Persistence layer: libSQL-backed storage for emails, delivery failures,
//! schedules and client records.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, EmailFilter, RecordStore};
