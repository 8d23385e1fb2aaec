//! Support mail workflow.
//!
//! Inbound mail moves through:
//! 1. `IngestPipeline`: fetch, extract text, deduplicate, categorize
//! 2. `BatchResponder`: compose replies per category (on demand or scheduled)
//! 3. `Lifecycle`: human review: reject, flag, edit, delete
//! 4. `DeliverySequencer`: send, verify, file and approve
//!
//! Nothing is sent without an explicit approval.

pub mod categorizer;
pub mod delivery;
pub mod ingest;
pub mod lifecycle;
pub mod report;
pub mod responder;
pub mod types;
