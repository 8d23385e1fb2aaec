//! Mail Triage: support inbox categorization, templated replies and
//! approval-gated delivery.

pub mod api;
pub mod compose;
pub mod config;
pub mod error;
pub mod llm;
pub mod mail;
pub mod pipeline;
pub mod store;

#[cfg(test)]
mod test_support;
