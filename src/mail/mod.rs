//! Mail provider integration.
//!
//! The pipeline only talks to [`MailProvider`]; [`GraphMailClient`] is the
//! Microsoft Graph implementation used in production. Every call takes the
//! caller's bearer token, which is never stored.

pub mod graph;

pub use graph::GraphMailClient;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MailError;

/// Connection settings for the mail provider.
#[derive(Debug, Clone)]
pub struct MailConfig {
    /// Base URL of the Graph API, e.g. `https://graph.microsoft.com/v1.0`.
    pub api_url: String,
    pub timeout: Duration,
}

/// Body content type as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyType {
    Html,
    Text,
}

/// An inbox message as delivered by the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub id: String,
    pub subject: String,
    pub body_type: BodyType,
    pub body: String,
    pub from_address: Option<String>,
    pub from_name: Option<String>,
    /// First reply-to address, if the sender set one.
    pub reply_to: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
}

/// A plain-text message to send.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// A message from the sent-items folder.
#[derive(Debug, Clone)]
pub struct SentItem {
    pub id: String,
    pub subject: String,
    pub recipients: Vec<String>,
}

impl SentItem {
    pub fn matches(&self, subject: &str, recipient: &str) -> bool {
        self.subject == subject
            && self
                .recipients
                .iter()
                .any(|r| r.eq_ignore_ascii_case(recipient))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailFolder {
    pub id: String,
    pub display_name: String,
}

#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn fetch_inbox(&self, token: &str) -> Result<Vec<ProviderMessage>, MailError>;

    async fn send_mail(&self, token: &str, mail: &OutgoingMail) -> Result<(), MailError>;

    /// Most recent sent items, newest first.
    async fn recent_sent(&self, token: &str, limit: usize) -> Result<Vec<SentItem>, MailError>;

    async fn move_message(
        &self,
        token: &str,
        message_id: &str,
        folder_id: &str,
    ) -> Result<(), MailError>;

    async fn list_folders(&self, token: &str) -> Result<Vec<MailFolder>, MailError>;

    async fn create_folder(&self, token: &str, name: &str) -> Result<MailFolder, MailError>;
}

/// Find a folder by display name (case-insensitive), creating it when absent.
pub async fn resolve_folder(
    provider: &dyn MailProvider,
    token: &str,
    name: &str,
) -> Result<MailFolder, MailError> {
    let folders = provider.list_folders(token).await?;
    if let Some(folder) = folders
        .into_iter()
        .find(|f| f.display_name.eq_ignore_ascii_case(name))
    {
        return Ok(folder);
    }

    tracing::info!(folder = %name, "Creating mail folder");
    provider.create_folder(token, name).await
}
