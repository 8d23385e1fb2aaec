//! Microsoft Graph mail client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::error::MailError;
use crate::mail::{
    BodyType, MailConfig, MailFolder, MailProvider, OutgoingMail, ProviderMessage, SentItem,
};

const INBOX_PAGE_SIZE: usize = 50;
const FOLDER_PAGE_SIZE: usize = 100;
/// Stop following `@odata.nextLink` after this many pages.
const MAX_FOLDER_PAGES: usize = 50;

#[derive(Debug, Clone)]
pub struct GraphMailClient {
    client: Client,
    api_url: String,
}

#[derive(Deserialize)]
struct GraphList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    /// Absolute URL of the next page, query included.
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    body: Option<GraphBody>,
    #[serde(default)]
    from: Option<GraphRecipient>,
    #[serde(default)]
    reply_to: Vec<GraphRecipient>,
    #[serde(default)]
    to_recipients: Vec<GraphRecipient>,
    #[serde(default)]
    received_date_time: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphBody {
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: GraphAddress,
}

#[derive(Deserialize)]
struct GraphAddress {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphFolder {
    id: String,
    display_name: String,
}

impl From<GraphFolder> for MailFolder {
    fn from(f: GraphFolder) -> Self {
        Self {
            id: f.id,
            display_name: f.display_name,
        }
    }
}

impl From<GraphMessage> for ProviderMessage {
    fn from(m: GraphMessage) -> Self {
        let (body_type, body) = match m.body {
            Some(b) => {
                let kind = match b.content_type.as_deref() {
                    Some(t) if t.eq_ignore_ascii_case("text") => BodyType::Text,
                    _ => BodyType::Html,
                };
                (kind, b.content.unwrap_or_default())
            }
            None => (BodyType::Text, String::new()),
        };
        let (from_address, from_name) = match m.from {
            Some(r) => (r.email_address.address, r.email_address.name),
            None => (None, None),
        };

        Self {
            id: m.id,
            subject: m.subject.unwrap_or_default(),
            body_type,
            body,
            from_address,
            from_name,
            reply_to: m
                .reply_to
                .into_iter()
                .find_map(|r| r.email_address.address),
            received_at: m
                .received_date_time
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

impl From<GraphMessage> for SentItem {
    fn from(m: GraphMessage) -> Self {
        Self {
            id: m.id,
            subject: m.subject.unwrap_or_default(),
            recipients: m
                .to_recipients
                .into_iter()
                .filter_map(|r| r.email_address.address)
                .collect(),
        }
    }
}

impl GraphMailClient {
    pub fn new(config: &MailConfig) -> Result<Self, MailError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| MailError::Network(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    fn require_token(token: &str) -> Result<(), MailError> {
        if token.trim().is_empty() {
            Err(MailError::MissingToken)
        } else {
            Ok(())
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    /// Turn a non-success response into `MailError::Api`, keeping the body text.
    async fn check(
        response: reqwest::Response,
        expected: &[StatusCode],
    ) -> Result<reqwest::Response, MailError> {
        let status = response.status();
        let ok = if expected.is_empty() {
            status.is_success()
        } else {
            expected.contains(&status)
        };
        if ok {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(MailError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_page<T: for<'de> Deserialize<'de>>(
        &self,
        token: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<GraphList<T>, MailError> {
        Self::require_token(token)?;
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(|e| MailError::Network(e.to_string()))?;
        let response = Self::check(response, &[]).await?;

        response
            .json()
            .await
            .map_err(|e| MailError::Parse(e.to_string()))
    }

    /// First page only.
    async fn get_list<T: for<'de> Deserialize<'de>>(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, MailError> {
        let list: GraphList<T> = self.get_page(token, &self.url(path), query).await?;
        Ok(list.value)
    }

    /// Every page, following `@odata.nextLink` up to [`MAX_FOLDER_PAGES`].
    async fn get_all<T: for<'de> Deserialize<'de>>(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, MailError> {
        let mut page: GraphList<T> = self.get_page(token, &self.url(path), query).await?;
        let mut items = std::mem::take(&mut page.value);
        let mut pages = 1;

        while let Some(next) = page.next_link.take() {
            if pages >= MAX_FOLDER_PAGES {
                tracing::warn!(path, pages, "Page limit reached, listing truncated");
                break;
            }
            page = self.get_page(token, &next, &[]).await?;
            items.append(&mut page.value);
            pages += 1;
        }
        Ok(items)
    }
}

#[async_trait]
impl MailProvider for GraphMailClient {
    async fn fetch_inbox(&self, token: &str) -> Result<Vec<ProviderMessage>, MailError> {
        let messages: Vec<GraphMessage> = self
            .get_list(
                token,
                "/me/mailFolders/inbox/messages",
                &[("$top", INBOX_PAGE_SIZE.to_string())],
            )
            .await?;
        tracing::debug!(count = messages.len(), "Fetched inbox page");
        Ok(messages.into_iter().map(ProviderMessage::from).collect())
    }

    async fn send_mail(&self, token: &str, mail: &OutgoingMail) -> Result<(), MailError> {
        Self::require_token(token)?;
        let payload = json!({
            "message": {
                "subject": mail.subject,
                "body": { "contentType": "Text", "content": mail.body },
                "toRecipients": [{ "emailAddress": { "address": mail.to } }]
            },
            "saveToSentItems": true
        });

        let response = self
            .client
            .post(self.url("/me/sendMail"))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| MailError::Network(e.to_string()))?;
        Self::check(response, &[StatusCode::ACCEPTED]).await?;

        tracing::info!(to = %mail.to, subject = %mail.subject, "Mail accepted for delivery");
        Ok(())
    }

    async fn recent_sent(&self, token: &str, limit: usize) -> Result<Vec<SentItem>, MailError> {
        let messages: Vec<GraphMessage> = self
            .get_list(
                token,
                "/me/mailFolders/sentitems/messages",
                &[
                    ("$top", limit.to_string()),
                    ("$orderby", "sentDateTime desc".to_string()),
                    ("$select", "id,subject,toRecipients".to_string()),
                ],
            )
            .await?;
        Ok(messages.into_iter().map(SentItem::from).collect())
    }

    async fn move_message(
        &self,
        token: &str,
        message_id: &str,
        folder_id: &str,
    ) -> Result<(), MailError> {
        Self::require_token(token)?;
        let response = self
            .client
            .post(self.url(&format!("/me/messages/{message_id}/move")))
            .bearer_auth(token)
            .json(&json!({ "destinationId": folder_id }))
            .send()
            .await
            .map_err(|e| MailError::Network(e.to_string()))?;
        Self::check(response, &[StatusCode::CREATED]).await?;
        Ok(())
    }

    async fn list_folders(&self, token: &str) -> Result<Vec<MailFolder>, MailError> {
        let folders: Vec<GraphFolder> = self
            .get_all(token, "/me/mailFolders", &[("$top", FOLDER_PAGE_SIZE.to_string())])
            .await?;
        Ok(folders.into_iter().map(MailFolder::from).collect())
    }

    async fn create_folder(&self, token: &str, name: &str) -> Result<MailFolder, MailError> {
        Self::require_token(token)?;
        let response = self
            .client
            .post(self.url("/me/mailFolders"))
            .bearer_auth(token)
            .json(&json!({ "displayName": name }))
            .send()
            .await
            .map_err(|e| MailError::Network(e.to_string()))?;
        let response = Self::check(response, &[StatusCode::CREATED]).await?;

        let folder: GraphFolder = response
            .json()
            .await
            .map_err(|e| MailError::Parse(e.to_string()))?;
        Ok(folder.into())
    }
}
