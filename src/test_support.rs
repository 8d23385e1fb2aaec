//! Shared test doubles for the LLM and mail seams.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{LlmError, MailError};
use crate::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};
use crate::mail::{BodyType, MailFolder, MailProvider, OutgoingMail, ProviderMessage, SentItem};
use crate::pipeline::types::{AiResponse, EmailRecord, EmailStatus};

/// Answers completions from a script, then fails once it runs dry.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<Result<String, LlmError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn failing() -> Self {
        Self::new(Vec::new())
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Concatenated system and user text of the nth request.
    pub fn prompt(&self, n: usize) -> String {
        self.requests.lock().unwrap()[n]
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub fn unavailable() -> LlmError {
    LlmError::RetriesExhausted {
        attempts: 3,
        reason: "script exhausted".into(),
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let next = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(unavailable()));
        next.map(|content| CompletionResponse {
            content,
            input_tokens: 10,
            output_tokens: 5,
            finish_reason: FinishReason::Stop,
        })
    }
}

/// In-memory mailbox with switches for each failure mode.
#[derive(Default)]
pub struct MockMail {
    pub inbox: Mutex<Vec<ProviderMessage>>,
    pub folders: Mutex<Vec<MailFolder>>,
    /// Every message the provider accepted.
    pub sent: Mutex<Vec<OutgoingMail>>,
    /// What the sent-items folder shows; normally mirrors `sent`.
    pub sent_folder: Mutex<Vec<SentItem>>,
    pub moved: Mutex<Vec<(String, String)>>,
    pub fail_fetch: AtomicBool,
    pub fail_send: AtomicBool,
    pub fail_move: AtomicBool,
    pub hide_sent: AtomicBool,
}

impl MockMail {
    pub fn with_inbox(messages: Vec<ProviderMessage>) -> Self {
        Self {
            inbox: Mutex::new(messages),
            ..Self::default()
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl MailProvider for MockMail {
    async fn fetch_inbox(&self, _token: &str) -> Result<Vec<ProviderMessage>, MailError> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(MailError::Api {
                status: 401,
                message: "InvalidAuthenticationToken".into(),
            });
        }
        Ok(self.inbox.lock().unwrap().clone())
    }

    async fn send_mail(&self, _token: &str, mail: &OutgoingMail) -> Result<(), MailError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(MailError::Api {
                status: 400,
                message: "ErrorInvalidRecipients".into(),
            });
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(mail.clone());
        if !self.hide_sent.load(Ordering::SeqCst) {
            self.sent_folder.lock().unwrap().push(SentItem {
                id: format!("sent-{}", sent.len()),
                subject: mail.subject.clone(),
                recipients: vec![mail.to.clone()],
            });
        }
        Ok(())
    }

    async fn recent_sent(&self, _token: &str, limit: usize) -> Result<Vec<SentItem>, MailError> {
        Ok(self
            .sent_folder
            .lock()
            .unwrap()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn move_message(
        &self,
        _token: &str,
        message_id: &str,
        folder_id: &str,
    ) -> Result<(), MailError> {
        if self.fail_move.load(Ordering::SeqCst) {
            return Err(MailError::Api {
                status: 404,
                message: "ErrorItemNotFound".into(),
            });
        }
        self.moved
            .lock()
            .unwrap()
            .push((message_id.to_string(), folder_id.to_string()));
        Ok(())
    }

    async fn list_folders(&self, _token: &str) -> Result<Vec<MailFolder>, MailError> {
        Ok(self.folders.lock().unwrap().clone())
    }

    async fn create_folder(&self, _token: &str, name: &str) -> Result<MailFolder, MailError> {
        let mut folders = self.folders.lock().unwrap();
        let folder = MailFolder {
            id: format!("folder-{}", folders.len() + 1),
            display_name: name.to_string(),
        };
        folders.push(folder.clone());
        Ok(folder)
    }
}

pub fn html_message(id: &str, subject: &str, html: &str) -> ProviderMessage {
    ProviderMessage {
        id: id.to_string(),
        subject: subject.to_string(),
        body_type: BodyType::Html,
        body: html.to_string(),
        from_address: Some("ada@example.com".into()),
        from_name: Some("Ada".into()),
        reply_to: None,
        received_at: Some(Utc::now()),
    }
}

pub fn email_record(
    id: &str,
    category: &str,
    status: EmailStatus,
    response: AiResponse,
) -> EmailRecord {
    let now = Utc::now();
    EmailRecord {
        id: id.to_string(),
        subject: format!("Question {id}"),
        sender: Some(format!("{id}@example.com")),
        sender_name: None,
        reply_to: None,
        raw_body: "Please help".into(),
        body: "Please help".into(),
        category: category.to_string(),
        status,
        ai_response: response,
        folder: None,
        received_at: Some(now),
        created_at: now,
        updated_at: now,
        approved_at: None,
    }
}
