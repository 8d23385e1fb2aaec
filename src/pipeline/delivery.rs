//! Approval and delivery: send the stored reply, find it in sent items,
//! move it into the record's folder, then mark the record approved.
//!
//! Each record advances `Responded|Edited → Sent → Moved → Approved`. The
//! record is claimed as Sent before the mail goes out, so of two concurrent
//! approvals only one sends. A rejected send hands the record back to its
//! prior status. A failure after sending leaves the record at the last state
//! it reached. Batches keep going past failed records.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{DatabaseError, DeliveryError, LifecycleError};
use crate::mail::{MailProvider, OutgoingMail, resolve_folder};
use crate::pipeline::lifecycle::check_transition;
use crate::pipeline::types::{
    EmailRecord, EmailStatus, FailedDeliveryRecord, ItemError, PENDING, StructuredReply,
};
use crate::store::{Database, EmailFilter};

#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Folder used when a record has no folder tag.
    pub default_folder: String,
    /// How many recent sent items to search for the delivered copy.
    pub sent_lookback: usize,
    /// Receives an alert for every rejected send.
    pub admin_email: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            default_folder: "Processed".to_string(),
            sent_lookback: 10,
            admin_email: "admin@company.com".to_string(),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ApprovalOutcome {
    pub approved: Vec<String>,
    pub errors: Vec<ItemError>,
}

pub struct DeliverySequencer {
    db: Arc<dyn Database>,
    mail: Arc<dyn MailProvider>,
    config: DeliveryConfig,
}

impl DeliverySequencer {
    pub fn new(db: Arc<dyn Database>, mail: Arc<dyn MailProvider>, config: DeliveryConfig) -> Self {
        Self { db, mail, config }
    }

    pub async fn approve(&self, token: &str, id: &str) -> Result<(), DeliveryError> {
        let email = self
            .db
            .get_email(id)
            .await?
            .ok_or_else(|| DeliveryError::NotFound { id: id.to_string() })?;

        if !email.status.is_approvable() {
            return Err(DeliveryError::NotEligible {
                id: id.to_string(),
                status: email.status.to_string(),
            });
        }

        self.deliver(token, &email).await
    }

    pub async fn approve_batch(&self, token: &str, ids: &[String]) -> ApprovalOutcome {
        let mut outcome = ApprovalOutcome::default();
        for id in ids {
            match self.approve(token, id).await {
                Ok(()) => outcome.approved.push(id.clone()),
                Err(e) => {
                    warn!(id = %id, error = %e, "Approval failed");
                    outcome.errors.push(ItemError {
                        id: id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        info!(
            approved = outcome.approved.len(),
            failed = outcome.errors.len(),
            "Batch approval complete"
        );
        outcome
    }

    /// Approve every Responded or Edited record of a category.
    pub async fn approve_category(
        &self,
        token: &str,
        category: &str,
    ) -> Result<ApprovalOutcome, DatabaseError> {
        let ids: Vec<String> = self
            .db
            .list_emails(&EmailFilter::category(category))
            .await?
            .into_iter()
            .filter(|e| e.status.is_approvable())
            .map(|e| e.id)
            .collect();
        Ok(self.approve_batch(token, &ids).await)
    }

    async fn deliver(&self, token: &str, email: &EmailRecord) -> Result<(), DeliveryError> {
        let reply = email.ai_response.normalize();
        if let Some(error) = reply.error.as_deref().filter(|e| !e.is_empty()) {
            return Err(DeliveryError::Response(error.to_string()));
        }

        let recipient = resolve_recipient(&reply, email).ok_or(DeliveryError::NoRecipient)?;
        let subject = resolve_subject(&reply, email);
        let body = reply.body_text().ok_or(DeliveryError::EmptyBody)?.to_string();

        let folder_name = self.folder_name(email);
        let folder = resolve_folder(self.mail.as_ref(), token, &folder_name)
            .await
            .map_err(DeliveryError::Folder)?;

        let mail = OutgoingMail {
            to: recipient.clone(),
            subject: subject.clone(),
            body,
        };
        self.transition(email, email.status, EmailStatus::Sent).await?;
        if let Err(e) = self.mail.send_mail(token, &mail).await {
            let failure = DeliveryError::SendFailed(e);
            self.release_claim(email).await;
            self.record_failure(token, email, &recipient, &failure).await;
            return Err(failure);
        }

        let sent = self
            .mail
            .recent_sent(token, self.config.sent_lookback)
            .await
            .map_err(DeliveryError::SentLookup)?;
        let copy = sent
            .iter()
            .find(|item| item.matches(&subject, &recipient))
            .ok_or(DeliveryError::SentMessageNotFound)?;

        self.mail
            .move_message(token, &copy.id, &folder.id)
            .await
            .map_err(DeliveryError::MoveFailed)?;
        self.transition(email, EmailStatus::Sent, EmailStatus::Moved).await?;

        check_transition(&email.id, EmailStatus::Moved, EmailStatus::Approved)?;
        if !self.db.mark_approved(&email.id, Utc::now()).await? {
            return Err(conflict(email, EmailStatus::Moved));
        }

        info!(
            id = %email.id,
            to = %recipient,
            folder = %folder.display_name,
            "Reply delivered and approved"
        );
        Ok(())
    }

    async fn transition(
        &self,
        email: &EmailRecord,
        from: EmailStatus,
        to: EmailStatus,
    ) -> Result<(), DeliveryError> {
        check_transition(&email.id, from, to)?;
        if !self.db.update_email_status(&email.id, from, to).await? {
            return Err(conflict(email, from));
        }
        Ok(())
    }

    /// Undo the Sent claim after the provider refused the mail.
    async fn release_claim(&self, email: &EmailRecord) {
        match self
            .db
            .update_email_status(&email.id, EmailStatus::Sent, email.status)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(id = %email.id, "Send claim already released"),
            Err(e) => error!(id = %email.id, error = %e, "Failed to release send claim"),
        }
    }

    fn folder_name(&self, email: &EmailRecord) -> String {
        match email.folder.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() && name != PENDING => name.to_string(),
            _ => self.config.default_folder.clone(),
        }
    }

    /// Keep a failure row and warn the admin. Neither step may mask the send error.
    async fn record_failure(
        &self,
        token: &str,
        email: &EmailRecord,
        recipient: &str,
        failure: &DeliveryError,
    ) {
        let record =
            FailedDeliveryRecord::new(&email.id, recipient, &email.category, failure.to_string());
        if let Err(e) = self.db.insert_failed_delivery(&record).await {
            error!(id = %email.id, error = %e, "Failed to record delivery failure");
        }

        let alert = OutgoingMail {
            to: self.config.admin_email.clone(),
            subject: "Email Send Failure Alert".to_string(),
            body: format!(
                "The reply to email {} could not be sent.\n\nRecipient: {}\nCategory: {}\nError: {}",
                email.id, recipient, email.category, failure
            ),
        };
        if let Err(e) = self.mail.send_mail(token, &alert).await {
            warn!(id = %email.id, error = %e, "Admin alert could not be sent");
        }
    }
}

fn conflict(email: &EmailRecord, expected: EmailStatus) -> DeliveryError {
    LifecycleError::Conflict {
        id: email.id.clone(),
        expected: expected.to_string(),
    }
    .into()
}

/// Reply `to`, then the sender, then the reply-to address.
pub fn resolve_recipient(reply: &StructuredReply, email: &EmailRecord) -> Option<String> {
    [&reply.to, &email.sender, &email.reply_to]
        .into_iter()
        .flatten()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn resolve_subject(reply: &StructuredReply, email: &EmailRecord) -> String {
    reply
        .subject
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("Re: {}", email.subject))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::mail::MailFolder;
    use crate::pipeline::types::AiResponse;
    use crate::store::LibSqlBackend;
    use crate::test_support::{MockMail, email_record};

    fn structured(to: Option<&str>, body: &str) -> AiResponse {
        AiResponse::Structured(StructuredReply {
            to: to.map(str::to_string),
            subject: Some("Response regarding Honda Civic".into()),
            body: Some(body.into()),
            error: None,
        })
    }

    async fn setup(
        mail: MockMail,
        records: Vec<EmailRecord>,
    ) -> (DeliverySequencer, Arc<LibSqlBackend>, Arc<MockMail>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        for record in &records {
            db.insert_email_if_absent(record).await.unwrap();
        }
        let mail = Arc::new(mail);
        let sequencer = DeliverySequencer::new(db.clone(), mail.clone(), DeliveryConfig::default());
        (sequencer, db, mail)
    }

    async fn status(db: &LibSqlBackend, id: &str) -> EmailStatus {
        db.get_email(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn delivers_moves_and_approves() {
        let record = email_record(
            "m1",
            "Billing Issues",
            EmailStatus::Responded,
            structured(Some("bob@example.com"), "Your car is ready"),
        );
        let (sequencer, db, mail) = setup(MockMail::default(), vec![record]).await;

        sequencer.approve("token", "m1").await.unwrap();

        let stored = db.get_email("m1").await.unwrap().unwrap();
        assert_eq!(stored.status, EmailStatus::Approved);
        assert!(stored.approved_at.is_some());

        let sent = mail.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "bob@example.com");
        assert_eq!(sent[0].body, "Your car is ready");

        let folders = mail.folders.lock().unwrap().clone();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].display_name, "Processed");
        let moved = mail.moved.lock().unwrap().clone();
        assert_eq!(moved, vec![("sent-1".to_string(), folders[0].id.clone())]);
    }

    #[tokio::test]
    async fn reuses_existing_folder_case_insensitively() {
        let mut record = email_record(
            "m1",
            "Billing Issues",
            EmailStatus::Edited,
            AiResponse::Text("Plain reply".into()),
        );
        record.folder = Some("billing".into());
        let mail = MockMail::default();
        mail.folders.lock().unwrap().push(MailFolder {
            id: "f-billing".into(),
            display_name: "Billing".into(),
        });
        let (sequencer, db, mail) = setup(mail, vec![record]).await;

        sequencer.approve("token", "m1").await.unwrap();

        assert_eq!(mail.folders.lock().unwrap().len(), 1);
        assert_eq!(mail.moved.lock().unwrap()[0].1, "f-billing");
        // Text replies go to the sender with a Re: subject.
        let sent = mail.sent.lock().unwrap()[0].clone();
        assert_eq!(sent.to, "m1@example.com");
        assert_eq!(sent.subject, "Re: Question m1");
        assert_eq!(status(&db, "m1").await, EmailStatus::Approved);
    }

    #[tokio::test]
    async fn batch_with_unresolvable_recipient_partially_succeeds() {
        let mut orphan = email_record(
            "b",
            "Billing Issues",
            EmailStatus::Responded,
            structured(None, "Body"),
        );
        orphan.sender = None;
        orphan.reply_to = None;
        let records = vec![
            email_record("a", "Billing Issues", EmailStatus::Responded, structured(None, "Body A")),
            orphan,
            email_record("c", "Billing Issues", EmailStatus::Responded, structured(None, "Body C")),
        ];
        let (sequencer, db, _) = setup(MockMail::default(), records).await;

        let outcome = sequencer
            .approve_batch("token", &["a".into(), "b".into(), "c".into()])
            .await;

        assert_eq!(outcome.approved, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(
            outcome.errors,
            vec![ItemError {
                id: "b".into(),
                error: "no recipient".into()
            }]
        );
        assert_eq!(status(&db, "b").await, EmailStatus::Responded);
    }

    #[tokio::test]
    async fn stored_error_blocks_delivery() {
        let record = email_record(
            "m1",
            "Billing Issues",
            EmailStatus::Responded,
            AiResponse::Structured(StructuredReply::failed("No matching client found")),
        );
        let (sequencer, _, mail) = setup(MockMail::default(), vec![record]).await;

        let err = sequencer.approve("token", "m1").await.unwrap_err();
        assert_eq!(err.to_string(), "No matching client found");
        assert_eq!(mail.sent_count(), 0);
    }

    #[tokio::test]
    async fn blank_body_is_rejected() {
        let record = email_record(
            "m1",
            "Billing Issues",
            EmailStatus::Responded,
            structured(Some("x@example.com"), "  "),
        );
        let (sequencer, _, _) = setup(MockMail::default(), vec![record]).await;
        let err = sequencer.approve("token", "m1").await.unwrap_err();
        assert_eq!(err.to_string(), "empty body");
    }

    #[tokio::test]
    async fn rejected_send_is_recorded_and_status_kept() {
        let record = email_record(
            "m1",
            "Billing Issues",
            EmailStatus::Responded,
            structured(Some("bob@example.com"), "Body"),
        );
        let mail = MockMail::default();
        mail.fail_send.store(true, Ordering::SeqCst);
        let (sequencer, db, _) = setup(mail, vec![record]).await;

        let err = sequencer.approve("token", "m1").await.unwrap_err();
        assert!(matches!(err, DeliveryError::SendFailed(_)));
        assert!(err.to_string().starts_with("send failed"));
        assert_eq!(status(&db, "m1").await, EmailStatus::Responded);

        let failures = db
            .failed_deliveries_since(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].recipient, "bob@example.com");
        assert_eq!(failures[0].category, "Billing Issues");
    }

    #[tokio::test]
    async fn concurrent_approvals_send_once() {
        let record = email_record(
            "m1",
            "Billing Issues",
            EmailStatus::Responded,
            structured(Some("bob@example.com"), "Body"),
        );
        let (sequencer, db, mail) = setup(MockMail::default(), vec![record]).await;

        let (first, second) = tokio::join!(
            sequencer.approve("token", "m1"),
            sequencer.approve("token", "m1")
        );
        assert!(first.is_ok() != second.is_ok(), "{first:?} / {second:?}");
        assert_eq!(mail.sent_count(), 1);
        assert_eq!(status(&db, "m1").await, EmailStatus::Approved);
    }

    #[tokio::test]
    async fn missing_sent_copy_leaves_record_sent() {
        let record = email_record(
            "m1",
            "Billing Issues",
            EmailStatus::Responded,
            structured(Some("bob@example.com"), "Body"),
        );
        let mail = MockMail::default();
        mail.hide_sent.store(true, Ordering::SeqCst);
        let (sequencer, db, mail) = setup(mail, vec![record]).await;

        let err = sequencer.approve("token", "m1").await.unwrap_err();
        assert_eq!(err.to_string(), "sent message not found");
        assert_eq!(status(&db, "m1").await, EmailStatus::Sent);
        assert_eq!(mail.sent_count(), 1);
    }

    #[tokio::test]
    async fn move_failure_leaves_record_sent() {
        let record = email_record(
            "m1",
            "Billing Issues",
            EmailStatus::Responded,
            structured(Some("bob@example.com"), "Body"),
        );
        let mail = MockMail::default();
        mail.fail_move.store(true, Ordering::SeqCst);
        let (sequencer, db, _) = setup(mail, vec![record]).await;

        let err = sequencer.approve("token", "m1").await.unwrap_err();
        assert!(err.to_string().starts_with("move failed"));
        assert_eq!(status(&db, "m1").await, EmailStatus::Sent);
    }

    #[tokio::test]
    async fn ineligible_and_unknown_records() {
        let record = email_record("m1", "Billing Issues", EmailStatus::Categorized, AiResponse::Pending);
        let (sequencer, _, mail) = setup(MockMail::default(), vec![record]).await;

        assert!(matches!(
            sequencer.approve("token", "m1").await,
            Err(DeliveryError::NotEligible { .. })
        ));
        assert!(matches!(
            sequencer.approve("token", "zz").await,
            Err(DeliveryError::NotFound { .. })
        ));
        assert_eq!(mail.sent_count(), 0);
    }

    #[tokio::test]
    async fn approve_category_only_touches_eligible_records() {
        let records = vec![
            email_record("a", "Billing Issues", EmailStatus::Responded, structured(None, "A")),
            email_record("b", "Billing Issues", EmailStatus::Categorized, AiResponse::Pending),
            email_record("c", "Sales", EmailStatus::Responded, structured(None, "C")),
        ];
        let (sequencer, db, _) = setup(MockMail::default(), records).await;

        let outcome = sequencer
            .approve_category("token", "Billing Issues")
            .await
            .unwrap();
        assert_eq!(outcome.approved, vec!["a".to_string()]);
        assert!(outcome.errors.is_empty());
        assert_eq!(status(&db, "c").await, EmailStatus::Responded);
    }

    #[test]
    fn recipient_precedence() {
        let mut email = email_record("m1", "x", EmailStatus::Responded, AiResponse::Pending);
        email.reply_to = Some("reply@example.com".into());

        let reply = StructuredReply {
            to: Some("to@example.com".into()),
            ..Default::default()
        };
        assert_eq!(resolve_recipient(&reply, &email).as_deref(), Some("to@example.com"));

        let blank = StructuredReply {
            to: Some(" ".into()),
            ..Default::default()
        };
        assert_eq!(resolve_recipient(&blank, &email).as_deref(), Some("m1@example.com"));

        email.sender = None;
        assert_eq!(resolve_recipient(&blank, &email).as_deref(), Some("reply@example.com"));
    }
}
