//! Email status transitions and the human review actions built on them.
//!
//! ```text
//! Categorized ─┬─> Responded ─┬──────────> Sent ─> Moved ─> Approved
//!              ├─> Failed     └─> Edited ─┘
//!              ├─> Rejected        ↺
//!              └─> Follow-up
//! ```
//!
//! Only an unsent reply can be edited. Every write names the status it
//! expects to replace, so a record changed by someone else in the meantime
//! is reported as a conflict instead of being overwritten.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::error::LifecycleError;
use crate::pipeline::types::{AiResponse, EmailRecord, EmailStatus, ItemError};
use crate::store::Database;

impl EmailStatus {
    pub fn can_transition_to(self, next: EmailStatus) -> bool {
        use EmailStatus::*;
        matches!(
            (self, next),
            (Responded | Edited, Edited)
                | (Categorized, Responded | Failed | Rejected | FollowUp)
                | (Responded | Edited, Sent)
                | (Sent, Moved)
                | (Moved, Approved)
        )
    }

    /// Whether the delivery sequencer will accept this record.
    pub fn is_approvable(self) -> bool {
        matches!(self, Self::Responded | Self::Edited)
    }
}

/// Validate a transition without touching the store.
pub fn check_transition(
    id: &str,
    from: EmailStatus,
    to: EmailStatus,
) -> Result<(), LifecycleError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(LifecycleError::InvalidTransition {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Reviewer batch actions on freshly categorized mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewAction {
    Reject,
    Flag,
}

impl ReviewAction {
    fn target(self) -> EmailStatus {
        match self {
            Self::Reject => EmailStatus::Rejected,
            Self::Flag => EmailStatus::FollowUp,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ReviewOutcome {
    pub updated: Vec<String>,
    pub errors: Vec<ItemError>,
}

pub struct Lifecycle {
    db: Arc<dyn Database>,
}

impl Lifecycle {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    async fn load(&self, id: &str) -> Result<EmailRecord, LifecycleError> {
        self.db
            .get_email(id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound { id: id.to_string() })
    }

    /// Move a record to `next`, checking the transition against its stored status.
    pub async fn advance(&self, id: &str, next: EmailStatus) -> Result<(), LifecycleError> {
        let email = self.load(id).await?;
        check_transition(id, email.status, next)?;
        if !self.db.update_email_status(id, email.status, next).await? {
            return Err(LifecycleError::Conflict {
                id: id.to_string(),
                expected: email.status.to_string(),
            });
        }
        info!(id = %id, from = %email.status, to = %next, "Email status changed");
        Ok(())
    }

    /// Apply a review action to each id. Ineligible or unknown ids are
    /// reported and skipped.
    pub async fn review(&self, ids: &[String], action: ReviewAction) -> ReviewOutcome {
        let mut outcome = ReviewOutcome::default();
        for id in ids {
            match self.advance(id, action.target()).await {
                Ok(()) => outcome.updated.push(id.clone()),
                Err(e) => outcome.errors.push(ItemError {
                    id: id.clone(),
                    error: e.to_string(),
                }),
            }
        }
        outcome
    }

    /// Replace the reply with reviewer-written text.
    pub async fn edit_reply(&self, id: &str, text: &str) -> Result<EmailRecord, LifecycleError> {
        let email = self.load(id).await?;
        check_transition(id, email.status, EmailStatus::Edited)?;

        let stored = self
            .db
            .store_ai_response(
                id,
                &AiResponse::Text(text.to_string()),
                email.status,
                EmailStatus::Edited,
                None,
            )
            .await?;
        if !stored {
            return Err(LifecycleError::Conflict {
                id: id.to_string(),
                expected: email.status.to_string(),
            });
        }
        info!(id = %id, "Reply edited");
        self.load(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), LifecycleError> {
        if self.db.delete_email(id).await? {
            info!(id = %id, "Email deleted");
            Ok(())
        } else {
            Err(LifecycleError::NotFound { id: id.to_string() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeliveryError;
    use crate::pipeline::delivery::{DeliveryConfig, DeliverySequencer};
    use crate::store::LibSqlBackend;
    use crate::test_support::{MockMail, email_record};

    #[test]
    fn transition_table() {
        use EmailStatus::*;
        assert!(Categorized.can_transition_to(Responded));
        assert!(Categorized.can_transition_to(FollowUp));
        assert!(Responded.can_transition_to(Sent));
        assert!(Edited.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Moved));
        assert!(Moved.can_transition_to(Approved));
        assert!(Responded.can_transition_to(Edited));
        assert!(Edited.can_transition_to(Edited));

        assert!(!Categorized.can_transition_to(Sent));
        assert!(!Responded.can_transition_to(Approved));
        assert!(!Sent.can_transition_to(Approved));
        assert!(!Rejected.can_transition_to(Responded));
        assert!(!Failed.can_transition_to(Sent));
        for status in [Categorized, Failed, Rejected, FollowUp, Sent, Moved, Approved] {
            assert!(!status.can_transition_to(Edited), "{status} must not be editable");
        }
    }

    #[test]
    fn approvable_states() {
        assert!(EmailStatus::Responded.is_approvable());
        assert!(EmailStatus::Edited.is_approvable());
        assert!(!EmailStatus::Categorized.is_approvable());
        assert!(!EmailStatus::Sent.is_approvable());
    }

    async fn seeded(records: &[(&str, EmailStatus)]) -> (Lifecycle, Arc<LibSqlBackend>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        for (id, status) in records {
            db.insert_email_if_absent(&email_record(id, "Billing Issues", *status, AiResponse::Pending))
                .await
                .unwrap();
        }
        (Lifecycle::new(db.clone()), db)
    }

    #[tokio::test]
    async fn reject_reports_ineligible_and_unknown_ids() {
        let (lifecycle, db) = seeded(&[
            ("a", EmailStatus::Categorized),
            ("b", EmailStatus::Responded),
        ])
        .await;

        let outcome = lifecycle
            .review(
                &["a".to_string(), "b".to_string(), "zz".to_string()],
                ReviewAction::Reject,
            )
            .await;

        assert_eq!(outcome.updated, vec!["a".to_string()]);
        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(outcome.errors[0].id, "b");
        assert!(outcome.errors[1].error.contains("not found"));
        assert_eq!(
            db.get_email("a").await.unwrap().unwrap().status,
            EmailStatus::Rejected
        );
        assert_eq!(
            db.get_email("b").await.unwrap().unwrap().status,
            EmailStatus::Responded
        );
    }

    #[tokio::test]
    async fn flag_sets_follow_up() {
        let (lifecycle, db) = seeded(&[("a", EmailStatus::Categorized)]).await;
        let outcome = lifecycle.review(&["a".to_string()], ReviewAction::Flag).await;
        assert!(outcome.errors.is_empty());
        assert_eq!(
            db.get_email("a").await.unwrap().unwrap().status,
            EmailStatus::FollowUp
        );
    }

    #[tokio::test]
    async fn edit_replaces_reply_text() {
        let (lifecycle, _) = seeded(&[("a", EmailStatus::Responded)]).await;
        let edited = lifecycle.edit_reply("a", "Hand-written answer").await.unwrap();
        assert_eq!(edited.status, EmailStatus::Edited);
        assert_eq!(
            edited.ai_response,
            AiResponse::Text("Hand-written answer".into())
        );
    }

    #[tokio::test]
    async fn edit_unknown_id_is_not_found() {
        let (lifecycle, _) = seeded(&[]).await;
        assert!(matches!(
            lifecycle.edit_reply("nope", "x").await,
            Err(LifecycleError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn advance_rejects_invalid_transition() {
        let (lifecycle, _) = seeded(&[("a", EmailStatus::Categorized)]).await;
        let err = lifecycle.advance("a", EmailStatus::Approved).await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn delete_is_explicit() {
        let (lifecycle, db) = seeded(&[("a", EmailStatus::Categorized)]).await;
        lifecycle.delete("a").await.unwrap();
        assert!(db.get_email("a").await.unwrap().is_none());
        assert!(matches!(
            lifecycle.delete("a").await,
            Err(LifecycleError::NotFound { .. })
        ));
    }

    fn sequencer(db: &Arc<LibSqlBackend>) -> (DeliverySequencer, Arc<MockMail>) {
        let mail = Arc::new(MockMail::default());
        let delivery = DeliverySequencer::new(db.clone(), mail.clone(), DeliveryConfig::default());
        (delivery, mail)
    }

    #[tokio::test]
    async fn rejected_record_cannot_be_edited_into_delivery() {
        let (lifecycle, db) = seeded(&[("a", EmailStatus::Categorized)]).await;
        lifecycle.review(&["a".to_string()], ReviewAction::Reject).await;

        let err = lifecycle.edit_reply("a", "Reply anyway").await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));

        let (delivery, mail) = sequencer(&db);
        assert!(matches!(
            delivery.approve("token", "a").await,
            Err(DeliveryError::NotEligible { .. })
        ));
        assert_eq!(mail.sent_count(), 0);

        let stored = db.get_email("a").await.unwrap().unwrap();
        assert_eq!(stored.status, EmailStatus::Rejected);
        assert_eq!(stored.ai_response, AiResponse::Pending);
    }

    #[tokio::test]
    async fn approved_record_cannot_be_edited_and_sent_again() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.insert_email_if_absent(&email_record(
            "a",
            "Billing Issues",
            EmailStatus::Responded,
            AiResponse::Text("Your refund is on its way".into()),
        ))
        .await
        .unwrap();
        let lifecycle = Lifecycle::new(db.clone());
        let (delivery, mail) = sequencer(&db);

        delivery.approve("token", "a").await.unwrap();
        assert_eq!(mail.sent_count(), 1);

        let err = lifecycle.edit_reply("a", "One more time").await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
        assert!(matches!(
            delivery.approve("token", "a").await,
            Err(DeliveryError::NotEligible { .. })
        ));
        assert_eq!(mail.sent_count(), 1);
        assert_eq!(
            db.get_email("a").await.unwrap().unwrap().status,
            EmailStatus::Approved
        );
    }

    #[tokio::test]
    async fn edited_reply_is_the_one_delivered() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.insert_email_if_absent(&email_record(
            "a",
            "Billing Issues",
            EmailStatus::Responded,
            AiResponse::Text("Draft".into()),
        ))
        .await
        .unwrap();
        let lifecycle = Lifecycle::new(db.clone());
        let (delivery, mail) = sequencer(&db);

        lifecycle.edit_reply("a", "First pass").await.unwrap();
        lifecycle.edit_reply("a", "Final wording").await.unwrap();
        delivery.approve("token", "a").await.unwrap();

        let sent = mail.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, "Final wording");
    }

    #[tokio::test]
    async fn write_against_stale_status_is_refused() {
        let (lifecycle, db) = seeded(&[("a", EmailStatus::Categorized)]).await;
        // Someone else flags the record after our read.
        let seen = db.get_email("a").await.unwrap().unwrap();
        lifecycle.advance("a", EmailStatus::FollowUp).await.unwrap();

        assert!(!db
            .update_email_status("a", seen.status, EmailStatus::Rejected)
            .await
            .unwrap());
        let err = lifecycle.advance("a", EmailStatus::Rejected).await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
    }
}
