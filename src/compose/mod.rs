//! Reply composition: request text → query → client record → template → reply.
//!
//! Every stage short-circuits. The composer never returns an error to its
//! caller; a failed stage is reported through the reply's `error` field so
//! the batch responder can store it as-is.

pub mod query;
pub mod record;
pub mod templates;

use std::sync::Arc;

use tracing::{info, warn};

use crate::compose::query::{QuerySynthesizer, build_schema_summary};
use crate::compose::record::ClientRecord;
use crate::compose::templates::{TemplateDataset, TemplateSelector, build_catalog, fill_placeholders};
use crate::error::ComposeError;
use crate::llm::LlmProvider;
use crate::pipeline::types::StructuredReply;
use crate::store::RecordStore;

pub struct ResponseComposer {
    records: Arc<dyn RecordStore>,
    dataset: Arc<TemplateDataset>,
    synthesizer: QuerySynthesizer,
    selector: TemplateSelector,
    admin_email: String,
}

impl ResponseComposer {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        records: Arc<dyn RecordStore>,
        dataset: Arc<TemplateDataset>,
        admin_email: impl Into<String>,
    ) -> Self {
        Self {
            records,
            dataset,
            synthesizer: QuerySynthesizer::new(llm.clone()),
            selector: TemplateSelector::new(llm),
            admin_email: admin_email.into(),
        }
    }

    /// Replace the query synthesizer (custom fallback tables).
    pub fn with_synthesizer(mut self, synthesizer: QuerySynthesizer) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    pub async fn compose(&self, request: &str) -> StructuredReply {
        match self.try_compose(request).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Composition stopped");
                StructuredReply::failed(e.to_string())
            }
        }
    }

    async fn try_compose(&self, request: &str) -> Result<StructuredReply, ComposeError> {
        let schema = build_schema_summary(self.records.as_ref(), &self.dataset).await?;
        let query = self
            .synthesizer
            .synthesize(request, &schema)
            .await
            .ok_or(ComposeError::NoQuery)?;

        let record = self
            .records
            .find_one(&query.normalized())
            .await?
            .ok_or(ComposeError::NoRecord)?;

        let catalog = build_catalog(&self.dataset);
        let template = self
            .selector
            .select(request, &record, &catalog)
            .await
            .ok_or(ComposeError::NoTemplate)?;

        info!(
            collection = %query.collection,
            template_id = %template.id,
            "Reply composed"
        );
        Ok(StructuredReply {
            to: Some(record.text("Email").unwrap_or_else(|| self.admin_email.clone())),
            subject: Some(reply_subject(&record)),
            body: Some(fill_placeholders(&template.full_content, &record)),
            error: None,
        })
    }
}

/// `Response regarding <Make|ID|your request> <Model>`.
pub fn reply_subject(record: &ClientRecord) -> String {
    let topic = record
        .text("Make")
        .or_else(|| record.text("ID"))
        .unwrap_or_else(|| "your request".to_string());
    let model = record.text("Model").unwrap_or_default();
    format!("Response regarding {topic} {model}").trim().to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::compose::query::FallbackRule;
    use crate::compose::record::{FieldValue, QuerySpec};
    use crate::error::DatabaseError;
    use crate::store::LibSqlBackend;
    use crate::test_support::ScriptedLlm;

    fn dataset() -> Arc<TemplateDataset> {
        Arc::new(
            TemplateDataset::from_json_str(
                &json!([{
                    "source_file": "auto.docx",
                    "content": {"paragraphs": [
                        "Dear {Client Name}, your {Make} {Model} ({VIN}) is ready. Ref {Ticket}.",
                        "Hi [Client Name], we received your message."
                    ]},
                    "metadata": {"collection": "listings", "fields": ["VIN"]}
                }])
                .to_string(),
            )
            .unwrap(),
        )
    }

    async fn store_with_listing() -> Arc<LibSqlBackend> {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        store
            .insert_record(
                "listings",
                &json!({
                    "Client Name": "Bob",
                    "Email": "bob@example.com",
                    "Make": "Honda",
                    "Model": "Civic",
                    "VIN": "HQ0S3U42R8K7FOYPP"
                }),
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn composes_reply_from_record_and_template() {
        let llm = Arc::new(ScriptedLlm::replying(&[
            r#"{"collection": "listings", "query": {"VIN": "hq0s3u42r8k7foypp"}}"#,
            r#"{"id": "1"}"#,
        ]));
        let composer = ResponseComposer::new(
            llm.clone(),
            store_with_listing().await,
            dataset(),
            "admin@company.com",
        );

        let reply = composer
            .compose("Info for the vehicle with VIN HQ0S3U42R8K7FOYPP")
            .await;
        assert_eq!(reply.error, None);
        assert_eq!(reply.to.as_deref(), Some("bob@example.com"));
        assert_eq!(reply.subject.as_deref(), Some("Response regarding Honda Civic"));
        assert_eq!(
            reply.body.as_deref(),
            Some("Dear Bob, your Honda Civic (HQ0S3U42R8K7FOYPP) is ready. Ref N/A.")
        );
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn missing_record_is_terminal() {
        let llm = Arc::new(ScriptedLlm::replying(&[
            r#"{"collection": "listings", "query": {"VIN": "NOPE"}}"#,
        ]));
        let composer =
            ResponseComposer::new(llm.clone(), store_with_listing().await, dataset(), "admin@company.com");

        let reply = composer.compose("VIN NOPE").await;
        assert_eq!(reply.error.as_deref(), Some("No matching client found"));
        assert!(reply.to.is_none() && reply.subject.is_none() && reply.body.is_none());
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn empty_catalog_reports_no_template() {
        let llm = Arc::new(ScriptedLlm::replying(&[r#"{"collection": "listings"}"#]));
        let composer = ResponseComposer::new(
            llm,
            store_with_listing().await,
            Arc::new(TemplateDataset::default()),
            "admin@company.com",
        );
        let reply = composer.compose("anything").await;
        assert_eq!(reply.error.as_deref(), Some("No suitable template found"));
    }

    /// Counts lookups so tests can prove none happened.
    #[derive(Default)]
    struct CountingStore {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl RecordStore for CountingStore {
        async fn collection_names(&self) -> Result<Vec<String>, DatabaseError> {
            Ok(vec![])
        }

        async fn sample_fields(&self, _: &str) -> Result<Option<Vec<String>>, DatabaseError> {
            Ok(None)
        }

        async fn find_one(&self, _: &QuerySpec) -> Result<Option<ClientRecord>, DatabaseError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }

        async fn insert_record(
            &self,
            _: &str,
            _: &serde_json::Value,
        ) -> Result<String, DatabaseError> {
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn vin_request_without_fallback_stops_before_lookup() {
        let llm = Arc::new(ScriptedLlm::failing());
        let store = Arc::new(CountingStore::default());
        let synthesizer = QuerySynthesizer::with_fallbacks(
            llm.clone(),
            vec![
                FallbackRule::new(&["appointment"], "salon_appointments", "Client Name").unwrap(),
            ],
        );
        let composer = ResponseComposer::new(llm, store.clone(), dataset(), "admin@company.com")
            .with_synthesizer(synthesizer);

        let reply = composer
            .compose("Can you send details for VIN HQ0S3U42R8K7FOYPP?")
            .await;
        assert_eq!(reply.error.as_deref(), Some("Could not generate query"));
        assert_eq!(store.lookups.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subject_falls_back_through_make_id_and_default() {
        let make = ClientRecord::new(vec![("Make".into(), FieldValue::Text("Ford".into()))]);
        assert_eq!(reply_subject(&make), "Response regarding Ford");

        let id = ClientRecord::new(vec![("ID".into(), FieldValue::Text("ID-1026".into()))]);
        assert_eq!(reply_subject(&id), "Response regarding ID-1026");

        assert_eq!(
            reply_subject(&ClientRecord::default()),
            "Response regarding your request"
        );
    }

    #[tokio::test]
    async fn missing_email_goes_to_admin() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        store
            .insert_record("cases", &json!({"Client Name": "Ada", "Email": null}))
            .await
            .unwrap();
        let llm = Arc::new(ScriptedLlm::replying(&[
            r#"{"collection": "cases", "query": {"Client Name": {"$regex": "ada", "$options": "i"}}}"#,
            r#"{"id": "2"}"#,
        ]));
        let composer = ResponseComposer::new(llm, store, dataset(), "admin@company.com");

        let reply = composer.compose("Update on my case please").await;
        assert_eq!(reply.to.as_deref(), Some("admin@company.com"));
        assert_eq!(
            reply.body.as_deref(),
            Some("Hi Ada, we received your message.")
        );
    }
}
