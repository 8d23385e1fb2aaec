//! Natural-language request → `QuerySpec`.
//!
//! The model sees a schema summary (collection → field names) and must answer
//! with `{"collection": .., "query": {..}}`. When the call or the parse fails,
//! a small keyword table picks a wildcard query instead.

use std::sync::{Arc, LazyLock};

use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::compose::record::{FilterValue, QuerySpec};
use crate::compose::templates::TemplateDataset;
use crate::error::DatabaseError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, extract_json_object};
use crate::store::RecordStore;

/// Ordered collection → field names.
pub type SchemaSummary = Vec<(String, Vec<String>)>;

/// Keyword-triggered wildcard query used when the model cannot help.
#[derive(Debug, Clone)]
pub struct FallbackRule {
    /// Matches any keyword at a word start, case-insensitively.
    trigger: Regex,
    pub collection: String,
    pub field: String,
}

impl FallbackRule {
    pub fn new(
        keywords: &[&str],
        collection: impl Into<String>,
        field: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        let alternation = keywords
            .iter()
            .map(|kw| regex::escape(kw))
            .collect::<Vec<_>>()
            .join("|");
        let trigger = RegexBuilder::new(&format!(r"\b(?:{alternation})"))
            .case_insensitive(true)
            .build()?;
        Ok(Self {
            trigger,
            collection: collection.into(),
            field: field.into(),
        })
    }

    fn matches(&self, request: &str) -> bool {
        self.trigger.is_match(request)
    }

    fn query(&self) -> QuerySpec {
        QuerySpec::new(
            self.collection.clone(),
            vec![(self.field.clone(), FilterValue::regex(".*", true))],
        )
    }
}

/// Checked in order; the first rule whose keyword appears wins.
pub static DEFAULT_FALLBACKS: LazyLock<Vec<FallbackRule>> = LazyLock::new(|| {
    const RULES: &[(&[&str], &str, &str)] = &[
        (&["vin", "vehicle"], "listings", "VIN"),
        (&["test", "result"], "medical_tests", "Patient Name"),
        (&["appointment"], "salon_appointments", "Client Name"),
        (&["case"], "cases", "Client Name"),
    ];
    RULES
        .iter()
        .map(|(keywords, collection, field)| {
            FallbackRule::new(keywords, *collection, *field)
                .expect("fallback keywords are escaped and always compile")
        })
        .collect()
});

/// Sample one record per collection, then fold in dataset metadata fields.
pub async fn build_schema_summary(
    store: &dyn RecordStore,
    dataset: &TemplateDataset,
) -> Result<SchemaSummary, DatabaseError> {
    let mut schema: SchemaSummary = Vec::new();
    for collection in store.collection_names().await? {
        if let Some(fields) = store.sample_fields(&collection).await? {
            schema.push((collection, fields));
        }
    }

    for (collection, fields) in dataset.metadata_fields() {
        match schema.iter_mut().find(|(name, _)| name == collection) {
            Some((_, known)) => {
                for field in fields {
                    if !known.contains(field) {
                        known.push(field.clone());
                    }
                }
            }
            None => {
                let mut unique: Vec<String> = Vec::new();
                for field in fields {
                    if !unique.contains(field) {
                        unique.push(field.clone());
                    }
                }
                schema.push((collection.to_string(), unique));
            }
        }
    }
    Ok(schema)
}

pub struct QuerySynthesizer {
    llm: Arc<dyn LlmProvider>,
    fallbacks: Vec<FallbackRule>,
}

impl QuerySynthesizer {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self::with_fallbacks(llm, DEFAULT_FALLBACKS.clone())
    }

    pub fn with_fallbacks(llm: Arc<dyn LlmProvider>, fallbacks: Vec<FallbackRule>) -> Self {
        Self { llm, fallbacks }
    }

    /// `None` means neither the model nor a fallback produced a query.
    pub async fn synthesize(&self, request: &str, schema: &SchemaSummary) -> Option<QuerySpec> {
        match self.ask(request, schema).await {
            Ok(spec) => {
                debug!(collection = %spec.collection, filters = spec.filter.len(), "Query synthesized");
                Some(spec)
            }
            Err(reason) => {
                warn!(reason = %reason, "Query synthesis failed, trying keyword fallbacks");
                self.fallback(request)
            }
        }
    }

    pub fn fallback(&self, request: &str) -> Option<QuerySpec> {
        self.fallbacks
            .iter()
            .find(|rule| rule.matches(request))
            .map(FallbackRule::query)
    }

    async fn ask(&self, request: &str, schema: &SchemaSummary) -> Result<QuerySpec, String> {
        let (system, user) = query_prompts(request, schema);
        let completion = CompletionRequest::new(vec![
            ChatMessage::system(system),
            ChatMessage::user(user),
        ])
        .with_temperature(0.0)
        .with_max_tokens(500);

        let response = self
            .llm
            .complete(completion)
            .await
            .map_err(|e| e.to_string())?;
        if response.content.trim().is_empty() {
            return Err("model returned an empty answer".to_string());
        }

        let json = extract_json_object(&response.content);
        let value: Value =
            serde_json::from_str(&json).map_err(|e| format!("unparseable query: {e}"))?;
        QuerySpec::from_json(&value)
    }
}

fn query_prompts(request: &str, schema: &SchemaSummary) -> (String, String) {
    let collections: Map<String, Value> = schema
        .iter()
        .map(|(name, fields)| {
            (
                name.clone(),
                Value::Array(fields.iter().cloned().map(Value::String).collect()),
            )
        })
        .collect();
    let schema_json = serde_json::to_string_pretty(&collections).unwrap_or_default();

    let system = format!(
        "You are an expert document-store query generator.\n\n\
         RULES:\n\
         1. Return ONLY valid JSON with 'collection' and 'query'.\n\
         2. Use a case-insensitive regex ({{\"$regex\": \"..\", \"$options\": \"i\"}}) for names.\n\
         3. Use exact match for IDs, VINs and emails.\n\
         4. Do not explain anything. Just return JSON.\n\n\
         Available collections:\n{schema_json}"
    );
    let user = format!(
        "Generate a query for: \"{request}\"\n\n\
         Return only JSON format:\n\
         {{\"collection\": \"collection_name\", \"query\": {{...}}}}"
    );
    (system, user)
}
