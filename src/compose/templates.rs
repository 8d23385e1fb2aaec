//! Template dataset, catalog, selection and placeholder filling.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use regex::{NoExpand, Regex};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::compose::record::ClientRecord;
use crate::error::ConfigError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider, extract_json_object};

/// `{Name}` or `[Name]`.
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[{\[]([^}\]]+)[}\]]").expect("placeholder pattern must compile")
});

const PREVIEW_CHARS: usize = 80;

// ── Dataset ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateContent {
    #[serde(default)]
    pub paragraphs: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateMetadata {
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub fields: Vec<String>,
}

/// One source document of reply templates.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateSource {
    #[serde(rename = "_id", default)]
    pub id: Value,
    #[serde(default)]
    pub source_file: Option<String>,
    #[serde(default)]
    pub content: TemplateContent,
    #[serde(default)]
    pub metadata: Option<TemplateMetadata>,
}

impl TemplateSource {
    /// `_id` may be a plain string or an extended-JSON `{"$oid": ..}` object.
    pub fn source_id(&self) -> String {
        match &self.id {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Object(map) => match map.get("$oid") {
                Some(Value::String(s)) => s.clone(),
                _ => self.id.to_string(),
            },
            other => other.to_string(),
        }
    }
}

/// Reply templates loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct TemplateDataset {
    sources: Vec<TemplateSource>,
}

impl TemplateDataset {
    pub fn new(sources: Vec<TemplateSource>) -> Self {
        Self { sources }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let sources: Vec<TemplateSource> =
            serde_json::from_str(raw).map_err(|e| ConfigError::Dataset(e.to_string()))?;
        Ok(Self::new(sources))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let dataset = Self::from_json_str(&raw)?;
        tracing::info!(
            path = %path.display(),
            sources = dataset.sources.len(),
            "Template dataset loaded"
        );
        Ok(dataset)
    }

    pub fn sources(&self) -> &[TemplateSource] {
        &self.sources
    }

    /// `(collection, fields)` pairs declared in source metadata.
    pub fn metadata_fields(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.sources.iter().filter_map(|s| {
            let meta = s.metadata.as_ref()?;
            let collection = meta.collection.as_deref().filter(|c| !c.is_empty())?;
            Some((collection, meta.fields.as_slice()))
        })
    }
}

// ── Catalog ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub id: String,
    pub source_id: String,
    pub name: String,
    pub placeholders: BTreeSet<String>,
    pub full_content: String,
}

impl CatalogEntry {
    fn preview(&self) -> String {
        self.full_content.chars().take(PREVIEW_CHARS).collect()
    }
}

pub fn extract_placeholders(text: &str) -> BTreeSet<String> {
    PLACEHOLDER
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Index every non-blank paragraph that carries at least one placeholder.
/// Ids are a running counter across all sources.
pub fn build_catalog(dataset: &TemplateDataset) -> Vec<CatalogEntry> {
    let mut catalog = Vec::new();
    for source in dataset.sources() {
        for paragraph in &source.content.paragraphs {
            let text = paragraph.trim();
            if text.is_empty() {
                continue;
            }
            let placeholders = extract_placeholders(text);
            if placeholders.is_empty() {
                continue;
            }
            let n = catalog.len() + 1;
            catalog.push(CatalogEntry {
                id: n.to_string(),
                source_id: source.source_id(),
                name: format!(
                    "{} - Template {n}",
                    source.source_file.as_deref().unwrap_or("Unnamed")
                ),
                placeholders,
                full_content: text.to_string(),
            });
        }
    }
    debug!(entries = catalog.len(), "Template catalog built");
    catalog
}

// ── Selection ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct Selection {
    id: Value,
}

pub struct TemplateSelector {
    llm: Arc<dyn LlmProvider>,
}

impl TemplateSelector {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    /// Pick the best entry. Falls back to the first entry when the model
    /// fails or names an unknown id; `None` only for an empty catalog.
    pub async fn select<'a>(
        &self,
        request: &str,
        record: &ClientRecord,
        catalog: &'a [CatalogEntry],
    ) -> Option<&'a CatalogEntry> {
        let first = catalog.first()?;

        match self.ask(request, record, catalog).await {
            Ok(id) => match catalog.iter().find(|e| e.id == id) {
                Some(entry) => {
                    debug!(template_id = %entry.id, name = %entry.name, "Template selected");
                    Some(entry)
                }
                None => {
                    warn!(template_id = %id, "Model chose an unknown template, using first");
                    Some(first)
                }
            },
            Err(reason) => {
                warn!(reason = %reason, "Template selection failed, using first");
                Some(first)
            }
        }
    }

    async fn ask(
        &self,
        request: &str,
        record: &ClientRecord,
        catalog: &[CatalogEntry],
    ) -> Result<String, String> {
        let (system, user) = selection_prompts(request, record, catalog);
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
        let json = extract_json_object(&response.content);
        let selection: Selection =
            serde_json::from_str(&json).map_err(|e| format!("unparseable selection: {e}"))?;

        // Models sometimes answer with a bare number.
        match selection.id {
            Value::String(s) => Ok(s.trim().to_string()),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(format!("unexpected id {other}")),
        }
    }
}

fn selection_prompts(
    request: &str,
    record: &ClientRecord,
    catalog: &[CatalogEntry],
) -> (String, String) {
    let system = "You select the best matching email template.\n\n\
        RULES:\n\
        - Return ONLY valid JSON: {\"id\": \"template_id\"}.\n\
        - Consider both the user request and the client record fields.\n\
        - Always choose the most contextually relevant template."
        .to_string();

    let summary = catalog
        .iter()
        .map(|e| format!("{}: {} => {}...", e.id, e.name, e.preview()))
        .collect::<Vec<_>>()
        .join("\n");

    let user = format!(
        "User request: \"{request}\"\n\n\
         Client record: {}\n\n\
         Available templates:\n{summary}\n\n\
         Pick the ONE most relevant template.\n\
         Return only JSON:\n{{\"id\": \"<best_template_id>\"}}",
        record.to_json()
    );
    (system, user)
}

// ── Filling ─────────────────────────────────────────────────────────

/// Substitute record fields into `{key}` / `[key]` placeholders
/// (case-insensitive), then replace whatever is left with `N/A`.
pub fn fill_placeholders(template: &str, record: &ClientRecord) -> String {
    let mut filled = template.to_string();

    for (key, value) in record.iter() {
        if value.is_null() {
            continue;
        }
        let key = regex::escape(key);
        let pattern = match Regex::new(&format!(r"(?i)\{{{key}\}}|\[{key}\]")) {
            Ok(re) => re,
            Err(e) => {
                warn!(field = %key, error = %e, "Skipping field with unusable name");
                continue;
            }
        };
        let value = value.to_string();
        filled = pattern.replace_all(&filled, NoExpand(&value)).into_owned();
    }

    PLACEHOLDER
        .replace_all(&filled, "N/A")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;

    use super::*;
    use crate::compose::record::FieldValue;
    use crate::test_support::ScriptedLlm;

    fn dataset() -> TemplateDataset {
        TemplateDataset::from_json_str(
            &json!([
                {
                    "_id": {"$oid": "65f0"},
                    "source_file": "auto.docx",
                    "content": {"paragraphs": [
                        "Dear {Client Name}, your {Make} {Model} is ready.",
                        "   ",
                        "Thanks for reaching out.",
                        "VIN [VIN] has been logged."
                    ]},
                    "metadata": {"collection": "listings", "fields": ["VIN", "Make"]}
                },
                {
                    "content": {"paragraphs": ["Hello {Patient Name}, your results are in."]}
                }
            ])
            .to_string(),
        )
        .unwrap()
    }

    fn record(fields: &[(&str, FieldValue)]) -> ClientRecord {
        ClientRecord::new(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn catalog_skips_blank_and_placeholder_free_paragraphs() {
        let catalog = build_catalog(&dataset());
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog[0].id, "1");
        assert_eq!(catalog[0].name, "auto.docx - Template 1");
        assert_eq!(catalog[0].source_id, "65f0");
        assert_eq!(catalog[1].id, "2");
        assert!(catalog[1].placeholders.contains("VIN"));
        assert_eq!(catalog[2].name, "Unnamed - Template 3");
        assert_eq!(catalog[2].source_id, "");
    }

    #[test]
    fn placeholders_are_deduplicated() {
        let set = extract_placeholders("{A} [A] {B}");
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec!["A", "B"]);
    }

    #[test]
    fn metadata_fields_are_exposed() {
        let data = dataset();
        let meta: Vec<_> = data.metadata_fields().collect();
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0].0, "listings");
        assert_eq!(meta[0].1.to_vec(), vec!["VIN".to_string(), "Make".to_string()]);
    }

    #[test]
    fn fills_both_bracket_styles_and_marks_unknown() {
        let rec = record(&[("Name", FieldValue::Text("Ada".into()))]);
        assert_eq!(
            fill_placeholders("Hi {Name} / [Name], ref {Unknown}", &rec),
            "Hi Ada / Ada, ref N/A"
        );
    }

    #[test]
    fn fill_is_case_insensitive_and_skips_nulls() {
        let rec = record(&[
            ("Client Name", FieldValue::Text("Ada".into())),
            ("Notes", FieldValue::Null),
            ("Visits", FieldValue::Number(4.0)),
        ]);
        assert_eq!(
            fill_placeholders("  {client name}: {Notes}, {VISITS} visits  ", &rec),
            "Ada: N/A, 4 visits"
        );
    }

    #[test]
    fn fill_treats_values_literally() {
        let rec = record(&[("Price", FieldValue::Text("$1 off".into()))]);
        assert_eq!(fill_placeholders("Deal: {Price}", &rec), "Deal: $1 off");
    }

    #[tokio::test]
    async fn selector_uses_model_choice() {
        let llm = Arc::new(ScriptedLlm::replying(&["```json\n{\"id\": \"2\"}\n```"]));
        let selector = TemplateSelector::new(llm.clone());
        let catalog = build_catalog(&dataset());
        let rec = record(&[("VIN", FieldValue::Text("1HG".into()))]);

        let chosen = selector.select("VIN status", &rec, &catalog).await.unwrap();
        assert_eq!(chosen.id, "2");
        let prompt = llm.prompt(0);
        assert!(prompt.contains("VIN status"));
        assert!(prompt.contains("1: auto.docx - Template 1 => Dear {Client Name}"));
        assert!(prompt.contains("\"VIN\":\"1HG\""));
    }

    #[tokio::test]
    async fn selector_accepts_numeric_id() {
        let llm = Arc::new(ScriptedLlm::replying(&["{\"id\": 3}"]));
        let selector = TemplateSelector::new(llm);
        let catalog = build_catalog(&dataset());
        let chosen = selector
            .select("results", &ClientRecord::default(), &catalog)
            .await
            .unwrap();
        assert_eq!(chosen.id, "3");
    }

    #[tokio::test]
    async fn selector_falls_back_to_first_entry() {
        let catalog = build_catalog(&dataset());

        let unknown = TemplateSelector::new(Arc::new(ScriptedLlm::replying(&["{\"id\": \"99\"}"])));
        let chosen = unknown.select("x", &ClientRecord::default(), &catalog).await;
        assert_eq!(chosen.map(|e| e.id.as_str()), Some("1"));

        let failing = TemplateSelector::new(Arc::new(ScriptedLlm::failing()));
        let chosen = failing.select("x", &ClientRecord::default(), &catalog).await;
        assert_eq!(chosen.map(|e| e.id.as_str()), Some("1"));
    }

    #[tokio::test]
    async fn selector_returns_none_for_empty_catalog() {
        let llm = Arc::new(ScriptedLlm::failing());
        let selector = TemplateSelector::new(llm.clone());
        assert!(selector.select("x", &ClientRecord::default(), &[]).await.is_none());
        assert_eq!(llm.call_count(), 0);
    }

    #[test]
    fn preview_is_capped() {
        let entry = CatalogEntry {
            id: "1".into(),
            source_id: String::new(),
            name: "n".into(),
            placeholders: BTreeSet::new(),
            full_content: "é".repeat(100),
        };
        assert_eq!(entry.preview().chars().count(), PREVIEW_CHARS);
    }

    #[test]
    fn loads_dataset_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"source_file": "a.docx", "content": {{"paragraphs": ["Hi {{Name}}"]}}}}]"#).unwrap();
        let dataset = TemplateDataset::load(file.path()).unwrap();
        assert_eq!(build_catalog(&dataset).len(), 1);
    }

    #[test]
    fn malformed_dataset_is_a_config_error() {
        assert!(matches!(
            TemplateDataset::from_json_str("{not json"),
            Err(ConfigError::Dataset(_))
        ));
    }
}
