//! Subject-line categorizer.
//!
//! Ordered keyword rules run first and short-circuit the LLM entirely. Only
//! subjects that match no rule are sent to the model, whose free-form answer
//! is mapped back onto the fixed category list.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, warn};

use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};

pub const UNKNOWN_CATEGORY: &str = "Unknown";

/// Categories and their trigger phrases. Order matters: the first match wins.
pub const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "Billing Issues",
        &[
            "invoice",
            "payment",
            "refund",
            "billing",
            "charge",
            "overcharge",
            "subscription",
            "fee",
        ],
    ),
    (
        "Technical Support",
        &[
            "error",
            "bug",
            "issue",
            "crash",
            "not working",
            "troubleshoot",
            "server down",
        ],
    ),
    (
        "Account Management",
        &[
            "password reset",
            "login issue",
            "update profile",
            "account locked",
            "change email",
        ],
    ),
    (
        "Claims & Disputes",
        &[
            "claim",
            "dispute",
            "case number",
            "ticket",
            "resolution",
            "complaint",
        ],
    ),
    (
        "General Inquiry",
        &["help", "support", "question", "details", "assistance"],
    ),
    (
        "Medical Inquiry",
        &[
            "nurse",
            "psychiatry",
            "doctor",
            "hospital",
            "clinic",
            "medical",
        ],
    ),
];

/// A category with its compiled whole-word patterns.
#[derive(Debug, Clone)]
struct CategoryRule {
    name: &'static str,
    patterns: Vec<Regex>,
}

static CATEGORY_RULES: LazyLock<Vec<CategoryRule>> = LazyLock::new(|| {
    CATEGORY_KEYWORDS
        .iter()
        .map(|&(name, keywords)| CategoryRule {
            name,
            patterns: keywords
                .iter()
                .map(|kw| {
                    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(kw)))
                        .expect("escaped category keyword must compile")
                })
                .collect(),
        })
        .collect()
});

pub struct Categorizer {
    llm: Arc<dyn LlmProvider>,
}

impl Categorizer {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    /// Keyword pass only.
    pub fn match_keywords(&self, subject: &str) -> Option<&'static str> {
        CATEGORY_RULES
            .iter()
            .find(|rule| rule.patterns.iter().any(|re| re.is_match(subject)))
            .map(|rule| rule.name)
    }

    /// Never fails: a model error degrades to [`UNKNOWN_CATEGORY`].
    pub async fn categorize(&self, subject: &str) -> String {
        if let Some(category) = self.match_keywords(subject) {
            debug!(subject = %subject, category, "Categorized by keyword");
            return category.to_string();
        }

        match self.classify_with_llm(subject).await {
            Ok(category) => {
                debug!(subject = %subject, category, "Categorized by LLM");
                category.to_string()
            }
            Err(e) => {
                warn!(subject = %subject, error = %e, "LLM categorization failed, using Unknown");
                UNKNOWN_CATEGORY.to_string()
            }
        }
    }

    async fn classify_with_llm(&self, subject: &str) -> Result<&'static str, LlmError> {
        let categories = CATEGORY_KEYWORDS
            .iter()
            .map(|(name, _)| format!("- {name}"))
            .collect::<Vec<_>>()
            .join("\n");
        let system = format!(
            "You classify customer support emails by their subject line.\n\
             Answer with exactly one category name from this list and nothing else:\n\
             {categories}\n\
             If none fits, answer {UNKNOWN_CATEGORY}."
        );

        let request = CompletionRequest::new(vec![
            ChatMessage::system(system),
            ChatMessage::user(format!("Subject: {subject}")),
        ])
        .with_temperature(0.0)
        .with_max_tokens(20);

        let response = self.llm.complete(request).await?;
        Ok(normalize_category(&response.content))
    }
}

/// Map a free-form answer onto a canonical category name.
pub fn normalize_category(answer: &str) -> &'static str {
    let lowered = answer.to_lowercase();
    CATEGORY_KEYWORDS
        .iter()
        .map(|(name, _)| *name)
        .find(|name| lowered.contains(&name.to_lowercase()))
        .unwrap_or(UNKNOWN_CATEGORY)
}
