//! Core types for the triage pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Error;

/// Category placeholder for records that have not been categorized yet.
pub const PENDING: &str = "Pending";

/// Where an email record sits in the review workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmailStatus {
    Categorized,
    Responded,
    Failed,
    Sent,
    Moved,
    Approved,
    Rejected,
    #[serde(rename = "Follow-up")]
    FollowUp,
    Edited,
}

impl EmailStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Categorized => "Categorized",
            Self::Responded => "Responded",
            Self::Failed => "Failed",
            Self::Sent => "Sent",
            Self::Moved => "Moved",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
            Self::FollowUp => "Follow-up",
            Self::Edited => "Edited",
        }
    }
}

impl fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmailStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Categorized" => Ok(Self::Categorized),
            "Responded" => Ok(Self::Responded),
            "Failed" => Ok(Self::Failed),
            "Sent" => Ok(Self::Sent),
            "Moved" => Ok(Self::Moved),
            "Approved" => Ok(Self::Approved),
            "Rejected" => Ok(Self::Rejected),
            "Follow-up" => Ok(Self::FollowUp),
            "Edited" => Ok(Self::Edited),
            other => Err(format!("unknown email status: {other}")),
        }
    }
}

/// The reply shape produced by the composer and consumed by delivery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StructuredReply {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Non-empty body text, if any.
    pub fn body_text(&self) -> Option<&str> {
        self.body.as_deref().map(str::trim).filter(|b| !b.is_empty())
    }
}

/// Stored reply for an email. Older rows hold plain text or a nested
/// `response` object, so the column is read through [`AiResponse::from_json`].
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AiResponse {
    #[default]
    Pending,
    Text(String),
    Structured(StructuredReply),
}

impl AiResponse {
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => Self::Pending,
            Value::String(s) if s == PENDING => Self::Pending,
            Value::String(s) => Self::Text(s),
            Value::Object(map) => Self::Structured(structured_from_map(&map)),
            other => Self::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Pending => Value::String(PENDING.to_string()),
            Self::Text(s) => Value::String(s.clone()),
            Self::Structured(reply) => serde_json::to_value(reply).unwrap_or(Value::Null),
        }
    }

    /// Reduce any stored shape to the four reply fields.
    pub fn normalize(&self) -> StructuredReply {
        match self {
            Self::Pending => StructuredReply::default(),
            Self::Text(s) => StructuredReply {
                body: Some(s.clone()),
                ..StructuredReply::default()
            },
            Self::Structured(reply) => reply.clone(),
        }
    }
}

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

fn structured_from_map(map: &Map<String, Value>) -> StructuredReply {
    // Legacy rows keep the body under `response`, sometimes as a nested reply.
    let body = string_field(map, "body").or_else(|| match map.get("response") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Object(inner)) => structured_from_map(inner).body,
        _ => None,
    });

    StructuredReply {
        to: string_field(map, "to"),
        subject: string_field(map, "subject"),
        body,
        error: string_field(map, "error"),
    }
}

impl Serialize for AiResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AiResponse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_json)
    }
}

/// One inbound support email and everything the workflow has attached to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailRecord {
    /// Provider message id. Unique across the store.
    pub id: String,
    pub subject: String,
    pub sender: Option<String>,
    pub sender_name: Option<String>,
    pub reply_to: Option<String>,
    /// Text extracted from the provider body, whitespace preserved.
    pub raw_body: String,
    /// `raw_body` reduced to printable characters with collapsed whitespace.
    pub body: String,
    pub category: String,
    pub status: EmailStatus,
    pub ai_response: AiResponse,
    pub folder: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
}

impl EmailRecord {
    /// Whether the batch responder may compose a reply for this record.
    pub fn is_composable(&self) -> bool {
        self.status == EmailStatus::Categorized
            && !self.category.is_empty()
            && self.category != PENDING
    }
}

/// A single send failure, kept for the daily report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedDeliveryRecord {
    pub id: String,
    pub email_id: String,
    pub recipient: String,
    pub category: String,
    pub error_message: String,
    pub created_at: DateTime<Utc>,
}

impl FailedDeliveryRecord {
    pub fn new(
        email_id: impl Into<String>,
        recipient: impl Into<String>,
        category: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            email_id: email_id.into(),
            recipient: recipient.into(),
            category: category.into(),
            error_message: error_message.into(),
            created_at: Utc::now(),
        }
    }
}

/// A category to batch-respond at a fixed time of day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledResponseSpec {
    pub id: String,
    pub category: String,
    pub hour: u32,
    pub minute: u32,
    pub folder: String,
    pub created_at: DateTime<Utc>,
}

impl ScheduledResponseSpec {
    pub fn new(
        category: impl Into<String>,
        hour: u32,
        minute: u32,
        folder: impl Into<String>,
    ) -> crate::error::Result<Self> {
        let category = category.into();
        if category.trim().is_empty() {
            return Err(Error::InvalidInput("category is required".to_string()));
        }
        if hour > 23 {
            return Err(Error::InvalidInput(format!("hour must be 0-23, got {hour}")));
        }
        if minute > 59 {
            return Err(Error::InvalidInput(format!("minute must be 0-59, got {minute}")));
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            category,
            hour,
            minute,
            folder: folder.into(),
            created_at: Utc::now(),
        })
    }
}

/// Per-id failure in a batch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub id: String,
    pub error: String,
}
