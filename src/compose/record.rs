//! Client records and the filter language used to look them up.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Number, Value};

/// A single field value in a client record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Date(DateTime<Utc>),
    Null,
}

impl FieldValue {
    /// Strings that parse as RFC 3339 timestamps become dates.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Text(b.to_string()),
            Value::Number(n) => Self::Number(n.as_f64().unwrap_or_default()),
            Value::String(s) => match DateTime::parse_from_rfc3339(s) {
                Ok(dt) => Self::Date(dt.with_timezone(&Utc)),
                Err(_) => Self::Text(s.clone()),
            },
            other => Self::Text(other.to_string()),
        }
    }

    /// JSON form for prompts. Dates are rendered as strings.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::Number(n) if is_whole(*n) => Value::Number(Number::from(*n as i64)),
            Self::Number(n) => Number::from_f64(*n).map_or(Value::Null, Value::Number),
            Self::Date(dt) => Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true)),
            Self::Null => Value::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

fn is_whole(n: f64) -> bool {
    n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Number(n) if is_whole(*n) => write!(f, "{}", *n as i64),
            Self::Number(n) => write!(f, "{n}"),
            Self::Date(dt) => f.write_str(&dt.to_rfc3339_opts(SecondsFormat::Secs, true)),
            Self::Null => Ok(()),
        }
    }
}

/// An ordered set of named fields. The storage-internal `_id` is never included.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientRecord {
    fields: Vec<(String, FieldValue)>,
}

impl ClientRecord {
    pub fn new(fields: Vec<(String, FieldValue)>) -> Self {
        Self {
            fields: fields.into_iter().filter(|(k, _)| k != "_id").collect(),
        }
    }

    pub fn from_json_object(map: &Map<String, Value>) -> Self {
        Self::new(
            map.iter()
                .map(|(k, v)| (k.clone(), FieldValue::from_json(v)))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Display text of a non-null, non-empty field.
    pub fn text(&self, key: &str) -> Option<String> {
        self.get(key)
            .filter(|v| !v.is_null())
            .map(ToString::to_string)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn to_json(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

/// A `$regex` condition, compiled once when the filter is built.
/// Equality compares the source pattern and flags.
#[derive(Debug, Clone)]
pub struct FilterPattern {
    source: String,
    case_insensitive: bool,
    /// `None` for a pattern that does not compile; it matches nothing.
    compiled: Option<Regex>,
}

impl FilterPattern {
    pub fn new(source: impl Into<String>, case_insensitive: bool) -> Self {
        let source = source.into();
        let compiled = match RegexBuilder::new(&source)
            .case_insensitive(case_insensitive)
            .build()
        {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::debug!(pattern = %source, error = %e, "Ignoring invalid filter pattern");
                None
            }
        };
        Self {
            source,
            case_insensitive,
            compiled,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_case_insensitive(&self) -> bool {
        self.case_insensitive
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.compiled.as_ref().is_some_and(|re| re.is_match(text))
    }
}

impl PartialEq for FilterPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.case_insensitive == other.case_insensitive
    }
}

/// One side of a filter entry.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Literal(FieldValue),
    Regex(FilterPattern),
}

impl FilterValue {
    pub fn regex(pattern: impl Into<String>, case_insensitive: bool) -> Self {
        Self::Regex(FilterPattern::new(pattern, case_insensitive))
    }

    /// A missing field only matches a null literal.
    pub fn matches(&self, value: Option<&FieldValue>) -> bool {
        match self {
            Self::Literal(FieldValue::Null) => value.is_none_or(FieldValue::is_null),
            Self::Literal(expected) => value == Some(expected),
            Self::Regex(pattern) => value
                .filter(|v| !v.is_null())
                .is_some_and(|v| pattern.is_match(&v.to_string())),
        }
    }
}

/// A lookup against one collection of client records.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub collection: String,
    pub filter: Vec<(String, FilterValue)>,
}

impl QuerySpec {
    pub fn new(collection: impl Into<String>, filter: Vec<(String, FilterValue)>) -> Self {
        Self {
            collection: collection.into(),
            filter,
        }
    }

    /// Parse the `{"collection": .., "query": {..}}` shape. Only `$regex`
    /// (with optional `$options`) and `$eq` operators are understood.
    pub fn from_json(value: &Value) -> Result<Self, String> {
        let obj = value.as_object().ok_or("query must be a JSON object")?;
        let collection = obj
            .get("collection")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or("query is missing a collection")?;

        let mut filter = Vec::new();
        match obj.get("query") {
            None | Some(Value::Null) => {}
            Some(Value::Object(query)) => {
                for (field, condition) in query {
                    filter.push((field.clone(), parse_condition(field, condition)?));
                }
            }
            Some(_) => return Err("query filter must be an object".to_string()),
        }

        Ok(Self::new(collection, filter))
    }

    /// Turn literal string values into anchored, escaped, case-insensitive
    /// patterns so `Ada` matches `ADA` but not `Adamson`.
    pub fn normalized(&self) -> Self {
        let filter = self
            .filter
            .iter()
            .map(|(field, value)| {
                let value = match value {
                    FilterValue::Literal(FieldValue::Text(s)) => {
                        FilterValue::regex(format!("^{}$", regex::escape(s)), true)
                    }
                    other => other.clone(),
                };
                (field.clone(), value)
            })
            .collect();
        Self::new(self.collection.clone(), filter)
    }

    pub fn matches(&self, record: &ClientRecord) -> bool {
        self.filter
            .iter()
            .all(|(field, value)| value.matches(record.get(field)))
    }
}

fn parse_condition(field: &str, condition: &Value) -> Result<FilterValue, String> {
    let Value::Object(ops) = condition else {
        return Ok(FilterValue::Literal(FieldValue::from_json(condition)));
    };

    if let Some(pattern) = ops.get("$regex") {
        let pattern = pattern
            .as_str()
            .ok_or_else(|| format!("$regex for {field} must be a string"))?;
        let case_insensitive = ops
            .get("$options")
            .and_then(Value::as_str)
            .is_some_and(|o| o.contains('i'));
        if let Some(op) = ops.keys().find(|k| *k != "$regex" && *k != "$options") {
            return Err(format!("unsupported operator {op} for {field}"));
        }
        return Ok(FilterValue::regex(pattern, case_insensitive));
    }

    match (ops.len(), ops.get("$eq")) {
        (1, Some(value)) => Ok(FilterValue::Literal(FieldValue::from_json(value))),
        _ => Err(format!("unsupported filter for {field}")),
    }
}
