//! Upstream response shapes.
//!
//! Payloads are decoded into a small set of known shapes by explicit field
//! lookups: a bare array of items, an envelope object carrying an item array
//! and optional `page_meta`, or, as a last resort, an object keyed by
//! identifier.

use serde_json::{Map, Value};

use crate::error::FetchError;

/// Item array names probed when no `items_key` is configured.
const GENERIC_ITEM_KEYS: [&str; 4] = ["items", "results", "data", "records"];

/// Pagination metadata of an envelope response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageMeta {
    pub next: Option<String>,
    pub total_count: Option<u64>,
}

impl PageMeta {
    fn from_value(value: Option<&Value>) -> Self {
        let Some(Value::Object(meta)) = value else {
            return Self::default();
        };

        let next = meta
            .get("next")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|next| !next.is_empty())
            .map(str::to_owned);
        let total_count = meta.get("total_count").and_then(Value::as_u64);

        Self { next, total_count }
    }
}

/// Decoded upstream response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    /// Top-level JSON array.
    Items(Vec<Value>),
    /// Object with an item array and optional pagination metadata.
    Envelope { items: Vec<Value>, page_meta: PageMeta },
    /// Object mapping identifier to record.
    Keyed(Map<String, Value>),
}

/// Record paired with the raw identifier it was returned under.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedRecord {
    pub key: String,
    pub record: Value,
}

impl ResponsePayload {
    pub fn decode(body: &str, items_key: Option<&str>) -> Result<Self, FetchError> {
        let value: Value = serde_json::from_str(body)
            .map_err(|error| FetchError::decode(format!("response is not valid JSON: {error}")))?;
        Self::from_value(value, items_key)
    }

    pub fn from_value(value: Value, items_key: Option<&str>) -> Result<Self, FetchError> {
        match value {
            Value::Array(items) => Ok(Self::Items(items)),
            Value::Object(mut object) => {
                let page_meta = PageMeta::from_value(object.get("page_meta"));

                if let Some(key) = items_key {
                    if let Some(Value::Array(items)) = object.remove(key) {
                        return Ok(Self::Envelope { items, page_meta });
                    }
                }

                if object.contains_key("page_meta") {
                    let items = object
                        .iter_mut()
                        .find(|(name, value)| name.as_str() != "page_meta" && value.is_array())
                        .map(|(_, value)| value.take())
                        .and_then(|value| match value {
                            Value::Array(items) => Some(items),
                            _ => None,
                        })
                        .unwrap_or_default();
                    return Ok(Self::Envelope { items, page_meta });
                }

                for key in GENERIC_ITEM_KEYS {
                    if let Some(Value::Array(_)) = object.get(key) {
                        if let Some(Value::Array(items)) = object.remove(key) {
                            return Ok(Self::Envelope { items, page_meta });
                        }
                    }
                }

                Ok(Self::Keyed(object))
            }
            other => Err(FetchError::decode(format!(
                "expected a JSON array or object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn next_cursor(&self) -> Option<&str> {
        match self {
            Self::Envelope { page_meta, .. } => page_meta.next.as_deref(),
            Self::Items(_) | Self::Keyed(_) => None,
        }
    }

    /// Pair each record with its identifier. Items without a usable
    /// `id_field` are dropped and counted in the second return value.
    pub fn into_keyed_records(self, id_field: &str) -> (Vec<KeyedRecord>, usize) {
        match self {
            Self::Keyed(object) => (
                object
                    .into_iter()
                    .map(|(key, record)| KeyedRecord { key, record })
                    .collect(),
                0,
            ),
            Self::Items(items) | Self::Envelope { items, .. } => {
                let mut records = Vec::with_capacity(items.len());
                let mut unkeyed = 0;
                for record in items {
                    match record_key(&record, id_field) {
                        Some(key) => records.push(KeyedRecord { key, record }),
                        None => unkeyed += 1,
                    }
                }
                (records, unkeyed)
            }
        }
    }
}

/// Whether an upstream record is an error marker instead of data.
pub fn is_error_record(record: &Value) -> bool {
    match record {
        Value::Null => true,
        Value::Object(object) => match object.get("error") {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(_) => true,
        },
        _ => false,
    }
}

/// Message carried by an error marker, if any.
pub fn error_message(record: &Value) -> Option<String> {
    match record.get("error")? {
        Value::String(message) => Some(message.clone()),
        Value::Object(detail) => detail
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(|| Some(Value::Object(detail.clone()).to_string())),
        Value::Null | Value::Bool(false) => None,
        other => Some(other.to_string()),
    }
}

fn record_key(record: &Value, id_field: &str) -> Option<String> {
    match record.get(id_field)? {
        Value::String(key) => Some(key.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
