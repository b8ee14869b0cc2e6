//! Records as stored in local collections and on the remote.
//!
//! A record is a JSON object with a mandatory `id` (string or integer) plus
//! arbitrary domain fields. The sync core never interprets domain fields
//! except for the timestamps used by conflict resolution.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SyncError;

/// Field stamped by the cloud mirror when a record is pushed.
pub const SYNCED_AT_FIELD: &str = "syncedAt";

/// Field stamped on every local write.
pub const LAST_MODIFIED_FIELD: &str = "lastModified";

/// Timestamp fields consulted in order when comparing two versions.
pub const TIMESTAMP_FIELDS: [&str; 5] = [
    SYNCED_AT_FIELD,
    LAST_MODIFIED_FIELD,
    "updatedAt",
    "createdAt",
    "timestamp",
];

/// Normalised record identifier.
///
/// Numeric and string ids are compared by their string form, so `7` and
/// `"7"` name the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct RecordId(String);

impl RecordId {
    /// Extracts an id from a JSON value. Empty strings are not ids.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl TryFrom<Value> for RecordId {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        RecordId::from_value(&value).ok_or_else(|| format!("not a record id: {}", value))
    }
}

impl From<RecordId> for Value {
    fn from(id: RecordId) -> Self {
        Value::String(id.0)
    }
}

/// A domain record with a stable id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Record {
    id: RecordId,
    fields: Map<String, Value>,
}

impl Record {
    /// Builds a record from a JSON object, validating its `id`.
    pub fn new(fields: Map<String, Value>) -> Result<Self, SyncError> {
        let id = fields
            .get("id")
            .and_then(RecordId::from_value)
            .ok_or_else(|| SyncError::InvalidRecord("record has no usable 'id' field".into()))?;
        Ok(Self { id, fields })
    }

    /// Builds a record from any JSON value; only objects are accepted.
    pub fn from_value(value: Value) -> Result<Self, SyncError> {
        match value {
            Value::Object(fields) => Self::new(fields),
            other => Err(SyncError::InvalidRecord(format!(
                "expected a JSON object, got {}",
                other
            ))),
        }
    }

    /// A record carrying nothing but its id (used for delete payloads).
    pub fn with_id(id: &RecordId) -> Self {
        let mut fields = Map::new();
        fields.insert("id".to_string(), Value::String(id.as_str().to_string()));
        Self {
            id: id.clone(),
            fields,
        }
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    /// Sets a field. Changing `id` is allowed only to another valid id.
    pub fn set(&mut self, field: &str, value: Value) -> Result<(), SyncError> {
        if field == "id" {
            self.id = RecordId::from_value(&value)
                .ok_or_else(|| SyncError::InvalidRecord(format!("invalid id: {}", value)))?;
        }
        self.fields.insert(field.to_string(), value);
        Ok(())
    }

    /// Stamps the synchronization timestamp.
    pub fn stamp_synced_at(&mut self, at: DateTime<Utc>) {
        self.fields.insert(
            SYNCED_AT_FIELD.to_string(),
            Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
    }

    /// Marks a local edit: stamps `lastModified` and drops any `syncedAt`
    /// carried over from the last sync, so the edit is what gets compared.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.fields.remove(SYNCED_AT_FIELD);
        self.fields.insert(
            LAST_MODIFIED_FIELD.to_string(),
            Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
    }

    /// Reconciliation timestamp in epoch milliseconds.
    ///
    /// Walks [`TIMESTAMP_FIELDS`] and returns the first one that parses, or 0
    /// when the record carries no usable timestamp.
    pub fn timestamp_millis(&self) -> i64 {
        TIMESTAMP_FIELDS
            .iter()
            .filter_map(|field| self.fields.get(*field))
            .find_map(parse_timestamp)
            .unwrap_or(0)
    }

    /// Internal constructor for maps already known to carry `id`.
    pub(crate) fn from_parts(id: RecordId, fields: Map<String, Value>) -> Self {
        Self { id, fields }
    }
}

impl TryFrom<Map<String, Value>> for Record {
    type Error = SyncError;

    fn try_from(fields: Map<String, Value>) -> Result<Self, Self::Error> {
        Record::new(fields)
    }
}

impl From<Record> for Map<String, Value> {
    fn from(record: Record) -> Self {
        record.fields
    }
}

/// True for values the merge strategy treats as "not filled in".
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Parses epoch milliseconds or a date/time string into epoch milliseconds.
fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) if !s.is_empty() => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp_millis());
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
                return Some(naive.and_utc().timestamp_millis());
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc().timestamp_millis())
        }
        _ => None,
    }
}
