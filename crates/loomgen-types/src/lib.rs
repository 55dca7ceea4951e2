//! Shared types and errors for the Loomgen pipeline engine.
//!
//! This crate provides the foundational types used across all other Loomgen crates:
//! - `LoomError` — unified error taxonomy
//! - `Record` — an insertion-ordered field map, the unit of data flowing through a pipeline
//! - `Batch` — an ordered group of records with a terminal marker

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unified error type for all Loomgen subsystems.
#[derive(Debug, thiserror::Error)]
pub enum LoomError {
    // === Generation backend errors ===
    #[error("Provider {provider} returned HTTP {status}: {message}")]
    Backend {
        provider: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Rate limited by {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    #[error("Authentication failed for provider {provider}")]
    Authentication { provider: String },

    #[error("Request to {provider} timed out after {timeout_ms}ms")]
    RequestTimeout { provider: String, timeout_ms: u64 },

    #[error("Provider {provider} returned an invalid completion: {message}")]
    InvalidResponse { provider: String, message: String },

    #[error("Retry budget exhausted for provider {provider} after {attempts} attempts")]
    RetriesExhausted { provider: String, attempts: usize },

    // === Step / pipeline errors ===
    #[error("Step '{step}' configuration error: {message}")]
    Configuration { step: String, message: String },

    #[error("Pipeline graph validation failed: {0}")]
    GraphValidation(String),

    #[error("Step '{step}' pipeline error: {message}")]
    Pipeline { step: String, message: String },

    // === Descriptor errors ===
    #[error("Cannot resolve type '{module}.{name}' in the step registry")]
    UnresolvableType { module: String, name: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl LoomError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LoomError::RateLimited { .. }
                | LoomError::RequestTimeout { .. }
                | LoomError::Backend { retryable: true, .. }
        )
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoomError::Authentication { .. }
                | LoomError::Configuration { .. }
                | LoomError::GraphValidation(_)
                | LoomError::UnresolvableType { .. }
        )
    }
}

/// A convenience alias for `Result<T, LoomError>`.
pub type Result<T> = std::result::Result<T, LoomError>;

// ---------------------------------------------------------------------------
// Record — insertion-ordered field map
// ---------------------------------------------------------------------------

/// One unit of data flowing through the pipeline: an ordered mapping from
/// field name to JSON value.
///
/// Field order is insertion order and survives serialization, so dumps and
/// test fixtures compare deterministically. Setting an existing field
/// overwrites its value in place without changing its position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: Vec<(String, serde_json::Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Build a record from `(name, value)` pairs, preserving their order.
    pub fn from_pairs<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, serde_json::Value)>,
    {
        let mut record = Self::new();
        for (key, value) in pairs {
            record.set(key, value);
        }
        record
    }

    /// Insert or overwrite a field. Overwriting keeps the field's position.
    pub fn set(&mut self, name: impl Into<String>, value: serde_json::Value) {
        let name = name.into();
        match self.fields.iter_mut().find(|(k, _)| *k == name) {
            Some((_, v)) => *v = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == name)
    }

    /// Rename a field in place, keeping its position. Returns `true` if the
    /// field existed.
    pub fn rename(&mut self, from: &str, to: impl Into<String>) -> bool {
        match self.fields.iter_mut().find(|(k, _)| k == from) {
            Some((k, _)) => {
                *k = to.into();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct RecordVisitor;

        impl<'de> Visitor<'de> for RecordVisitor {
            type Value = Record;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map of field names to JSON values")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Record, A::Error> {
                let mut record = Record::new();
                while let Some((key, value)) = access.next_entry::<String, serde_json::Value>()? {
                    record.set(key, value);
                }
                Ok(record)
            }
        }

        deserializer.deserialize_map(RecordVisitor)
    }
}

// ---------------------------------------------------------------------------
// Batch — an ordered group of records with a terminal marker
// ---------------------------------------------------------------------------

/// An ordered sequence of records plus a flag marking the last batch a step
/// will emit. A step must not emit any batch after one with `last == true`;
/// the pipeline runner enforces this.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub records: Vec<Record>,
    pub last: bool,
}

impl Batch {
    pub fn new(records: Vec<Record>, last: bool) -> Self {
        Self { records, last }
    }

    /// A batch carrying the final records of a step's output.
    pub fn terminal(records: Vec<Record>) -> Self {
        Self {
            records,
            last: true,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
