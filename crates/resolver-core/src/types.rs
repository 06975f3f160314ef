//! Core data types for the supplier resolver.
//!
//! These mirror the data model: an untyped input row (`RawRecord`), the
//! normalizer's output (`CleanedRecord`), a registry hit (`Candidate`),
//! and the resolved outcome for one input row (`MatchResult`), plus the
//! on-disk shape of a checkpointed result (`CheckpointRow`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A scalar value carried by a [`RawRecord`] field.
///
/// Numeric-looking fields that may carry leading zeros (postal codes,
/// SIRET/SIREN) must always be read as [`Value::Text`], never
/// [`Value::Int`] — the loader is responsible for that distinction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Text(String),
    Int(i64),
    Float(f64),
    Null,
}

impl Value {
    /// Render as a string the way the normalizer and ID extraction expect.
    pub fn as_str(&self) -> Option<String> {
        match self {
            Value::Text(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Text(_) => None,
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Null => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Value::Text(s) => s.trim().is_empty(),
            Value::Null => true,
            _ => false,
        }
    }
}

/// An untyped input row: field name (as seen in the source file) to value.
///
/// Field names are not fixed; `resolverd::ingest` resolves the aliases
/// against this map at load time. `input_id` is derived once at ingest
/// time and carried alongside the raw fields rather than being a field
/// lookup on every use downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub input_id: String,
    pub fields: BTreeMap<String, Value>,
}

impl RawRecord {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// Output of the Normalizer (C1). Pure data, worker-local and short-lived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanedRecord {
    pub clean_name: String,
    pub search_token: String,
    /// Invariant: when present, matches `^[0-9]{5}$`.
    pub clean_postal: Option<String>,
    pub clean_city: Option<String>,
}

impl CleanedRecord {
    /// `true` when the cascade has nothing to route on (the NORMALIZE
    /// step's "no postal & no city" edge case).
    pub fn has_no_location(&self) -> bool {
        self.clean_postal.is_none() && self.clean_city.is_none()
    }
}

/// A candidate establishment retrieved from the registry (C2). Only
/// administratively-active establishments are ever materialized here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub establishment_id: String,
    pub company_id: String,
    pub official_name: String,
    pub city: String,
    pub address: String,
    pub is_head_office: bool,
}

impl Candidate {
    /// Invariant: `company_id == establishment_id[0..9]`.
    pub fn company_id_from_establishment(establishment_id: &str) -> Option<&str> {
        establishment_id.get(0..9)
    }
}

/// The method by which a [`MatchResult`] was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Method {
    DirectId,
    StrictLocal,
    Calculated,
    Arbiter,
    NotFound,
    Error,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectId => "DIRECT_ID",
            Self::StrictLocal => "STRICT_LOCAL",
            Self::Calculated => "CALCULATED",
            Self::Arbiter => "ARBITER",
            Self::NotFound => "NOT_FOUND",
            Self::Error => "ERROR",
        }
    }
}

/// The resolved outcome for one input row.
///
/// Invariants (enforced by the constructors below, never by callers
/// poking fields directly):
/// - `method == NotFound` iff `resolved_establishment_id.is_none() && error.is_none()`.
/// - `confidence == 0.0` for `NotFound`/`Error`.
/// - `confidence == 1.0` for `DirectId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub input_id: String,
    pub resolved_establishment_id: Option<String>,
    pub official_name: Option<String>,
    pub confidence: f64,
    pub method: Method,
    /// Up to `MAX_ALTERNATIVES` establishment ids, in scoring order, after
    /// the chosen one.
    pub alternatives: Vec<String>,
    pub error: Option<String>,
    pub debug: BTreeMap<String, String>,
}

impl MatchResult {
    pub const MAX_ALTERNATIVES: usize = 5;

    pub fn direct_id(input_id: String, establishment_id: String, official_name: String) -> Self {
        Self {
            input_id,
            resolved_establishment_id: Some(establishment_id),
            official_name: Some(official_name),
            confidence: 1.0,
            method: Method::DirectId,
            alternatives: Vec::new(),
            error: None,
            debug: BTreeMap::new(),
        }
    }

    pub fn not_found(input_id: String, debug: BTreeMap<String, String>) -> Self {
        Self {
            input_id,
            resolved_establishment_id: None,
            official_name: None,
            confidence: 0.0,
            method: Method::NotFound,
            alternatives: Vec::new(),
            error: None,
            debug,
        }
    }

    pub fn error(input_id: String, kind: &str, message: &str) -> Self {
        let mut debug = BTreeMap::new();
        debug.insert("error_kind".to_string(), kind.to_string());
        Self {
            input_id,
            resolved_establishment_id: None,
            official_name: None,
            confidence: 0.0,
            method: Method::Error,
            alternatives: Vec::new(),
            error: Some(format!("{kind}: {message}")),
            debug,
        }
    }

    pub fn scored(
        input_id: String,
        method: Method,
        establishment_id: String,
        official_name: String,
        score_out_of_100: u32,
        alternatives: Vec<String>,
    ) -> Self {
        debug_assert!(matches!(
            method,
            Method::StrictLocal | Method::Calculated | Method::Arbiter
        ));
        let confidence = if matches!(method, Method::StrictLocal) {
            0.95
        } else {
            f64::from(score_out_of_100) / 100.0
        };
        Self {
            input_id,
            resolved_establishment_id: Some(establishment_id),
            official_name: Some(official_name),
            confidence,
            method,
            alternatives: alternatives
                .into_iter()
                .take(Self::MAX_ALTERNATIVES)
                .collect(),
            error: None,
            debug: BTreeMap::new(),
        }
    }

    /// Used by property tests (confidence bounds + per-method fixed points).
    pub fn respects_confidence_invariants(&self) -> bool {
        if !(0.0..=1.0).contains(&self.confidence) {
            return false;
        }
        match self.method {
            Method::DirectId => self.confidence == 1.0,
            Method::NotFound | Method::Error => self.confidence == 0.0,
            _ => true,
        }
    }
}

/// One row in the CheckpointStore (C5): a [`MatchResult`] plus its last
/// update timestamp, stored as Unix millis to avoid a timezone-aware
/// dependency purely for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRow {
    pub result: MatchResult,
    pub updated_at_ms: i64,
}
