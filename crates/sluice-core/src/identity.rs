//! Deterministic identity resolution.
//!
//! Raw user records carry a source identifier and, somewhere in their
//! payload, an email-like match key. [`resolve`] groups candidates by the
//! normalized key and produces at most one mapping per key, side-recording
//! everything it could not map as an [`IdentityException`].

use std::{
  collections::{BTreeMap, BTreeSet},
  sync::LazyLock,
};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};

use crate::record::compare_source_ids;

/// Payload keys searched first, in order, before falling back to a scan of
/// every nested value.
pub const DEFAULT_KEY_FIELDS: &[&str] = &[
  "email",
  "email_address",
  "login_id",
  "user_email",
  "user",
  "contact",
];

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid")
});

// ─── Types ───────────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MatchMethod {
  /// Exact match on the normalized key.
  Deterministic,
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
  Display,
  EnumString,
  AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExceptionReason {
  MissingKey,
  DuplicateKey,
}

/// One raw user record offered to the resolver.
#[derive(Debug, Clone)]
pub struct IdentityCandidate {
  pub source_user_id: String,
  pub payload:        Value,
}

/// A mapping the resolver wants to exist. `internal_id` is allocated by the
/// store when the mapping is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedMapping {
  pub source_user_id:       String,
  pub normalized_match_key: String,
  pub match_method:         MatchMethod,
  pub match_confidence:     f64,
}

/// A persisted mapping row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityMapping {
  pub mapping_id:           i64,
  pub internal_id:          i64,
  pub source_user_id:       String,
  pub normalized_match_key: String,
  pub match_method:         MatchMethod,
  pub match_confidence:     f64,
  pub active:               bool,
  pub updated_at:           DateTime<Utc>,
}

/// A candidate the resolver could not map.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct IdentityException {
  pub source_user_id:         String,
  pub reason:                 ExceptionReason,
  pub normalized_match_key:   Option<String>,
  /// For duplicates, the identity that kept the mapping.
  pub representative_user_id: Option<String>,
}

/// Output of [`resolve`]. Both lists are in a stable order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
  pub mappings:   Vec<ResolvedMapping>,
  pub exceptions: Vec<IdentityException>,
}

impl Resolution {
  pub fn count(&self, reason: ExceptionReason) -> usize {
    self.exceptions.iter().filter(|e| e.reason == reason).count()
  }
}

/// What persisting a [`Resolution`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityWriteSummary {
  pub mappings_inserted:    u64,
  pub mappings_deactivated: u64,
  pub mappings_unchanged:   u64,
  pub exceptions_inserted:  u64,
  pub exceptions_cleared:   u64,
}

// ─── Key extraction ──────────────────────────────────────────────────────────

/// Finds and normalizes the match key in a user payload.
#[derive(Debug, Clone)]
pub struct KeyExtractor {
  fields: Vec<String>,
}

impl Default for KeyExtractor {
  fn default() -> Self {
    Self::new(DEFAULT_KEY_FIELDS.iter().map(|s| s.to_string()))
  }
}

impl KeyExtractor {
  pub fn new(fields: impl IntoIterator<Item = String>) -> Self {
    Self { fields: fields.into_iter().collect() }
  }

  /// The normalized key for `payload`, if any email-shaped value exists.
  pub fn extract(&self, payload: &Value) -> Option<String> {
    self.find(payload).map(|raw| normalize_key(&raw))
  }

  fn find(&self, value: &Value) -> Option<String> {
    match value {
      Value::String(s) => {
        let s = s.trim();
        EMAIL.is_match(s).then(|| s.to_owned())
      }
      Value::Object(map) => self
        .fields
        .iter()
        .filter_map(|k| map.get(k))
        .find_map(|v| self.find(v))
        .or_else(|| map.values().find_map(|v| self.find(v))),
      Value::Array(items) => items.iter().find_map(|v| self.find(v)),
      _ => None,
    }
  }
}

/// Case-fold and trim.
pub fn normalize_key(raw: &str) -> String { raw.trim().to_lowercase() }

// ─── Resolution ──────────────────────────────────────────────────────────────

/// Resolve candidates into mappings and exceptions.
///
/// The same input always yields the same output: groups are visited in key
/// order and the representative of a duplicate group is the lowest source
/// identifier under [`compare_source_ids`]. A source identifier that appears
/// more than once is treated as one identity.
pub fn resolve(
  candidates: &[IdentityCandidate],
  extractor: &KeyExtractor,
) -> Resolution {
  let mut groups: BTreeMap<String, BTreeSet<SourceId<'_>>> = BTreeMap::new();
  let mut missing: BTreeSet<SourceId<'_>> = BTreeSet::new();

  for candidate in candidates {
    let id = SourceId(&candidate.source_user_id);
    match extractor.extract(&candidate.payload) {
      Some(key) => {
        groups.entry(key).or_default().insert(id);
      }
      None => {
        missing.insert(id);
      }
    }
  }

  // An id seen under several keys belongs to the first one only, and an id
  // seen both with and without a key resolves through its key.
  let mut claimed: BTreeSet<SourceId<'_>> = BTreeSet::new();
  for ids in groups.values_mut() {
    ids.retain(|id| claimed.insert(*id));
  }
  missing.retain(|id| !claimed.contains(id));

  let mut resolution = Resolution::default();

  for (key, ids) in groups {
    let mut ids = ids.into_iter();
    let Some(representative) = ids.next() else { continue };

    resolution.mappings.push(ResolvedMapping {
      source_user_id:       representative.0.to_owned(),
      normalized_match_key: key.clone(),
      match_method:         MatchMethod::Deterministic,
      match_confidence:     1.0,
    });

    for duplicate in ids {
      resolution.exceptions.push(IdentityException {
        source_user_id:         duplicate.0.to_owned(),
        reason:                 ExceptionReason::DuplicateKey,
        normalized_match_key:   Some(key.clone()),
        representative_user_id: Some(representative.0.to_owned()),
      });
    }
  }

  resolution
    .exceptions
    .extend(missing.into_iter().map(|id| IdentityException {
      source_user_id:         id.0.to_owned(),
      reason:                 ExceptionReason::MissingKey,
      normalized_match_key:   None,
      representative_user_id: None,
    }));

  resolution
}

/// Borrowed source id ordered with [`compare_source_ids`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SourceId<'a>(&'a str);

impl Ord for SourceId<'_> {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    compare_source_ids(self.0, other.0)
  }
}

impl PartialOrd for SourceId<'_> {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
    Some(self.cmp(other))
  }
}
