//! Per-source high-water marks for incremental ingestion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The persisted watermark row for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
  pub source_name:     String,
  /// `None` means no watermark has been established yet.
  pub last_updated_at: Option<DateTime<Utc>>,
  pub updated_at:      DateTime<Utc>,
}

/// Watermark value threaded explicitly through an ingestion run.
///
/// The engine receives the prior state, filters against it, and hands back
/// the proposed next state. Persisting it is the caller's job and only
/// happens once the run has succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WatermarkState {
  pub last_updated_at: Option<DateTime<Utc>>,
}

impl WatermarkState {
  pub fn new(last_updated_at: Option<DateTime<Utc>>) -> Self {
    Self { last_updated_at }
  }

  /// A record is stale when it carries a timestamp at or below the mark.
  pub fn is_stale(&self, record_updated_at: DateTime<Utc>) -> bool {
    self
      .last_updated_at
      .is_some_and(|mark| record_updated_at <= mark)
  }

  /// Combine with a candidate maximum; never moves backwards.
  pub fn advanced(self, candidate: Option<DateTime<Utc>>) -> Self {
    let last_updated_at = match (self.last_updated_at, candidate) {
      (Some(current), Some(c)) => Some(current.max(c)),
      (current, c) => current.or(c),
    };
    Self { last_updated_at }
  }
}

impl From<Option<Watermark>> for WatermarkState {
  fn from(value: Option<Watermark>) -> Self {
    Self::new(value.and_then(|w| w.last_updated_at))
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone;

  use super::*;

  fn ts(h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap()
  }

  #[test]
  fn empty_state_treats_everything_as_new() {
    let state = WatermarkState::default();
    assert!(!state.is_stale(ts(0)));
  }

  #[test]
  fn stale_is_inclusive() {
    let state = WatermarkState::new(Some(ts(2)));
    assert!(state.is_stale(ts(1)));
    assert!(state.is_stale(ts(2)));
    assert!(!state.is_stale(ts(3)));
  }

  #[test]
  fn advance_never_regresses() {
    let state = WatermarkState::new(Some(ts(5)));
    assert_eq!(state.advanced(Some(ts(3))).last_updated_at, Some(ts(5)));
    assert_eq!(state.advanced(Some(ts(7))).last_updated_at, Some(ts(7)));
    assert_eq!(state.advanced(None).last_updated_at, Some(ts(5)));
    assert_eq!(
      WatermarkState::default().advanced(Some(ts(1))).last_updated_at,
      Some(ts(1))
    );
  }
}
