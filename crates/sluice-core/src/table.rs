//! Validated table identifiers.
//!
//! Raw tables are created on demand from caller-supplied names, so every name
//! that reaches SQL goes through [`TableName`] first.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const MAX_LEN: usize = 63;

/// A lowercase SQL identifier: `[a-z_][a-z0-9_]*`, at most 63 characters.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl TableName {
  pub fn new(name: impl Into<String>) -> Result<Self> {
    let name = name.into();
    let mut chars = name.chars();
    let valid_head = chars
      .next()
      .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_tail =
      chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if !valid_head || !valid_tail || name.len() > MAX_LEN {
      return Err(Error::InvalidTableName(name));
    }
    Ok(Self(name))
  }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for TableName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl FromStr for TableName {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> { Self::new(s) }
}

impl TryFrom<String> for TableName {
  type Error = Error;

  fn try_from(value: String) -> Result<Self> { Self::new(value) }
}

impl From<TableName> for String {
  fn from(value: TableName) -> Self { value.0 }
}

impl AsRef<str> for TableName {
  fn as_ref(&self) -> &str { &self.0 }
}
