// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Stream metadata and the well-known keys exchanged when a stream opens.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identifies the agent on its stream metadata; required, exactly once.
pub const AGENT_ID: &str = "agentID";
/// Returned to agents so they can distinguish servers behind a balancer.
pub const SERVER_ID: &str = "serverID";
/// Returned to agents as a fleet-size hint for opening parallel streams.
pub const SERVER_COUNT: &str = "serverCount";
/// Carries the agent's bearer token when authentication is enabled.
pub const AUTHENTICATION_TOKEN: &str = "proxy-authentication-token";
pub const AUTHENTICATION_TOKEN_SCHEME_PREFIX: &str = "Bearer ";

/// Key/values attached to a stream at open time, in either direction.
///
/// Keys map to lists of values, matching the semantics of the transports
/// these streams arrive over.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
  entries: BTreeMap<String, Vec<String>>,
}

#[derive(thiserror::Error, Debug)]
pub enum MetadataError {
  #[error("metadata key {0:?} is absent")]
  Missing(String),
  #[error("metadata key {0:?} has {1} values, expected exactly one")]
  Ambiguous(String, usize),
}

impl StreamMetadata {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
  where
    K: Into<String>,
    V: Into<String>,
  {
    let mut metadata = Self::new();
    for (key, value) in pairs {
      metadata.append(key, value);
    }
    metadata
  }

  pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
    self
      .entries
      .entry(key.into())
      .or_default()
      .push(value.into());
  }

  pub fn get_all(&self, key: &str) -> &[String] {
    self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
  }

  /// The single value under `key`, rejecting absence and duplicates alike.
  pub fn exactly_one(&self, key: &str) -> Result<&str, MetadataError> {
    match self.get_all(key) {
      [] => Err(MetadataError::Missing(key.to_string())),
      [value] => Ok(value),
      values => Err(MetadataError::Ambiguous(key.to_string(), values.len())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn exactly_one_accepts_single_values() {
    let metadata = StreamMetadata::from_pairs([(AGENT_ID, "agent-a")]);
    assert_eq!(metadata.exactly_one(AGENT_ID).unwrap(), "agent-a");
  }

  #[test]
  fn exactly_one_rejects_absent_and_duplicate_keys() {
    let mut metadata = StreamMetadata::new();
    assert!(matches!(
      metadata.exactly_one(AGENT_ID),
      Err(MetadataError::Missing(_))
    ));
    metadata.append(AGENT_ID, "agent-a");
    metadata.append(AGENT_ID, "agent-b");
    assert!(matches!(
      metadata.exactly_one(AGENT_ID),
      Err(MetadataError::Ambiguous(_, 2))
    ));
  }

  #[test]
  fn metadata_survives_serialization() {
    let metadata = StreamMetadata::from_pairs([(SERVER_ID, "s1"), (SERVER_COUNT, "3")]);
    let encoded = serde_json::to_vec(&metadata).unwrap();
    let decoded: StreamMetadata = serde_json::from_slice(&encoded).unwrap();
    assert_eq!(metadata, decoded);
  }
}
