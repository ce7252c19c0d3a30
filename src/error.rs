//! Error taxonomies for the storage and fetch layers.
//!
//! Storage errors never leave the cache: the store logs them and degrades to a
//! pass-through. Fetch errors reach subscribers only after the retry budget is
//! spent, and only as a soft `error` field next to the last good data.

use thiserror::Error;

/// Durable-medium I/O failures. Non-fatal by contract.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
  /// The medium's quota is full. Triggers oldest-N eviction and one retry.
  #[error("storage capacity exceeded: {0}")]
  CapacityExceeded(String),

  #[error("storage i/o failed: {0}")]
  Io(String),

  #[error("snapshot serialization failed: {0}")]
  Serialization(String),

  #[error("storage lock poisoned")]
  LockPoisoned,
}

impl StorageError {
  pub fn is_capacity_exceeded(&self) -> bool {
    matches!(self, StorageError::CapacityExceeded(_))
  }
}

/// Remote fetch failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
  /// Transport-level failure (DNS, TLS, connection, timeout).
  #[error("network error: {0}")]
  Network(String),

  /// Non-success HTTP status.
  #[error("request failed with status {status}: {message}")]
  Http { status: u16, message: String },

  /// Response body is not the expected `{success, data, error}` envelope.
  /// Callers treat this as "no data available", never as a hard failure.
  #[error("malformed response envelope: {0}")]
  MalformedResponse(String),
}
