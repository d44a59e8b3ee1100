//! Access to the shared desired-state store.
//!
//! The traffic-control engine of the platform writes shaping, filter and load-balancing records
//! into a key/value store and announces changes on two pub/sub channels. This crate exposes that
//! store behind the [`Store`] and [`EventSource`] traits, decodes the records and knows the key
//! layout. [`redis`] provides the production backend; the `test-utils` feature adds an in-memory
//! one.

use std::collections::HashMap;

use async_trait::async_trait;

mod keys;
pub use keys::KeySchema;

pub mod record;
pub use record::{FilterRecord, LbRecord, RecordError, ServiceType, ShapingRecord};

pub mod redis;
pub use self::redis::{RedisEvents, RedisStore};

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

/// The field map of a single hash entry.
pub type Fields = HashMap<String, String>;

/// A single store entry returned by [`Store::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub fields: Fields,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("invalid record at {key}: {source}")]
    Record { key: String, source: RecordError },
    #[error("event stream closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Read/write access to the desired-state store.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Returns all entries whose key matches the glob `pattern`. Implementations must page
    /// through the keyspace rather than read it in a single call.
    async fn scan(&self, pattern: &str) -> Result<Vec<Entry>>;

    /// Returns `true` if `key` exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Returns the fields of `key`, empty if the key does not exist.
    async fn fields(&self, key: &str) -> Result<Fields>;

    /// Sets `fields` on the hash at `key`.
    async fn set_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<()>;

    /// Removes `fields` from the hash at `key`. Missing fields are ignored.
    async fn remove_fields(&self, key: &str, fields: &[&str]) -> Result<()>;
}

/// A message received on one of the subscribed channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub channel: String,
    pub payload: String,
}

impl Event {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self { channel: channel.into(), payload: payload.into() }
    }
}

/// A subscription delivering channel-tagged events.
#[async_trait]
pub trait EventSource: Send + 'static {
    /// Waits for the next event. `Ok(None)` means the subscription ended.
    async fn next_event(&mut self) -> Result<Option<Event>>;
}
