//! In-memory [`Store`] and [`EventSource`] for tests.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::{Entry, Event, EventSource, Fields, Result, Store, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Fields>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, pairs: &[(&str, &str)]) {
        let fields = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        self.entries.write().insert(key.into(), fields);
    }

    pub fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }

    pub fn get(&self, key: &str) -> Option<Fields> {
        self.entries.read().get(key).cloned()
    }

    /// Make every call fail until reset, as if the store were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            let err = ::redis::RedisError::from((::redis::ErrorKind::IoError, "store unavailable"));
            return Err(StoreError::Redis(err));
        }
        Ok(())
    }
}

/// Redis-style glob matching supporting `*` only.
fn glob_match(pattern: &str, key: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == key,
        Some((prefix, rest)) => {
            let Some(tail) = key.strip_prefix(prefix) else {
                return false;
            };
            if rest.is_empty() {
                return true;
            }
            (0..=tail.len())
                .filter(|i| tail.is_char_boundary(*i))
                .any(|i| glob_match(rest, &tail[i..]))
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn scan(&self, pattern: &str) -> Result<Vec<Entry>> {
        self.check()?;
        Ok(self
            .entries
            .read()
            .iter()
            .filter(|(key, _)| glob_match(pattern, key))
            .map(|(key, fields)| Entry { key: key.clone(), fields: fields.clone() })
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.entries.read().contains_key(key))
    }

    async fn fields(&self, key: &str) -> Result<Fields> {
        self.check()?;
        Ok(self.entries.read().get(key).cloned().unwrap_or_default())
    }

    async fn set_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        self.check()?;
        let mut entries = self.entries.write();
        let entry = entries.entry(key.to_string()).or_default();
        for (field, value) in fields {
            entry.insert(field.to_string(), value.clone());
        }
        Ok(())
    }

    async fn remove_fields(&self, key: &str, fields: &[&str]) -> Result<()> {
        self.check()?;
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(key) {
            for field in fields {
                entry.remove(*field);
            }
            // Like Redis, a hash without fields is gone.
            if entry.is_empty() {
                entries.remove(key);
            }
        }
        Ok(())
    }
}

/// Publishing half of a [`MemoryEvents`] subscription.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventPublisher {
    pub fn publish(&self, channel: &str, payload: &str) {
        // The receiver being gone only means the dispatcher stopped.
        let _ = self.tx.send(Event::new(channel, payload));
    }
}

#[derive(Debug)]
pub struct MemoryEvents {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl MemoryEvents {
    pub fn channel() -> (EventPublisher, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventPublisher { tx }, Self { rx })
    }
}

#[async_trait]
impl EventSource for MemoryEvents {
    async fn next_event(&mut self) -> Result<Option<Event>> {
        Ok(self.rx.recv().await)
    }
}
