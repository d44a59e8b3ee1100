//! Redis backend for [`Store`] and [`EventSource`].

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use redis::{aio::ConnectionManager, AsyncCommands, Client, Msg};
use tracing::{debug, info};

use crate::{Entry, Event, EventSource, Fields, Result, Store, StoreError};

/// Number of keys requested per `SCAN` round-trip.
const SCAN_CHUNK: usize = 50;

/// A [`Store`] backed by Redis hashes.
///
/// The connection manager reconnects transparently; it is cheap to clone, so every call works on
/// its own handle.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("addr", &self.client.get_connection_info().addr).finish()
    }
}

impl RedisStore {
    /// Opens a connection to `url` and checks it with a `PING`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let mut conn = client.get_connection_manager().await?;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(url, %pong, "connected to store");

        Ok(Self { client, conn })
    }

    /// Subscribes to `channels` on a dedicated connection.
    pub async fn subscribe(&self, channels: &[String]) -> Result<RedisEvents> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
            info!(%channel, "subscribed");
        }

        Ok(RedisEvents { messages: Box::pin(pubsub.into_on_message()) })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn scan(&self, pattern: &str) -> Result<Vec<Entry>> {
        let mut conn = self.conn.clone();
        let mut entries = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_CHUNK)
                .query_async(&mut conn)
                .await?;

            for key in keys {
                let fields: Fields = conn.hgetall(&key).await?;
                // The key may have been removed between the scan and the read.
                if !fields.is_empty() {
                    entries.push(Entry { key, fields });
                }
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(entries)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn fields(&self, key: &str) -> Result<Fields> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn set_fields(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset_multiple::<_, _, _, ()>(key, fields).await?;
        Ok(())
    }

    async fn remove_fields(&self, key: &str, fields: &[&str]) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(key, fields).await?;
        Ok(())
    }
}

/// Messages received on the channels passed to [`RedisStore::subscribe`].
pub struct RedisEvents {
    messages: Pin<Box<dyn Stream<Item = Msg> + Send>>,
}

impl std::fmt::Debug for RedisEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisEvents").finish_non_exhaustive()
    }
}

#[async_trait]
impl EventSource for RedisEvents {
    async fn next_event(&mut self) -> Result<Option<Event>> {
        let Some(msg) = self.messages.next().await else {
            return Ok(None);
        };

        let payload: String = msg.get_payload().map_err(StoreError::Redis)?;
        Ok(Some(Event::new(msg.get_channel_name(), payload)))
    }
}
