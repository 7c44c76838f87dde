//! Redis backend for the shared store and the event bus, so several server
//! processes can host the same sessions and streams.
//!
//! Commands run on pooled blocking connections, matching the synchronous
//! [`KeyValueStore`] contract. Published events come back through one
//! pattern subscription per process, relayed into the local [`EventBus`].

use crate::events::{Event, EventBus, EventTransport};
use crate::store::{KeyValueStore, StoreError};
use redis::{Client, Commands, Connection, RedisResult, Script};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

/// Connections kept open between commands.
const MAX_IDLE_CONNECTIONS: usize = 16;

const RELAY_RETRY: Duration = Duration::from_secs(1);

/// Channels relayed into each process: `session:{id}:updates` and every
/// `lobby:*` channel.
pub const RELAY_PATTERNS: [&str; 2] = ["session:*:updates", "lobby:*"];

const COMPARE_AND_SET: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
  return 1
end
return 0
"#;

pub struct RedisStore {
    client: Client,
    idle: Mutex<Vec<Connection>>,
    cas_script: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("server", &self.client.get_connection_info().addr)
            .finish()
    }
}

impl RedisStore {
    /// Parses `url` (e.g. `redis://localhost:6379`). Connections are opened
    /// lazily, so an unreachable server surfaces on first use.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(unavailable)?;
        tracing::info!(url = %url, "redis client initialized");
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            idle: Mutex::new(Vec::new()),
            cas_script: Script::new(COMPARE_AND_SET),
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn ping(&self) -> Result<bool, StoreError> {
        let pong: String = self.with_connection(|conn| redis::cmd("PING").query(conn))?;
        Ok(pong == "PONG")
    }

    fn with_connection<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> RedisResult<T>,
    {
        let pooled = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => self.client.get_connection().map_err(unavailable)?,
        };

        let result = op(&mut conn);
        match &result {
            Err(e) if e.is_io_error() || e.is_connection_dropped() => {
                tracing::warn!(error = %e, "dropping broken redis connection");
            }
            _ => {
                let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
                if idle.len() < MAX_IDLE_CONNECTIONS {
                    idle.push(conn);
                }
            }
        }
        result.map_err(unavailable)
    }
}

impl KeyValueStore for RedisStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_connection(|conn| redis::cmd("GET").arg(key).query(conn))
    }

    fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis(ttl))
                .query(conn)
        })
    }

    fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool, StoreError> {
        let reply: Option<String> = self.with_connection(|conn| {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(millis(ttl))
                .query(conn)
        })?;
        Ok(reply.is_some())
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: &str,
        value: String,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let swapped: i64 = self.with_connection(|conn| {
            self.cas_script
                .key(key)
                .arg(expected)
                .arg(value)
                .arg(millis(ttl))
                .invoke(conn)
        })?;
        Ok(swapped == 1)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed: i64 = self.with_connection(|conn| redis::cmd("DEL").arg(key).query(conn))?;
        Ok(removed > 0)
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let armed: i64 = self.with_connection(|conn| {
            redis::cmd("PEXPIRE").arg(key).arg(millis(ttl)).query(conn)
        })?;
        Ok(armed == 1)
    }

    fn hash_set(
        &self,
        key: &str,
        field: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            redis::pipe()
                .atomic()
                .cmd("HSET")
                .arg(key)
                .arg(field)
                .arg(value)
                .ignore()
                .cmd("PEXPIRE")
                .arg(key)
                .arg(millis(ttl))
                .ignore()
                .query(conn)
        })
    }

    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.with_connection(|conn| redis::cmd("HGETALL").arg(key).query(conn))
    }

    fn hash_delete(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let removed: i64 =
            self.with_connection(|conn| redis::cmd("HDEL").arg(key).arg(field).query(conn))?;
        Ok(removed > 0)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut keys: Vec<String> = self.with_connection(|conn| {
            let keys = conn.scan_match::<_, String>(pattern.as_str())?.collect();
            Ok(keys)
        })?;
        // SCAN may repeat a key across pages.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

impl EventTransport for RedisStore {
    fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError> {
        self.with_connection(|conn| redis::cmd("PUBLISH").arg(channel).arg(payload).query(conn))
    }
}

/// Subscribes to [`RELAY_PATTERNS`] and hands every message to `bus`, for
/// as long as the task lives. Reconnects after a pause when the
/// subscription drops.
pub fn spawn_relay(client: Client, bus: EventBus) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match relay(&client, &bus).await {
                Ok(()) => tracing::warn!("redis subscription closed"),
                Err(e) => tracing::warn!(error = %e, "redis subscription failed"),
            }
            tokio::time::sleep(RELAY_RETRY).await;
        }
    })
}

async fn relay(client: &Client, bus: &EventBus) -> RedisResult<()> {
    let mut pubsub = client.get_async_pubsub().await?;
    for pattern in RELAY_PATTERNS {
        pubsub.psubscribe(pattern).await?;
    }
    tracing::info!(patterns = ?RELAY_PATTERNS, "relaying shared events");

    let mut messages = std::pin::pin!(pubsub.on_message());
    while let Some(message) = messages.next().await {
        let channel = message.get_channel_name().to_string();
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "unreadable shared event");
                continue;
            }
        };
        match serde_json::from_str::<Event>(&payload) {
            Ok(event) => {
                bus.deliver(&channel, event);
            }
            Err(e) => tracing::warn!(channel = %channel, error = %e, "undecodable shared event"),
        }
    }
    Ok(())
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn unavailable(err: redis::RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}
