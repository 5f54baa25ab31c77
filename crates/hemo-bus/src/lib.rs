//! Message-bus layer for HemoStat agents.
//!
//! The bus is the only inter-agent medium: publish/subscribe channels plus a
//! keyed JSON store with TTLs and bounded lists. [`RedisBus`] is the
//! production implementation; [`MemoryBus`] backs the test suites.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use futures_util::StreamExt;
use hemo_proto::{Agent, Envelope};
use redis::AsyncCommands;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub mod retry;

pub use retry::RetryPolicy;

/// Namespace applied to every key and channel on the wire.
const KEY_PREFIX: &str = "hemostat";

/// Transport timeout for individual bus commands.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus connect error: {0}")]
    Connect(String),

    #[error("bus command error: {0}")]
    Command(String),

    #[error("bus command timed out")]
    Timeout,

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<redis::RedisError> for BusError {
    fn from(e: redis::RedisError) -> Self {
        Self::Command(e.to_string())
    }
}

// ─── Bus trait ───────────────────────────────────────────────────────────────

/// A message delivered on a subscribed channel.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Receiving half of a subscription. Messages arrive in publish order per
/// channel; the consumer drains one at a time, which is what preserves the
/// pipeline's per-container causal ordering.
pub struct Subscription {
    rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

/// Pub/sub channels plus a keyed value store with TTLs and bounded lists.
/// Channel and key names are logical (unprefixed); implementations apply
/// the `hemostat:` namespace at the wire.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;

    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription, BusError>;

    async fn kv_get(&self, key: &str) -> Result<Option<String>, BusError>;

    async fn kv_set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), BusError>;

    async fn kv_expire(&self, key: &str, ttl_secs: u64) -> Result<(), BusError>;

    /// Keys matching a glob pattern (dashboard read model only).
    async fn kv_keys(&self, pattern: &str) -> Result<Vec<String>, BusError>;

    async fn lpush(&self, key: &str, value: &str) -> Result<(), BusError>;

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), BusError>;

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, BusError>;

    async fn ping(&self) -> Result<(), BusError>;
}

// ─── Typed helpers ───────────────────────────────────────────────────────────

/// Read and deserialize keyed state. Missing keys, transport errors, and
/// malformed JSON all come back as `None` so a bad entry never poisons the
/// consumer.
pub async fn get_state<T: DeserializeOwned>(bus: &dyn Bus, key: &str) -> Option<T> {
    match bus.kv_get(key).await {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                error!(key, error = %e, "failed to deserialize shared state");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            error!(key, error = %e, "failed to read shared state");
            None
        }
    }
}

/// Serialize and store keyed state with an optional TTL.
pub async fn set_state<T: Serialize>(
    bus: &dyn Bus,
    key: &str,
    value: &T,
    ttl_secs: Option<u64>,
) -> Result<(), BusError> {
    let raw = serde_json::to_string(value)?;
    bus.kv_set(key, &raw, ttl_secs).await
}

/// Wrap `data` in the event envelope and publish with bounded retry.
pub async fn publish_event(
    bus: &dyn Bus,
    policy: &RetryPolicy,
    channel: &str,
    event_type: &str,
    agent: Agent,
    data: serde_json::Value,
) -> Result<(), BusError> {
    let envelope = Envelope::new(event_type, agent, data);
    let payload = serde_json::to_string(&envelope)?;

    retry::with_backoff("bus publish", policy, || async {
        bus.publish(channel, &payload).await
    })
    .await?;

    info!(event_type, channel, "published event");
    Ok(())
}

// ─── RedisBus ────────────────────────────────────────────────────────────────

/// Redis-backed bus. Commands go through a shared [`redis::aio::ConnectionManager`];
/// each subscription gets its own pub/sub connection driven by a background task.
pub struct RedisBus {
    client: redis::Client,
    manager: redis::aio::ConnectionManager,
}

impl RedisBus {
    /// Connect with exponential backoff. Exhausting the attempts is fatal for
    /// the calling process (startup exit 1).
    pub async fn connect_with_retry(
        url: &str,
        max_attempts: u32,
        base_delay: Duration,
    ) -> Result<Self, BusError> {
        let client =
            redis::Client::open(url).map_err(|e| BusError::Connect(e.to_string()))?;

        let mut attempt = 0u32;
        loop {
            match redis::aio::ConnectionManager::new(client.clone()).await {
                Ok(manager) => {
                    info!(url, "connected to bus");
                    return Ok(Self { client, manager });
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        error!(url, attempts = max_attempts, error = %e, "bus connect failed");
                        return Err(BusError::Connect(e.to_string()));
                    }
                    let delay = base_delay * 2u32.pow(attempt - 1);
                    warn!(
                        url,
                        attempt,
                        max_attempts,
                        delay_secs = delay.as_secs_f64(),
                        error = %e,
                        "bus connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn full_key(key: &str) -> String {
        format!("{KEY_PREFIX}:{key}")
    }

    async fn timed<T>(
        fut: impl std::future::Future<Output = Result<T, redis::RedisError>>,
    ) -> Result<T, BusError> {
        match tokio::time::timeout(COMMAND_TIMEOUT, fut).await {
            Ok(result) => result.map_err(BusError::from),
            Err(_) => Err(BusError::Timeout),
        }
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.manager.clone();
        let full = Self::full_key(channel);
        let receivers: i64 = Self::timed(conn.publish(&full, payload)).await?;
        debug!(channel, receivers, "published to bus channel");
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        for channel in channels {
            pubsub
                .subscribe(Self::full_key(channel))
                .await
                .map_err(BusError::from)?;
            info!(channel, "subscribed to bus channel");
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg
                    .get_channel_name()
                    .strip_prefix(&format!("{KEY_PREFIX}:"))
                    .unwrap_or_else(|| msg.get_channel_name())
                    .to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        error!(channel, error = %e, "failed to decode bus payload");
                        continue;
                    }
                };
                if tx.send(BusMessage { channel, payload }).await.is_err() {
                    // Receiver dropped; subscription is done.
                    break;
                }
            }
            debug!("pub/sub delivery task stopped");
        });

        Ok(Subscription { rx })
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, BusError> {
        let mut conn = self.manager.clone();
        Self::timed(conn.get(Self::full_key(key))).await
    }

    async fn kv_set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), BusError> {
        let mut conn = self.manager.clone();
        let full = Self::full_key(key);
        match ttl_secs {
            Some(ttl) => Self::timed(conn.set_ex(&full, value, ttl)).await,
            None => Self::timed(conn.set(&full, value)).await,
        }
    }

    async fn kv_expire(&self, key: &str, ttl_secs: u64) -> Result<(), BusError> {
        let mut conn = self.manager.clone();
        let _: bool = Self::timed(conn.expire(Self::full_key(key), ttl_secs as i64)).await?;
        Ok(())
    }

    async fn kv_keys(&self, pattern: &str) -> Result<Vec<String>, BusError> {
        let mut conn = self.manager.clone();
        let found: Vec<String> = Self::timed(conn.keys(Self::full_key(pattern))).await?;
        let prefix = format!("{KEY_PREFIX}:");
        Ok(found
            .into_iter()
            .map(|k| k.strip_prefix(&prefix).map(str::to_string).unwrap_or(k))
            .collect())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), BusError> {
        let mut conn = self.manager.clone();
        let _: i64 = Self::timed(conn.lpush(Self::full_key(key), value)).await?;
        Ok(())
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), BusError> {
        let mut conn = self.manager.clone();
        Self::timed(conn.ltrim(Self::full_key(key), start, stop)).await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, BusError> {
        let mut conn = self.manager.clone();
        Self::timed(conn.lrange(Self::full_key(key), start, stop)).await
    }

    async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self.manager.clone();
        let reply: String = Self::timed(redis::cmd("PING").query_async(&mut conn)).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(BusError::Command(format!("unexpected ping reply: {reply}")))
        }
    }
}

// ─── MemoryBus ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    values: HashMap<String, String>,
    lists: HashMap<String, Vec<String>>,
    expiries: HashMap<String, Instant>,
    subscribers: HashMap<String, Vec<mpsc::Sender<BusMessage>>>,
    published: Vec<(String, String)>,
}

impl MemoryState {
    fn drop_expired(&mut self) {
        let now = Instant::now();
        let dead: Vec<String> = self
            .expiries
            .iter()
            .filter(|(_, at)| now >= **at)
            .map(|(k, _)| k.clone())
            .collect();
        for key in dead {
            self.values.remove(&key);
            self.lists.remove(&key);
            self.expiries.remove(&key);
        }
    }
}

/// In-memory bus for tests: same contract as [`RedisBus`], plus a captured
/// log of everything published for assertions.
#[derive(Default)]
pub struct MemoryBus {
    state: Mutex<MemoryState>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// All `(channel, payload)` pairs published so far, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.state.lock().expect("bus lock").published.clone()
    }

    /// Published payloads on one channel, parsed as envelopes.
    pub fn published_envelopes(&self, channel: &str) -> Vec<Envelope> {
        self.published()
            .into_iter()
            .filter(|(c, _)| c == channel)
            .filter_map(|(_, p)| serde_json::from_str(&p).ok())
            .collect()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let senders = {
            let mut state = self.state.lock().expect("bus lock");
            state
                .published
                .push((channel.to_string(), payload.to_string()));
            state
                .subscribers
                .get(channel)
                .cloned()
                .unwrap_or_default()
        };
        for tx in senders {
            let _ = tx
                .send(BusMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                })
                .await;
        }
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(64);
        let mut state = self.state.lock().expect("bus lock");
        for channel in channels {
            state
                .subscribers
                .entry(channel.to_string())
                .or_default()
                .push(tx.clone());
        }
        Ok(Subscription { rx })
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, BusError> {
        let mut state = self.state.lock().expect("bus lock");
        state.drop_expired();
        Ok(state.values.get(key).cloned())
    }

    async fn kv_set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), BusError> {
        let mut state = self.state.lock().expect("bus lock");
        state.values.insert(key.to_string(), value.to_string());
        match ttl_secs {
            Some(ttl) => {
                state
                    .expiries
                    .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl));
            }
            None => {
                state.expiries.remove(key);
            }
        }
        Ok(())
    }

    async fn kv_expire(&self, key: &str, ttl_secs: u64) -> Result<(), BusError> {
        let mut state = self.state.lock().expect("bus lock");
        state
            .expiries
            .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
        Ok(())
    }

    async fn kv_keys(&self, pattern: &str) -> Result<Vec<String>, BusError> {
        let mut state = self.state.lock().expect("bus lock");
        state.drop_expired();
        // Only the trailing-star form is needed by the read model.
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        Ok(state
            .values
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<(), BusError> {
        let mut state = self.state.lock().expect("bus lock");
        state.drop_expired();
        state
            .lists
            .entry(key.to_string())
            .or_default()
            .insert(0, value.to_string());
        Ok(())
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), BusError> {
        let mut state = self.state.lock().expect("bus lock");
        if let Some(list) = state.lists.get_mut(key) {
            let len = list.len() as isize;
            let start = start.clamp(0, len);
            let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
            if stop < start {
                list.clear();
            } else {
                list.truncate(stop as usize + 1);
                list.drain(..(start as usize).min(list.len()));
            }
        }
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, BusError> {
        let mut state = self.state.lock().expect("bus lock");
        state.drop_expired();
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        let start = start.clamp(0, len);
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if stop < start || list.is_empty() {
            return Ok(Vec::new());
        }
        Ok(list[start as usize..=(stop as usize).min(list.len() - 1)].to_vec())
    }

    async fn ping(&self) -> Result<(), BusError> {
        Ok(())
    }
}
