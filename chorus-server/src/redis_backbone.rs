//! Redis-backed shared counter and pub/sub.
//!
//! Commands go over one multiplexed connection. Each subscribed channel
//! gets its own pub/sub connection so a failure on one channel never takes
//! the other down with it.

use async_trait::async_trait;
use chorus_core::{BackboneError, PubSubBackbone, SharedCounter, Subscription};
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError, Script};

/// Add a delta to the counter, clamp at zero, store and return the result.
const ADJUST_CLAMPED: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local next = current + tonumber(ARGV[1])
if next < 0 then next = 0 end
redis.call('SET', KEYS[1], next)
return next
";

#[derive(Clone)]
pub struct RedisBackbone {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisBackbone {
    /// Open the command connection. Subscriptions connect lazily.
    pub async fn connect(url: &str) -> Result<Self, BackboneError> {
        let client = Client::open(url).map_err(unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;
        Ok(Self { client, conn })
    }

    /// Counter stored under `key`.
    pub fn counter(&self, key: impl Into<String>) -> RedisCounter {
        RedisCounter {
            conn: self.conn.clone(),
            key: key.into(),
            adjust: Script::new(ADJUST_CLAMPED),
        }
    }
}

#[async_trait]
impl PubSubBackbone for RedisBackbone {
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BackboneError> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(command("PUBLISH"))?;
        Ok(usize::try_from(receivers).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackboneError> {
        let subscribe_error = |e: RedisError| BackboneError::Subscribe {
            channel: channel.to_string(),
            reason: e.to_string(),
        };

        let mut pubsub = self.client.get_async_pubsub().await.map_err(subscribe_error)?;
        pubsub.subscribe(channel).await.map_err(subscribe_error)?;

        let (tx, subscription) = Subscription::channel(channel);
        let name = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            // Subscription dropped; stop reading.
                            return;
                        }
                    }
                    Err(e) => log::warn!("Undecodable payload on {name}: {e}"),
                }
            }
            log::warn!("Redis closed the {name} subscription");
        });

        Ok(subscription)
    }
}

/// [`SharedCounter`] over a Redis integer key.
#[derive(Clone)]
pub struct RedisCounter {
    conn: MultiplexedConnection,
    key: String,
    adjust: Script,
}

#[async_trait]
impl SharedCounter for RedisCounter {
    async fn ensure_initialized(&self) -> Result<(), BackboneError> {
        let mut conn = self.conn.clone();
        let created: bool = conn
            .set_nx(&self.key, 0)
            .await
            .map_err(command("SETNX"))?;
        if created {
            log::info!("Initialized {} to 0", self.key);
        }
        Ok(())
    }

    async fn increment(&self) -> Result<i64, BackboneError> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.incr(&self.key, 1).await.map_err(command("INCR"))?;
        Ok(count)
    }

    async fn decrement(&self) -> Result<i64, BackboneError> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.decr(&self.key, 1).await.map_err(command("DECR"))?;
        Ok(count)
    }

    async fn read(&self) -> Result<i64, BackboneError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn.get(&self.key).await.map_err(command("GET"))?;
        Ok(value.unwrap_or(0))
    }

    async fn adjust_by(&self, delta: i64) -> Result<i64, BackboneError> {
        let mut conn = self.conn.clone();
        let count: i64 = self
            .adjust
            .key(&self.key)
            .arg(delta)
            .invoke_async(&mut conn)
            .await
            .map_err(command("EVAL"))?;
        Ok(count)
    }
}

fn unavailable(e: RedisError) -> BackboneError {
    BackboneError::Unavailable(e.to_string())
}

fn command(op: &'static str) -> impl Fn(RedisError) -> BackboneError {
    move |e| BackboneError::Command {
        op,
        reason: e.to_string(),
    }
}
