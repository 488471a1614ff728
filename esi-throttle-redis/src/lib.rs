//! Redis bucket store for `esi-throttle` (companion crate).
//! Bring your own connection; bucket records are plain string values with a
//! millisecond TTL, and compare-and-swap runs as a server-side script.

use async_trait::async_trait;
use esi_throttle::store::KeyValueStore;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::{AsyncCommands, RedisError, Script};
use std::time::Duration;

// KEYS[1] key; ARGV: expected value, '1' if a value is expected, new value, ttl ms.
const COMPARE_AND_SWAP: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[2] == '1' then
  if current ~= ARGV[1] then return 0 end
elseif current then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
return 1
";

/// [`KeyValueStore`] over a Redis connection.
#[derive(Clone)]
pub struct RedisStore<C = ConnectionManager> {
    conn: C,
    compare_and_swap: Script,
}

impl<C> std::fmt::Debug for RedisStore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("conn", &"<redis connection>").finish()
    }
}

impl RedisStore<ConnectionManager> {
    /// Open `url` and wrap a reconnecting connection manager.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!(target: "esi_throttle::redis", "connected bucket store");
        Ok(Self::new(conn))
    }
}

impl<C> RedisStore<C>
where
    C: ConnectionLike + Clone + Send + Sync,
{
    /// Use an existing multiplexed connection or connection manager.
    pub fn new(conn: C) -> Self {
        Self { conn, compare_and_swap: Script::new(COMPARE_AND_SWAP) }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl<C> KeyValueStore for RedisStore<C>
where
    C: ConnectionLike + Clone + Send + Sync,
{
    type Error = RedisError;

    async fn get_raw(&self, key: &str) -> Result<Option<String>, RedisError> {
        let mut conn = self.conn.clone();
        conn.get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RedisError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, RedisError> {
        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .compare_and_swap
            .key(key)
            .arg(expected.unwrap_or(""))
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        if swapped == 0 {
            tracing::debug!(target: "esi_throttle::redis", key, "compare-and-swap lost a race");
        }
        Ok(swapped == 1)
    }
}
