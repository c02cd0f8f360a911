use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use redis::{AsyncCommands, IntoConnectionInfo, Script, aio::ConnectionManager};

use crate::{
    config::RedisConfig,
    error::StoreResult,
    ratelimit::{BlockStatus, Increment, Policy, Store, WINDOW},
};

// A counter or block record left without a TTL (a PEXPIRE lost between
// round-trips, or a key written by hand) is given one here instead of living forever.
const INCREMENT_LUA: &str = r#"
local key = KEYS[1]
local block_key = KEYS[2]
local limit = tonumber(ARGV[1])
local block_ms = tonumber(ARGV[2])
local window_ms = tonumber(ARGV[3])

local blocked_ms = redis.call('PTTL', block_key)
if blocked_ms == -1 then
  redis.call('PEXPIRE', block_key, block_ms)
  return {0, block_ms}
end
if blocked_ms ~= -2 then
  return {0, math.max(blocked_ms, 0)}
end

local count = redis.call('INCR', key)
if count == 1 or redis.call('PTTL', key) == -1 then
  redis.call('PEXPIRE', key, window_ms)
end

if count > limit then
  redis.call('SET', block_key, '1', 'PX', block_ms)
  return {0, block_ms}
end

return {1, math.max(redis.call('PTTL', key), 0)}
"#;

/// How `increment` reaches the server.
///
/// `Script` runs check, increment and block as one server-side script and never
/// lets more than `limit` requests through. `RoundTrip` issues the commands
/// separately; the set-if-absent block write still has a single winner, but a
/// window can roll over between round-trips and let a few extra requests in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IncrementMode {
    #[default]
    Script,
    RoundTrip,
}

impl FromStr for IncrementMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "script" => Ok(Self::Script),
            "round_trip" | "roundtrip" => Ok(Self::RoundTrip),
            other => Err(format!("unsupported redis increment mode: {other}")),
        }
    }
}

pub struct RedisStore {
    manager: ConnectionManager,
    mode: IncrementMode,
    script: Script,
}

impl RedisStore {
    pub async fn connect(config: &RedisConfig) -> StoreResult<Self> {
        let mut info = format!("redis://{}", config.addr).into_connection_info()?;
        info.redis.db = config.db;
        if !config.password.is_empty() {
            info.redis.password = Some(config.password.clone());
        }

        let client = redis::Client::open(info)?;
        let mut manager = client.get_connection_manager().await?;
        let _: String = redis::cmd("PING").query_async(&mut manager).await?;

        tracing::info!(
            addr = %config.addr,
            db = config.db,
            mode = ?config.increment_mode,
            "connected to redis"
        );

        Ok(Self {
            manager,
            mode: config.increment_mode,
            script: Script::new(INCREMENT_LUA),
        })
    }

    /// Deletes both the counter and the block record for `key`.
    pub async fn reset_key(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(vec![key.to_string(), block_key(key)]).await?;
        Ok(())
    }

    async fn increment_scripted(&self, key: &str, policy: &Policy) -> StoreResult<Increment> {
        let mut conn = self.manager.clone();
        let (allowed, ttl_ms): (i64, i64) = self
            .script
            .key(key)
            .key(block_key(key))
            .arg(policy.limit)
            .arg(block_millis(policy))
            .arg(WINDOW.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        Ok(Increment {
            allowed: allowed == 1,
            ttl: Duration::from_millis(ttl_ms.max(0) as u64),
        })
    }

    async fn increment_round_trip(&self, key: &str, policy: &Policy) -> StoreResult<Increment> {
        let mut conn = self.manager.clone();
        let block_key = block_key(key);

        let blocked_ms: i64 = conn.pttl(&block_key).await?;
        if blocked_ms != -2 {
            let ttl = if blocked_ms == -1 {
                let _: () = conn.pexpire(&block_key, block_millis(policy) as i64).await?;
                policy.block_duration()
            } else {
                Duration::from_millis(blocked_ms.max(0) as u64)
            };
            return Ok(Increment {
                allowed: false,
                ttl,
            });
        }

        let count: u64 = conn.incr(key, 1).await?;
        if count == 1 {
            let _: () = conn.pexpire(key, WINDOW.as_millis() as i64).await?;
        }

        if count > policy.limit {
            let placed: Option<String> = redis::cmd("SET")
                .arg(&block_key)
                .arg(1)
                .arg("NX")
                .arg("PX")
                .arg(block_millis(policy))
                .query_async(&mut conn)
                .await?;

            let ttl = if placed.is_some() {
                policy.block_duration()
            } else {
                remaining(&mut conn, &block_key).await
            };
            return Ok(Increment {
                allowed: false,
                ttl,
            });
        }

        Ok(Increment {
            allowed: true,
            ttl: remaining(&mut conn, key).await,
        })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn increment(&self, key: &str, policy: &Policy) -> StoreResult<Increment> {
        match self.mode {
            IncrementMode::Script => self.increment_scripted(key, policy).await,
            IncrementMode::RoundTrip => self.increment_round_trip(key, policy).await,
        }
    }

    async fn is_blocked(&self, key: &str) -> StoreResult<BlockStatus> {
        let mut conn = self.manager.clone();
        let ttl_ms: i64 = conn.pttl(block_key(key)).await?;

        // -2: no such key. -1: a block without expiry, which the next increment
        // repairs with the policy's block duration; until then it does not count.
        Ok(match ttl_ms {
            -2 => BlockStatus::default(),
            -1 => {
                tracing::debug!(key, "block record has no expiry");
                BlockStatus::default()
            }
            ms => BlockStatus {
                blocked: true,
                ttl: Duration::from_millis(ms.max(0) as u64),
            },
        })
    }

    async fn get_request_count(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.manager.clone();
        let count: Option<u64> = conn.get(key).await?;
        Ok(count.unwrap_or(0))
    }
}

fn block_key(key: &str) -> String {
    format!("block:{key}")
}

/// Redis rejects a zero expiry, so a zero-second block is written as one millisecond.
fn block_millis(policy: &Policy) -> u64 {
    (policy.block_duration().as_millis() as u64).max(1)
}

/// TTL of a key we just touched. A failed or negative read is reported as zero
/// rather than failing a call whose mutation already happened.
async fn remaining(conn: &mut ConnectionManager, key: &str) -> Duration {
    let ttl: redis::RedisResult<i64> = conn.pttl(key).await;
    match ttl {
        Ok(ms) if ms > 0 => Duration::from_millis(ms as u64),
        Ok(_) => Duration::ZERO,
        Err(err) => {
            tracing::debug!(key, error = %err, "ttl lookup failed");
            Duration::ZERO
        }
    }
}
