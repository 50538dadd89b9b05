//! Redis lock backend.
//!
//! Exclusive locks are a plain `SET key owner NX PX lease`. Fair locks add a
//! FIFO waiter list and a sorted set of waiter heartbeats next to the lock key;
//! a Lua script admits only the head of the list and purges waiters whose
//! heartbeat lapsed, so a crashed waiter cannot block the queue.
//!
//! Lock keys are hash-tagged (`lock:{key}`) so the three keys of a fair lock
//! land in the same cluster slot. The fair script reads the server clock with
//! `TIME`, which needs Redis 5 or newer.

use async_trait::async_trait;
use log::{debug, error, warn};
use redis::{AsyncCommands, Client as RedisClient, Script};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::{LockClient, LockError, LockKind, LockToken};

/// Default interval between acquisition attempts while waiting.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A fair waiter that has not polled for this long loses its queue position.
const DEFAULT_WAITER_STALE_AFTER: Duration = Duration::from_secs(2);

/// Compare-and-delete on the owner token.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// KEYS: lock, waiter list, waiter heartbeats.
/// ARGV: owner, lease ms (0 = none), waiter stale ms.
const FAIR_ACQUIRE_SCRIPT: &str = r#"
local clock = redis.call('TIME')
local now = tonumber(clock[1]) * 1000 + math.floor(tonumber(clock[2]) / 1000)
while true do
  local head = redis.call('LINDEX', KEYS[2], 0)
  if not head then break end
  local seen = redis.call('ZSCORE', KEYS[3], head)
  if seen and tonumber(seen) >= now then break end
  redis.call('LPOP', KEYS[2])
  redis.call('ZREM', KEYS[3], head)
end
if redis.call('EXISTS', KEYS[1]) == 0 then
  local head = redis.call('LINDEX', KEYS[2], 0)
  if (not head) or head == ARGV[1] then
    if head then redis.call('LPOP', KEYS[2]) end
    redis.call('ZREM', KEYS[3], ARGV[1])
    if tonumber(ARGV[2]) > 0 then
      redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    else
      redis.call('SET', KEYS[1], ARGV[1])
    end
    return 1
  end
end
if not redis.call('ZSCORE', KEYS[3], ARGV[1]) then
  redis.call('RPUSH', KEYS[2], ARGV[1])
end
redis.call('ZADD', KEYS[3], now + tonumber(ARGV[3]), ARGV[1])
redis.call('PEXPIRE', KEYS[2], tonumber(ARGV[3]) * 2)
redis.call('PEXPIRE', KEYS[3], tonumber(ARGV[3]) * 2)
return 0
"#;

/// Removes a waiter that gave up.
const FAIR_CANCEL_SCRIPT: &str = r#"
redis.call('LREM', KEYS[1], 0, ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
return 1
"#;

pub struct RedisLockClient {
    redis_client: Arc<RedisClient>,
    key_prefix: String,
    poll_interval: Duration,
    waiter_stale_after: Duration,
    release_script: Script,
    fair_acquire_script: Script,
    fair_cancel_script: Script,
}

impl RedisLockClient {
    pub fn new(redis_client: Arc<RedisClient>, key_prefix: &str) -> Self {
        Self {
            redis_client,
            key_prefix: key_prefix.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            waiter_stale_after: DEFAULT_WAITER_STALE_AFTER,
            release_script: Script::new(RELEASE_SCRIPT),
            fair_acquire_script: Script::new(FAIR_ACQUIRE_SCRIPT),
            fair_cancel_script: Script::new(FAIR_CANCEL_SCRIPT),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        // a waiter must survive many missed polls before it is purged
        self.waiter_stale_after = self.waiter_stale_after.max(poll_interval * 20);
        self
    }

    pub fn lock_key(&self, key: &str) -> String {
        format!("{}{{{}}}", self.key_prefix, key)
    }

    fn queue_key(&self, key: &str) -> String {
        format!("{}:queue", self.lock_key(key))
    }

    fn waiters_key(&self, key: &str) -> String {
        format!("{}:waiters", self.lock_key(key))
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, LockError> {
        self.redis_client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!("Redis connection failed: {}", e);
                LockError::from(e)
            })
    }

    async fn set_nx(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        token: &LockToken,
        lease: Option<Duration>,
    ) -> Result<bool, LockError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.lock_key(token.key()))
            .arg(token.owner())
            .arg("NX");
        if let Some(lease) = lease {
            cmd.arg("PX").arg(lease_millis(lease));
        }
        let reply: Option<String> = cmd.query_async(conn).await?;
        Ok(reply.is_some())
    }

    async fn fair_attempt(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        token: &LockToken,
        lease: Option<Duration>,
    ) -> Result<bool, LockError> {
        let admitted: i64 = self
            .fair_acquire_script
            .key(self.lock_key(token.key()))
            .key(self.queue_key(token.key()))
            .key(self.waiters_key(token.key()))
            .arg(token.owner())
            .arg(lease.map_or(0, lease_millis))
            .arg(self.waiter_stale_after.as_millis() as u64)
            .invoke_async(conn)
            .await?;
        Ok(admitted == 1)
    }

    async fn fair_cancel(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        token: &LockToken,
    ) -> Result<(), LockError> {
        let _: i64 = self
            .fair_cancel_script
            .key(self.queue_key(token.key()))
            .key(self.waiters_key(token.key()))
            .arg(token.owner())
            .invoke_async(conn)
            .await?;
        Ok(())
    }
}

/// A fair waiter's queue entry. Removed in the background if the waiting
/// future is dropped or fails before it was admitted or cancelled.
struct FairWaiter {
    redis_client: Arc<RedisClient>,
    cancel_script: Script,
    queue_key: String,
    waiters_key: String,
    owner: String,
    armed: bool,
}

impl Drop for FairWaiter {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                "No runtime to dequeue fair waiter on {}; it is purged once stale",
                self.queue_key
            );
            return;
        };
        let redis_client = self.redis_client.clone();
        let cancel_script = self.cancel_script.clone();
        let queue_key = std::mem::take(&mut self.queue_key);
        let waiters_key = std::mem::take(&mut self.waiters_key);
        let owner = std::mem::take(&mut self.owner);
        handle.spawn(async move {
            let cancelled: Result<i64, redis::RedisError> =
                match redis_client.get_multiplexed_async_connection().await {
                    Ok(mut conn) => {
                        cancel_script
                            .key(&queue_key)
                            .key(&waiters_key)
                            .arg(&owner)
                            .invoke_async(&mut conn)
                            .await
                    }
                    Err(e) => Err(e),
                };
            if let Err(e) = cancelled {
                warn!("Failed to dequeue abandoned waiter on {}: {}", queue_key, e);
            }
        });
    }
}

/// Redis rejects a zero millisecond expiry.
fn lease_millis(lease: Duration) -> u64 {
    (lease.as_millis() as u64).max(1)
}

#[async_trait]
impl LockClient for RedisLockClient {
    async fn try_acquire(
        &self,
        key: &str,
        lease: Option<Duration>,
    ) -> Result<Option<LockToken>, LockError> {
        let token = LockToken::new(key);
        let mut conn = self.connection().await?;
        if self.set_nx(&mut conn, &token, lease).await? {
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    async fn acquire(
        &self,
        key: &str,
        kind: LockKind,
        wait: Duration,
        lease: Option<Duration>,
    ) -> Result<Option<LockToken>, LockError> {
        let token = LockToken::new(key);
        let deadline = Instant::now() + wait;
        let mut conn = self.connection().await?;
        let mut waiter = FairWaiter {
            redis_client: self.redis_client.clone(),
            cancel_script: self.fair_cancel_script.clone(),
            queue_key: self.queue_key(key),
            waiters_key: self.waiters_key(key),
            owner: token.owner().to_string(),
            armed: kind == LockKind::Fair,
        };

        loop {
            let admitted = match kind {
                LockKind::Exclusive => self.set_nx(&mut conn, &token, lease).await?,
                LockKind::Fair => self.fair_attempt(&mut conn, &token, lease).await?,
            };
            if admitted {
                waiter.armed = false;
                return Ok(Some(token));
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }

        if kind == LockKind::Fair {
            self.fair_cancel(&mut conn, &token).await?;
            waiter.armed = false;
        }
        debug!("Gave up waiting for {} lock {}", kind, key);
        Ok(None)
    }

    async fn release(&self, token: &LockToken) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let removed: i64 = self
            .release_script
            .key(self.lock_key(token.key()))
            .arg(token.owner())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn force_release(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let removed: u64 = conn.del(self.lock_key(key)).await?;
        Ok(removed > 0)
    }
}
