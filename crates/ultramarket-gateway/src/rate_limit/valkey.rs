//! Valkey-backed sliding windows shared by every gateway instance.

use async_trait::async_trait;
use deadpool_redis::redis::Script;
use deadpool_redis::{Config, Pool, PoolConfig, Runtime, Timeouts};
use std::time::Duration;

use super::store::{Acquisition, StoreError, WindowSnapshot, WindowSpec, WindowStore};

/// Purges, counts and conditionally appends across all KEYS in one round trip.
///
/// ARGV[1] is now in ms, ARGV[2] a unique member id, then one (limit, window_ms)
/// pair per key. Returns `{admitted, count_1, oldest_1, count_2, oldest_2, ...}`
/// where oldest is -1 for an empty window.
const ACQUIRE_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local member = ARGV[2]
local admitted = 1
local result = {}

for i = 1, #KEYS do
    local limit = tonumber(ARGV[1 + i * 2])
    local window = tonumber(ARGV[2 + i * 2])
    redis.call('ZREMRANGEBYSCORE', KEYS[i], '-inf', '(' .. (now - window))
    local count = redis.call('ZCARD', KEYS[i])
    local oldest = -1
    local first = redis.call('ZRANGE', KEYS[i], 0, 0, 'WITHSCORES')
    if first[2] then
        oldest = tonumber(first[2])
    end
    if count >= limit then
        admitted = 0
    end
    result[#result + 1] = count
    result[#result + 1] = oldest
end

if admitted == 1 then
    for i = 1, #KEYS do
        local window = tonumber(ARGV[2 + i * 2])
        redis.call('ZADD', KEYS[i], now, member)
        redis.call('PEXPIRE', KEYS[i], window)
    end
end

table.insert(result, 1, admitted)
return result
";

pub struct ValkeyWindowStore {
    pool: Pool,
    key_prefix: String,
    script: Script,
}

impl std::fmt::Debug for ValkeyWindowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyWindowStore")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

impl ValkeyWindowStore {
    /// Creates the connection pool. Connections are established lazily.
    ///
    /// `timeout` bounds waiting for, creating and recycling a pooled connection.
    pub fn new(
        url: &str,
        key_prefix: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let mut config = Config::from_url(url);
        config.pool = Some(PoolConfig {
            timeouts: Timeouts {
                wait: Some(timeout),
                create: Some(timeout),
                recycle: Some(timeout),
            },
            ..PoolConfig::default()
        });
        let pool = config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            key_prefix: key_prefix.into(),
            script: Script::new(ACQUIRE_SCRIPT),
        })
    }

    fn decode(reply: &[i64], expected: usize) -> Result<Acquisition, StoreError> {
        let Some((&admitted, rest)) = reply.split_first() else {
            return Err(StoreError::Protocol("empty reply".into()));
        };
        if rest.len() != expected * 2 {
            return Err(StoreError::Protocol(format!(
                "expected {} window values, got {}",
                expected * 2,
                rest.len()
            )));
        }

        let windows = rest
            .chunks_exact(2)
            .map(|pair| WindowSnapshot {
                count: u32::try_from(pair[0]).unwrap_or(u32::MAX),
                oldest_ms: u64::try_from(pair[1]).ok(),
            })
            .collect();

        Ok(Acquisition {
            admitted: admitted == 1,
            windows,
        })
    }
}

#[async_trait]
impl WindowStore for ValkeyWindowStore {
    async fn try_acquire(
        &self,
        windows: &[WindowSpec],
        now_ms: u64,
    ) -> Result<Acquisition, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let mut invocation = self.script.prepare_invoke();
        for spec in windows {
            invocation.key(format!("{}{}", self.key_prefix, spec.key));
        }
        invocation
            .arg(now_ms)
            .arg(uuid::Uuid::new_v4().to_string());
        for spec in windows {
            invocation.arg(spec.limit).arg(spec.window_ms);
        }

        let reply: Vec<i64> = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Self::decode(&reply, windows.len())
    }

    async fn sweep(&self, _idle_before_ms: u64) -> Result<usize, StoreError> {
        // Keys carry a PEXPIRE of their window length.
        Ok(0)
    }

    fn name(&self) -> &'static str {
        "valkey"
    }
}
