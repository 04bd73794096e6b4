use accp_config::RedisConfig;
use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, PoolConfig, Runtime, Timeouts};
use redis::{RedisError, Script};
use std::future::Future;
use std::time::Duration;

use super::{SecondaryStore, StoreError, StoreResult};

const INCREMENT_WITH_TTL: &str = r#"
local c = redis.call('INCR', KEYS[1])
if c == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return c
"#;

const INCREMENT_WITH_CAP: &str = r#"
local c = redis.call('INCR', KEYS[1])
if c >= tonumber(ARGV[1]) then
  redis.call('SET', KEYS[1], 0, 'KEEPTTL')
  c = 0
end
return c
"#;

/// Redis + RedisJSON binding of [`SecondaryStore`].
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    timeout: Duration,
    increment_ttl: Script,
    increment_cap: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("pool", &self.pool.status())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisStore {
    /// Build the pool and verify one connection can be made.
    pub async fn connect(config: &RedisConfig) -> StoreResult<Self> {
        let timeout = config.timeout();
        let mut redis_config = Config::from_url(&config.url);
        redis_config.pool = Some(PoolConfig {
            max_size: config.pool_size,
            timeouts: Timeouts {
                wait: Some(timeout),
                create: Some(timeout),
                recycle: Some(timeout),
            },
        });

        let pool = redis_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::transport(format!("failed to create Redis pool: {e}")))?;

        let store = Self {
            pool,
            timeout,
            increment_ttl: Script::new(INCREMENT_WITH_TTL),
            increment_cap: Script::new(INCREMENT_WITH_CAP),
        };
        store.ping().await?;
        tracing::info!(url = %config.url, pool_size = config.pool_size, "Connected to Redis");
        Ok(store)
    }

    async fn conn(&self) -> StoreResult<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::transport(format!("Redis pool: {e}")))
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::transport(format!(
                "{op} timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

fn transport(e: RedisError) -> StoreError {
    // RedisJSON reports missing paths as errors rather than nil.
    let msg = e.to_string();
    if msg.contains("does not exist") || msg.contains("not exist") {
        StoreError::NotFound
    } else {
        StoreError::Transport(msg)
    }
}

/// `$`-style paths answer with an array of matches; keep the first one.
fn first_match(raw: String, path: &str) -> StoreResult<String> {
    if !path.starts_with('$') {
        return Ok(raw);
    }
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| StoreError::transport(format!("invalid JSON.GET reply: {e}")))?;
    match value {
        serde_json::Value::Array(mut matches) if !matches.is_empty() => {
            Ok(matches.swap_remove(0).to_string())
        }
        serde_json::Value::Array(_) => Err(StoreError::NotFound),
        other => Ok(other.to_string()),
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl SecondaryStore for RedisStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.bounded("SET", async {
            let mut conn = self.conn().await?;
            let _: () = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(millis(ttl))
                .query_async(&mut conn)
                .await
                .map_err(transport)?;
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<String> {
        self.bounded("GET", async {
            let mut conn = self.conn().await?;
            let value: Option<String> = redis::cmd("GET")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(transport)?;
            value.ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.bounded("DEL", async {
            let mut conn = self.conn().await?;
            let _: i64 = redis::cmd("DEL")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(transport)?;
            Ok(())
        })
        .await
    }

    async fn touch(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.bounded("PEXPIRE", async {
            let mut conn = self.conn().await?;
            let updated: i64 = redis::cmd("PEXPIRE")
                .arg(key)
                .arg(millis(ttl))
                .query_async(&mut conn)
                .await
                .map_err(transport)?;
            if updated == 1 {
                Ok(())
            } else {
                Err(StoreError::NotFound)
            }
        })
        .await
    }

    async fn json_get(&self, key: &str, path: &str) -> StoreResult<String> {
        self.bounded("JSON.GET", async {
            let mut conn = self.conn().await?;
            let raw: Option<String> = redis::cmd("JSON.GET")
                .arg(key)
                .arg(path)
                .query_async(&mut conn)
                .await
                .map_err(transport)?;
            first_match(raw.ok_or(StoreError::NotFound)?, path)
        })
        .await
    }

    async fn json_set(&self, key: &str, path: &str, json: &str) -> StoreResult<()> {
        self.bounded("JSON.SET", async {
            let mut conn = self.conn().await?;
            let reply: Option<String> = redis::cmd("JSON.SET")
                .arg(key)
                .arg(path)
                .arg(json)
                .query_async(&mut conn)
                .await
                .map_err(transport)?;
            // nil: the parent of a non-root path is missing
            reply.map(|_| ()).ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn json_set_if_absent(&self, key: &str, path: &str, json: &str) -> StoreResult<bool> {
        self.bounded("JSON.SET NX", async {
            let mut conn = self.conn().await?;
            let reply: Option<String> = redis::cmd("JSON.SET")
                .arg(key)
                .arg(path)
                .arg(json)
                .arg("NX")
                .query_async(&mut conn)
                .await
                .map_err(transport)?;
            Ok(reply.is_some())
        })
        .await
    }

    async fn json_delete(&self, key: &str, path: &str) -> StoreResult<()> {
        self.bounded("JSON.DEL", async {
            let mut conn = self.conn().await?;
            let _: i64 = redis::cmd("JSON.DEL")
                .arg(key)
                .arg(path)
                .query_async(&mut conn)
                .await
                .map_err(transport)?;
            Ok(())
        })
        .await
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        self.bounded("INCR+PEXPIRE", async {
            let mut conn = self.conn().await?;
            let mut invocation = self.increment_ttl.prepare_invoke();
            invocation.key(key).arg(millis(ttl));
            let value: i64 = invocation
                .invoke_async(&mut conn)
                .await
                .map_err(transport)?;
            Ok(value)
        })
        .await
    }

    async fn increment_with_cap(&self, key: &str, cap: i64) -> StoreResult<i64> {
        self.bounded("INCR+CAP", async {
            let mut conn = self.conn().await?;
            let mut invocation = self.increment_cap.prepare_invoke();
            invocation.key(key).arg(cap);
            let value: i64 = invocation
                .invoke_async(&mut conn)
                .await
                .map_err(transport)?;
            Ok(value)
        })
        .await
    }

    async fn get_counter(&self, key: &str) -> StoreResult<i64> {
        self.bounded("GET", async {
            let mut conn = self.conn().await?;
            let value: Option<i64> = redis::cmd("GET")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(transport)?;
            value.ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.bounded("PING", async {
            let mut conn = self.conn().await?;
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(transport)?;
            Ok(())
        })
        .await
    }
}
