//! Redis counting backend for `quotagate` (companion crate).
//!
//! [`RedisCounterStore`] keeps one integer key per window. The increment runs as a Lua script so
//! `INCR` and the first-hit `PEXPIRE` land in one atomic step: concurrent processes never lose an
//! increment, and a crash can never leave a counter without an expiry.
//!
//! [`build_limiter`] assembles the whole stack from a [`LimiterConfig`].

use async_trait::async_trait;
use quotagate::config::Backend;
use quotagate::telemetry::{NullSink, TelemetrySink};
use quotagate::{
    ConfigError, CounterKey, CounterStore, FailoverCounterStore, LimiterConfig, RateLimiter,
    StoreError, TimeoutPolicy, WindowCount,
};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script};
use std::fmt;
use std::time::Duration;
use tokio::sync::OnceCell;

const BACKEND: &str = "redis";

/// Returns `{count, pttl}`. The expiry is only set on the first hit of a window, and re-set if a
/// key somehow has none, so the original deadline is kept for every later increment.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Connection settings for [`RedisCounterStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisStoreConfig {
    pub url: String,
    /// Bound on establishing the connection.
    pub connection_timeout: Duration,
    /// Bound on each command, including the increment script.
    pub operation_timeout: Duration,
}

impl RedisStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        let defaults = LimiterConfig::default();
        Self {
            url: url.into(),
            connection_timeout: defaults.store.connection_timeout,
            operation_timeout: defaults.store.operation_timeout,
        }
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Pull the `store.*` settings out of a limiter config. Errors if no URL is set.
    pub fn from_limiter_config(config: &LimiterConfig) -> Result<Self, ConfigError> {
        let url = config.store.url.clone().ok_or(ConfigError::MissingUrl)?;
        Ok(Self {
            url,
            connection_timeout: config.store.connection_timeout,
            operation_timeout: config.store.operation_timeout,
        })
    }
}

/// Distributed counter store on Redis.
///
/// The connection is opened once and shared by every call; `ConnectionManager` reconnects on its
/// own after a dropped link. If the first connect fails, the next call tries again.
pub struct RedisCounterStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    connect_timeout: TimeoutPolicy,
    operation_timeout: TimeoutPolicy,
    increment: Script,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("connected", &self.is_connected())
            .field("connect_timeout", &self.connect_timeout.duration())
            .field("operation_timeout", &self.operation_timeout.duration())
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Build the store without touching the network. The connection is made on first use.
    ///
    /// # Errors
    /// Returns `Err` if the URL cannot be parsed or a timeout is zero.
    pub fn lazy(config: RedisStoreConfig) -> Result<Self, ConfigError> {
        let client = Client::open(config.url.as_str())
            .map_err(|_| ConfigError::InvalidValue { key: "store.url".to_string(), value: config.url.clone() })?;
        let connect_timeout = TimeoutPolicy::new(config.connection_timeout).map_err(|_| {
            ConfigError::InvalidTimeout { name: "store.connectionTimeout", value: config.connection_timeout }
        })?;
        let operation_timeout = TimeoutPolicy::new(config.operation_timeout).map_err(|_| {
            ConfigError::InvalidTimeout { name: "store.operationTimeout", value: config.operation_timeout }
        })?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            connect_timeout,
            operation_timeout,
            increment: Script::new(INCREMENT_SCRIPT),
        })
    }

    /// Build the store and connect now.
    ///
    /// # Errors
    /// Returns `Err` if the server cannot be reached within `connection_timeout`.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self, StoreError> {
        let store = Self::lazy(config).map_err(|e| StoreError::unavailable(BACKEND, e.to_string()))?;
        store.ensure_connected().await?;
        Ok(store)
    }

    /// Open the connection if it is not open yet.
    pub async fn ensure_connected(&self) -> Result<(), StoreError> {
        self.connection().await.map(|_| ())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.initialized()
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        if let Some(conn) = self.connection.get() {
            return Ok(conn.clone());
        }
        self.connect_timeout
            .execute("connect", async {
                self.connection
                    .get_or_try_init(|| async {
                        let conn = ConnectionManager::new(self.client.clone()).await.map_err(unavailable)?;
                        tracing::info!(target: "quotagate::redis", "connected to redis");
                        Ok::<_, StoreError>(conn)
                    })
                    .await
                    .cloned()
            })
            .await
    }
}

fn unavailable(e: RedisError) -> StoreError {
    StoreError::unavailable(BACKEND, e.to_string())
}

fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// `PTTL` reports 0 for a key with under a millisecond left; a live window never reports a
/// zero wait.
fn remaining_ttl(ttl_ms: i64, window_ms: u64) -> Duration {
    Duration::from_millis(u64::try_from(ttl_ms).unwrap_or(window_ms).max(1))
}

fn checked_count(key: &CounterKey, count: i64) -> Result<u64, StoreError> {
    match u64::try_from(count) {
        Ok(count) if count > 0 => Ok(count),
        _ => Err(StoreError::invariant(key.as_str(), format!("redis returned count {}", count))),
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_and_get(&self, key: &CounterKey, window: Duration) -> Result<WindowCount, StoreError> {
        let mut conn = self.connection().await?;
        let window_ms = window_millis(window);

        let (count, ttl): (i64, i64) = self
            .operation_timeout
            .execute("increment", async {
                self.increment
                    .key(key.as_str())
                    .arg(window_ms)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(unavailable)
            })
            .await?;

        let count = checked_count(key, count)?;
        Ok(WindowCount::new(count, remaining_ttl(ttl, window_ms)))
    }

    async fn peek(&self, key: &CounterKey) -> Result<Option<WindowCount>, StoreError> {
        let mut conn = self.connection().await?;

        let (count, ttl): (Option<i64>, i64) = self
            .operation_timeout
            .execute("peek", async {
                redis::pipe()
                    .atomic()
                    .get(key.as_str())
                    .pttl(key.as_str())
                    .query_async(&mut conn)
                    .await
                    .map_err(unavailable)
            })
            .await?;

        let Some(count) = count else {
            return Ok(None);
        };
        // -2: the key expired between GET and PTTL.
        if ttl == -2 {
            return Ok(None);
        }
        let count = checked_count(key, count)?;
        if ttl < 0 {
            return Err(StoreError::invariant(key.as_str(), "counter has no expiry"));
        }
        Ok(Some(WindowCount::new(count, remaining_ttl(ttl, 1))))
    }

    async fn reset(&self, key: &CounterKey) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        self.operation_timeout
            .execute("reset", async {
                let _: () = conn.del(key.as_str()).await.map_err(unavailable)?;
                Ok(())
            })
            .await
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }
}

/// Limiter type produced by [`build_limiter`].
pub type RedisRateLimiter<T = NullSink> = RateLimiter<FailoverCounterStore<RedisCounterStore, T>, T>;

/// Assemble a limiter from `config`.
///
/// - `store.backend = "memory"`: in-memory counting only, no connection attempted.
/// - `store.backend = "distributed"`: Redis as primary behind the circuit breaker. If Redis is
///   unreachable now, the breaker starts Open and the process boots anyway; the regular probe
///   restores Redis once it is back.
///
/// Must be called inside a tokio runtime (the in-memory sweeper is spawned here).
///
/// # Errors
/// Returns `Err` only for configuration problems.
pub async fn build_limiter(config: &LimiterConfig) -> Result<RedisRateLimiter, ConfigError> {
    build_limiter_with_sink(config, NullSink).await
}

/// [`build_limiter`] with one sink receiving both breaker and admission events.
pub async fn build_limiter_with_sink<T>(
    config: &LimiterConfig,
    sink: T,
) -> Result<RedisRateLimiter<T>, ConfigError>
where
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    config.validate()?;
    let secondary = config.memory_store();

    let store = match config.store.backend {
        Backend::Memory => {
            tracing::info!(target: "quotagate::redis", "store.backend=memory; counting per process");
            FailoverCounterStore::memory_only(secondary)
        }
        Backend::Distributed => {
            let redis = RedisCounterStore::lazy(RedisStoreConfig::from_limiter_config(config)?)?;
            let startup = redis.ensure_connected().await;
            let store = FailoverCounterStore::new(redis, secondary, config.breaker_config()?);
            match startup {
                Ok(()) => store,
                Err(error) => {
                    tracing::error!(
                        target: "quotagate::redis",
                        error = %error,
                        "redis unreachable at startup; counting in memory until a probe succeeds"
                    );
                    store.start_open()
                }
            }
        }
    };

    RateLimiter::builder(store.with_sink(sink.clone()))
        .tiers(config.tier_policies())
        .build()
        .map(|limiter| limiter.with_sink(sink))
}
