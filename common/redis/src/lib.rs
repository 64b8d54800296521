use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};
use thiserror::Error;
use tokio::time::timeout;

/// A simple redis wrapper.
/// Only the commands the tracker uses are exposed, which keeps the trait
/// small enough to mock by hand. Every command runs under a response timeout
/// so a wedged cache cannot stall the ingestion path.

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CustomRedisError {
    #[error("Not found in redis")]
    NotFound,
    #[error("Timeout error")]
    Timeout,
    #[error("Redis error: {0}")]
    Other(String),
}

impl From<RedisError> for CustomRedisError {
    fn from(err: RedisError) -> Self {
        CustomRedisError::Other(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for CustomRedisError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CustomRedisError::Timeout
    }
}

#[async_trait]
pub trait Client {
    async fn get(&self, k: String) -> Result<String, CustomRedisError>;

    /// SET with a millisecond TTL; `None` means no expiry.
    async fn set_px(
        &self,
        k: String,
        v: String,
        ttl_millis: Option<u64>,
    ) -> Result<(), CustomRedisError>;

    /// Single-round-trip MGET; missing keys come back as `None`.
    async fn mget(&self, keys: Vec<String>) -> Result<Vec<Option<String>>, CustomRedisError>;

    /// Pipelined SET PX over all items; `None` means no expiry.
    async fn mset_px(
        &self,
        items: Vec<(String, String)>,
        ttl_millis: Option<u64>,
    ) -> Result<(), CustomRedisError>;

    async fn ping(&self) -> Result<(), CustomRedisError>;
}

pub struct RedisClient {
    connection: MultiplexedConnection,
    response_timeout: Duration,
}

impl RedisClient {
    pub async fn new(addr: String) -> Result<RedisClient, CustomRedisError> {
        Self::with_timeout(addr, DEFAULT_RESPONSE_TIMEOUT).await
    }

    pub async fn with_timeout(
        addr: String,
        response_timeout: Duration,
    ) -> Result<RedisClient, CustomRedisError> {
        let client = redis::Client::open(addr)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(RedisClient {
            connection,
            response_timeout,
        })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        let mut conn = self.connection.clone();
        let results = conn.get(k);
        let value: Option<String> = timeout(self.response_timeout, results).await??;
        value.ok_or(CustomRedisError::NotFound)
    }

    async fn set_px(
        &self,
        k: String,
        v: String,
        ttl_millis: Option<u64>,
    ) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        match ttl_millis {
            Some(millis) => {
                let results = conn.pset_ex(k, v, millis);
                let _: () = timeout(self.response_timeout, results).await??;
            }
            None => {
                let results = conn.set(k, v);
                let _: () = timeout(self.response_timeout, results).await??;
            }
        }
        Ok(())
    }

    async fn mget(&self, keys: Vec<String>) -> Result<Vec<Option<String>>, CustomRedisError> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let mut conn = self.connection.clone();
        let results = conn.mget(&keys);
        let values: Vec<Option<String>> = timeout(self.response_timeout, results).await??;
        Ok(values)
    }

    async fn mset_px(
        &self,
        items: Vec<(String, String)>,
        ttl_millis: Option<u64>,
    ) -> Result<(), CustomRedisError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for (k, v) in &items {
            let cmd = pipe.cmd("SET").arg(k).arg(v);
            if let Some(millis) = ttl_millis {
                cmd.arg("PX").arg(millis);
            }
            cmd.ignore();
        }
        let mut conn = self.connection.clone();
        let results = pipe.query_async::<()>(&mut conn);
        timeout(self.response_timeout, results).await??;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CustomRedisError> {
        let mut conn = self.connection.clone();
        let cmd = redis::cmd("PING");
        let results = cmd.query_async::<String>(&mut conn);
        timeout(self.response_timeout, results).await??;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockRedisCall {
    pub op: String,
    pub key: String,
    pub value: Option<String>,
    pub ttl_millis: Option<u64>,
}

/// In-memory stand-in for tests: behaves like a tiny redis (writes are
/// visible to later reads, TTLs recorded but never enforced) and logs every
/// call. An injected error makes every command fail, for degrade-open tests.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    entries: Arc<Mutex<HashMap<String, String>>>,
    error: Arc<Mutex<Option<CustomRedisError>>>,
    calls: Arc<Mutex<Vec<MockRedisCall>>>,
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a key, as if a previous run had set it.
    pub fn with_entry(self, key: &str, value: &str) -> Self {
        self.lock_entries().insert(key.to_owned(), value.to_owned());
        self
    }

    /// Make every subsequent command fail with the given error.
    pub fn break_with(self, error: CustomRedisError) -> Self {
        *self.error.lock().expect("poisoned mock lock") = Some(error);
        self
    }

    /// Clear a previously injected error.
    pub fn repair(&self) {
        *self.error.lock().expect("poisoned mock lock") = None;
    }

    pub fn calls(&self) -> Vec<MockRedisCall> {
        self.calls.lock().expect("poisoned mock lock").clone()
    }

    pub fn entry(&self, key: &str) -> Option<String> {
        self.lock_entries().get(key).cloned()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().expect("poisoned mock lock")
    }

    fn check_error(&self) -> Result<(), CustomRedisError> {
        match self.error.lock().expect("poisoned mock lock").clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record(&self, op: &str, key: &str, value: Option<String>, ttl_millis: Option<u64>) {
        self.calls
            .lock()
            .expect("poisoned mock lock")
            .push(MockRedisCall {
                op: op.to_owned(),
                key: key.to_owned(),
                value,
                ttl_millis,
            });
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, k: String) -> Result<String, CustomRedisError> {
        self.record("get", &k, None, None);
        self.check_error()?;
        self.lock_entries()
            .get(&k)
            .cloned()
            .ok_or(CustomRedisError::NotFound)
    }

    async fn set_px(
        &self,
        k: String,
        v: String,
        ttl_millis: Option<u64>,
    ) -> Result<(), CustomRedisError> {
        self.record("set_px", &k, Some(v.clone()), ttl_millis);
        self.check_error()?;
        self.lock_entries().insert(k, v);
        Ok(())
    }

    async fn mget(&self, keys: Vec<String>) -> Result<Vec<Option<String>>, CustomRedisError> {
        for key in &keys {
            self.record("mget", key, None, None);
        }
        self.check_error()?;
        let entries = self.lock_entries();
        Ok(keys.iter().map(|k| entries.get(k).cloned()).collect())
    }

    async fn mset_px(
        &self,
        items: Vec<(String, String)>,
        ttl_millis: Option<u64>,
    ) -> Result<(), CustomRedisError> {
        for (k, v) in &items {
            self.record("mset_px", k, Some(v.clone()), ttl_millis);
        }
        self.check_error()?;
        let mut entries = self.lock_entries();
        for (k, v) in items {
            entries.insert(k, v);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), CustomRedisError> {
        self.record("ping", "", None, None);
        self.check_error()
    }
}
