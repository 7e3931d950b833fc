use async_trait::async_trait;
use engram_core::{EngramError, PayloadStore};
use redis::IntoConnectionInfo;
use serde_json::Value;

/// Configuration for [`RedisPayloadStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL.
    pub url: String,
    /// Optional auth token, applied as the connection password.
    pub token: Option<String>,
    /// Key prefix for all entries. Defaults to `""` so cache ids map to keys
    /// unchanged.
    pub prefix: String,
}

impl RedisStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            prefix: String::new(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// Redis-backed implementation of the [`PayloadStore`] trait.
///
/// Payloads are stored as JSON strings under `{prefix}{key}` with expiry
/// managed by Redis itself; locks use `SET NX EX`.
pub struct RedisPayloadStore {
    client: redis::Client,
    config: RedisStoreConfig,
}

impl RedisPayloadStore {
    /// Create a new store from a Redis URL with default configuration.
    pub fn from_url(url: &str) -> Result<Self, EngramError> {
        Self::new(RedisStoreConfig::new(url))
    }

    /// Create a new store from a configuration.
    pub fn new(config: RedisStoreConfig) -> Result<Self, EngramError> {
        let mut info = config
            .url
            .as_str()
            .into_connection_info()
            .map_err(|e| EngramError::Store(format!("invalid Redis URL: {e}")))?;
        if let Some(ref token) = config.token {
            info.redis.password = Some(token.clone());
        }
        let client = redis::Client::open(info)
            .map_err(|e| EngramError::Store(format!("failed to connect to Redis: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    /// Build the full Redis key for an entry.
    fn redis_key(&self, key: &str) -> String {
        format!("{}{key}", self.config.prefix)
    }

    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection, EngramError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EngramError::Store(format!("Redis connection error: {e}")))
    }
}

#[async_trait]
impl PayloadStore for RedisPayloadStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, EngramError> {
        let mut con = self.get_connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.redis_key(key))
            .query_async(&mut con)
            .await
            .map_err(|e| EngramError::Store(format!("Redis GET error: {e}")))?;

        match raw {
            Some(json_str) => {
                let value: Value = serde_json::from_str(&json_str)
                    .map_err(|e| EngramError::Store(format!("JSON deserialize error: {e}")))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &Value, ttl_secs: u64) -> Result<(), EngramError> {
        let mut con = self.get_connection().await?;
        let json_str = serde_json::to_string(value)
            .map_err(|e| EngramError::Store(format!("JSON serialize error: {e}")))?;

        let _: () = redis::cmd("SET")
            .arg(self.redis_key(key))
            .arg(json_str)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut con)
            .await
            .map_err(|e| EngramError::Store(format!("Redis SET error: {e}")))?;

        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool, EngramError> {
        let mut con = self.get_connection().await?;

        // SET NX EX replies OK when the key was set and nil when it existed.
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.redis_key(key))
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut con)
            .await
            .map_err(|e| EngramError::Store(format!("Redis SET NX error: {e}")))?;

        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), EngramError> {
        let mut con = self.get_connection().await?;
        let _: () = redis::cmd("DEL")
            .arg(self.redis_key(key))
            .query_async(&mut con)
            .await
            .map_err(|e| EngramError::Store(format!("Redis DEL error: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = RedisStoreConfig::new("redis://localhost:6379");
        assert_eq!(config.url, "redis://localhost:6379");
        assert!(config.token.is_none());
        assert_eq!(config.prefix, "");
    }

    #[test]
    fn config_builder_chain() {
        let config = RedisStoreConfig::new("redis://cache.internal:6379")
            .with_token("secret")
            .with_prefix("engram:");
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.prefix, "engram:");
    }

    #[test]
    fn prefix_is_applied_to_keys() {
        let store = RedisPayloadStore::new(
            RedisStoreConfig::new("redis://localhost:6379").with_prefix("engram:"),
        )
        .unwrap();
        assert_eq!(store.redis_key("llm:abc"), "engram:llm:abc");
    }

    #[test]
    fn invalid_url_is_an_error() {
        let result = RedisPayloadStore::from_url("not-a-valid-url");
        assert!(result.is_err());
    }
}
