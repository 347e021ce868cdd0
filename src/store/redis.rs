//! Redis-backed list and sorted-set store.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tracing::{debug, info};

use super::{ListStore, SortedSetStore};
use crate::error::{RateWindowError, Result};

/// Keys deleted per `DEL` while resetting a prefix.
const SCAN_BATCH: usize = 500;

/// Redis store over a multiplexed async connection.
///
/// The connection is cheap to clone, so each command clones it out of the
/// lock and runs without holding it.
pub struct RedisStore {
    url: String,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStore {
    /// Connect to redis, e.g. `redis://localhost:6379`.
    pub async fn connect(url: &str) -> Result<Self> {
        debug!(url = %sanitize_url(url), "Connecting to redis");

        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await.map_err(|e| {
            RateWindowError::StoreUnavailable(format!(
                "failed to connect to redis at {}: {}",
                sanitize_url(url),
                e
            ))
        })?;

        info!(url = %sanitize_url(url), "Connected to redis");
        Ok(Self {
            url: url.to_string(),
            conn: Mutex::new(Some(conn)),
        })
    }

    fn connection(&self) -> Result<MultiplexedConnection> {
        self.conn.lock().clone().ok_or_else(|| {
            RateWindowError::StoreUnavailable("redis connection is closed".to_string())
        })
    }

    async fn pexpire(&self, key: &str, ttl_ms: u64) -> Result<()> {
        let mut conn = self.connection()?;
        let _: bool = conn.pexpire(key, ttl_ms as i64).await?;
        Ok(())
    }

    async fn delete_matching(&self, prefix: &str) -> Result<()> {
        let mut conn = self.connection()?;
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut deleted = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                deleted += keys.len();
                let _: usize = conn.del(keys).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(prefix = %prefix, deleted = deleted, "Deleted redis keys");
        Ok(())
    }

    fn disconnect(&self) {
        if self.conn.lock().take().is_some() {
            info!(url = %sanitize_url(&self.url), "Closed redis connection");
        }
    }
}

/// Escape glob metacharacters so `SCAN MATCH` treats `prefix` literally.
fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\' | '^') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Hide any password in a redis URL before logging it.
fn sanitize_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl ListStore for RedisStore {
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.connection()?;
        let items: Vec<String> = conn.lrange(key, start, stop).await?;
        Ok(items)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection()?;
        let item: Option<String> = conn.lpop(key, None).await?;
        Ok(item)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize> {
        let mut conn = self.connection()?;
        let len: usize = conn.rpush(key, value).await?;
        Ok(len)
    }

    async fn llen(&self, key: &str) -> Result<usize> {
        let mut conn = self.connection()?;
        let len: usize = conn.llen(key).await?;
        Ok(len)
    }

    async fn expire(&self, key: &str, ttl_ms: u64) -> Result<()> {
        self.pexpire(key, ttl_ms).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.delete_matching(prefix).await
    }

    async fn close(&self) -> Result<()> {
        self.disconnect();
        Ok(())
    }
}

#[async_trait]
impl SortedSetStore for RedisStore {
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut conn = self.connection()?;
        let _: usize = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max_exclusive: i64) -> Result<usize> {
        let min = if min == i64::MIN {
            "-inf".to_string()
        } else {
            min.to_string()
        };
        let mut conn = self.connection()?;
        let removed: usize = conn
            .zrembyscore(key, min, format!("({}", max_exclusive))
            .await?;
        Ok(removed)
    }

    async fn zrank(&self, key: &str, member: &str) -> Result<Option<usize>> {
        let mut conn = self.connection()?;
        let rank: Option<usize> = conn.zrank(key, member).await?;
        Ok(rank)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.connection()?;
        let _: usize = conn.zrem(key, member).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_ms: u64) -> Result<()> {
        self.pexpire(key, ttl_ms).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.delete_matching(prefix).await
    }

    async fn close(&self) -> Result<()> {
        self.disconnect();
        Ok(())
    }
}
