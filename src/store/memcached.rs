//! Memcached counter store speaking the text protocol over tokio.

use std::fmt::Write as _;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::CounterStore;
use crate::error::{RateWindowError, Result};

/// Memcached interprets expiry times above 30 days as absolute Unix time.
const MAX_RELATIVE_EXPIRY_SECS: u64 = 60 * 60 * 24 * 30;
/// Longest key memcached accepts.
const MAX_KEY_LEN: usize = 250;

/// A single memcached connection.
///
/// Requests are strictly request/response, so the socket is serialized behind
/// an async mutex. A connection that fails mid-exchange is dropped and
/// re-opened on the next call.
pub struct MemcachedStore {
    addr: String,
    conn: Mutex<Connection>,
}

struct Connection {
    stream: Option<BufStream<TcpStream>>,
    closed: bool,
}

impl Connection {
    async fn stream(&mut self, addr: &str) -> Result<&mut BufStream<TcpStream>> {
        if self.closed {
            return Err(RateWindowError::StoreUnavailable(
                "memcached connection is closed".to_string(),
            ));
        }
        if self.stream.is_none() {
            debug!(addr = %addr, "Reconnecting to memcached");
            self.stream = Some(open(addr).await?);
        }
        self.stream.as_mut().ok_or_else(|| {
            RateWindowError::StoreUnavailable("memcached connection is not established".to_string())
        })
    }

    fn discard_on_failure<T>(&mut self, result: &Result<T>) {
        if result.is_err() {
            self.stream = None;
        }
    }
}

async fn open(addr: &str) -> Result<BufStream<TcpStream>> {
    let stream = TcpStream::connect(addr).await.map_err(|e| {
        RateWindowError::StoreUnavailable(format!("failed to connect to memcached at {}: {}", addr, e))
    })?;
    stream.set_nodelay(true)?;
    Ok(BufStream::new(stream))
}

impl MemcachedStore {
    /// Connect to memcached. Accepts `host:port` or `memcache://host:port`.
    pub async fn connect(url: &str) -> Result<Self> {
        let addr = normalize_addr(url);
        let stream = open(&addr).await?;
        info!(addr = %addr, "Connected to memcached");

        Ok(Self {
            addr,
            conn: Mutex::new(Connection {
                stream: Some(stream),
                closed: false,
            }),
        })
    }

    /// The `host:port` this store talks to.
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

fn normalize_addr(url: &str) -> String {
    let trimmed = url
        .strip_prefix("memcached://")
        .or_else(|| url.strip_prefix("memcache://"))
        .unwrap_or(url);
    trimmed.trim_end_matches('/').to_string()
}

/// Build a memcached-safe key for a caller.
///
/// Bytes outside printable ASCII, plus `%` and `#`, are percent-encoded so
/// any caller id maps to a distinct legal key. When the encoded key would be
/// too long, the caller part becomes `#` followed by the SHA-256 of the id.
pub fn cache_key(prefix: &str, caller_id: &str) -> String {
    let mut key = String::with_capacity(prefix.len() + 1 + caller_id.len());
    key.push_str(prefix);
    key.push(':');
    for byte in caller_id.bytes() {
        if byte.is_ascii_graphic() && byte != b'%' && byte != b'#' {
            key.push(byte as char);
        } else {
            let _ = write!(key, "%{:02X}", byte);
        }
        if key.len() > MAX_KEY_LEN {
            break;
        }
    }

    if key.len() > MAX_KEY_LEN {
        let digest = Sha256::digest(caller_id.as_bytes());
        return format!("{}:#{}", prefix, hex::encode(digest));
    }
    key
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(RateWindowError::StoreUnavailable(format!(
            "memcached keys must be 1..={} bytes, got {}",
            MAX_KEY_LEN,
            key.len()
        )));
    }
    if key.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(RateWindowError::StoreUnavailable(
            "memcached keys cannot contain whitespace or control characters".to_string(),
        ));
    }
    Ok(())
}

/// Expiry field for a `set` command.
fn expiry_field(ttl_secs: u64) -> u64 {
    if ttl_secs > MAX_RELATIVE_EXPIRY_SECS {
        chrono::Utc::now().timestamp().max(0) as u64 + ttl_secs
    } else {
        ttl_secs
    }
}

async fn send(stream: &mut BufStream<TcpStream>, request: &[u8]) -> Result<()> {
    stream.write_all(request).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_line(stream: &mut BufStream<TcpStream>) -> Result<String> {
    let mut line = String::new();
    if stream.read_line(&mut line).await? == 0 {
        return Err(RateWindowError::StoreUnavailable(
            "memcached closed the connection".to_string(),
        ));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn unexpected(command: &str, line: &str) -> RateWindowError {
    RateWindowError::StoreUnavailable(format!("memcached {} failed: {}", command, line))
}

async fn read_get_response(stream: &mut BufStream<TcpStream>) -> Result<Option<u64>> {
    let mut value = None;
    loop {
        let line = read_line(stream).await?;
        if line == "END" {
            return Ok(value);
        }
        let Some(header) = line.strip_prefix("VALUE ") else {
            return Err(unexpected("get", &line));
        };

        // VALUE <key> <flags> <bytes> [<cas>]
        let len: usize = header
            .split_whitespace()
            .nth(2)
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| unexpected("get", &line))?;
        let mut data = vec![0u8; len + 2];
        stream.read_exact(&mut data).await?;
        data.truncate(len);

        let text = String::from_utf8_lossy(&data);
        let count = text
            .trim()
            .parse::<u64>()
            .map_err(|_| unexpected("get", &format!("non-numeric counter {:?}", text)))?;
        value = Some(count);
    }
}

async fn expect_reply(stream: &mut BufStream<TcpStream>, command: &str, ok: &str) -> Result<()> {
    let line = read_line(stream).await?;
    if line == ok {
        Ok(())
    } else {
        Err(unexpected(command, &line))
    }
}

#[async_trait]
impl CounterStore for MemcachedStore {
    async fn get(&self, key: &str) -> Result<Option<u64>> {
        validate_key(key)?;
        let mut conn = self.conn.lock().await;
        let result = async {
            let stream = conn.stream(&self.addr).await?;
            send(stream, format!("get {}\r\n", key).as_bytes()).await?;
            read_get_response(stream).await
        }
        .await;
        conn.discard_on_failure(&result);
        result
    }

    async fn set(&self, key: &str, value: u64, ttl_secs: u64) -> Result<()> {
        validate_key(key)?;
        let data = value.to_string();
        let request = format!(
            "set {} 0 {} {}\r\n{}\r\n",
            key,
            expiry_field(ttl_secs),
            data.len(),
            data
        );

        let mut conn = self.conn.lock().await;
        let result = async {
            let stream = conn.stream(&self.addr).await?;
            send(stream, request.as_bytes()).await?;
            expect_reply(stream, "set", "STORED").await
        }
        .await;
        conn.discard_on_failure(&result);
        result
    }

    async fn flush(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let result = async {
            let stream = conn.stream(&self.addr).await?;
            send(stream, b"flush_all\r\n").await?;
            expect_reply(stream, "flush_all", "OK").await
        }
        .await;
        conn.discard_on_failure(&result);
        result
    }

    async fn close(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        conn.closed = true;
        let Some(mut stream) = conn.stream.take() else {
            return Ok(());
        };

        info!(addr = %self.addr, "Closing memcached connection");
        send(&mut stream, b"quit\r\n").await?;
        stream.shutdown().await?;
        Ok(())
    }
}
