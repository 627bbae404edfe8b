use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_FRAME: usize = 1 << 20;
pub const DEFAULT_MAX_WRITE_QUEUE_BYTES: usize = 8 << 20;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    IO(#[from] std::io::Error),
    #[error("json: {0}")]
    JSON(#[from] serde_json::Error),
}

/// Settings shared, read-only, by a listener and every session it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Worker threads for the runtime. Advisory: the server core never reads it.
    pub threads: usize,
    #[serde(rename = "idle_timeout_ms", with = "millis")]
    pub idle_timeout: Duration,
    /// Largest accepted frame body, in bytes.
    pub max_frame: usize,
    /// Largest total of unflushed outbound bytes before a session is closed.
    pub max_write_queue_bytes: usize,
    pub tcp_nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_frame: DEFAULT_MAX_FRAME,
            max_write_queue_bytes: DEFAULT_MAX_WRITE_QUEUE_BYTES,
            tcp_nodelay: true,
        }
    }
}

impl ServerConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    #[must_use]
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    #[must_use]
    pub fn with_max_write_queue_bytes(mut self, max_write_queue_bytes: usize) -> Self {
        self.max_write_queue_bytes = max_write_queue_bytes;
        self
    }

    #[must_use]
    pub fn with_tcp_nodelay(mut self, tcp_nodelay: bool) -> Self {
        self.tcp_nodelay = tcp_nodelay;
        self
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

mod millis {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        // Never write a non-zero timeout as zero.
        let millis = if millis == 0 && !value.is_zero() { 1 } else { millis };
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match u64::deserialize(deserializer)? {
            0 => Err(D::Error::custom("idle timeout must be at least 1 ms")),
            millis => Ok(Duration::from_millis(millis)),
        }
    }
}
