//! Connection tunables.
//!
//! The original tooling exposed these as mutable process globals; here they
//! travel as a config struct handed to [`Conn`](crate::Conn) at creation so
//! two connections can disagree without racing each other.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard ceiling on chunk length, set by the KV value-size limit.
pub const MAX_CHUNK_SIZE: usize = 100_000;

/// Largest blob a single transaction can carry (the KV transaction limit).
pub const MAX_BLOB_SIZE: usize = 10_000_000;

/// Tunables for a single connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Collection id under which blob chunks are stored.
    pub chunk_type: u16,

    /// Chunk length in bytes. Values are split into chunks of at most this
    /// size once their packed form exceeds it. Capped at [`MAX_CHUNK_SIZE`].
    pub chunk_size: usize,

    /// Values longer than this are gzipped before storage.
    pub gzip_size: usize,

    /// Longest a subscriber sleeps between queue polls when no watch fires.
    pub punch_size: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_type: 0xFFFF,
            chunk_size: MAX_CHUNK_SIZE,
            gzip_size: 860,
            punch_size: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Checks the tunables against their hard limits.
    pub fn validate(&self) -> crate::Result<()> {
        if self.chunk_size == 0 {
            return Err(crate::Error::Config("chunk_size must be nonzero".into()));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(crate::Error::Config(format!(
                "chunk_size {} exceeds the KV value limit of {}",
                self.chunk_size, MAX_CHUNK_SIZE
            )));
        }
        if self.punch_size.is_zero() {
            return Err(crate::Error::Config("punch_size must be nonzero".into()));
        }
        Ok(())
    }
}
