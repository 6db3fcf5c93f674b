//! KV provider abstraction.
//!
//! The crate consumes an ordered transactional key-value store through the
//! traits in this module: keyed get/set/clear, ranged scans and clears,
//! optimistic transactions with explicit write-conflict ranges, and key
//! watches. [`mem`] is a complete in-memory engine used by the mock
//! connection version and the test suite; [`fdb`] binds FoundationDB 6.1
//! behind the `foundationdb` feature.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use crate::error::Result;

pub mod mem;

#[cfg(feature = "foundationdb")]
pub mod fdb;

/// Deferred single-key read. Issued eagerly, awaited later, so callers can
/// batch reads the way [`Db::load`](crate::Db::load) does.
pub type ValueFuture = BoxFuture<'static, Result<Option<Bytes>>>;

/// One row of a range scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: Bytes,
    pub value: Bytes,
}

/// Streaming-mode hint for range reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    /// Fetch the whole result set up front; right for bounded scans.
    #[default]
    WantAll,
    /// Stream rows as the provider pages them in; right for large blobs.
    Iterator,
}

/// Options for [`KvTransaction::get_range`].
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub limit: Option<usize>,
    pub mode: ScanMode,
}

/// An ordered transactional KV store.
#[async_trait]
pub trait Kv: Send + Sync {
    /// Opens a read-write transaction.
    async fn transaction(&self) -> Result<Arc<dyn KvTransaction>>;

    /// Opens a read-only transaction. Writes issued through it are never
    /// committed.
    async fn read_transaction(&self) -> Result<Arc<dyn KvTransaction>>;
}

/// A single optimistic transaction.
///
/// Reads see a consistent snapshot; writes are buffered and become visible
/// atomically at [`commit`](KvTransaction::commit). A commit that loses a
/// concurrency race fails with [`Error::Conflict`](crate::Error::Conflict).
#[async_trait]
pub trait KvTransaction: Send + Sync {
    /// Issues a point read. The returned future may be awaited at any later
    /// point; the read (and its conflict range) is registered immediately.
    fn get(&self, key: Bytes) -> ValueFuture;

    fn set(&self, key: Bytes, value: Bytes) -> Result<()>;

    fn clear(&self, key: Bytes) -> Result<()>;

    /// Clears every key in `[begin, end)`.
    fn clear_range(&self, begin: Bytes, end: Bytes) -> Result<()>;

    /// Reads keys in `[begin, end)` in ascending key order.
    async fn get_range(&self, begin: Bytes, end: Bytes, opts: ScanOptions) -> Result<Vec<KvPair>>;

    /// Marks `[begin, end)` as written for conflict purposes without writing,
    /// serializing this transaction against concurrent readers of the range.
    fn add_write_conflict_range(&self, begin: Bytes, end: Bytes) -> Result<()>;

    /// Registers a watch on `key`. The watch arms when this transaction
    /// commits and fires on the next committed write to the key.
    fn watch(&self, key: Bytes) -> Result<Watch>;

    async fn commit(&self) -> Result<()>;
}

/// A pending key watch.
///
/// Dropping the handle cancels the watch. A watch whose transaction never
/// committed may resolve spuriously, so consumers re-check state after every
/// wake rather than trusting the wake itself.
#[derive(Debug)]
pub struct Watch {
    key: Bytes,
    rx: oneshot::Receiver<()>,
}

impl Watch {
    pub(crate) fn channel(key: Bytes) -> (Self, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { key, rx }, tx)
    }

    /// The watched key.
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Resolves once the key is written (or the watch is abandoned by the
    /// provider, which counts as a spurious wake).
    pub async fn fired(self) {
        let _ = self.rx.await;
    }
}
