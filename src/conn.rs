//! Connection and transaction scope.
//!
//! A [`Conn`] owns the KV provider, the keyspace of one database number, the
//! tunables, and the process-wide index registry. Transaction handlers run
//! through [`Conn::tx`], which retries serialization conflicts the way the
//! provider's own retry loop would.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::engine::Db;
use crate::error::{Error, Result};
use crate::keys::Keyspace;
use crate::kv::Kv;
use crate::kv::mem::MemKv;
use crate::queue::Queue;
use crate::record::{Fabric, IndexFabric};

/// KV client version backed by FoundationDB 6.1.
pub const CONN_VERSION_610: u16 = 610;

/// KV client version backed by the in-memory engine, for tests.
pub const CONN_VERSION_MOCK: u16 = 0xFFFF;

/// Conflicting transactions are retried at most this many times before the
/// conflict is surfaced to the caller.
const MAX_TX_ATTEMPTS: u32 = 64;

/// Handle to one logical database.
///
/// Cheap to clone; all clones share the KV connection and index registry.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    keyspace: Keyspace,
    config: Config,
    clock: Arc<dyn Clock>,
    kv: Arc<dyn Kv>,
    indexes: RwLock<HashMap<u16, Vec<IndexFabric>>>,
}

impl Conn {
    /// Connects with default tunables. Version `0` falls back to
    /// [`CONN_VERSION_610`]; unsupported versions fail with
    /// [`Error::UnknownVersion`].
    pub fn new(db: u16, version: u16) -> Result<Self> {
        Self::with_config(db, version, Config::default())
    }

    /// Connects with explicit tunables.
    pub fn with_config(db: u16, version: u16, config: Config) -> Result<Self> {
        let kv = open_kv(version)?;
        Self::with_kv(db, config, kv, Arc::new(SystemClock))
    }

    /// Assembles a connection over a caller-supplied KV provider and clock.
    ///
    /// This is how tests pin time with [`MockClock`](crate::MockClock) and
    /// how alternative providers plug in.
    pub fn with_kv(
        db: u16,
        config: Config,
        kv: Arc<dyn Kv>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ConnInner {
                keyspace: Keyspace::new(db),
                config,
                clock,
                kv,
                indexes: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Database number of this connection.
    pub fn db(&self) -> u16 {
        self.inner.keyspace.db()
    }

    /// Tunables this connection was created with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn keyspace(&self) -> Keyspace {
        self.inner.keyspace
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub(crate) fn kv(&self) -> &Arc<dyn Kv> {
        &self.inner.kv
    }

    /// Registers an index fabric for a collection type.
    ///
    /// Registration happens at startup, before the first save of the
    /// collection; the registry is treated as read-only afterwards.
    pub fn register_index(&self, ctype: u16, fabric: IndexFabric) {
        self.inner
            .indexes
            .write()
            .unwrap()
            .entry(ctype)
            .or_default()
            .push(fabric);
    }

    pub(crate) fn indexes(&self, ctype: u16) -> Vec<IndexFabric> {
        self.inner
            .indexes
            .read()
            .unwrap()
            .get(&ctype)
            .cloned()
            .unwrap_or_default()
    }

    /// Runs `handler` inside a read-write transaction and commits.
    ///
    /// Handler failures abort the transaction; commit-time serialization
    /// conflicts re-run the handler against a fresh transaction. The handler
    /// must therefore be safe to invoke more than once — captures it mutates
    /// should be cloned per attempt.
    pub async fn tx<F, Fut, T>(&self, handler: F) -> Result<T>
    where
        F: Fn(Db) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            let kv_tx = self.inner.kv.transaction().await?;
            let db = Db::new(self.clone(), kv_tx.clone());
            let err = match handler(db).await {
                Ok(value) => match kv_tx.commit().await {
                    Ok(()) => return Ok(value),
                    Err(err) => err,
                },
                Err(err) => err,
            };

            attempt += 1;
            if !err.is_retryable() || attempt >= MAX_TX_ATTEMPTS {
                return Err(err);
            }
            tracing::trace!(attempt, "retrying conflicting transaction");
        }
    }

    /// Runs `handler` against a read-only snapshot. Nothing is committed.
    pub async fn read_tx<F, Fut, T>(&self, handler: F) -> Result<T>
    where
        F: Fn(Db) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let kv_tx = self.inner.kv.read_transaction().await?;
        handler(Db::new(self.clone(), kv_tx)).await
    }

    /// Opens a delayed task queue stored under `qtype`, hydrating claimed
    /// entries through `fabric`.
    pub fn queue(&self, qtype: u16, fabric: Fabric) -> Queue {
        Queue::new(self.clone(), qtype, fabric)
    }

    /// Clears every key of this database number, collections and queues
    /// alike.
    pub async fn clear_db(&self) -> Result<()> {
        self.tx(|db| async move {
            let keys = db.keyspace();
            db.transaction().clear_range(keys.db_begin(), keys.db_end())
        })
        .await
    }
}

fn open_kv(version: u16) -> Result<Arc<dyn Kv>> {
    let version = if version == 0 { CONN_VERSION_610 } else { version };
    match version {
        CONN_VERSION_MOCK => Ok(Arc::new(MemKv::new())),
        CONN_VERSION_610 => {
            #[cfg(feature = "foundationdb")]
            {
                return Ok(Arc::new(crate::kv::fdb::FdbKv::open()?));
            }
            #[cfg(not(feature = "foundationdb"))]
            {
                Err(Error::UnknownVersion(version))
            }
        }
        other => Err(Error::UnknownVersion(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn should_reject_unknown_version() {
        // given/when
        let result = Conn::new(1, 42);

        // then
        assert!(matches!(result, Err(Error::UnknownVersion(42))));
    }

    #[cfg(not(feature = "foundationdb"))]
    #[tokio::test]
    async fn should_report_missing_client_for_version_610() {
        // when - version 0 defaults to 610, which this build does not carry
        let result = Conn::new(1, 0);

        // then
        assert!(matches!(result, Err(Error::UnknownVersion(610))));
    }

    #[tokio::test]
    async fn should_commit_handler_writes() {
        // given
        let conn = Conn::new(1, CONN_VERSION_MOCK).unwrap();

        // when
        conn.tx(|db| async move { db.set(7, &[0x01], &[0xAA]) })
            .await
            .unwrap();

        // then
        let value = conn
            .read_tx(|db| async move { db.get(7, &[0x01]).await })
            .await
            .unwrap();
        assert_eq!(value, Some(Bytes::from_static(&[0xAA])));
    }

    #[tokio::test]
    async fn should_discard_writes_when_handler_fails() {
        // given
        let conn = Conn::new(1, CONN_VERSION_MOCK).unwrap();

        // when
        let result: Result<()> = conn
            .tx(|db| async move {
                db.set(7, &[0x01], &[0xAA])?;
                Err(Error::Record("boom".into()))
            })
            .await;

        // then
        assert!(result.is_err());
        let value = conn
            .read_tx(|db| async move { db.get(7, &[0x01]).await })
            .await
            .unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn should_retry_conflicting_transactions_to_completion() {
        // given - two writers bump the same counter concurrently
        let conn = Conn::new(1, CONN_VERSION_MOCK).unwrap();
        let bump = |conn: Conn| async move {
            conn.tx(|db| async move {
                let current = db
                    .get(3, b"counter")
                    .await?
                    .map(|v| v[0])
                    .unwrap_or_default();
                db.set(3, b"counter", &[current + 1])
            })
            .await
        };

        // when
        let (a, b) = tokio::join!(bump(conn.clone()), bump(conn.clone()));
        a.unwrap();
        b.unwrap();

        // then - both increments survive
        let value = conn
            .read_tx(|db| async move { db.get(3, b"counter").await })
            .await
            .unwrap();
        assert_eq!(value, Some(Bytes::from_static(&[2])));
    }

    #[tokio::test]
    async fn should_clear_whole_database() {
        // given
        let conn = Conn::new(9, CONN_VERSION_MOCK).unwrap();
        conn.tx(|db| async move {
            db.set(1, &[0x01], &[0x01])?;
            db.set(0xFFFF, &[0xAB; 18], &[0x02])
        })
        .await
        .unwrap();

        // when
        conn.clear_db().await.unwrap();

        // then
        let (a, b) = conn
            .read_tx(|db| async move {
                Ok((db.get(1, &[0x01]).await?, db.get(0xFFFF, &[0xAB; 18]).await?))
            })
            .await
            .unwrap();
        assert!(a.is_none());
        assert!(b.is_none());
    }
}
