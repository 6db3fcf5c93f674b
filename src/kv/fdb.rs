//! FoundationDB backend, API version 6.1.
//!
//! Compiled only under the `foundationdb` feature: the binding links the
//! libfdb_c client. The adapter translates the crate's KV traits onto
//! [`foundationdb::Transaction`]; point reads are dispatched eagerly on the
//! runtime so batched loads still pipeline, and watches ride the C client's
//! own futures, which stay valid independently of the transaction that
//! created them.

use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use foundationdb::options::{ConflictRangeType, StreamingMode};
use foundationdb::{Database, KeySelector, RangeOption, Transaction};
use futures::TryStreamExt;

use crate::error::{Error, Result};

use super::{Kv, KvPair, KvTransaction, ScanMode, ScanOptions, ValueFuture, Watch};

/// Keeps the client network thread alive for the process lifetime.
static NETWORK: OnceLock<foundationdb::api::NetworkAutoStop> = OnceLock::new();

/// FoundationDB-backed KV provider.
pub struct FdbKv {
    db: Arc<Database>,
}

impl FdbKv {
    /// Boots the client network (once per process) and opens the database
    /// described by the default cluster file.
    pub fn open() -> Result<Self> {
        NETWORK.get_or_init(|| unsafe { foundationdb::boot() });
        let db = Database::new(None).map_err(Error::kv)?;
        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl Kv for FdbKv {
    async fn transaction(&self) -> Result<Arc<dyn KvTransaction>> {
        let trx = self.db.create_trx().map_err(Error::kv)?;
        Ok(Arc::new(FdbTransaction {
            trx: Mutex::new(Some(Arc::new(trx))),
            read_only: false,
        }))
    }

    async fn read_transaction(&self) -> Result<Arc<dyn KvTransaction>> {
        let trx = self.db.create_trx().map_err(Error::kv)?;
        Ok(Arc::new(FdbTransaction {
            trx: Mutex::new(Some(Arc::new(trx))),
            read_only: true,
        }))
    }
}

struct FdbTransaction {
    /// Taken at commit; shared handles are drained first so the binding's
    /// by-value commit can run.
    trx: Mutex<Option<Arc<Transaction>>>,
    read_only: bool,
}

impl FdbTransaction {
    fn shared(&self) -> Result<Arc<Transaction>> {
        self.trx
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Internal("transaction already committed".into()))
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::Kv("write issued on a read-only transaction".into()));
        }
        Ok(())
    }
}

fn classify(err: foundationdb::FdbError) -> Error {
    if err.is_retryable() {
        Error::Conflict
    } else {
        Error::kv(err)
    }
}

#[async_trait]
impl KvTransaction for FdbTransaction {
    fn get(&self, key: Bytes) -> ValueFuture {
        let trx = self.shared();
        let handle = tokio::spawn(async move {
            let trx = trx?;
            let value = trx.get(&key, false).await.map_err(classify)?;
            Ok(value.map(|slice| Bytes::copy_from_slice(&slice)))
        });
        Box::pin(async move {
            handle
                .await
                .map_err(|err| Error::Internal(err.to_string()))?
        })
    }

    fn set(&self, key: Bytes, value: Bytes) -> Result<()> {
        self.check_writable()?;
        self.shared()?.set(&key, &value);
        Ok(())
    }

    fn clear(&self, key: Bytes) -> Result<()> {
        self.check_writable()?;
        self.shared()?.clear(&key);
        Ok(())
    }

    fn clear_range(&self, begin: Bytes, end: Bytes) -> Result<()> {
        self.check_writable()?;
        self.shared()?.clear_range(&begin, &end);
        Ok(())
    }

    async fn get_range(&self, begin: Bytes, end: Bytes, opts: ScanOptions) -> Result<Vec<KvPair>> {
        let trx = self.shared()?;
        let range = RangeOption {
            limit: opts.limit,
            mode: match opts.mode {
                ScanMode::WantAll => StreamingMode::WantAll,
                ScanMode::Iterator => StreamingMode::Iterator,
            },
            ..RangeOption::from((
                KeySelector::first_greater_or_equal(begin.to_vec()),
                KeySelector::first_greater_or_equal(end.to_vec()),
            ))
        };
        let rows: Vec<_> = trx
            .get_ranges_keyvalues(range, false)
            .try_collect()
            .await
            .map_err(classify)?;
        Ok(rows
            .into_iter()
            .map(|kv| KvPair {
                key: Bytes::copy_from_slice(kv.key()),
                value: Bytes::copy_from_slice(kv.value()),
            })
            .collect())
    }

    fn add_write_conflict_range(&self, begin: Bytes, end: Bytes) -> Result<()> {
        self.check_writable()?;
        self.shared()?
            .add_conflict_range(&begin, &end, ConflictRangeType::Write)
            .map_err(Error::kv)
    }

    fn watch(&self, key: Bytes) -> Result<Watch> {
        let trx = self.shared()?;
        let (watch, sender) = Watch::channel(key.clone());
        // registered immediately; the C client keeps watch futures alive as
        // independent objects, so the transaction handle is released before
        // the wait starts and commit can take ownership
        let fired = trx.watch(&key);
        drop(trx);
        tokio::spawn(async move {
            let mut sender = sender;
            tokio::select! {
                _ = fired => {
                    let _ = sender.send(());
                }
                _ = sender.closed() => {}
            }
        });
        Ok(watch)
    }

    async fn commit(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::Kv("commit issued on a read-only transaction".into()));
        }
        let Some(mut shared) = self.trx.lock().unwrap().take() else {
            return Err(Error::Internal("transaction already committed".into()));
        };
        // in-flight point reads hold short-lived clones; wait them out so
        // the by-value commit can take ownership
        let trx = loop {
            match Arc::try_unwrap(shared) {
                Ok(trx) => break trx,
                Err(still_shared) => {
                    shared = still_shared;
                    tokio::task::yield_now().await;
                }
            }
        };
        match trx.commit().await {
            Ok(_) => Ok(()),
            Err(err) => Err(classify(*err)),
        }
    }
}
