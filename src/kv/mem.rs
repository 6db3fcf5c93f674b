//! In-memory KV engine.
//!
//! Backs the mock connection version. This is a real engine, not a stub: it
//! provides snapshot-isolated transactions with optimistic concurrency,
//! explicit write-conflict ranges, ranged clears, and key watches, so the
//! record engine and queue behave the same way here as on the real provider.
//!
//! Conflict bookkeeping (`modified`, `range_marks`) is kept for the lifetime
//! of the store; the engine favors fidelity over memory.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Included};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::oneshot;

use crate::error::{Error, Result};

use super::{Kv, KvPair, KvTransaction, ScanOptions, ValueFuture, Watch};

/// In-memory ordered transactional store.
#[derive(Clone, Default)]
pub struct MemKv {
    store: Arc<Store>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Kv for MemKv {
    async fn transaction(&self) -> Result<Arc<dyn KvTransaction>> {
        Ok(Arc::new(MemTransaction::begin(self.store.clone(), false)))
    }

    async fn read_transaction(&self) -> Result<Arc<dyn KvTransaction>> {
        Ok(Arc::new(MemTransaction::begin(self.store.clone(), true)))
    }
}

#[derive(Default)]
struct Store {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    /// Monotonic commit counter; every committed transaction bumps it.
    version: u64,
    data: BTreeMap<Bytes, Bytes>,
    /// Last commit version that wrote or cleared each key.
    modified: BTreeMap<Bytes, u64>,
    /// Committed range clears and explicit write-conflict ranges.
    range_marks: Vec<RangeMark>,
    /// Armed watches, fired and consumed on the next write to their key.
    watchers: HashMap<Bytes, Vec<oneshot::Sender<()>>>,
}

struct RangeMark {
    begin: Bytes,
    end: Bytes,
    version: u64,
}

impl StoreState {
    fn fire_watchers(&mut self, key: &Bytes) {
        if let Some(senders) = self.watchers.remove(key) {
            for sender in senders {
                let _ = sender.send(());
            }
        }
    }
}

struct MemTransaction {
    store: Arc<Store>,
    read_only: bool,
    state: Mutex<TxState>,
}

struct TxState {
    begin_version: u64,
    snapshot: BTreeMap<Bytes, Bytes>,
    /// Buffered point writes; `None` is a pending clear.
    writes: BTreeMap<Bytes, Option<Bytes>>,
    cleared: Vec<(Bytes, Bytes)>,
    read_conflicts: Vec<(Bytes, Bytes)>,
    write_conflict_ranges: Vec<(Bytes, Bytes)>,
    /// Watch senders armed when this transaction commits.
    watches: Vec<(Bytes, oneshot::Sender<()>)>,
    committed: bool,
}

impl MemTransaction {
    fn begin(store: Arc<Store>, read_only: bool) -> Self {
        let state = store.state.lock().unwrap();
        let tx = TxState {
            begin_version: state.version,
            snapshot: state.data.clone(),
            writes: BTreeMap::new(),
            cleared: Vec::new(),
            read_conflicts: Vec::new(),
            write_conflict_ranges: Vec::new(),
            watches: Vec::new(),
            committed: false,
        };
        drop(state);
        Self {
            store,
            read_only,
            state: Mutex::new(tx),
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::kv("write issued on a read-only transaction"));
        }
        Ok(())
    }

    /// Resolves a key against buffered writes, pending clears, and the
    /// snapshot, in that order (read-your-writes).
    fn resolve(tx: &TxState, key: &Bytes) -> Option<Bytes> {
        if let Some(buffered) = tx.writes.get(key) {
            return buffered.clone();
        }
        if tx.cleared.iter().any(|(b, e)| range_contains(b, e, key)) {
            return None;
        }
        tx.snapshot.get(key).cloned()
    }
}

#[async_trait]
impl KvTransaction for MemTransaction {
    fn get(&self, key: Bytes) -> ValueFuture {
        let mut tx = self.state.lock().unwrap();
        tx.read_conflicts.push((key.clone(), key_successor(&key)));
        let value = Self::resolve(&tx, &key);
        drop(tx);
        Box::pin(futures::future::ready(Ok(value)))
    }

    fn set(&self, key: Bytes, value: Bytes) -> Result<()> {
        self.check_writable()?;
        let mut tx = self.state.lock().unwrap();
        tx.writes.insert(key, Some(value));
        Ok(())
    }

    fn clear(&self, key: Bytes) -> Result<()> {
        self.check_writable()?;
        let mut tx = self.state.lock().unwrap();
        tx.writes.insert(key, None);
        Ok(())
    }

    fn clear_range(&self, begin: Bytes, end: Bytes) -> Result<()> {
        self.check_writable()?;
        if begin >= end {
            return Ok(());
        }
        let mut tx = self.state.lock().unwrap();
        // a later set re-adds the key; earlier buffered writes in the range
        // are superseded by the clear
        let stale: Vec<Bytes> = tx
            .writes
            .range((Included(begin.clone()), Excluded(end.clone())))
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            tx.writes.remove(&key);
        }
        tx.cleared.push((begin, end));
        Ok(())
    }

    async fn get_range(&self, begin: Bytes, end: Bytes, opts: ScanOptions) -> Result<Vec<KvPair>> {
        if begin >= end {
            return Ok(Vec::new());
        }
        let mut tx = self.state.lock().unwrap();
        tx.read_conflicts.push((begin.clone(), end.clone()));

        let mut merged: BTreeMap<Bytes, Bytes> = tx
            .snapshot
            .range((Included(begin.clone()), Excluded(end.clone())))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (b, e) in &tx.cleared {
            merged.retain(|k, _| !range_contains(b, e, k));
        }
        for (key, buffered) in tx.writes.range((Included(begin), Excluded(end))) {
            match buffered {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        let limit = opts.limit.unwrap_or(usize::MAX);
        Ok(merged
            .into_iter()
            .take(limit)
            .map(|(key, value)| KvPair { key, value })
            .collect())
    }

    fn add_write_conflict_range(&self, begin: Bytes, end: Bytes) -> Result<()> {
        self.check_writable()?;
        let mut tx = self.state.lock().unwrap();
        tx.write_conflict_ranges.push((begin, end));
        Ok(())
    }

    fn watch(&self, key: Bytes) -> Result<Watch> {
        let (watch, sender) = Watch::channel(key.clone());
        let mut tx = self.state.lock().unwrap();
        tx.watches.push((key, sender));
        Ok(watch)
    }

    async fn commit(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::kv("commit issued on a read-only transaction"));
        }
        let mut tx = self.state.lock().unwrap();
        if tx.committed {
            return Err(Error::Internal("transaction already committed".into()));
        }

        let mut store = self.store.state.lock().unwrap();

        for (rb, re) in &tx.read_conflicts {
            if rb >= re {
                continue;
            }
            let conflicting_point = store
                .modified
                .range((Included(rb.clone()), Excluded(re.clone())))
                .any(|(_, &version)| version > tx.begin_version);
            let conflicting_range = store.range_marks.iter().any(|mark| {
                mark.version > tx.begin_version && ranges_overlap(rb, re, &mark.begin, &mark.end)
            });
            if conflicting_point || conflicting_range {
                return Err(Error::Conflict);
            }
        }

        tx.committed = true;
        store.version += 1;
        let version = store.version;

        for (begin, end) in tx.cleared.drain(..) {
            let removed: Vec<Bytes> = store
                .data
                .range((Included(begin.clone()), Excluded(end.clone())))
                .map(|(k, _)| k.clone())
                .collect();
            for key in removed {
                store.data.remove(&key);
                store.modified.insert(key.clone(), version);
                store.fire_watchers(&key);
            }
            store.range_marks.push(RangeMark {
                begin,
                end,
                version,
            });
        }

        let writes = std::mem::take(&mut tx.writes);
        for (key, buffered) in writes {
            match buffered {
                Some(value) => {
                    store.data.insert(key.clone(), value);
                }
                None => {
                    store.data.remove(&key);
                }
            }
            store.modified.insert(key.clone(), version);
            store.fire_watchers(&key);
        }

        for (begin, end) in tx.write_conflict_ranges.drain(..) {
            store.range_marks.push(RangeMark {
                begin,
                end,
                version,
            });
        }

        for (key, sender) in tx.watches.drain(..) {
            store.watchers.entry(key).or_default().push(sender);
        }

        Ok(())
    }
}

/// Smallest key strictly greater than `key`.
fn key_successor(key: &Bytes) -> Bytes {
    let mut succ = BytesMut::with_capacity(key.len() + 1);
    succ.extend_from_slice(key);
    succ.put_u8(0x00);
    succ.freeze()
}

fn range_contains(begin: &Bytes, end: &Bytes, key: &Bytes) -> bool {
    key >= begin && key < end
}

fn ranges_overlap(a_begin: &Bytes, a_end: &Bytes, b_begin: &Bytes, b_end: &Bytes) -> bool {
    a_begin < b_end && b_begin < a_end
}
