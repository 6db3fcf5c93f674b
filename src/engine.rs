//! Record engine.
//!
//! A [`Db`] binds one KV transaction to a connection for the duration of a
//! transaction scope. Raw [`get`](Db::get)/[`set`](Db::set)/[`del`](Db::del)
//! pass bytes straight through; [`save`](Db::save)/[`load`](Db::load)/
//! [`drop`](Db::drop) run records through the value codec and keep secondary
//! indexes in step with the primary value; [`select`](Db::select) hydrates a
//! key range back into records.

use std::sync::Arc;

use bytes::Bytes;

use crate::conn::Conn;
use crate::error::Result;
use crate::keys::Keyspace;
use crate::kv::{KvTransaction, ScanMode, ScanOptions};
use crate::record::{Fabric, Predicate, Record};

/// Options for [`Db::select`].
///
/// `gte`/`lt` bound the scanned id range (defaults `0x00`..`0xFF`). Exactly
/// one of `id_len` (take the last N key bytes) or `prefix_len` (strip the
/// first N key bytes, counted over the full KV key including the 4-byte
/// database/collection prefix) determines the id handed to the fabric; with
/// neither set the fabric receives an empty id.
#[derive(Clone, Default)]
pub struct SelectOptions {
    pub gte: Option<Bytes>,
    pub lt: Option<Bytes>,
    pub limit: Option<usize>,
    pub id_len: Option<usize>,
    pub prefix_len: Option<usize>,
    pub filter: Option<Predicate>,
}

/// Record engine bound to one open transaction.
///
/// Handed to transaction handlers by [`Conn::tx`](crate::Conn::tx); cheap to
/// clone, but must not outlive its transaction scope.
#[derive(Clone)]
pub struct Db {
    conn: Conn,
    tx: Arc<dyn KvTransaction>,
}

impl Db {
    pub(crate) fn new(conn: Conn, tx: Arc<dyn KvTransaction>) -> Self {
        Self { conn, tx }
    }

    /// The connection this engine was opened from.
    pub fn conn(&self) -> &Conn {
        &self.conn
    }

    pub(crate) fn transaction(&self) -> &dyn KvTransaction {
        self.tx.as_ref()
    }

    pub(crate) fn keyspace(&self) -> Keyspace {
        self.conn.keyspace()
    }

    /// Reads the raw value at `(ctype, id)`, bypassing the codec.
    pub async fn get(&self, ctype: u16, id: &[u8]) -> Result<Option<Bytes>> {
        self.tx.get(self.keyspace().key(ctype, id)).await
    }

    /// Writes a raw value at `(ctype, id)`, bypassing the codec.
    pub fn set(&self, ctype: u16, id: &[u8], value: &[u8]) -> Result<()> {
        self.tx
            .set(self.keyspace().key(ctype, id), Bytes::copy_from_slice(value))
    }

    /// Clears the key at `(ctype, id)`.
    pub fn del(&self, ctype: u16, id: &[u8]) -> Result<()> {
        self.tx.clear(self.keyspace().key(ctype, id))
    }

    /// Persists records together with their secondary-index entries.
    ///
    /// For each record: index entries derived from its previous dump are
    /// cleared, entries derived from the fresh marshaled buffer are written,
    /// and the packed buffer lands at the primary key — all inside this
    /// engine's transaction, so the index set can never drift from the
    /// stored value.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn save(&self, records: &[&dyn Record]) -> Result<()> {
        for record in records {
            self.save_one(*record)?;
        }
        Ok(())
    }

    fn save_one(&self, record: &dyn Record) -> Result<()> {
        let keys = self.keyspace();
        let key = keys.record_key(record);
        let indexes = self.conn.indexes(record.collection());

        // stale entries first, computed from the buffer the record was
        // loaded from
        if let Some(prev) = record.previous_dump()
            && !prev.is_empty()
        {
            for fabric in &indexes {
                for (ctype, idx) in fabric(&prev)? {
                    self.tx.clear(keys.key(ctype, &idx))?;
                }
            }
        }

        let buffer = record.marshal()?;
        for fabric in &indexes {
            for (ctype, idx) in fabric(&buffer)? {
                self.tx.set(keys.key(ctype, &idx), Bytes::new())?;
            }
        }

        let value = self.pack(buffer)?;
        self.tx.set(key, value)
    }

    /// Loads records in place.
    ///
    /// All point reads are issued up front and awaited afterwards, so the
    /// provider can satisfy them in one round of pipelined I/O. Records with
    /// no stored value are left untouched.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn load(&self, records: &mut [&mut dyn Record]) -> Result<()> {
        let keys = self.keyspace();
        let mut futures = Vec::with_capacity(records.len());
        for record in records.iter() {
            futures.push(self.tx.get(keys.record_key(&**record)));
        }

        for (record, future) in records.iter_mut().zip(futures) {
            let Some(value) = future.await? else { continue };
            if value.is_empty() {
                continue;
            }
            let (_, buffer) = self.unpack(&value).await?;
            record.unmarshal(&buffer)?;
        }
        Ok(())
    }

    /// Destroys records: primary value, derived index entries, and any
    /// referenced blob chunks. Reads are pipelined the same way as
    /// [`load`](Db::load).
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn drop(&self, records: &[&dyn Record]) -> Result<()> {
        let keys = self.keyspace();
        let mut primary = Vec::with_capacity(records.len());
        let mut futures = Vec::with_capacity(records.len());
        for record in records {
            let key = keys.record_key(*record);
            futures.push(self.tx.get(key.clone()));
            primary.push(key);
        }

        for ((record, future), key) in records.iter().zip(futures).zip(primary) {
            if let Some(value) = future.await?
                && !value.is_empty()
            {
                let (blob_id, buffer) = self.unpack(&value).await?;
                if let Some(id) = blob_id {
                    self.drop_blob(&id)?;
                }
                let indexes = self.conn.indexes(record.collection());
                for fabric in &indexes {
                    for (ctype, idx) in fabric(&buffer)? {
                        self.tx.clear(keys.key(ctype, &idx))?;
                    }
                }
            }
            self.tx.clear(key)?;
        }
        Ok(())
    }

    /// Scans a collection (or index) range and hydrates each row through the
    /// fabric. Results come back ascending by key.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn select(
        &self,
        ctype: u16,
        fabric: &Fabric,
        opts: SelectOptions,
    ) -> Result<Vec<Box<dyn Record>>> {
        let keys = self.keyspace();
        let begin = keys.key(ctype, opts.gte.as_deref().unwrap_or(&[0x00]));
        let end = keys.key(ctype, opts.lt.as_deref().unwrap_or(&[0xFF]));
        let rows = self
            .tx
            .get_range(
                begin,
                end,
                ScanOptions {
                    limit: opts.limit,
                    mode: ScanMode::WantAll,
                },
            )
            .await?;

        let mut list: Vec<Box<dyn Record>> = Vec::with_capacity(rows.len());
        for row in rows {
            let mid: &[u8] = if let Some(id_len) = opts.id_len {
                let start = row.key.len().saturating_sub(id_len);
                &row.key[start..]
            } else if let Some(prefix_len) = opts.prefix_len {
                row.key.get(prefix_len..).unwrap_or(&[])
            } else {
                &[]
            };

            let (_, payload) = self.unpack(&row.value).await?;

            if let Some(filter) = &opts.filter
                && !filter(&payload)?
            {
                continue;
            }

            let mut record = fabric(mid)?;
            record.unmarshal(&payload)?;
            list.push(record);
        }
        Ok(list)
    }
}
