//! Keyspace layout with big-endian encoding.
//!
//! Every logical key is `DBNUM (u16 BE) ‖ CTYPE (u16 BE) ‖ ID`, so keys of
//! one database sort together, collections sort within a database, and ids
//! sort within a collection. All key construction goes through [`Keyspace`];
//! nothing else in the crate concatenates key bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::record::Record;

/// Length of the `DBNUM ‖ CTYPE` prefix on every key.
pub(crate) const PREFIX_LEN: usize = 4;

/// Key constructor bound to one database number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Keyspace {
    db: u16,
}

impl Keyspace {
    pub(crate) fn new(db: u16) -> Self {
        Self { db }
    }

    pub(crate) fn db(&self) -> u16 {
        self.db
    }

    /// `DBNUM ‖ ctype ‖ id`. Empty ids are valid; the queue and blob store
    /// use bare sentinel suffixes on top of them.
    pub(crate) fn key(&self, ctype: u16, id: &[u8]) -> Bytes {
        let mut key = BytesMut::with_capacity(PREFIX_LEN + id.len());
        key.put_u16(self.db);
        key.put_u16(ctype);
        key.extend_from_slice(id);
        key.freeze()
    }

    /// Primary key of a record: `key(record.collection(), record.id())`.
    pub(crate) fn record_key(&self, record: &dyn Record) -> Bytes {
        self.key(record.collection(), &record.id())
    }

    /// Exclusive upper bound covering every key of this database.
    pub(crate) fn db_end(&self) -> Bytes {
        let mut end = BytesMut::with_capacity(PREFIX_LEN + 24);
        match self.db.checked_add(1) {
            Some(next) => end.put_u16(next),
            None => {
                // no successor prefix exists for the last database; bound
                // past any key this crate constructs itself
                end.put_u16(self.db);
                end.put_u16(u16::MAX);
                end.put_slice(&[0xFF; 24]);
            }
        }
        end.freeze()
    }

    /// Inclusive lower bound covering every key of this database.
    pub(crate) fn db_begin(&self) -> Bytes {
        let mut key = BytesMut::with_capacity(2);
        key.put_u16(self.db);
        key.freeze()
    }
}
