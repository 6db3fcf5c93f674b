//! Record trait and the function types the engine is polymorphic over.
//!
//! Records are opaque to the engine: it only ever calls the four operations
//! below plus the previous-dump hook. Everything else — field layout, wire
//! format, id scheme — belongs to the caller.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;

/// A persistable entity.
///
/// Implementations own their serialization; the engine packs whatever
/// [`marshal`](Record::marshal) returns and hands the unpacked bytes back to
/// [`unmarshal`](Record::unmarshal) on load.
pub trait Record: Send {
    /// Identifier, unique within the record's collection.
    fn id(&self) -> Bytes;

    /// Collection id this record belongs to.
    fn collection(&self) -> u16;

    /// Serializes the current fields.
    fn marshal(&self) -> Result<Bytes>;

    /// Populates fields from a previously marshaled buffer.
    fn unmarshal(&mut self, buf: &[u8]) -> Result<()>;

    /// The marshaled buffer this record was last loaded from, if any.
    ///
    /// When nonempty, [`Db::save`](crate::Db::save) treats it as the
    /// authoritative previous value and clears the index entries derived
    /// from it before writing fresh ones. Implementations that want index
    /// invalidation capture the buffer inside [`unmarshal`](Record::unmarshal);
    /// the engine never tracks it on their behalf.
    fn previous_dump(&self) -> Option<Bytes> {
        None
    }
}

/// Produces a fresh record for the given id, used to hydrate query and queue
/// results.
pub type Fabric = Arc<dyn Fn(&[u8]) -> Result<Box<dyn Record>> + Send + Sync>;

/// Derives secondary-index entries from a marshaled record buffer.
///
/// Each returned pair is `(index collection id, index key)`; the engine
/// stores the entry at `(DBNUM, index ctype, index key)` with an empty value.
pub type IndexFabric = Arc<dyn Fn(&[u8]) -> Result<Vec<(u16, Bytes)>> + Send + Sync>;

/// Filters decoded payloads during [`Db::select`](crate::Db::select) scans.
pub type Predicate = Arc<dyn Fn(&[u8]) -> Result<bool> + Send + Sync>;
