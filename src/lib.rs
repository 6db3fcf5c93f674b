//! Coffer - record storage and delayed task queues over an ordered
//! transactional key-value store.
//!
//! Coffer layers three things on top of a KV provider that offers ranged
//! scans, optimistic multi-key transactions, and key watches:
//!
//! - a **value codec** that transparently gzips large payloads and spills
//!   very large ones into chunked blobs behind an opaque id,
//! - a **record engine** that keeps user-defined secondary indexes in the
//!   same transaction as the primary record,
//! - a **delayed task queue** keyed by firing time, with watch-based
//!   sleeping subscribers and an in-flight "lost" sideband for
//!   at-least-once delivery.
//!
//! # Key Concepts
//!
//! - **Conn**: handle to one logical database; owns the KV connection, the
//!   tunables, and the index registry. Transactions run through
//!   [`Conn::tx`].
//! - **Record**: anything with an id, a collection, and a marshal/unmarshal
//!   pair. The engine never looks inside record buffers; user-registered
//!   index fabrics derive secondary keys from them.
//! - **Queue**: delayed publish/claim/ack over one collection, driven by
//!   the provider's watches instead of polling.
//!
//! # Example
//!
//! ```ignore
//! use coffer::{Conn, CONN_VERSION_MOCK};
//!
//! let conn = Conn::new(1, CONN_VERSION_MOCK)?;
//! conn.tx(|db| async move { db.save(&[&user]).await }).await?;
//!
//! let queue = conn.queue(0x0100, fabric);
//! conn.tx(|db| async move { queue.publish(&db, &user, None) }).await?;
//! ```

mod blob;
mod clock;
mod codec;
mod config;
mod conn;
mod engine;
mod error;
mod keys;
pub mod kv;
mod queue;
mod record;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::{Config, MAX_BLOB_SIZE, MAX_CHUNK_SIZE};
pub use conn::{CONN_VERSION_610, CONN_VERSION_MOCK, Conn};
pub use engine::{Db, SelectOptions};
pub use error::{Error, Result};
pub use queue::Queue;
pub use record::{Fabric, IndexFabric, Predicate, Record};
