//! Delayed task queue.
//!
//! Entries live in two sub-spaces of one queue collection: pending keys
//! `time_u64_BE ‖ id` sort by firing time, lost keys `0xFF ‖ id` hold
//! claimed-but-unacknowledged entries for at-least-once delivery. The watch
//! key `0xFF 0xFF` is written on every publish so sleeping subscribers
//! re-check instead of waiting out their full punch interval.

use std::panic::AssertUnwindSafe;
use std::time::{Duration, SystemTime};

use bytes::{BufMut, Bytes, BytesMut};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::unix_nanos;
use crate::conn::Conn;
use crate::engine::Db;
use crate::error::{Error, Result};
use crate::keys::PREFIX_LEN;
use crate::kv::{ScanMode, ScanOptions, Watch};
use crate::record::{Fabric, Record};

/// First byte of every lost-entry key; sorts after any realistic time key.
const LOST_PREFIX: u8 = 0xFF;

/// Suffix of the watch key, written on every publish.
const WATCH_SUFFIX: [u8; 2] = [0xFF, 0xFF];

/// Delayed task queue over one collection type.
///
/// Cloneable; clones share the connection and fabric.
#[derive(Clone)]
pub struct Queue {
    conn: Conn,
    qtype: u16,
    fabric: Fabric,
}

impl Queue {
    pub(crate) fn new(conn: Conn, qtype: u16, fabric: Fabric) -> Self {
        Self {
            conn,
            qtype,
            fabric,
        }
    }

    /// The queue's collection id and fabric.
    pub fn settings(&self) -> (u16, Fabric) {
        (self.qtype, self.fabric.clone())
    }

    /// Schedules a record for delivery at `when` (`None` means now).
    ///
    /// Both the pending key and the watch key are written in the caller's
    /// transaction, so a publish becomes visible to subscribers exactly when
    /// the surrounding work commits. Publishing the same `(when, id)` twice
    /// stores a single entry.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn publish(&self, db: &Db, record: &dyn Record, when: Option<SystemTime>) -> Result<()> {
        let when = when.unwrap_or_else(|| self.conn.clock().now());
        let nanos = unix_nanos(when);

        let mid = record.id();
        let mut key = BytesMut::with_capacity(8 + mid.len());
        key.put_u64(nanos);
        key.extend_from_slice(&mid);

        db.set(self.qtype, &key, &[])?;
        db.set(self.qtype, &WATCH_SUFFIX, &nanos.to_be_bytes())
    }

    /// Acknowledges a claimed record, deleting its lost entry. Acking an
    /// entry that is not in the lost sub-space is a no-op.
    #[tracing::instrument(level = "trace", skip_all)]
    pub fn ack(&self, db: &Db, record: &dyn Record) -> Result<()> {
        db.del(self.qtype, &lost_id(&record.id()))
    }

    /// Collects one record, waiting for it to become due.
    pub async fn sub_one(&self, token: &CancellationToken) -> Result<Box<dyn Record>> {
        let mut list = self.sub_list(token, 1).await?;
        list.pop()
            .ok_or_else(|| Error::Internal("subscription returned no records".into()))
    }

    /// Collects `limit` records, sleeping between claim attempts.
    ///
    /// The sleep is bounded by the distance to the next due task and by the
    /// configured punch interval, and is cut short when the watch armed by
    /// an empty claim fires. Cancellation is honored at every await; the
    /// pending watch is dropped (cancelled) on the way out.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn sub_list(
        &self,
        token: &CancellationToken,
        limit: usize,
    ) -> Result<Vec<Box<dyn Record>>> {
        let mut list: Vec<Box<dyn Record>> = Vec::new();
        let mut pending_watch: Option<Watch> = None;

        while list.len() < limit {
            if let Some(watch) = pending_watch.take() {
                let distance = self.next_task_distance().await?;
                let punch = distance.min(self.conn.config().punch_size);
                tokio::select! {
                    _ = watch.fired() => {}
                    _ = tokio::time::sleep(punch) => {}
                    _ = token.cancelled() => return Err(Error::Cancelled),
                }
            }
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let (watch, ids) = self.claim(limit - list.len()).await?;
            pending_watch = watch;
            if ids.is_empty() {
                continue;
            }

            let fabric = self.fabric.clone();
            let records = self
                .conn
                .tx(move |db| {
                    let fabric = fabric.clone();
                    let ids = ids.clone();
                    async move { hydrate(&db, &fabric, &ids).await }
                })
                .await?;
            list.extend(records);
        }

        Ok(list)
    }

    /// Spawns a subscription task that forwards records until cancelled.
    ///
    /// The task owns the token and closes both channels on exit; the
    /// terminal error — including the cancellation itself and any panic,
    /// surfaced as [`Error::QueuePanic`] — is delivered on the error channel
    /// first.
    pub fn sub(
        &self,
        token: CancellationToken,
    ) -> (mpsc::Receiver<Box<dyn Record>>, mpsc::Receiver<Error>) {
        let (record_tx, record_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(1);
        let queue = self.clone();

        tokio::spawn(async move {
            let run = async {
                loop {
                    let record = queue.sub_one(&token).await?;
                    tokio::select! {
                        sent = record_tx.send(record) => {
                            if sent.is_err() {
                                // receiver gone, nothing left to deliver to
                                return Ok(());
                            }
                        }
                        _ = token.cancelled() => return Err(Error::Cancelled),
                    }
                }
            };

            match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    let _ = error_tx.send(err).await;
                }
                Err(panic) => {
                    let _ = error_tx.send(Error::QueuePanic(panic_message(panic))).await;
                }
            }
        });

        (record_rx, error_rx)
    }

    /// Entries claimed but never acknowledged, up to `limit`.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn get_lost(&self, limit: usize) -> Result<Vec<Box<dyn Record>>> {
        let qtype = self.qtype;
        let fabric = self.fabric.clone();
        self.conn
            .read_tx(move |db| {
                let fabric = fabric.clone();
                async move {
                    let keys = db.keyspace();
                    let rows = db
                        .transaction()
                        .get_range(
                            keys.key(qtype, &[LOST_PREFIX]),
                            keys.key(qtype, &WATCH_SUFFIX),
                            ScanOptions {
                                limit: Some(limit),
                                mode: ScanMode::WantAll,
                            },
                        )
                        .await?;
                    let ids: Vec<Bytes> = rows
                        .iter()
                        .filter(|row| row.key.len() > PREFIX_LEN)
                        .map(|row| row.key.slice(PREFIX_LEN + 1..))
                        .collect();
                    hydrate(&db, &fabric, &ids).await
                }
            })
            .await
    }

    /// Time until the earliest pending entry is due, padded by a
    /// millisecond; the punch interval when the queue is empty.
    pub async fn next_task_distance(&self) -> Result<Duration> {
        let qtype = self.qtype;
        let punch = self.conn.config().punch_size;
        self.conn
            .read_tx(move |db| async move {
                let keys = db.keyspace();
                let rows = db
                    .transaction()
                    .get_range(
                        keys.key(qtype, &[0x00]),
                        keys.key(qtype, &[LOST_PREFIX]),
                        ScanOptions {
                            limit: Some(1),
                            mode: ScanMode::WantAll,
                        },
                    )
                    .await?;
                let Some(row) = rows.first() else {
                    return Ok(punch);
                };
                let Some(due) = time_of(&row.key) else {
                    return Ok(punch);
                };
                let now = db.conn().clock().now_unix_nanos();
                Ok(Duration::from_nanos(due.saturating_sub(now)) + Duration::from_millis(1))
            })
            .await
    }

    /// Moves up to `limit` due entries from pending to lost in one
    /// transaction and returns their ids.
    ///
    /// The write-conflict range over the due window serializes concurrent
    /// claimers: each due key is won by at most one of them. When nothing is
    /// due, a watch on the publish key is returned instead.
    #[tracing::instrument(level = "trace", skip_all)]
    async fn claim(&self, limit: usize) -> Result<(Option<Watch>, Vec<Bytes>)> {
        let qtype = self.qtype;
        self.conn
            .tx(move |db| async move {
                let keys = db.keyspace();
                let now = db.conn().clock().now_unix_nanos();
                let begin = keys.key(qtype, &[0x00]);
                let end = keys.key(qtype, &now.to_be_bytes());

                let tx = db.transaction();
                tx.add_write_conflict_range(begin.clone(), end.clone())?;
                let rows = tx
                    .get_range(
                        begin,
                        end,
                        ScanOptions {
                            limit: Some(limit),
                            mode: ScanMode::WantAll,
                        },
                    )
                    .await?;

                if rows.is_empty() {
                    let watch = tx.watch(keys.key(qtype, &WATCH_SUFFIX))?;
                    return Ok((Some(watch), Vec::new()));
                }

                let mut ids = Vec::with_capacity(rows.len());
                for row in rows {
                    if row.key.len() < PREFIX_LEN + 8 {
                        continue;
                    }
                    let mid = row.key.slice(PREFIX_LEN + 8..);
                    tx.set(keys.key(qtype, &lost_id(&mid)), Bytes::new())?;
                    tx.clear(row.key.clone())?;
                    ids.push(mid);
                }
                Ok((None, ids))
            })
            .await
    }
}

/// Hydrates records for the given ids through the fabric and a batched load.
async fn hydrate(db: &Db, fabric: &Fabric, ids: &[Bytes]) -> Result<Vec<Box<dyn Record>>> {
    let mut records = ids
        .iter()
        .map(|id| fabric(id.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    {
        let mut refs: Vec<&mut dyn Record> = Vec::with_capacity(records.len());
        for record in records.iter_mut() {
            refs.push(record.as_mut());
        }
        db.load(&mut refs).await?;
    }
    Ok(records)
}

fn lost_id(mid: &[u8]) -> Bytes {
    let mut id = BytesMut::with_capacity(1 + mid.len());
    id.put_u8(LOST_PREFIX);
    id.extend_from_slice(mid);
    id.freeze()
}

/// Firing time embedded in a pending key, if the key is well-formed.
fn time_of(key: &Bytes) -> Option<u64> {
    let time = key.get(PREFIX_LEN..PREFIX_LEN + 8)?;
    Some(u64::from_be_bytes(time.try_into().ok()?))
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
