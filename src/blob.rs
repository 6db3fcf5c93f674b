//! Chunked blob storage.
//!
//! Buffers too large for a single KV value are split into chunks of at most
//! `chunk_size` bytes under a freshly generated 128-bit id. Chunk keys are
//! `(chunk_type, id ‖ index_u16_BE)`, so an in-order range scan reassembles
//! the blob without any manifest. All chunk writes land in the enclosing
//! transaction; a blob either exists completely or not at all.

use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::config::MAX_BLOB_SIZE;
use crate::engine::Db;
use crate::error::{Error, Result};
use crate::kv::{ScanMode, ScanOptions};

impl Db {
    /// Writes `blob` as chunks and returns the generated 16-byte blob id.
    #[tracing::instrument(level = "trace", skip_all)]
    pub(crate) fn save_blob(&self, blob: Bytes) -> Result<Bytes> {
        if blob.len() > MAX_BLOB_SIZE {
            return Err(Error::MemFail(format!(
                "blob of {} bytes exceeds the {} byte transaction limit",
                blob.len(),
                MAX_BLOB_SIZE
            )));
        }

        let id = Uuid::new_v4();
        let keys = self.keyspace();
        let config = self.conn().config();

        for (index, chunk) in blob.chunks(config.chunk_size).enumerate() {
            let index = u16::try_from(index)
                .map_err(|_| Error::MemFail("blob chunk count exceeds u16".into()))?;
            let mut chunk_id = BytesMut::with_capacity(16 + 2);
            chunk_id.extend_from_slice(id.as_bytes());
            chunk_id.put_u16(index);
            self.transaction().set(
                keys.key(config.chunk_type, &chunk_id),
                Bytes::copy_from_slice(chunk),
            )?;
        }

        Ok(Bytes::copy_from_slice(id.as_bytes()))
    }

    /// Reassembles a blob by scanning its chunk range in key order.
    #[tracing::instrument(level = "trace", skip_all)]
    pub(crate) async fn load_blob(&self, id: &[u8]) -> Result<Bytes> {
        let (begin, end) = self.blob_range(id);
        let rows = self
            .transaction()
            .get_range(
                begin,
                end,
                ScanOptions {
                    limit: None,
                    mode: ScanMode::Iterator,
                },
            )
            .await?;

        let mut blob = BytesMut::with_capacity(rows.iter().map(|row| row.value.len()).sum());
        for row in rows {
            blob.extend_from_slice(&row.value);
        }
        Ok(blob.freeze())
    }

    /// Clears every chunk of the blob.
    pub(crate) fn drop_blob(&self, id: &[u8]) -> Result<()> {
        let (begin, end) = self.blob_range(id);
        self.transaction().clear_range(begin, end)
    }

    /// Chunk-key range of one blob. Chunk indexes are u16 BE, so a single
    /// 0xFF suffix bounds every index the size limit permits.
    fn blob_range(&self, id: &[u8]) -> (Bytes, Bytes) {
        let begin = self.keyspace().key(self.conn().config().chunk_type, id);
        let mut end = BytesMut::with_capacity(begin.len() + 1);
        end.extend_from_slice(&begin);
        end.put_u8(0xFF);
        (begin, end.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Db;
    use crate::{CONN_VERSION_MOCK, Config, Conn};

    async fn engine_with_chunk_size(chunk_size: usize) -> (Conn, Db) {
        let config = Config {
            chunk_size,
            ..Config::default()
        };
        let conn = Conn::with_config(1, CONN_VERSION_MOCK, config).unwrap();
        let tx = conn.kv().transaction().await.unwrap();
        let db = Db::new(conn.clone(), tx);
        (conn, db)
    }

    #[tokio::test]
    async fn should_split_into_expected_chunk_sizes() {
        // given
        let (_conn, db) = engine_with_chunk_size(100_000).await;
        let blob = Bytes::from(vec![b'x'; 250_000]);

        // when
        let id = db.save_blob(blob).unwrap();

        // then - chunks 0,1,2 of sizes 100000,100000,50000
        let (begin, end) = db.blob_range(&id);
        let rows = db
            .transaction()
            .get_range(begin, end, ScanOptions::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].value.len(), 100_000);
        assert_eq!(rows[1].value.len(), 100_000);
        assert_eq!(rows[2].value.len(), 50_000);
        let prefix_len = 4 + 16;
        assert_eq!(&rows[0].key[prefix_len..], &[0x00, 0x00]);
        assert_eq!(&rows[1].key[prefix_len..], &[0x00, 0x01]);
        assert_eq!(&rows[2].key[prefix_len..], &[0x00, 0x02]);
    }

    #[tokio::test]
    async fn should_reassemble_in_index_order() {
        // given
        let (_conn, db) = engine_with_chunk_size(10).await;
        let blob: Bytes = (0..=255u8).collect();

        // when
        let id = db.save_blob(blob.clone()).unwrap();
        let loaded = db.load_blob(&id).await.unwrap();

        // then
        assert_eq!(loaded, blob);
    }

    #[tokio::test]
    async fn should_drop_all_chunks() {
        // given
        let (_conn, db) = engine_with_chunk_size(10).await;
        let id = db.save_blob(Bytes::from(vec![1u8; 100])).unwrap();

        // when
        db.drop_blob(&id).unwrap();

        // then
        let loaded = db.load_blob(&id).await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn should_reject_blob_over_transaction_limit() {
        // given
        let (_conn, db) = engine_with_chunk_size(100_000).await;
        let blob = Bytes::from(vec![0u8; MAX_BLOB_SIZE + 1]);

        // when
        let result = db.save_blob(blob);

        // then
        assert!(matches!(result, Err(Error::MemFail(_))));
    }
}
