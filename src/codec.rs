//! Value codec.
//!
//! Stored values carry a one-byte flag prefix. Buffers over the gzip
//! threshold are compressed (`GZIP` bit); buffers whose packed form still
//! exceeds the chunk size are handed to the blob store and replaced by a
//! 16-byte blob id (`CHUNK` bit). The two transforms compose independently,
//! evaluated gzip-then-chunk, and `unpack` reverses them exactly.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::engine::Db;
use crate::error::{Error, Result};

/// Payload (after de-chunking) is gzip-compressed.
pub(crate) const FLAG_GZIP: u8 = 1 << 6;

/// Payload is a 16-byte blob id referring to chunked storage.
pub(crate) const FLAG_CHUNK: u8 = 1 << 7;

impl Db {
    /// Packs a marshaled buffer into its stored form.
    pub(crate) fn pack(&self, buffer: Bytes) -> Result<Bytes> {
        let config = self.conn().config();
        let mut flags = 0u8;
        let mut body = buffer;

        if body.len() > config.gzip_size {
            flags |= FLAG_GZIP;
            body = Bytes::from(gzip(&body)?);
        }

        if body.len() > config.chunk_size {
            flags |= FLAG_CHUNK;
            body = self.save_blob(body)?;
        }

        let mut value = BytesMut::with_capacity(1 + body.len());
        value.put_u8(flags);
        value.extend_from_slice(&body);
        Ok(value.freeze())
    }

    /// Unpacks a stored value back into the original buffer.
    ///
    /// Returns the blob id alongside the payload when the value was chunked,
    /// so callers that are about to destroy the record can drop the chunks.
    pub(crate) async fn unpack(&self, value: &[u8]) -> Result<(Option<Bytes>, Bytes)> {
        let Some((&flags, body)) = value.split_first() else {
            return Err(Error::MemFail("empty packed value".into()));
        };
        if flags & !(FLAG_GZIP | FLAG_CHUNK) != 0 {
            return Err(Error::MemFail(format!(
                "reserved flag bits set: {flags:#04x}"
            )));
        }

        let mut blob_id = None;
        let mut buffer = Bytes::copy_from_slice(body);

        if flags & FLAG_CHUNK != 0 {
            let id = buffer;
            buffer = self.load_blob(&id).await?;
            blob_id = Some(id);
        }

        if flags & FLAG_GZIP != 0 {
            buffer = Bytes::from(gunzip(&buffer)?);
        }

        Ok((blob_id, buffer))
    }
}

fn gzip(buffer: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(buffer).map_err(Error::mem_fail)?;
    encoder.finish().map_err(Error::mem_fail)
}

fn gunzip(buffer: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(buffer);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|err| match err.kind() {
        std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
            Error::InvalidGzip(err.to_string())
        }
        _ => Error::mem_fail(err),
    })?;
    Ok(out)
}
