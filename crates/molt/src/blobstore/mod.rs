//! Blob stores for intermediate chunk artifacts.
//!
//! A [`Store`] hands out [`ChunkWriter`]s; each finished chunk becomes a
//! [`Resource`] the target can load from (`IMPORT INTO` URL or a reader for
//! `COPY`). Chunk bytes are accumulated in memory — their size is bounded
//! by the CSV pipe's flush threshold — and uploaded on flush.

pub mod direct;
pub mod gcs;
pub mod local;
pub mod s3;

use std::io::{self, Write};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::write::GzEncoder;

use crate::compression::Compression;
use crate::dbtable::Name;
use crate::error::Result;

/// Handle to one finished chunk artifact.
#[async_trait]
pub trait Resource: Send + Sync {
    /// Object key or file name of the chunk.
    fn key(&self) -> &str;

    /// URL consumable by the target's bulk loader.
    fn import_url(&self) -> Result<String>;

    /// Chunk contents, for `COPY`-based loading.
    async fn read_all(&self) -> Result<Vec<u8>>;

    /// Delete the underlying artifact. Idempotent.
    async fn mark_for_cleanup(&self) -> Result<()>;
}

/// Uniform surface over the chunk storage backends.
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a writer for chunk `part` of `table`. Creation is cheap; the
    /// artifact is materialised when the writer is finished. `columns` is
    /// the CSV column order (used by the direct-copy store to build its
    /// `COPY` statement).
    fn create_writer(
        &self,
        table: &Name,
        columns: &[String],
        part: u32,
        compression: Compression,
    ) -> Result<ChunkWriter>;

    /// Byte threshold to use when no explicit flush size is configured.
    fn default_flush_batch_size(&self) -> usize;

    /// Whether the pipeline must run the load half itself (`IMPORT`/`COPY`).
    /// False when the store already loads data as part of flushing
    /// (direct-copy).
    fn can_be_target(&self) -> bool;

    /// Tear down store-level state (delete the chunk directory or prefix).
    async fn cleanup(&self) -> Result<()>;
}

/// Uploads one finished chunk; implemented per store.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn put(&self, key: String, data: Vec<u8>) -> Result<Arc<dyn Resource>>;
}

enum ChunkBuf {
    Plain(Vec<u8>),
    Gzip(GzEncoder<Vec<u8>>),
}

/// In-flight chunk: a (possibly gzip-wrapped) buffer plus the sink that
/// will persist it. Implements [`io::Write`] so the CSV writer can target
/// it directly.
pub struct ChunkWriter {
    key: String,
    buf: ChunkBuf,
    sink: Arc<dyn ChunkSink>,
}

impl ChunkWriter {
    pub fn new(key: String, compression: Compression, sink: Arc<dyn ChunkSink>) -> Self {
        let buf = match compression {
            Compression::Gzip => ChunkBuf::Gzip(GzEncoder::new(
                Vec::new(),
                flate2::Compression::default(),
            )),
            _ => ChunkBuf::Plain(Vec::new()),
        };
        Self { key, buf, sink }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Finish the encoder (flushing gzip trailers) and upload the chunk.
    pub async fn finish(self) -> Result<Arc<dyn Resource>> {
        let data = match self.buf {
            ChunkBuf::Plain(data) => data,
            ChunkBuf::Gzip(encoder) => encoder.finish()?,
        };
        self.sink.put(self.key, data).await
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match &mut self.buf {
            ChunkBuf::Plain(buf) => buf.write(data),
            ChunkBuf::Gzip(encoder) => encoder.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.buf {
            ChunkBuf::Plain(_) => Ok(()),
            ChunkBuf::Gzip(encoder) => encoder.flush(),
        }
    }
}

/// Chunk file name: `<schema>.<table>/part_00000042.csv[.gz]`.
pub fn chunk_key(table: &Name, part: u32, compression: Compression) -> String {
    let suffix = match compression {
        Compression::Gzip => ".gz",
        _ => "",
    };
    format!("{}/part_{:08}.csv{}", table.safe_string(), part, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::Mutex;

    struct MemorySink {
        chunks: Mutex<Vec<(String, Vec<u8>)>>,
    }

    struct MemoryResource {
        key: String,
    }

    #[async_trait]
    impl Resource for MemoryResource {
        fn key(&self) -> &str {
            &self.key
        }
        fn import_url(&self) -> Result<String> {
            Ok(format!("mem://{}", self.key))
        }
        async fn read_all(&self) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
        async fn mark_for_cleanup(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ChunkSink for MemorySink {
        async fn put(&self, key: String, data: Vec<u8>) -> Result<Arc<dyn Resource>> {
            self.chunks.lock().unwrap().push((key.clone(), data));
            Ok(Arc::new(MemoryResource { key }))
        }
    }

    #[test]
    fn test_chunk_key_format() {
        let name = Name::new("public", "users");
        assert_eq!(
            chunk_key(&name, 3, Compression::None),
            "public.users/part_00000003.csv"
        );
        assert_eq!(
            chunk_key(&name, 3, Compression::Gzip),
            "public.users/part_00000003.csv.gz"
        );
    }

    #[tokio::test]
    async fn test_plain_writer_round_trip() {
        let sink = Arc::new(MemorySink {
            chunks: Mutex::new(Vec::new()),
        });
        let mut w = ChunkWriter::new("k".into(), Compression::None, sink.clone());
        w.write_all(b"1,alice,admin\n").unwrap();
        let resource = w.finish().await.unwrap();
        assert_eq!(resource.key(), "k");
        let chunks = sink.chunks.lock().unwrap();
        assert_eq!(chunks[0].1, b"1,alice,admin\n");
    }

    #[tokio::test]
    async fn test_gzip_writer_produces_decodable_output() {
        let sink = Arc::new(MemorySink {
            chunks: Mutex::new(Vec::new()),
        });
        let mut w = ChunkWriter::new("k.gz".into(), Compression::Gzip, sink.clone());
        w.write_all(b"1,alice,admin\n").unwrap();
        w.finish().await.unwrap();

        let chunks = sink.chunks.lock().unwrap();
        let mut decoder = flate2::read::GzDecoder::new(chunks[0].1.as_slice());
        let mut decoded = String::new();
        decoder.read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, "1,alice,admin\n");
    }
}
