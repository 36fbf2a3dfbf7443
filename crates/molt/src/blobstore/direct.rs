//! Direct-copy store: no persistence, every finished chunk is streamed
//! straight into `COPY ... FROM STDIN CSV` on the target.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{ChunkSink, ChunkWriter, Resource, Store};
use crate::compression::Compression;
use crate::dbconn::pg::PgConn;
use crate::dbconn::Dialect;
use crate::dbtable::Name;
use crate::error::{MoltError, Result};
use crate::sqlbuild::{qualify_table, quote_ident};

const DEFAULT_FLUSH_SIZE: usize = 16 << 20;

pub struct DirectCopyStore {
    target: Arc<PgConn>,
}

struct DirectSink {
    target: Arc<PgConn>,
    stmt: String,
}

/// Marker for a chunk that has already been copied into the target. It has
/// no artifact to import, read, or clean.
struct CopiedResource {
    key: String,
}

impl DirectCopyStore {
    /// `target` must be an independent connection (a clone), as chunk
    /// copies run concurrently with the engine's own statements.
    pub fn new(target: PgConn) -> Self {
        Self {
            target: Arc::new(target),
        }
    }
}

#[async_trait]
impl Store for DirectCopyStore {
    fn create_writer(
        &self,
        table: &Name,
        columns: &[String],
        part: u32,
        compression: Compression,
    ) -> Result<ChunkWriter> {
        if compression == Compression::Gzip {
            return Err(MoltError::Config(
                "direct copy cannot use compression".to_string(),
            ));
        }
        let col_list = columns
            .iter()
            .map(|c| quote_ident(Dialect::PostgresWire, c))
            .collect::<Vec<_>>()
            .join(", ");
        let stmt = format!(
            "COPY {} ({}) FROM STDIN CSV",
            qualify_table(Dialect::PostgresWire, table),
            col_list
        );
        Ok(ChunkWriter::new(
            format!("{}/part_{:08}", table.safe_string(), part),
            compression,
            Arc::new(DirectSink {
                target: self.target.clone(),
                stmt,
            }),
        ))
    }

    fn default_flush_batch_size(&self) -> usize {
        DEFAULT_FLUSH_SIZE
    }

    fn can_be_target(&self) -> bool {
        // The load half already happened chunk by chunk.
        false
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ChunkSink for DirectSink {
    async fn put(&self, key: String, data: Vec<u8>) -> Result<Arc<dyn Resource>> {
        let rows = self.target.copy_from(&self.stmt, data).await?;
        debug!(key, rows, "copied chunk into target");
        Ok(Arc::new(CopiedResource { key }))
    }
}

#[async_trait]
impl Resource for CopiedResource {
    fn key(&self) -> &str {
        &self.key
    }

    fn import_url(&self) -> Result<String> {
        Err(MoltError::assertion(
            "direct-copy chunks have no import URL",
        ))
    }

    async fn read_all(&self) -> Result<Vec<u8>> {
        Err(MoltError::assertion(
            "direct-copy chunks are not readable after load",
        ))
    }

    async fn mark_for_cleanup(&self) -> Result<()> {
        Ok(())
    }
}
