//! Table export: ordered keyset-paginated reads piped into chunked CSV.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::csv_pipe::CsvPipe;
use crate::blobstore::{Resource, Store};
use crate::compression::Compression;
use crate::dbconn::Conn;
use crate::dbtable::VerifiedTable;
use crate::error::{MoltError, Result};
use crate::sqlbuild::{build_scan_query, ScanQuery};

pub struct ExportResult {
    pub resources: Vec<Arc<dyn Resource>>,
    pub num_rows: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Export one table into the store as a sequence of CSV chunks.
pub async fn export_table(
    ctx: &CancellationToken,
    source: &Conn,
    table: &VerifiedTable,
    store: &Arc<dyn Store>,
    compression: Compression,
    flush_size: usize,
    flush_rows: usize,
    row_batch_size: usize,
) -> Result<ExportResult> {
    let start_time = Utc::now();
    let columns = table.all_columns();
    let pk_len = table.pk_len();
    let source_types = table.side_types(0);
    let pk_types: Vec<_> = source_types[..pk_len].to_vec();
    let dialect = source.dialect();

    let store_ref = store.clone();
    let table_name = table.name.clone();
    let factory_columns = columns.clone();
    let mut pipe = CsvPipe::new(
        table.name.clone(),
        flush_size,
        flush_rows,
        Box::new(move |part| {
            store_ref.create_writer(&table_name, &factory_columns, part, compression)
        }),
    );

    let mut cursor: Option<Vec<Option<String>>> = None;
    loop {
        if ctx.is_cancelled() {
            return Err(MoltError::Cancelled);
        }
        let sql = build_scan_query(&ScanQuery {
            dialect,
            table: &table.name,
            columns: &columns,
            pk_columns: &table.pk_columns,
            pk_types: &pk_types,
            after: cursor.as_deref(),
            shard_lo: None,
            shard_hi: None,
            limit: row_batch_size,
        })?;
        let rows = source.query(&sql).await?;
        if rows.is_empty() {
            break;
        }
        let batch_len = rows.len();
        cursor = rows.last().map(|row| row[..pk_len].to_vec());
        for row in &rows {
            pipe.write_record(row).await?;
        }
        if batch_len < row_batch_size {
            break;
        }
    }

    let num_rows = pipe.num_rows();
    let resources = pipe.finish().await?;
    debug!(
        table = %table.name,
        num_rows,
        chunks = resources.len(),
        "export complete"
    );
    Ok(ExportResult {
        resources,
        num_rows,
        start_time,
        end_time: Utc::now(),
    })
}
