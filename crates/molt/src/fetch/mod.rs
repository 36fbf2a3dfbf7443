//! The fetch engine: export every table from the source into chunked CSV
//! artifacts and load them into the CockroachDB target.

pub mod csv_pipe;
pub mod export;
pub mod import;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::blobstore::{Resource, Store};
use crate::compression::Compression;
use crate::dbconn::{Conn, Dialect, OrderedConns};
use crate::dbtable::{Name, VerifiedTable};
use crate::error::{MoltError, Result};
use crate::filter::TableFilter;
use crate::sqlbuild::{qualify_table, quote_literal};
use crate::tableverify::{self, dbverify};

/// Postgres logical-replication slot settings. The slot is only an anchor:
/// its consistent snapshot identifier is recorded so downstream replication
/// can resume from the export moment; the engine itself never streams
/// changes.
#[derive(Debug, Clone, Default)]
pub struct PgReplicationSettings {
    pub slot_name: String,
    pub plugin: String,
    pub drop_if_exists: bool,
}

#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub row_batch_size: usize,
    pub pg: PgReplicationSettings,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            row_batch_size: 100_000,
            pg: PgReplicationSettings {
                plugin: "pgoutput".to_string(),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub flush_size: usize,
    pub flush_rows: usize,
    pub cleanup: bool,
    /// Tables stay queryable during load: chunks are applied with `COPY`
    /// instead of `IMPORT INTO`.
    pub live: bool,
    pub truncate: bool,
    pub concurrency: usize,
    pub compression: Compression,
    pub export: ExportSettings,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            flush_size: 0,
            flush_rows: 0,
            cleanup: false,
            live: false,
            truncate: false,
            concurrency: 4,
            compression: Compression::Default,
            export: ExportSettings::default(),
        }
    }
}

/// Snapshot of one fetch run: the export window, the optional replication
/// anchor, and the chunk artifacts per table.
pub struct ExportSnapshot {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub snapshot_id: Option<String>,
    pub resources: HashMap<Name, Vec<Arc<dyn Resource>>>,
}

/// Resolve the `default` compression per mode, and refuse the combinations
/// that cannot work: `COPY` has no decompression step, so copy modes force
/// plain CSV.
pub fn resolve_compression(copy_mode: bool, compression: Compression) -> Result<Compression> {
    if copy_mode {
        match compression {
            Compression::Gzip => Err(MoltError::Config(
                "cannot run copy mode with compression".to_string(),
            )),
            Compression::Default => {
                info!("default compression to none");
                Ok(Compression::None)
            }
            Compression::None => Ok(Compression::None),
        }
    } else {
        match compression {
            Compression::Default => {
                info!("default compression to gzip");
                Ok(Compression::Gzip)
            }
            other => Ok(other),
        }
    }
}

/// Move all matching tables from the source into the target.
///
/// Per-table failures are isolated: remaining tables keep going and the
/// first error is returned once in-flight tables finalise.
pub async fn fetch(
    ctx: CancellationToken,
    cfg: FetchConfig,
    conns: &OrderedConns,
    store: Arc<dyn Store>,
    filter: &TableFilter,
) -> Result<()> {
    if !conns.target().is_cockroach() {
        return Err(MoltError::assertion("target must be cockroach"));
    }
    let copy_mode = cfg.live || !store.can_be_target();
    let compression = resolve_compression(copy_mode, cfg.compression)?;
    let flush_size = if cfg.flush_size > 0 {
        cfg.flush_size
    } else {
        store.default_flush_batch_size()
    };

    let start_time = Utc::now();

    info!("verifying database details");
    let db_result = dbverify::verify(conns, filter).await?;
    let verifications = tableverify::verify_common_tables(conns, &db_result.verified).await?;

    let snapshot_id = create_replication_slot(conns.source(), &cfg.export.pg).await?;

    let semaphore = Arc::new(Semaphore::new(cfg.concurrency.max(1)));
    let mut tasks: JoinSet<(Name, Result<TableFetchResult>)> = JoinSet::new();

    for verification in verifications {
        for mismatch in &verification.mismatches {
            warn!(
                table = %mismatch.table,
                conn = %mismatch.conn_id,
                reason = %mismatch.info,
                "table definition mismatch"
            );
        }
        let table = match verification.table {
            Some(table) => table,
            None => {
                warn!(table = %verification.name, "skipping table: schemas do not align");
                continue;
            }
        };

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MoltError::Cancelled)?;
        let source = conns.source().clone_conn().await?;
        let target = conns.target().clone_conn().await?;
        let store = store.clone();
        let cfg = cfg.clone();
        let ctx = ctx.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let name = table.name.clone();
            let result = fetch_table(
                &ctx, &cfg, &source, &target, store, &table, compression, flush_size,
            )
            .await;
            let _ = source.close().await;
            let _ = target.close().await;
            (name, result)
        });
    }

    let mut first_error: Option<MoltError> = None;
    let mut snapshot = ExportSnapshot {
        start_time,
        end_time: start_time,
        snapshot_id,
        resources: HashMap::new(),
    };
    let mut tables_done = 0usize;
    let mut tables_failed = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(result))) => {
                tables_done += 1;
                info!(
                    table = %name,
                    num_rows = result.num_rows,
                    "data movement for table complete"
                );
                snapshot.resources.insert(name, result.resources);
            }
            Ok((name, Err(e))) => {
                tables_failed += 1;
                warn!(table = %name, error = %e, "table fetch failed");
                first_error.get_or_insert(e);
            }
            Err(join_err) => {
                tables_failed += 1;
                first_error.get_or_insert(MoltError::assertion(format!(
                    "table task panicked: {}",
                    join_err
                )));
            }
        }
    }
    snapshot.end_time = Utc::now();

    if cfg.cleanup {
        if let Err(e) = store.cleanup().await {
            warn!(error = %e, "error cleaning up store");
        }
    }

    info!(
        tables_done,
        tables_failed,
        duration = %(snapshot.end_time - snapshot.start_time),
        snapshot_id = snapshot.snapshot_id.as_deref().unwrap_or(""),
        "fetch complete"
    );
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct TableFetchResult {
    num_rows: u64,
    resources: Vec<Arc<dyn Resource>>,
}

#[allow(clippy::too_many_arguments)]
async fn fetch_table(
    ctx: &CancellationToken,
    cfg: &FetchConfig,
    source: &Conn,
    target: &Conn,
    store: Arc<dyn Store>,
    table: &VerifiedTable,
    compression: Compression,
    flush_size: usize,
) -> Result<TableFetchResult> {
    // Live mode keeps the target queryable, so no truncation there.
    if cfg.truncate && !cfg.live {
        info!(table = %table.name, "truncating table");
        target
            .execute(&format!(
                "TRUNCATE TABLE {}",
                qualify_table(Dialect::PostgresWire, &table.name)
            ))
            .await?;
    }

    info!(table = %table.name, "data extraction phase starting");
    let export = export::export_table(
        ctx,
        source,
        table,
        &store,
        compression,
        flush_size,
        cfg.flush_rows,
        cfg.export.row_batch_size,
    )
    .await?;
    info!(
        table = %table.name,
        duration = %(export.end_time - export.start_time),
        num_rows = export.num_rows,
        "data extraction phase complete"
    );

    let load_result = if !store.can_be_target() || export.resources.is_empty() {
        // Direct copy already loaded chunk by chunk; an empty export has
        // nothing to import.
        Ok(())
    } else if cfg.live {
        import::copy_table(target, table, &export.resources)
            .await
            .map(|_| ())
    } else {
        match import::import_table(target, table, &export.resources, compression).await {
            Ok(result) => {
                import::report_import_progress(target, &table.name, result.start_time, false)
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(e),
        }
    };

    if cfg.cleanup {
        for resource in &export.resources {
            if let Err(e) = resource.mark_for_cleanup().await {
                warn!(key = resource.key(), error = %e, "error marking resource for cleanup");
            }
        }
    }
    load_result?;

    Ok(TableFetchResult {
        num_rows: export.num_rows,
        resources: export.resources,
    })
}

/// Drop/recreate the logical replication slot and record its consistent
/// snapshot position. Postgres sources only; a no-op without a slot name.
async fn create_replication_slot(
    source: &Conn,
    settings: &PgReplicationSettings,
) -> Result<Option<String>> {
    if settings.slot_name.is_empty() {
        return Ok(None);
    }
    let pg = match source {
        Conn::Pg(pg) if !pg.is_cockroach() => pg,
        _ => {
            return Err(MoltError::Config(
                "replication slots require a PostgreSQL source".to_string(),
            ))
        }
    };
    if settings.drop_if_exists {
        let existing = pg
            .query(&format!(
                "SELECT 1 FROM pg_replication_slots WHERE slot_name = {}",
                quote_literal(&settings.slot_name)
            ))
            .await?;
        if !existing.is_empty() {
            info!(slot = %settings.slot_name, "dropping existing replication slot");
            pg.execute(&format!(
                "SELECT pg_drop_replication_slot({})",
                quote_literal(&settings.slot_name)
            ))
            .await?;
        }
    }
    let lsn = pg
        .query(&format!(
            "SELECT lsn FROM pg_create_logical_replication_slot({}, {})",
            quote_literal(&settings.slot_name),
            quote_literal(&settings.plugin)
        ))
        .await?
        .into_iter()
        .next()
        .and_then(|row| row.into_iter().next())
        .flatten();
    info!(
        slot = %settings.slot_name,
        snapshot_id = lsn.as_deref().unwrap_or(""),
        "created replication slot"
    );
    Ok(lsn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_mode_refuses_gzip() {
        assert!(matches!(
            resolve_compression(true, Compression::Gzip),
            Err(MoltError::Config(_))
        ));
    }

    #[test]
    fn test_copy_mode_defaults_to_none() {
        assert_eq!(
            resolve_compression(true, Compression::Default).unwrap(),
            Compression::None
        );
    }

    #[test]
    fn test_bulk_mode_defaults_to_gzip() {
        assert_eq!(
            resolve_compression(false, Compression::Default).unwrap(),
            Compression::Gzip
        );
    }

    #[test]
    fn test_explicit_choices_pass_through() {
        assert_eq!(
            resolve_compression(false, Compression::None).unwrap(),
            Compression::None
        );
        assert_eq!(
            resolve_compression(false, Compression::Gzip).unwrap(),
            Compression::Gzip
        );
    }
}
