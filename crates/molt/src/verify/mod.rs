//! The verify engine: shard-parallel ordered comparison of every common
//! table between the source of truth and the target.

pub mod inconsistency;
pub mod ratelimit;
pub mod reverify;
pub mod rowverify;
pub mod shard;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dbconn::{Conn, OrderedConns};
use crate::dbtable::{Name, VerifiedTable};
use crate::error::{MoltError, Result};
use crate::filter::TableFilter;
use crate::tableverify::{self, dbverify};
use inconsistency::{CombinedReporter, Inconsistency, Reporter};
use ratelimit::RateLimiter;
use reverify::{LiveReverificationSettings, Reverifier};
use rowverify::{verify_shard, EventSink, ShardStats, TableScanner};
use shard::plan_shards;

#[derive(Debug, Clone)]
pub struct VerifyOpts {
    /// Number of tables verified at a time; zero means one per CPU.
    pub concurrency: usize,
    /// Shards per table.
    pub table_splits: usize,
    pub row_batch_size: usize,
    /// Per-shard scan cap; zero is unlimited.
    pub rows_per_second: usize,
    pub continuous: bool,
    pub continuous_pause: Duration,
    pub live: Option<LiveReverificationSettings>,
    /// When false, verify schemas only.
    pub rows: bool,
}

impl Default for VerifyOpts {
    fn default() -> Self {
        Self {
            concurrency: 0,
            table_splits: 1,
            row_batch_size: 20_000,
            rows_per_second: 0,
            continuous: false,
            continuous_pause: Duration::ZERO,
            live: None,
            rows: true,
        }
    }
}

/// Verify table schemas and row data between the two databases.
pub async fn verify(
    ctx: CancellationToken,
    conns: &OrderedConns,
    reporter: Arc<CombinedReporter>,
    opts: VerifyOpts,
    filter: &TableFilter,
) -> Result<()> {
    info!("verifying common table definitions");
    let db_result = dbverify::verify(conns, filter).await?;
    for (conn_id, name) in &db_result.missing {
        reporter.report(&Inconsistency::MismatchingTableDefinition {
            conn_id: conn_id.clone(),
            table: name.clone(),
            info: "table missing".to_string(),
        });
    }
    let verifications = tableverify::verify_common_tables(conns, &db_result.verified).await?;

    let mut tables = Vec::new();
    for verification in verifications {
        for mismatch in &verification.mismatches {
            reporter.report(&Inconsistency::MismatchingTableDefinition {
                conn_id: mismatch.conn_id.clone(),
                table: mismatch.table.clone(),
                info: mismatch.info.clone(),
            });
        }
        match verification.table {
            Some(table) => tables.push(table),
            None => warn!(table = %verification.name, "skipping table: schemas do not align"),
        }
    }
    if !opts.rows {
        return Ok(());
    }

    let concurrency = if opts.concurrency > 0 {
        opts.concurrency
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    };
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut tasks: JoinSet<(Name, Result<()>)> = JoinSet::new();

    for table in tables {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MoltError::Cancelled)?;
        let source = conns.source().clone_conn().await?;
        let target = conns.target().clone_conn().await?;
        let reporter = reporter.clone();
        let opts = opts.clone();
        let ctx = ctx.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let name = table.name.clone();
            let result = verify_table(&ctx, &opts, &source, &target, table, reporter).await;
            let _ = source.close().await;
            let _ = target.close().await;
            (name, result)
        });
    }

    let mut first_error: Option<MoltError> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((name, Err(e))) => {
                warn!(table = %name, error = %e, "table verification failed");
                first_error.get_or_insert(e);
            }
            Err(join_err) => {
                first_error.get_or_insert(MoltError::assertion(format!(
                    "verify task panicked: {}",
                    join_err
                )));
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Run one table's scan loop: plan shards, compare them in parallel, drain
/// the reverifier, fire fixups, and (in continuous mode) start over.
async fn verify_table(
    ctx: &CancellationToken,
    opts: &VerifyOpts,
    source: &Conn,
    target: &Conn,
    table: VerifiedTable,
    reporter: Arc<CombinedReporter>,
) -> Result<()> {
    loop {
        if ctx.is_cancelled() {
            return Err(MoltError::Cancelled);
        }
        let shards = plan_shards(source, &table, opts.table_splits).await?;

        let reverifier = match &opts.live {
            Some(settings) => {
                let rv_source = source.clone_conn().await?;
                let rv_target = target.clone_conn().await?;
                Some(Reverifier::spawn(
                    ctx.clone(),
                    settings.clone(),
                    rv_source,
                    rv_target,
                    table.clone(),
                    reporter.clone(),
                ))
            }
            None => None,
        };
        let sink = match &reverifier {
            Some(r) => EventSink::Live(r.sender()),
            None => EventSink::Direct(reporter.clone()),
        };

        let mut shard_tasks: JoinSet<Result<ShardStats>> = JoinSet::new();
        for shard in shards {
            let shard_source = source.clone_conn().await?;
            let shard_target = target.clone_conn().await?;
            let table = table.clone();
            let sink = sink.clone();
            let ctx = ctx.clone();
            let batch_size = opts.row_batch_size;
            let limiter = (opts.rows_per_second > 0).then(|| RateLimiter::new(opts.rows_per_second));
            shard_tasks.spawn(async move {
                if ctx.is_cancelled() {
                    return Err(MoltError::Cancelled);
                }
                let stats = {
                    let mut source_scan =
                        TableScanner::new(&shard_source, &table, 0, shard.clone(), batch_size);
                    let mut target_scan =
                        TableScanner::new(&shard_target, &table, 1, shard, batch_size);
                    verify_shard(
                        &ctx,
                        &table,
                        &mut source_scan,
                        &mut target_scan,
                        &sink,
                        limiter.as_ref(),
                    )
                    .await
                };
                let _ = shard_source.close().await;
                let _ = shard_target.close().await;
                stats
            });
        }

        let mut totals = ShardStats::default();
        let mut shard_error: Option<MoltError> = None;
        while let Some(joined) = shard_tasks.join_next().await {
            match joined {
                Ok(Ok(stats)) => {
                    totals.source_rows += stats.source_rows;
                    totals.target_rows += stats.target_rows;
                    totals.mismatches += stats.mismatches;
                }
                Ok(Err(e)) => {
                    shard_error.get_or_insert(e);
                }
                Err(join_err) => {
                    shard_error.get_or_insert(MoltError::assertion(format!(
                        "shard task panicked: {}",
                        join_err
                    )));
                }
            }
        }

        // Close the intake so the reverifier's final flush can run.
        drop(sink);
        if let Some(reverifier) = reverifier {
            totals.mismatches += reverifier.finish().await?;
        }
        if let Some(e) = shard_error {
            return Err(e);
        }

        // Fixups apply only after the full table scan concludes.
        reporter.table_done(&table).await?;
        reporter.report(&Inconsistency::StatusReport {
            info: format!(
                "finished row verification on {} (source rows: {}, mismatches: {})",
                table.name, totals.source_rows, totals.mismatches
            ),
        });

        if !opts.continuous {
            return Ok(());
        }
        tokio::select! {
            _ = ctx.cancelled() => return Err(MoltError::Cancelled),
            _ = tokio::time::sleep(opts.continuous_pause) => {}
        }
    }
}
