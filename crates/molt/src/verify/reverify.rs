//! Live reverification: buffered retry of raw mismatches, tolerating rows
//! that change while the scan is in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::inconsistency::{CombinedReporter, Inconsistency, Reporter};
use super::rowverify::{
    compare_rows, extraneous_row, fetch_rows_by_pks, missing_row, pk_key, RowValues,
};
use crate::dbconn::Conn;
use crate::dbtable::VerifiedTable;
use crate::error::{MoltError, Result};
use crate::retry::{Retry, RetrySettings};

/// Tuning for the reverification buffer.
#[derive(Debug, Clone)]
pub struct LiveReverificationSettings {
    /// Flush once this many raw mismatches are queued.
    pub max_batch_size: usize,
    /// Flush on this interval even when the batch is small.
    pub flush_interval: Duration,
    /// Backoff between reverification runs of one batch.
    pub retry: RetrySettings,
    /// Global cap on reverification runs per second; zero is uncapped.
    pub runs_per_second: usize,
}

impl Default for LiveReverificationSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            flush_interval: Duration::from_secs(1),
            retry: RetrySettings {
                initial_backoff: Duration::from_millis(250),
                multiplier: 2,
                max_backoff: Duration::from_secs(1),
                max_retries: 5,
            },
            runs_per_second: 0,
        }
    }
}

/// Buffered reverifier for one table. Raw mismatches stream in from the
/// shard comparators; batches are re-read from both sides until they
/// converge or retries run out, and only then reported.
pub struct Reverifier {
    tx: mpsc::Sender<Inconsistency>,
    handle: tokio::task::JoinHandle<Result<u64>>,
}

impl Reverifier {
    /// `source` and `target` must be dedicated cloned connections; the
    /// reverifier queries them concurrently with the shard scans.
    pub fn spawn(
        ctx: CancellationToken,
        settings: LiveReverificationSettings,
        source: Conn,
        target: Conn,
        table: VerifiedTable,
        reporter: Arc<CombinedReporter>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.max_batch_size.max(1) * 2);
        let handle = tokio::spawn(run(ctx, settings, rx, source, target, table, reporter));
        Self { tx, handle }
    }

    pub fn sender(&self) -> mpsc::Sender<Inconsistency> {
        self.tx.clone()
    }

    /// Close the intake and wait for the final flush. Returns the number
    /// of rows confirmed inconsistent.
    pub async fn finish(self) -> Result<u64> {
        drop(self.tx);
        self.handle
            .await
            .map_err(|e| MoltError::assertion(format!("reverifier task failed: {}", e)))?
    }
}

async fn run(
    ctx: CancellationToken,
    settings: LiveReverificationSettings,
    mut rx: mpsc::Receiver<Inconsistency>,
    source: Conn,
    target: Conn,
    table: VerifiedTable,
    reporter: Arc<CombinedReporter>,
) -> Result<u64> {
    let mut buffer: Vec<Inconsistency> = Vec::new();
    let mut interval = tokio::time::interval(settings.flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut confirmed = 0u64;

    loop {
        tokio::select! {
            // Cancellation drops pending batches without reporting them.
            _ = ctx.cancelled() => return Ok(confirmed),
            event = rx.recv() => match event {
                Some(event) => {
                    buffer.push(event);
                    if buffer.len() >= settings.max_batch_size {
                        confirmed += flush(
                            &settings, &source, &target, &table, &reporter,
                            std::mem::take(&mut buffer),
                        )
                        .await?;
                    }
                }
                None => {
                    confirmed += flush(
                        &settings, &source, &target, &table, &reporter,
                        std::mem::take(&mut buffer),
                    )
                    .await?;
                    return Ok(confirmed);
                }
            },
            _ = interval.tick() => {
                if !buffer.is_empty() {
                    confirmed += flush(
                        &settings, &source, &target, &table, &reporter,
                        std::mem::take(&mut buffer),
                    )
                    .await?;
                }
            }
        }
    }
}

/// Reverify one batch. A row is declared truly inconsistent only after the
/// retry budget is exhausted without convergence.
async fn flush(
    settings: &LiveReverificationSettings,
    source: &Conn,
    target: &Conn,
    table: &VerifiedTable,
    reporter: &Arc<CombinedReporter>,
    batch: Vec<Inconsistency>,
) -> Result<u64> {
    if batch.is_empty() {
        return Ok(0);
    }
    debug!(table = %table.name, batch = batch.len(), "reverifying batch");
    let pending = Mutex::new(batch);
    let retry = Retry::new(settings.retry)?;
    let outcome = retry
        .do_with(
            || async {
                if settings.runs_per_second > 0 {
                    tokio::time::sleep(Duration::from_secs_f64(
                        1.0 / settings.runs_per_second as f64,
                    ))
                    .await;
                }
                let pks: Vec<Vec<Option<String>>> = pending
                    .lock()
                    .unwrap()
                    .iter()
                    .filter_map(|e| e.pk_raw().map(|pk| pk.to_vec()))
                    .collect();
                let source_rows = fetch_rows_by_pks(source, table, 0, &pks).await?;
                let target_rows = fetch_rows_by_pks(target, table, 1, &pks).await?;

                let still: Vec<Inconsistency> = {
                    let pending = pending.lock().unwrap();
                    pending
                        .iter()
                        .filter_map(|event| {
                            reclassify(table, event, &source_rows, &target_rows)
                        })
                        .collect()
                };
                let converged = still.is_empty();
                *pending.lock().unwrap() = still;
                if converged {
                    Ok(())
                } else {
                    Err(MoltError::table(
                        table.name.safe_string(),
                        "rows still inconsistent",
                    ))
                }
            },
            |_| {},
        )
        .await;

    match outcome {
        Ok(()) => Ok(0),
        Err(_) => {
            let remaining = pending.into_inner().unwrap();
            warn!(
                table = %table.name,
                rows = remaining.len(),
                "rows failed reverification"
            );
            for event in &remaining {
                reporter.report(event);
            }
            Ok(remaining.len() as u64)
        }
    }
}

/// Recompute the status of one queued mismatch against freshly read rows.
/// Returns `None` when the sides now agree.
fn reclassify(
    table: &VerifiedTable,
    event: &Inconsistency,
    source_rows: &HashMap<String, RowValues>,
    target_rows: &HashMap<String, RowValues>,
) -> Option<Inconsistency> {
    let key = pk_key(event.pk_raw()?);
    match (source_rows.get(&key), target_rows.get(&key)) {
        (Some(src), Some(tgt)) => compare_rows(table, src, tgt),
        (Some(src), None) => Some(missing_row(table, src.clone())),
        (None, Some(tgt)) => Some(extraneous_row(table, tgt.clone())),
        // Deleted on both sides; the sides agree.
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbtable::Name;
    use crate::typeconv::TypeId;

    fn test_table() -> VerifiedTable {
        VerifiedTable {
            name: Name::new("public", "t"),
            pk_columns: vec!["id".into()],
            value_columns: vec!["v".into()],
            pk_types: vec![(TypeId::Int8, TypeId::Int8)],
            value_types: vec![(TypeId::Text, TypeId::Text)],
        }
    }

    fn row(table: &VerifiedTable, id: i64, v: &str) -> RowValues {
        RowValues::from_raw(
            vec![Some(id.to_string()), Some(v.to_string())],
            &table.side_types(0),
            table.pk_len(),
        )
        .unwrap()
    }

    #[test]
    fn test_reclassify_converged_row_is_dropped() {
        let table = test_table();
        let event = missing_row(&table, row(&table, 1, "a"));
        let mut source_rows = HashMap::new();
        let mut target_rows = HashMap::new();
        source_rows.insert(pk_key(&[Some("1".into())]), row(&table, 1, "a"));
        target_rows.insert(pk_key(&[Some("1".into())]), row(&table, 1, "a"));
        assert!(reclassify(&table, &event, &source_rows, &target_rows).is_none());
    }

    #[test]
    fn test_reclassify_deleted_everywhere_is_dropped() {
        let table = test_table();
        let event = missing_row(&table, row(&table, 1, "a"));
        assert!(reclassify(&table, &event, &HashMap::new(), &HashMap::new()).is_none());
    }

    #[test]
    fn test_reclassify_still_missing() {
        let table = test_table();
        let event = missing_row(&table, row(&table, 1, "a"));
        let mut source_rows = HashMap::new();
        source_rows.insert(pk_key(&[Some("1".into())]), row(&table, 1, "a"));
        let result = reclassify(&table, &event, &source_rows, &HashMap::new());
        assert!(matches!(result, Some(Inconsistency::MissingRow { .. })));
    }

    #[test]
    fn test_reclassify_flips_to_mismatch_when_values_differ() {
        let table = test_table();
        let event = missing_row(&table, row(&table, 1, "a"));
        let mut source_rows = HashMap::new();
        let mut target_rows = HashMap::new();
        source_rows.insert(pk_key(&[Some("1".into())]), row(&table, 1, "a"));
        target_rows.insert(pk_key(&[Some("1".into())]), row(&table, 1, "z"));
        let result = reclassify(&table, &event, &source_rows, &target_rows);
        assert!(matches!(result, Some(Inconsistency::MismatchingRow { .. })));
    }
}
