//! Ordered row scanning and merge comparison.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use metrics::counter;
use tokio_util::sync::CancellationToken;

use super::inconsistency::Inconsistency;
use super::ratelimit::RateLimiter;
use super::shard::Shard;
use crate::dbconn::Conn;
use crate::dbtable::VerifiedTable;
use crate::error::{MoltError, Result};
use crate::metrics::VERIFY_ROWS_READ;
use crate::sqlbuild::{build_scan_query, key_equality_predicate, qualify_table, ScanQuery};
use crate::typeconv::{cmp_key, convert_row_values, Datum, TypeId};

/// One scanned row: converted datums plus the raw cells they came from.
#[derive(Debug, Clone)]
pub struct RowValues {
    pub pk: Vec<Datum>,
    pub values: Vec<Datum>,
    pub raw: Vec<Option<String>>,
    pk_len: usize,
}

impl RowValues {
    pub fn from_raw(raw: Vec<Option<String>>, types: &[TypeId], pk_len: usize) -> Result<Self> {
        let mut datums = convert_row_values(&raw, types)?;
        let values = datums.split_off(pk_len);
        Ok(Self {
            pk: datums,
            values,
            raw,
            pk_len,
        })
    }

    pub fn pk_raw(&self) -> &[Option<String>] {
        &self.raw[..self.pk_len]
    }
}

/// Source of ordered row batches; the scan side of the comparator.
#[async_trait]
pub trait RowSource: Send {
    /// Next batch in PK order; empty when exhausted.
    async fn next_batch(&mut self) -> Result<Vec<RowValues>>;
}

/// Cursor-paginated scanner over one side of a table shard.
pub struct TableScanner<'a> {
    conn: &'a Conn,
    table: &'a VerifiedTable,
    side: usize,
    shard: Shard,
    batch_size: usize,
    columns: Vec<String>,
    types: Vec<TypeId>,
    cursor: Option<Vec<Option<String>>>,
    done: bool,
}

impl<'a> TableScanner<'a> {
    pub fn new(
        conn: &'a Conn,
        table: &'a VerifiedTable,
        side: usize,
        shard: Shard,
        batch_size: usize,
    ) -> Self {
        Self {
            conn,
            table,
            side,
            shard,
            batch_size,
            columns: table.all_columns(),
            types: table.side_types(side),
            cursor: None,
            done: false,
        }
    }
}

#[async_trait]
impl RowSource for TableScanner<'_> {
    async fn next_batch(&mut self) -> Result<Vec<RowValues>> {
        if self.done {
            return Ok(Vec::new());
        }
        let pk_len = self.table.pk_len();
        let sql = build_scan_query(&ScanQuery {
            dialect: self.conn.dialect(),
            table: &self.table.name,
            columns: &self.columns,
            pk_columns: &self.table.pk_columns,
            pk_types: &self.types[..pk_len],
            after: self.cursor.as_deref(),
            shard_lo: self.shard.lo,
            shard_hi: self.shard.hi,
            limit: self.batch_size,
        })?;
        let raw_rows = self.conn.query(&sql).await?;
        if raw_rows.len() < self.batch_size {
            self.done = true;
        }
        if let Some(last) = raw_rows.last() {
            self.cursor = Some(last[..pk_len].to_vec());
        }
        if self.side == 0 {
            counter!(VERIFY_ROWS_READ, "table" => self.table.name.safe_string())
                .increment(raw_rows.len() as u64);
        }
        raw_rows
            .into_iter()
            .map(|raw| RowValues::from_raw(raw, &self.types, pk_len))
            .collect()
    }
}

/// Outcome of one shard comparison pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShardStats {
    pub source_rows: u64,
    pub target_rows: u64,
    pub mismatches: u64,
}

/// Where row events go: straight to the reporters, or into the live
/// reverification buffer.
#[derive(Clone)]
pub enum EventSink {
    Direct(std::sync::Arc<super::inconsistency::CombinedReporter>),
    Live(tokio::sync::mpsc::Sender<Inconsistency>),
}

impl EventSink {
    pub async fn emit(&self, event: Inconsistency) {
        match self {
            EventSink::Direct(reporter) => {
                use super::inconsistency::Reporter;
                reporter.report(&event);
            }
            EventSink::Live(tx) => {
                // A closed buffer means the run is shutting down; pending
                // reverification batches are dropped by design.
                let _ = tx.send(event).await;
            }
        }
    }
}

/// Merge-compare both sides of one shard, advancing whichever side has the
/// smaller PK tuple. Events are published in PK order within the shard.
pub async fn verify_shard(
    ctx: &CancellationToken,
    table: &VerifiedTable,
    source: &mut dyn RowSource,
    target: &mut dyn RowSource,
    sink: &EventSink,
    limiter: Option<&RateLimiter>,
) -> Result<ShardStats> {
    let mut stats = ShardStats::default();
    let mut src_buf: VecDeque<RowValues> = VecDeque::new();
    let mut tgt_buf: VecDeque<RowValues> = VecDeque::new();
    let mut src_done = false;
    let mut tgt_done = false;

    loop {
        // Stop issuing new batches once cancelled; drained buffers are
        // abandoned.
        if ctx.is_cancelled() {
            return Err(MoltError::Cancelled);
        }
        if src_buf.is_empty() && !src_done {
            let batch = source.next_batch().await?;
            if batch.is_empty() {
                src_done = true;
            } else {
                if let Some(limiter) = limiter {
                    limiter.wait(batch.len()).await;
                }
                stats.source_rows += batch.len() as u64;
                src_buf.extend(batch);
            }
        }
        if tgt_buf.is_empty() && !tgt_done {
            let batch = target.next_batch().await?;
            if batch.is_empty() {
                tgt_done = true;
            } else {
                if let Some(limiter) = limiter {
                    limiter.wait(batch.len()).await;
                }
                stats.target_rows += batch.len() as u64;
                tgt_buf.extend(batch);
            }
        }

        let advance = match (src_buf.front(), tgt_buf.front()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(src), Some(tgt)) => cmp_key(&src.pk, &tgt.pk)?,
        };
        match advance {
            Ordering::Less => {
                if let Some(row) = src_buf.pop_front() {
                    stats.mismatches += 1;
                    sink.emit(missing_row(table, row)).await;
                }
            }
            Ordering::Greater => {
                if let Some(row) = tgt_buf.pop_front() {
                    stats.mismatches += 1;
                    sink.emit(extraneous_row(table, row)).await;
                }
            }
            Ordering::Equal => {
                if let (Some(src), Some(tgt)) = (src_buf.pop_front(), tgt_buf.pop_front()) {
                    if let Some(event) = compare_rows(table, &src, &tgt) {
                        stats.mismatches += 1;
                        sink.emit(event).await;
                    }
                }
            }
        }
    }
    Ok(stats)
}

pub(crate) fn missing_row(table: &VerifiedTable, row: RowValues) -> Inconsistency {
    Inconsistency::MissingRow {
        table: table.name.clone(),
        pk_raw: row.pk_raw().to_vec(),
        pk: row.pk,
        source_row: row.raw,
    }
}

pub(crate) fn extraneous_row(table: &VerifiedTable, row: RowValues) -> Inconsistency {
    Inconsistency::ExtraneousRow {
        table: table.name.clone(),
        pk_raw: row.pk_raw().to_vec(),
        pk: row.pk,
    }
}

/// Column-wise equality for rows with equal keys.
pub fn compare_rows(
    table: &VerifiedTable,
    src: &RowValues,
    tgt: &RowValues,
) -> Option<Inconsistency> {
    let mismatching_columns: Vec<String> = table
        .value_columns
        .iter()
        .zip(src.values.iter().zip(&tgt.values))
        .filter(|(_, (s, t))| s != t)
        .map(|(name, _)| name.clone())
        .collect();
    if mismatching_columns.is_empty() {
        return None;
    }
    Some(Inconsistency::MismatchingRow {
        table: table.name.clone(),
        pk_raw: src.pk_raw().to_vec(),
        pk: src.pk.clone(),
        mismatching_columns,
        source_row: src.raw.clone(),
        target_row: tgt.raw.clone(),
    })
}

/// Re-read specific rows by primary key, for live reverification. Returns
/// a map keyed by the raw PK cells.
pub async fn fetch_rows_by_pks(
    conn: &Conn,
    table: &VerifiedTable,
    side: usize,
    pks: &[Vec<Option<String>>],
) -> Result<HashMap<String, RowValues>> {
    if pks.is_empty() {
        return Ok(HashMap::new());
    }
    let dialect = conn.dialect();
    let types = table.side_types(side);
    let pk_len = table.pk_len();
    let pk_types = &types[..pk_len];

    let columns = table.all_columns();
    let col_list = columns
        .iter()
        .map(|c| crate::sqlbuild::quote_ident(dialect, c))
        .collect::<Vec<_>>()
        .join(", ");
    let mut predicates = Vec::with_capacity(pks.len());
    for pk in pks {
        predicates.push(format!(
            "({})",
            key_equality_predicate(dialect, &table.pk_columns, pk_types, pk)?
        ));
    }
    let sql = format!(
        "SELECT {} FROM {} WHERE {}",
        col_list,
        qualify_table(dialect, &table.name),
        predicates.join(" OR ")
    );
    let rows = conn.query(&sql).await?;
    let mut by_pk = HashMap::with_capacity(rows.len());
    for raw in rows {
        let row = RowValues::from_raw(raw, &types, pk_len)?;
        by_pk.insert(pk_key(row.pk_raw()), row);
    }
    Ok(by_pk)
}

/// Stable map key for a raw PK tuple.
pub fn pk_key(pk_raw: &[Option<String>]) -> String {
    pk_raw
        .iter()
        .map(|c| c.as_deref().unwrap_or("\u{1}NULL"))
        .collect::<Vec<_>>()
        .join("\u{0}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbtable::Name;
    use crate::typeconv::TypeId;
    use std::sync::Arc;
    use std::sync::Mutex;

    struct VecSource {
        batches: VecDeque<Vec<RowValues>>,
    }

    #[async_trait]
    impl RowSource for VecSource {
        async fn next_batch(&mut self) -> Result<Vec<RowValues>> {
            Ok(self.batches.pop_front().unwrap_or_default())
        }
    }

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

    fn source_of(rows: Vec<RowValues>) -> VecSource {
        VecSource {
            batches: VecDeque::from([rows]),
        }
    }

    struct CollectingReporter {
        events: Mutex<Vec<Inconsistency>>,
    }

    #[async_trait]
    impl super::super::inconsistency::Reporter for CollectingReporter {
        fn report(&self, event: &Inconsistency) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    async fn run_compare(
        src_rows: Vec<RowValues>,
        tgt_rows: Vec<RowValues>,
    ) -> (ShardStats, Vec<Inconsistency>) {
        let table = test_table();
        let events = Arc::new(Mutex::new(Vec::new()));
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let sink = EventSink::Live(tx);
        let mut src = source_of(src_rows);
        let mut tgt = source_of(tgt_rows);
        let ctx = CancellationToken::new();
        let stats = verify_shard(&ctx, &table, &mut src, &mut tgt, &sink, None)
            .await
            .unwrap();
        drop(sink);
        while let Some(event) = rx.recv().await {
            events.lock().unwrap().push(event);
        }
        let collected = events.lock().unwrap().clone();
        (stats, collected)
    }

    #[tokio::test]
    async fn test_identical_sides_produce_no_events() {
        let table = test_table();
        let rows = |t: &VerifiedTable| vec![row(t, 1, "a"), row(t, 2, "b")];
        let (stats, events) = run_compare(rows(&table), rows(&table)).await;
        assert_eq!(stats.mismatches, 0);
        assert!(events.is_empty());
        assert_eq!(stats.source_rows, 2);
        assert_eq!(stats.target_rows, 2);
    }

    #[tokio::test]
    async fn test_missing_and_extraneous_classification() {
        // Source has (1,a),(2,b); target has (1,a),(3,c).
        let table = test_table();
        let (stats, events) = run_compare(
            vec![row(&table, 1, "a"), row(&table, 2, "b")],
            vec![row(&table, 1, "a"), row(&table, 3, "c")],
        )
        .await;
        assert_eq!(stats.mismatches, 2);
        assert_eq!(events.len(), 2);
        match &events[0] {
            Inconsistency::MissingRow { pk, .. } => assert_eq!(pk, &vec![Datum::Int(2)]),
            other => panic!("expected missing row, got {:?}", other),
        }
        match &events[1] {
            Inconsistency::ExtraneousRow { pk, .. } => assert_eq!(pk, &vec![Datum::Int(3)]),
            other => panic!("expected extraneous row, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mismatching_row_lists_columns() {
        let table = test_table();
        let (stats, events) =
            run_compare(vec![row(&table, 1, "a")], vec![row(&table, 1, "z")]).await;
        assert_eq!(stats.mismatches, 1);
        match &events[0] {
            Inconsistency::MismatchingRow {
                mismatching_columns,
                ..
            } => {
                assert_eq!(mismatching_columns, &vec!["v".to_string()]);
            }
            other => panic!("expected mismatching row, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_direct_sink_publishes_to_reporter() {
        use super::super::inconsistency::CombinedReporter;
        let table = test_table();
        let collector = Box::new(CollectingReporter {
            events: Mutex::new(Vec::new()),
        });
        let combined = Arc::new(CombinedReporter {
            reporters: vec![collector],
        });
        let sink = EventSink::Direct(combined.clone());
        let mut src = source_of(vec![row(&table, 1, "a")]);
        let mut tgt = source_of(vec![]);
        let ctx = CancellationToken::new();
        let stats = verify_shard(&ctx, &table, &mut src, &mut tgt, &sink, None)
            .await
            .unwrap();
        assert_eq!(stats.mismatches, 1);
    }

    #[test]
    fn test_pk_key_distinguishes_null_and_empty() {
        assert_ne!(pk_key(&[None]), pk_key(&[Some(String::new())]));
        assert_eq!(
            pk_key(&[Some("1".into()), Some("x".into())]),
            pk_key(&[Some("1".into()), Some("x".into())])
        );
    }
}
