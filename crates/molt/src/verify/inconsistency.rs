//! Inconsistency events and their reporters.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use metrics::counter;
use tracing::{info, warn};

use crate::dbconn::{Conn, Dialect};
use crate::dbtable::{Name, VerifiedTable};
use crate::error::Result;
use crate::metrics::VERIFY_MISMATCHES;
use crate::sqlbuild::{key_equality_predicate, qualify_table, quote_ident, render_literal};
use crate::typeconv::Datum;

/// A single verification finding. Row events carry the primary key datum
/// tuple; raw cells ride along so fixups can rewrite the target.
#[derive(Debug, Clone)]
pub enum Inconsistency {
    /// Row exists on the source but not the target.
    MissingRow {
        table: Name,
        pk: Vec<Datum>,
        pk_raw: Vec<Option<String>>,
        /// Full source row in scan order (primary key first).
        source_row: Vec<Option<String>>,
    },
    /// Row exists on the target but not the source.
    ExtraneousRow {
        table: Name,
        pk: Vec<Datum>,
        pk_raw: Vec<Option<String>>,
    },
    /// Row exists on both sides with differing column values.
    MismatchingRow {
        table: Name,
        pk: Vec<Datum>,
        pk_raw: Vec<Option<String>>,
        mismatching_columns: Vec<String>,
        source_row: Vec<Option<String>>,
        target_row: Vec<Option<String>>,
    },
    /// The two sides disagree about the table's shape.
    MismatchingTableDefinition {
        conn_id: String,
        table: Name,
        info: String,
    },
    /// Free-form progress marker.
    StatusReport { info: String },
}

impl Inconsistency {
    pub fn kind(&self) -> &'static str {
        match self {
            Inconsistency::MissingRow { .. } => "missing_row",
            Inconsistency::ExtraneousRow { .. } => "extraneous_row",
            Inconsistency::MismatchingRow { .. } => "mismatching_row",
            Inconsistency::MismatchingTableDefinition { .. } => "mismatching_table_definition",
            Inconsistency::StatusReport { .. } => "status",
        }
    }

    /// Primary key raw cells for row-level events.
    pub fn pk_raw(&self) -> Option<&[Option<String>]> {
        match self {
            Inconsistency::MissingRow { pk_raw, .. }
            | Inconsistency::ExtraneousRow { pk_raw, .. }
            | Inconsistency::MismatchingRow { pk_raw, .. } => Some(pk_raw),
            _ => None,
        }
    }

    fn pk_display(pk: &[Datum]) -> String {
        let cells: Vec<String> = pk.iter().map(|d| format!("{}", d)).collect();
        cells.join(",")
    }
}

/// Sink for verification findings. Shared by every shard of every table;
/// implementations must be safe under concurrent publication and must not
/// mutate events.
#[async_trait]
pub trait Reporter: Send + Sync {
    fn report(&self, event: &Inconsistency);

    /// Called once after a table's scan (and any live reverification)
    /// concludes.
    async fn table_done(&self, table: &VerifiedTable) -> Result<()> {
        let _ = table;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Fans events out to its children in order.
#[derive(Default)]
pub struct CombinedReporter {
    pub reporters: Vec<Box<dyn Reporter>>,
}

#[async_trait]
impl Reporter for CombinedReporter {
    fn report(&self, event: &Inconsistency) {
        for reporter in &self.reporters {
            reporter.report(event);
        }
    }

    async fn table_done(&self, table: &VerifiedTable) -> Result<()> {
        for reporter in &self.reporters {
            reporter.table_done(table).await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        for reporter in &self.reporters {
            reporter.close().await?;
        }
        Ok(())
    }
}

/// Structured-log reporter; also bumps the per-kind mismatch counters.
#[derive(Default)]
pub struct LogReporter;

#[async_trait]
impl Reporter for LogReporter {
    fn report(&self, event: &Inconsistency) {
        match event {
            Inconsistency::MissingRow { table, pk, .. } => {
                counter!(VERIFY_MISMATCHES, "table" => table.safe_string(), "kind" => event.kind())
                    .increment(1);
                warn!(table = %table, pk = %Inconsistency::pk_display(pk), "missing row on target");
            }
            Inconsistency::ExtraneousRow { table, pk, .. } => {
                counter!(VERIFY_MISMATCHES, "table" => table.safe_string(), "kind" => event.kind())
                    .increment(1);
                warn!(table = %table, pk = %Inconsistency::pk_display(pk), "extraneous row on target");
            }
            Inconsistency::MismatchingRow {
                table,
                pk,
                mismatching_columns,
                ..
            } => {
                counter!(VERIFY_MISMATCHES, "table" => table.safe_string(), "kind" => event.kind())
                    .increment(1);
                warn!(
                    table = %table,
                    pk = %Inconsistency::pk_display(pk),
                    columns = %mismatching_columns.join(","),
                    "mismatching row"
                );
            }
            Inconsistency::MismatchingTableDefinition {
                conn_id,
                table,
                info,
            } => {
                counter!(VERIFY_MISMATCHES, "table" => table.safe_string(), "kind" => event.kind())
                    .increment(1);
                warn!(table = %table, conn = %conn_id, reason = %info, "mismatching table definition");
            }
            Inconsistency::StatusReport { info } => {
                info!("{}", info);
            }
        }
    }
}

/// Write-back reporter: buffers row findings during the scan and applies
/// them to the target once the table concludes. `UPSERT` for missing and
/// mismatching rows (the source row always wins), `DELETE` for extraneous
/// rows. Failures are logged and do not abort verification.
pub struct FixReporter {
    conn: Conn,
    buffered: Mutex<HashMap<Name, Vec<Inconsistency>>>,
}

impl FixReporter {
    /// `conn` must be a cloned target connection dedicated to fixups.
    pub fn new(conn: Conn) -> Self {
        warn!("fixup mode enabled: the source row always wins for mismatching rows");
        Self {
            conn,
            buffered: Mutex::new(HashMap::new()),
        }
    }

    async fn apply(&self, table: &VerifiedTable, event: &Inconsistency) -> Result<()> {
        let dialect = Dialect::PostgresWire;
        let target_types = table.side_types(1);
        let pk_types = &target_types[..table.pk_len()];
        match event {
            Inconsistency::MissingRow { source_row, .. }
            | Inconsistency::MismatchingRow { source_row, .. } => {
                let columns = table.all_columns();
                let col_list = columns
                    .iter()
                    .map(|c| quote_ident(dialect, c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let values = source_row
                    .iter()
                    .zip(&target_types)
                    .map(|(cell, t)| match cell {
                        Some(raw) => render_literal(*t, raw),
                        None => "NULL".to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let stmt = format!(
                    "UPSERT INTO {} ({}) VALUES ({})",
                    qualify_table(dialect, &table.name),
                    col_list,
                    values
                );
                self.conn.execute(&stmt).await?;
            }
            Inconsistency::ExtraneousRow { pk_raw, .. } => {
                let stmt = format!(
                    "DELETE FROM {} WHERE {}",
                    qualify_table(dialect, &table.name),
                    key_equality_predicate(dialect, &table.pk_columns, pk_types, pk_raw)?
                );
                self.conn.execute(&stmt).await?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Reporter for FixReporter {
    fn report(&self, event: &Inconsistency) {
        match event {
            Inconsistency::MissingRow { table, .. }
            | Inconsistency::ExtraneousRow { table, .. }
            | Inconsistency::MismatchingRow { table, .. } => {
                self.buffered
                    .lock()
                    .unwrap()
                    .entry(table.clone())
                    .or_default()
                    .push(event.clone());
            }
            _ => {}
        }
    }

    async fn table_done(&self, table: &VerifiedTable) -> Result<()> {
        let events = self
            .buffered
            .lock()
            .unwrap()
            .remove(&table.name)
            .unwrap_or_default();
        if events.is_empty() {
            return Ok(());
        }
        info!(table = %table.name, fixups = events.len(), "applying fixups");
        for event in &events {
            if let Err(e) = self.apply(table, event).await {
                warn!(table = %table.name, error = %e, "fixup failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_reporter_fans_out_in_order() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct Counting(Arc<AtomicUsize>);
        #[async_trait]
        impl Reporter for Counting {
            fn report(&self, _event: &Inconsistency) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let count = Arc::new(AtomicUsize::new(0));
        let combined = CombinedReporter {
            reporters: vec![
                Box::new(Counting(count.clone())),
                Box::new(Counting(count.clone())),
            ],
        };
        combined.report(&Inconsistency::StatusReport {
            info: "hello".to_string(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_kind_labels() {
        let event = Inconsistency::StatusReport {
            info: String::new(),
        };
        assert_eq!(event.kind(), "status");
    }
}
