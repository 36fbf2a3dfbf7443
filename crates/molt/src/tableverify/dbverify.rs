//! Database-level verification: list tables on both sides and pair them.

use std::collections::BTreeMap;

use tracing::warn;

use crate::dbconn::{Conn, OrderedConns};
use crate::dbtable::{DBTable, Name};
use crate::error::{MoltError, Result};
use crate::filter::TableFilter;

/// Result of pairing tables across the two connections.
#[derive(Debug, Default)]
pub struct DbVerification {
    /// Tables present on both sides, `[source, target]`.
    pub verified: Vec<[DBTable; 2]>,
    /// Tables present on only one side: `(conn id it is missing from, name)`.
    pub missing: Vec<(String, Name)>,
}

/// List user tables on a connection. MySQL and Oracle are single-namespace;
/// their tables are normalized under the `public` schema.
pub async fn list_tables(conn: &Conn) -> Result<Vec<DBTable>> {
    let mut tables = match conn {
        Conn::Pg(_) => {
            let rows = conn
                .query(
                    "SELECT pg_class.oid, nspname, relname \
                     FROM pg_class \
                     JOIN pg_namespace ON pg_namespace.oid = pg_class.relnamespace \
                     WHERE relkind = 'r' \
                       AND nspname NOT IN ('pg_catalog', 'information_schema', \
                                           'pg_extension', 'crdb_internal') \
                     ORDER BY nspname, relname",
                )
                .await?;
            rows.into_iter()
                .map(|row| -> Result<DBTable> {
                    let oid: u32 = req(&row, 0)?
                        .parse()
                        .map_err(|_| MoltError::assertion("unparseable pg_class oid"))?;
                    Ok(DBTable::with_oid(
                        Name::new(req(&row, 1)?, req(&row, 2)?),
                        oid,
                    ))
                })
                .collect::<Result<Vec<_>>>()?
        }
        Conn::MySql(_) => {
            let rows = conn
                .query(
                    "SELECT table_name FROM information_schema.tables \
                     WHERE table_schema = database() AND table_type = 'BASE TABLE' \
                     ORDER BY table_name",
                )
                .await?;
            rows.into_iter()
                .map(|row| Ok(DBTable::new(Name::new("public", req(&row, 0)?.to_lowercase()))))
                .collect::<Result<Vec<_>>>()?
        }
        Conn::Oracle(_) => {
            let rows = conn
                .query("SELECT table_name FROM user_tables ORDER BY table_name")
                .await?;
            rows.into_iter()
                .map(|row| Ok(DBTable::new(Name::new("public", req(&row, 0)?.to_lowercase()))))
                .collect::<Result<Vec<_>>>()?
        }
    };
    tables.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(tables)
}

fn req(row: &[Option<String>], idx: usize) -> Result<String> {
    row.get(idx)
        .cloned()
        .flatten()
        .ok_or_else(|| MoltError::assertion(format!("null cell at index {}", idx)))
}

/// Pair tables by name across the two connections, applying the filter.
pub async fn verify(conns: &OrderedConns, filter: &TableFilter) -> Result<DbVerification> {
    let source_tables = list_tables(conns.source()).await?;
    let target_tables = list_tables(conns.target()).await?;

    let mut by_name: BTreeMap<Name, [Option<DBTable>; 2]> = BTreeMap::new();
    for t in source_tables {
        let name = t.name.clone();
        by_name.entry(name).or_default()[0] = Some(t);
    }
    for t in target_tables {
        let name = t.name.clone();
        by_name.entry(name).or_default()[1] = Some(t);
    }

    let mut result = DbVerification::default();
    for (name, sides) in by_name {
        if !filter.matches(&name) {
            continue;
        }
        match sides {
            [Some(src), Some(tgt)] => result.verified.push([src, tgt]),
            [Some(_), None] => {
                warn!(table = %name, "table missing on target");
                result
                    .missing
                    .push((conns.target().id().to_string(), name));
            }
            [None, Some(_)] => {
                warn!(table = %name, "table missing on source");
                result
                    .missing
                    .push((conns.source().id().to_string(), name));
            }
            [None, None] => unreachable!("entry without any side"),
        }
    }
    Ok(result)
}
