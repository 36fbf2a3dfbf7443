//! Schema introspection and cross-database table verification.
//!
//! For each table, both sides contribute ordered columns (name, canonical
//! type, nullability, collation) and primary key columns; the two sides are
//! then aligned into a [`VerifiedTable`]. Columns that do not align are
//! dropped and reported; a table without a usable primary key is skipped.

pub mod dbverify;

use tracing::warn;

use crate::dbconn::{Conn, OrderedConns};
use crate::dbtable::{DBTable, Name, VerifiedTable};
use crate::error::{MoltError, Result};
use crate::sqlbuild::quote_literal;
use crate::typeconv::{self, TypeId};

/// One introspected column.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub type_id: TypeId,
    pub not_null: bool,
    pub collation: Option<String>,
}

/// A schema-level discrepancy between the two sides of a table.
#[derive(Debug, Clone)]
pub struct DefinitionMismatch {
    pub conn_id: String,
    pub table: Name,
    pub info: String,
}

/// Result of verifying one table pair.
#[derive(Debug, Clone)]
pub struct TableVerification {
    pub name: Name,
    /// Present when the table is comparable; `None` when it must be skipped
    /// (no common columns or unusable primary key).
    pub table: Option<VerifiedTable>,
    pub mismatches: Vec<DefinitionMismatch>,
}

/// Extract ordered column metadata for a table.
pub async fn get_columns(conn: &Conn, table: &DBTable) -> Result<Vec<Column>> {
    match conn {
        Conn::Pg(_) => get_columns_pg(conn, table).await,
        Conn::MySql(_) => get_columns_mysql(conn, table).await,
        Conn::Oracle(_) => get_columns_oracle(conn, table).await,
    }
}

async fn get_columns_pg(conn: &Conn, table: &DBTable) -> Result<Vec<Column>> {
    let default_collation = conn
        .query(
            "SELECT pg_database.datcollate AS current_collation \
             FROM pg_catalog.pg_database \
             WHERE pg_database.datname = pg_catalog.current_database()",
        )
        .await?
        .into_iter()
        .next()
        .and_then(|row| row.into_iter().next())
        .flatten();

    let oid = table
        .oid
        .ok_or_else(|| MoltError::assertion(format!("table {} has no OID", table.name)))?;
    let rows = conn
        .query(&format!(
            "SELECT attname, atttypid, attnotnull, collname \
             FROM pg_attribute \
             LEFT OUTER JOIN pg_collation ON (pg_collation.oid = pg_attribute.attcollation) \
             WHERE attrelid = {} AND attnum > 0 AND NOT attisdropped \
             ORDER BY attnum",
            oid
        ))
        .await?;

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let name = cell(&row, 0)?;
        let type_oid: u32 = cell(&row, 1)?
            .parse()
            .map_err(|_| MoltError::assertion("unparseable atttypid"))?;
        let not_null = cell(&row, 2)? == "t";
        let mut collation = row.get(3).cloned().flatten();
        if collation.is_none() || collation.as_deref() == Some("default") {
            collation = default_collation.clone();
        }
        let type_id = resolve_pg_type(conn, &table.name, &name, type_oid).await?;
        columns.push(Column {
            name,
            type_id,
            not_null,
            collation,
        });
    }
    Ok(columns)
}

/// Resolve a Postgres type OID: builtins map directly; user-defined enums
/// are discovered once and remembered in the connection's shared type map.
async fn resolve_pg_type(conn: &Conn, table: &Name, column: &str, oid: u32) -> Result<TypeId> {
    if let Some(t) = TypeId::from_pg_oid(oid) {
        return Ok(t);
    }
    if let Some(t) = conn.type_map().get(oid) {
        return Ok(t);
    }
    let typtype = conn
        .query(&format!("SELECT typtype FROM pg_type WHERE oid = {}", oid))
        .await?
        .into_iter()
        .next()
        .and_then(|row| row.into_iter().next())
        .flatten();
    let resolved = match typtype.as_deref() {
        Some("e") => TypeId::Enum,
        _ => {
            warn!(
                table = %table,
                column,
                oid,
                "unknown type OID; treating as text"
            );
            TypeId::Text
        }
    };
    conn.type_map().insert(oid, resolved);
    Ok(resolved)
}

async fn get_columns_mysql(conn: &Conn, table: &DBTable) -> Result<Vec<Column>> {
    let rows = conn
        .query(&format!(
            "SELECT column_name, data_type, column_type, is_nullable, collation_name \
             FROM information_schema.columns \
             WHERE table_schema = database() AND table_name = {} \
             ORDER BY ordinal_position",
            quote_literal(&table.name.table)
        ))
        .await?;

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let name = cell(&row, 0)?.to_lowercase();
        let data_type = cell(&row, 1)?;
        let column_type = cell(&row, 2)?;
        let not_null = cell(&row, 3)? == "NO";
        let collation = row.get(4).cloned().flatten();
        let type_id = match typeconv::mysql::data_type_to_canonical(&data_type, &column_type) {
            Some(t) => t,
            None => {
                warn!(
                    table = %table.name,
                    column = %name,
                    data_type = %data_type,
                    "unknown mysql type; treating as text"
                );
                TypeId::Text
            }
        };
        columns.push(Column {
            name,
            type_id,
            not_null,
            collation,
        });
    }
    Ok(columns)
}

async fn get_columns_oracle(conn: &Conn, table: &DBTable) -> Result<Vec<Column>> {
    let rows = conn
        .query(&format!(
            "SELECT column_name, data_type, nullable, character_set_name, data_precision, data_scale \
             FROM all_tab_columns \
             WHERE table_name = {} \
             ORDER BY column_id",
            quote_literal(&table.name.table.to_uppercase())
        ))
        .await?;

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let name = cell(&row, 0)?.to_lowercase();
        let data_type = cell(&row, 1)?;
        let not_null = cell(&row, 2)? == "N";
        let collation = row.get(3).cloned().flatten();
        let precision = row.get(4).cloned().flatten().and_then(|v| v.parse().ok());
        let scale = row.get(5).cloned().flatten().and_then(|v| v.parse().ok());
        let type_id = match typeconv::oracle::data_type_to_canonical(&data_type, precision, scale) {
            Some(t) => t,
            None => {
                warn!(
                    table = %table.name,
                    column = %name,
                    data_type = %data_type,
                    "unknown oracle type; treating as text"
                );
                TypeId::Text
            }
        };
        columns.push(Column {
            name,
            type_id,
            not_null,
            collation,
        });
    }
    Ok(columns)
}

/// Extract primary key column names, ordered by key position.
pub async fn get_primary_key(conn: &Conn, table: &DBTable) -> Result<Vec<String>> {
    let rows = match conn {
        Conn::Pg(_) => {
            let oid = table
                .oid
                .ok_or_else(|| MoltError::assertion(format!("table {} has no OID", table.name)))?;
            conn.query(&format!(
                "SELECT a.attname AS column_name \
                 FROM pg_class t \
                 JOIN pg_attribute a ON a.attrelid = t.oid \
                 JOIN pg_index ix ON t.oid = ix.indrelid AND a.attnum = ANY(ix.indkey) \
                 JOIN pg_class i ON i.oid = ix.indexrelid \
                 WHERE t.oid = {} AND indisprimary",
                oid
            ))
            .await?
        }
        Conn::MySql(_) => {
            conn.query(&format!(
                "SELECT k.column_name \
                 FROM information_schema.table_constraints t \
                 JOIN information_schema.key_column_usage k \
                 USING (constraint_name, table_schema, table_name) \
                 WHERE t.constraint_type = 'PRIMARY KEY' \
                   AND t.table_schema = database() \
                   AND t.table_name = {} \
                 ORDER BY k.ordinal_position",
                quote_literal(&table.name.table)
            ))
            .await?
        }
        Conn::Oracle(_) => {
            conn.query(&format!(
                "SELECT column_name \
                 FROM all_cons_columns \
                 WHERE constraint_name = ( \
                   SELECT constraint_name FROM user_constraints \
                   WHERE table_name = {} AND constraint_type = 'P' \
                 ) ORDER BY position",
                quote_literal(&table.name.table.to_uppercase())
            ))
            .await?
        }
    };
    rows.into_iter()
        .map(|row| cell(&row, 0).map(|c| c.to_lowercase()))
        .collect()
}

fn cell(row: &[Option<String>], idx: usize) -> Result<String> {
    row.get(idx)
        .cloned()
        .flatten()
        .ok_or_else(|| MoltError::assertion(format!("null cell at index {}", idx)))
}

/// Align both sides of each table pair into [`VerifiedTable`] descriptors.
pub async fn verify_common_tables(
    conns: &OrderedConns,
    pairs: &[[DBTable; 2]],
) -> Result<Vec<TableVerification>> {
    let mut results = Vec::with_capacity(pairs.len());
    for pair in pairs {
        results.push(verify_table_pair(conns, pair).await?);
    }
    Ok(results)
}

async fn verify_table_pair(conns: &OrderedConns, pair: &[DBTable; 2]) -> Result<TableVerification> {
    let name = pair[1].name.clone();
    let mut mismatches = Vec::new();

    let mut columns: [Vec<Column>; 2] = [Vec::new(), Vec::new()];
    let mut pks: [Vec<String>; 2] = [Vec::new(), Vec::new()];
    for (i, conn) in conns.iter().enumerate() {
        columns[i] = get_columns(conn, &pair[i]).await?;
        pks[i] = get_primary_key(conn, &pair[i]).await?;
    }

    // The primary key must be non-empty and identical by position and
    // canonical kind; fetch and verify both paginate on it.
    if pks[0].is_empty() || pks[1].is_empty() {
        mismatches.push(DefinitionMismatch {
            conn_id: conns.get(if pks[0].is_empty() { 0 } else { 1 }).id().to_string(),
            table: name.clone(),
            info: "missing a primary key".to_string(),
        });
        return Ok(TableVerification {
            name,
            table: None,
            mismatches,
        });
    }
    if pks[0] != pks[1] {
        mismatches.push(DefinitionMismatch {
            conn_id: conns.target().id().to_string(),
            table: name.clone(),
            info: format!(
                "primary key mismatch: {:?} vs {:?}",
                pks[0], pks[1]
            ),
        });
        return Ok(TableVerification {
            name,
            table: None,
            mismatches,
        });
    }

    let find = |cols: &[Column], n: &str| cols.iter().find(|c| c.name == n).cloned();

    let mut pk_types = Vec::with_capacity(pks[0].len());
    let mut pk_ok = true;
    for pk_col in &pks[0] {
        let (src, tgt) = match (find(&columns[0], pk_col), find(&columns[1], pk_col)) {
            (Some(s), Some(t)) => (s, t),
            _ => {
                mismatches.push(DefinitionMismatch {
                    conn_id: conns.target().id().to_string(),
                    table: name.clone(),
                    info: format!("primary key column {:?} missing from a side", pk_col),
                });
                pk_ok = false;
                break;
            }
        };
        if src.type_id.kind() != tgt.type_id.kind() {
            mismatches.push(DefinitionMismatch {
                conn_id: conns.target().id().to_string(),
                table: name.clone(),
                info: format!(
                    "primary key column {:?} has incomparable types {} vs {}",
                    pk_col,
                    src.type_id.name(),
                    tgt.type_id.name()
                ),
            });
            pk_ok = false;
            break;
        }
        pk_types.push((src.type_id, tgt.type_id));
    }
    if !pk_ok {
        return Ok(TableVerification {
            name,
            table: None,
            mismatches,
        });
    }

    // Align non-PK columns by name; drop anything that does not line up.
    let mut value_columns = Vec::new();
    let mut value_types = Vec::new();
    for src in &columns[0] {
        if pks[0].contains(&src.name) {
            continue;
        }
        let tgt = match find(&columns[1], &src.name) {
            Some(t) => t,
            None => {
                mismatches.push(DefinitionMismatch {
                    conn_id: conns.target().id().to_string(),
                    table: name.clone(),
                    info: format!("column {:?} missing on target", src.name),
                });
                continue;
            }
        };
        if src.type_id.kind() != tgt.type_id.kind() {
            mismatches.push(DefinitionMismatch {
                conn_id: conns.target().id().to_string(),
                table: name.clone(),
                info: format!(
                    "column {:?} has incomparable types {} vs {}",
                    src.name,
                    src.type_id.name(),
                    tgt.type_id.name()
                ),
            });
            continue;
        }
        if src.not_null != tgt.not_null {
            mismatches.push(DefinitionMismatch {
                conn_id: conns.target().id().to_string(),
                table: name.clone(),
                info: format!("column {:?} differs in nullability", src.name),
            });
        }
        // Collation names are only comparable within one dialect family.
        if conns.source().dialect() == conns.target().dialect() && src.collation != tgt.collation {
            mismatches.push(DefinitionMismatch {
                conn_id: conns.target().id().to_string(),
                table: name.clone(),
                info: format!(
                    "column {:?} differs in collation ({:?} vs {:?})",
                    src.name, src.collation, tgt.collation
                ),
            });
        }
        value_columns.push(src.name.clone());
        value_types.push((src.type_id, tgt.type_id));
    }
    for tgt in &columns[1] {
        if pks[0].contains(&tgt.name) || columns[0].iter().any(|c| c.name == tgt.name) {
            continue;
        }
        mismatches.push(DefinitionMismatch {
            conn_id: conns.source().id().to_string(),
            table: name.clone(),
            info: format!("column {:?} missing on source", tgt.name),
        });
    }

    Ok(TableVerification {
        name: name.clone(),
        table: Some(VerifiedTable {
            name,
            pk_columns: pks[0].clone(),
            value_columns,
            pk_types,
            value_types,
        }),
        mismatches,
    })
}
