//! SQL generation helpers shared by the fetch exporter and the verify
//! scanners: identifier quoting per dialect, literal rendering, and
//! keyset-pagination predicates over composite primary keys.

use crate::dbconn::Dialect;
use crate::dbtable::Name;
use crate::error::{MoltError, Result};
use crate::typeconv::TypeId;

/// Quote an identifier for the given dialect.
///
/// Oracle identifiers are left unquoted: introspection lowercases names and
/// unquoted identifiers resolve case-insensitively there.
pub fn quote_ident(dialect: Dialect, name: &str) -> String {
    match dialect {
        Dialect::PostgresWire => format!("\"{}\"", name.replace('"', "\"\"")),
        Dialect::MySql => format!("`{}`", name.replace('`', "``")),
        Dialect::Oracle => name.to_string(),
    }
}

/// Quote a `schema.table` reference. MySQL and Oracle are single-namespace;
/// the normalized `public` schema is dropped there.
pub fn qualify_table(dialect: Dialect, name: &Name) -> String {
    match dialect {
        Dialect::PostgresWire => format!(
            "{}.{}",
            quote_ident(dialect, &name.schema),
            quote_ident(dialect, &name.table)
        ),
        Dialect::MySql | Dialect::Oracle => quote_ident(dialect, &name.table),
    }
}

/// Quote a string for use as a SQL literal.
pub fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Render a raw text cell as a SQL literal of the given canonical type.
pub fn render_literal(type_id: TypeId, raw: &str) -> String {
    if type_id.literal_needs_quotes() {
        quote_literal(raw)
    } else {
        raw.to_string()
    }
}

/// Lexicographic `>` (or `>=` when `inclusive`) predicate over a composite
/// key tuple, expanded into the OR-of-ANDs form every dialect accepts:
/// `(a > v1) OR (a = v1 AND b > v2) OR ...`.
pub fn keyset_predicate(
    dialect: Dialect,
    columns: &[String],
    types: &[TypeId],
    values: &[Option<String>],
    inclusive: bool,
) -> Result<String> {
    if columns.len() != values.len() || columns.len() != types.len() {
        return Err(MoltError::assertion(format!(
            "keyset arity mismatch: {} columns, {} types, {} values",
            columns.len(),
            types.len(),
            values.len()
        )));
    }
    let literal = |i: usize| -> Result<String> {
        let raw = values[i]
            .as_deref()
            .ok_or_else(|| MoltError::assertion("primary key cell is null"))?;
        Ok(render_literal(types[i], raw))
    };

    let mut alternatives = Vec::with_capacity(columns.len());
    for i in 0..columns.len() {
        let mut conjuncts = Vec::with_capacity(i + 1);
        for (j, col) in columns.iter().enumerate().take(i) {
            conjuncts.push(format!("{} = {}", quote_ident(dialect, col), literal(j)?));
        }
        let last = i == columns.len() - 1;
        let op = if last && inclusive { ">=" } else { ">" };
        conjuncts.push(format!(
            "{} {} {}",
            quote_ident(dialect, &columns[i]),
            op,
            literal(i)?
        ));
        alternatives.push(format!("({})", conjuncts.join(" AND ")));
    }
    Ok(format!("({})", alternatives.join(" OR ")))
}

/// Options for building an ordered, keyset-paginated scan query.
pub struct ScanQuery<'a> {
    pub dialect: Dialect,
    pub table: &'a Name,
    /// Columns to select, primary key first.
    pub columns: &'a [String],
    /// Primary key columns, ordered by key position.
    pub pk_columns: &'a [String],
    /// Canonical types of the primary key columns.
    pub pk_types: &'a [TypeId],
    /// Resume after this key (exclusive cursor).
    pub after: Option<&'a [Option<String>]>,
    /// Shard lower bound, inclusive (integer PK domains only).
    pub shard_lo: Option<i64>,
    /// Shard upper bound, exclusive.
    pub shard_hi: Option<i64>,
    pub limit: usize,
}

/// Build `SELECT cols FROM t WHERE <bounds> ORDER BY pk LIMIT n` with the
/// dialect's row-limit syntax.
pub fn build_scan_query(q: &ScanQuery<'_>) -> Result<String> {
    let col_list = q
        .columns
        .iter()
        .map(|c| quote_ident(q.dialect, c))
        .collect::<Vec<_>>()
        .join(", ");
    let order_by = q
        .pk_columns
        .iter()
        .map(|c| quote_ident(q.dialect, c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut conditions = Vec::new();
    if let Some(after) = q.after {
        conditions.push(keyset_predicate(
            q.dialect,
            q.pk_columns,
            q.pk_types,
            after,
            false,
        )?);
    }
    let first_pk = quote_ident(q.dialect, &q.pk_columns[0]);
    if let Some(lo) = q.shard_lo {
        conditions.push(format!("{} >= {}", first_pk, lo));
    }
    if let Some(hi) = q.shard_hi {
        conditions.push(format!("{} < {}", first_pk, hi));
    }

    let mut sql = format!(
        "SELECT {} FROM {}",
        col_list,
        qualify_table(q.dialect, q.table)
    );
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(&format!(" ORDER BY {}", order_by));
    match q.dialect {
        Dialect::PostgresWire | Dialect::MySql => sql.push_str(&format!(" LIMIT {}", q.limit)),
        Dialect::Oracle => sql.push_str(&format!(" FETCH FIRST {} ROWS ONLY", q.limit)),
    }
    Ok(sql)
}

/// Predicate matching an exact composite key: `a = v1 AND b = v2`.
pub fn key_equality_predicate(
    dialect: Dialect,
    columns: &[String],
    types: &[TypeId],
    values: &[Option<String>],
) -> Result<String> {
    if columns.len() != values.len() {
        return Err(MoltError::assertion("key arity mismatch"));
    }
    let mut conjuncts = Vec::with_capacity(columns.len());
    for (i, col) in columns.iter().enumerate() {
        let raw = values[i]
            .as_deref()
            .ok_or_else(|| MoltError::assertion("primary key cell is null"))?;
        conjuncts.push(format!(
            "{} = {}",
            quote_ident(dialect, col),
            render_literal(types[i], raw)
        ));
    }
    Ok(conjuncts.join(" AND "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn cells(v: &[&str]) -> Vec<Option<String>> {
        v.iter().map(|s| Some(s.to_string())).collect()
    }

    #[test]
    fn test_quote_ident_per_dialect() {
        assert_eq!(quote_ident(Dialect::PostgresWire, "id"), "\"id\"");
        assert_eq!(
            quote_ident(Dialect::PostgresWire, "we\"ird"),
            "\"we\"\"ird\""
        );
        assert_eq!(quote_ident(Dialect::MySql, "id"), "`id`");
        assert_eq!(quote_ident(Dialect::Oracle, "id"), "id");
    }

    #[test]
    fn test_single_column_keyset() {
        let p = keyset_predicate(
            Dialect::PostgresWire,
            &strs(&["id"]),
            &[TypeId::Int8],
            &cells(&["42"]),
            false,
        )
        .unwrap();
        assert_eq!(p, "((\"id\" > 42))");
    }

    #[test]
    fn test_composite_keyset_expands_lexicographically() {
        let p = keyset_predicate(
            Dialect::PostgresWire,
            &strs(&["a", "b"]),
            &[TypeId::Int8, TypeId::Varchar],
            &cells(&["1", "x"]),
            false,
        )
        .unwrap();
        assert_eq!(p, "((\"a\" > 1) OR (\"a\" = 1 AND \"b\" > 'x'))");
    }

    #[test]
    fn test_string_literals_are_escaped() {
        let p = keyset_predicate(
            Dialect::PostgresWire,
            &strs(&["name"]),
            &[TypeId::Text],
            &cells(&["O'Brien"]),
            false,
        )
        .unwrap();
        assert_eq!(p, "((\"name\" > 'O''Brien'))");
    }

    #[test]
    fn test_scan_query_shapes() {
        let table = Name::new("public", "events");
        let columns = strs(&["id", "payload"]);
        let pk = strs(&["id"]);
        let q = ScanQuery {
            dialect: Dialect::PostgresWire,
            table: &table,
            columns: &columns,
            pk_columns: &pk,
            pk_types: &[TypeId::Int8],
            after: None,
            shard_lo: Some(100),
            shard_hi: Some(200),
            limit: 1000,
        };
        assert_eq!(
            build_scan_query(&q).unwrap(),
            "SELECT \"id\", \"payload\" FROM \"public\".\"events\" \
             WHERE \"id\" >= 100 AND \"id\" < 200 ORDER BY \"id\" LIMIT 1000"
        );
    }

    #[test]
    fn test_scan_query_oracle_fetch_first() {
        let table = Name::new("public", "events");
        let columns = strs(&["id"]);
        let pk = strs(&["id"]);
        let q = ScanQuery {
            dialect: Dialect::Oracle,
            table: &table,
            columns: &columns,
            pk_columns: &pk,
            pk_types: &[TypeId::Int8],
            after: None,
            shard_lo: None,
            shard_hi: None,
            limit: 50,
        };
        assert_eq!(
            build_scan_query(&q).unwrap(),
            "SELECT id FROM events ORDER BY id FETCH FIRST 50 ROWS ONLY"
        );
    }

    #[test]
    fn test_key_equality_predicate() {
        let p = key_equality_predicate(
            Dialect::MySql,
            &strs(&["a", "b"]),
            &[TypeId::Int8, TypeId::Text],
            &cells(&["7", "x"]),
        )
        .unwrap();
        assert_eq!(p, "`a` = 7 AND `b` = 'x'");
    }
}
