//! Table descriptors shared by the fetch and verify engines.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::typeconv::TypeId;

/// Quote an identifier if it is not a simple lowercase name.
pub fn quote_if_needed(ident: &str) -> String {
    let simple = !ident.is_empty()
        && ident
            .chars()
            .next()
            .map(|c| c.is_ascii_lowercase() || c == '_')
            .unwrap_or(false)
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if simple {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

/// A `(schema, table)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Name {
    pub schema: String,
    pub table: String,
}

impl Name {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Unquoted `schema.table`, for metric labels and log fields.
    pub fn safe_string(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

impl fmt::Display for Name {
    /// Quoted-safe `schema.table`; identifiers are quoted only when needed.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}",
            quote_if_needed(&self.schema),
            quote_if_needed(&self.table)
        )
    }
}

/// A table as discovered on one side, with its dialect-specific object id
/// (the Postgres `pg_class` OID; absent for MySQL and Oracle).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DBTable {
    pub name: Name,
    pub oid: Option<u32>,
}

impl DBTable {
    pub fn new(name: Name) -> Self {
        Self { name, oid: None }
    }

    pub fn with_oid(name: Name, oid: u32) -> Self {
        Self {
            name,
            oid: Some(oid),
        }
    }
}

/// A table descriptor validated as comparable between source and target.
///
/// The primary key column list is non-empty and identical on both sides by
/// position and canonical type; non-PK columns that do not align on both
/// sides have already been dropped by schema verification. Produced once at
/// the start of fetch/verify and consumed read-only.
#[derive(Debug, Clone)]
pub struct VerifiedTable {
    pub name: Name,
    /// Primary key columns ordered by key position.
    pub pk_columns: Vec<String>,
    /// Aligned comparable non-PK columns in declaration order.
    pub value_columns: Vec<String>,
    /// Canonical `(source, target)` type per PK column.
    pub pk_types: Vec<(TypeId, TypeId)>,
    /// Canonical `(source, target)` type per value column.
    pub value_types: Vec<(TypeId, TypeId)>,
}

impl VerifiedTable {
    /// All scanned columns: primary key first, then value columns.
    pub fn all_columns(&self) -> Vec<String> {
        let mut cols = self.pk_columns.clone();
        cols.extend(self.value_columns.iter().cloned());
        cols
    }

    /// Canonical types for one side (`0` source, `1` target) in scan order.
    pub fn side_types(&self, side: usize) -> Vec<TypeId> {
        let pick = |pair: &(TypeId, TypeId)| if side == 0 { pair.0 } else { pair.1 };
        self.pk_types
            .iter()
            .map(pick)
            .chain(self.value_types.iter().map(pick))
            .collect()
    }

    pub fn pk_len(&self) -> usize {
        self.pk_columns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_quotes_only_when_needed() {
        assert_eq!(Name::new("public", "users").to_string(), "public.users");
        assert_eq!(
            Name::new("public", "test%1").to_string(),
            "public.\"test%1\""
        );
        assert_eq!(
            Name::new("public", "Weird\"Name").to_string(),
            "public.\"Weird\"\"Name\""
        );
    }

    #[test]
    fn test_safe_string_is_unquoted() {
        assert_eq!(Name::new("public", "test%1").safe_string(), "public.test%1");
    }

    #[test]
    fn test_all_columns_puts_pk_first() {
        let table = VerifiedTable {
            name: Name::new("public", "t"),
            pk_columns: vec!["id".into()],
            value_columns: vec!["name".into(), "role".into()],
            pk_types: vec![(TypeId::Int8, TypeId::Int8)],
            value_types: vec![
                (TypeId::Text, TypeId::Text),
                (TypeId::Text, TypeId::Text),
            ],
        };
        assert_eq!(table.all_columns(), vec!["id", "name", "role"]);
        assert_eq!(
            table.side_types(0),
            vec![TypeId::Int8, TypeId::Text, TypeId::Text]
        );
    }
}
