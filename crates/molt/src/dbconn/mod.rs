//! Polymorphic database connections.
//!
//! A [`Conn`] wraps one of the supported drivers behind a uniform surface:
//! execute, text-format query, clone, dialect tag, and the shared type map.
//! Two ordered connections are always held by the engines: index 0 is the
//! source of truth, index 1 the target.

pub mod mysql;
pub mod oracle;
pub mod pg;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub use mysql::MySqlConn;
pub use oracle::OracleConn;
pub use pg::PgConn;

use crate::error::{MoltError, Result};
use crate::typeconv::TypeId;

/// Wire dialect of a connection. `PostgresWire` serves both upstream
/// PostgreSQL and the CockroachDB target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    PostgresWire,
    MySql,
    Oracle,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::PostgresWire => "postgres",
            Dialect::MySql => "mysql",
            Dialect::Oracle => "oracle",
        }
    }
}

/// Accumulated mapping of non-builtin type OIDs (user-defined enums and the
/// like) to canonical types. Append-only; shared by reference between a
/// connection and its clones so decoding state is never lost.
#[derive(Debug, Default)]
pub struct TypeMap {
    inner: Mutex<HashMap<u32, TypeId>>,
}

impl TypeMap {
    pub fn get(&self, oid: u32) -> Option<TypeId> {
        self.inner.lock().unwrap().get(&oid).copied()
    }

    pub fn insert(&self, oid: u32, type_id: TypeId) {
        self.inner.lock().unwrap().insert(oid, type_id);
    }
}

/// One row of text-format cells; `None` is SQL NULL.
pub type RawRow = Vec<Option<String>>;

/// A connection to one side of the migration.
pub enum Conn {
    Pg(PgConn),
    MySql(MySqlConn),
    Oracle(OracleConn),
}

impl Conn {
    /// Identifier used in logs and reports ("source" / "target").
    pub fn id(&self) -> &str {
        match self {
            Conn::Pg(c) => c.id(),
            Conn::MySql(c) => c.id(),
            Conn::Oracle(c) => c.id(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            Conn::Pg(_) => Dialect::PostgresWire,
            Conn::MySql(_) => Dialect::MySql,
            Conn::Oracle(_) => Dialect::Oracle,
        }
    }

    /// Whether the server identified itself as CockroachDB.
    pub fn is_cockroach(&self) -> bool {
        match self {
            Conn::Pg(c) => c.is_cockroach(),
            _ => false,
        }
    }

    pub fn type_map(&self) -> &Arc<TypeMap> {
        match self {
            Conn::Pg(c) => c.type_map(),
            Conn::MySql(c) => c.type_map(),
            Conn::Oracle(c) => c.type_map(),
        }
    }

    /// Open an independent connection to the same database. The clone
    /// shares this connection's type map by reference.
    pub async fn clone_conn(&self) -> Result<Conn> {
        Ok(match self {
            Conn::Pg(c) => Conn::Pg(c.clone_conn().await?),
            Conn::MySql(c) => Conn::MySql(c.clone_conn().await?),
            Conn::Oracle(c) => Conn::Oracle(c.clone_conn().await?),
        })
    }

    /// Execute a statement, returning the affected row count.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        match self {
            Conn::Pg(c) => c.execute(sql).await,
            Conn::MySql(c) => c.execute(sql).await,
            Conn::Oracle(c) => c.execute(sql).await,
        }
    }

    /// Run a query and collect all rows as text-format cells.
    pub async fn query(&self, sql: &str) -> Result<Vec<RawRow>> {
        match self {
            Conn::Pg(c) => c.query(sql).await,
            Conn::MySql(c) => c.query(sql).await,
            Conn::Oracle(c) => c.query(sql).await,
        }
    }

    pub async fn close(self) -> Result<()> {
        match self {
            Conn::Pg(c) => c.close().await,
            Conn::MySql(c) => c.close().await,
            Conn::Oracle(c) => c.close().await,
        }
    }

    /// Downcast to the Postgres-wire connection, for COPY and other
    /// target-only operations.
    pub fn pg(&self) -> Result<&PgConn> {
        match self {
            Conn::Pg(c) => Ok(c),
            other => Err(MoltError::assertion(format!(
                "expected postgres connection, got {}",
                other.dialect().as_str()
            ))),
        }
    }
}

/// The source-of-truth connection (index 0) and the target (index 1).
pub struct OrderedConns {
    conns: [Conn; 2],
}

impl OrderedConns {
    pub fn new(source: Conn, target: Conn) -> Self {
        Self {
            conns: [source, target],
        }
    }

    pub fn source(&self) -> &Conn {
        &self.conns[0]
    }

    pub fn target(&self) -> &Conn {
        &self.conns[1]
    }

    pub fn get(&self, side: usize) -> &Conn {
        &self.conns[side]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conn> {
        self.conns.iter()
    }
}

/// Connect to a database by URI, dispatching on the scheme. MySQL also
/// accepts DSN-form strings (`user:pass@tcp(host:port)/db`).
pub async fn connect(id: &str, conn_str: &str) -> Result<Conn> {
    if conn_str.starts_with("postgres://") || conn_str.starts_with("postgresql://") {
        Ok(Conn::Pg(PgConn::connect(id, conn_str, None).await?))
    } else if conn_str.starts_with("oracle://") {
        Ok(Conn::Oracle(OracleConn::connect(id, conn_str, None).await?))
    } else if conn_str.starts_with("mysql://") || conn_str.contains("tcp(") {
        Ok(Conn::MySql(MySqlConn::connect(id, conn_str, None).await?))
    } else {
        Err(MoltError::Config(format!(
            "unsupported connection string {:?}; expected a postgres://, mysql://, or oracle:// URI",
            conn_str
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_map_is_shared_by_reference() {
        // Cloning a connection hands the clone the same Arc'd map, so an
        // insert through either handle is visible to both.
        let original: Arc<TypeMap> = Arc::default();
        let cloned = original.clone();
        original.insert(424242, TypeId::Enum);
        assert_eq!(cloned.get(424242), Some(TypeId::Enum));
        cloned.insert(424243, TypeId::Text);
        assert_eq!(original.get(424243), Some(TypeId::Text));
    }

    #[test]
    fn test_dialect_tags() {
        assert_eq!(Dialect::PostgresWire.as_str(), "postgres");
        assert_eq!(Dialect::MySql.as_str(), "mysql");
        assert_eq!(Dialect::Oracle.as_str(), "oracle");
    }
}
