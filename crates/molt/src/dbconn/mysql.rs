//! MySQL connections.

use std::sync::Arc;

use mysql_async::prelude::Queryable;
use mysql_async::{Pool, Row, Value};
use tracing::debug;

use super::{RawRow, TypeMap};
use crate::error::Result;
use crate::mysqlurl;

/// A MySQL connection pool wrapped as a single logical connection.
pub struct MySqlConn {
    id: String,
    conn_str: String,
    pool: Pool,
    type_map: Arc<TypeMap>,
}

impl MySqlConn {
    /// Connect from either a URL or DSN form connection string.
    pub async fn connect(id: &str, conn_str: &str, type_map: Option<Arc<TypeMap>>) -> Result<Self> {
        let cfg = mysqlurl::parse(conn_str)?;
        let pool = Pool::new(cfg.to_opts()?);
        let conn = Self {
            id: id.to_string(),
            conn_str: conn_str.to_string(),
            pool,
            type_map: type_map.unwrap_or_default(),
        };
        // Exercise the pool so connection errors surface at startup.
        conn.query("SELECT 1").await?;
        debug!(id = %id, "connected to mysql");
        Ok(conn)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_map(&self) -> &Arc<TypeMap> {
        &self.type_map
    }

    pub async fn clone_conn(&self) -> Result<Self> {
        Self::connect(&self.id, &self.conn_str, Some(self.type_map.clone())).await
    }

    pub async fn execute(&self, sql: &str) -> Result<u64> {
        let mut conn = self.pool.get_conn().await?;
        conn.query_drop(sql).await?;
        Ok(conn.affected_rows())
    }

    /// Run a query over the text protocol and collect rows as text cells.
    pub async fn query(&self, sql: &str) -> Result<Vec<RawRow>> {
        let mut conn = self.pool.get_conn().await?;
        let rows: Vec<Row> = conn.query(sql).await?;
        Ok(rows
            .into_iter()
            .map(|row| row.unwrap().into_iter().map(value_to_text).collect())
            .collect())
    }

    pub async fn close(self) -> Result<()> {
        self.pool.disconnect().await?;
        Ok(())
    }
}

/// Render a driver value as its text form. The text protocol delivers most
/// cells as bytes already; the remaining variants appear when the server
/// pre-parses values.
fn value_to_text(value: Value) -> Option<String> {
    match value {
        Value::NULL => None,
        Value::Bytes(b) => Some(String::from_utf8_lossy(&b).into_owned()),
        Value::Int(v) => Some(v.to_string()),
        Value::UInt(v) => Some(v.to_string()),
        Value::Float(v) => Some(v.to_string()),
        Value::Double(v) => Some(v.to_string()),
        Value::Date(y, mo, d, 0, 0, 0, 0) => Some(format!("{:04}-{:02}-{:02}", y, mo, d)),
        Value::Date(y, mo, d, h, mi, s, us) => Some(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            y, mo, d, h, mi, s, us
        )),
        Value::Time(neg, days, h, mi, s, us) => {
            let sign = if neg { "-" } else { "" };
            Some(format!(
                "{}{:02}:{:02}:{:02}.{:06}",
                sign,
                u32::from(h) + days * 24,
                mi,
                s,
                us
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_to_text_scalars() {
        assert_eq!(value_to_text(Value::NULL), None);
        assert_eq!(
            value_to_text(Value::Bytes(b"hello".to_vec())).as_deref(),
            Some("hello")
        );
        assert_eq!(value_to_text(Value::Int(-7)).as_deref(), Some("-7"));
        assert_eq!(value_to_text(Value::UInt(7)).as_deref(), Some("7"));
    }

    #[test]
    fn test_value_to_text_dates() {
        assert_eq!(
            value_to_text(Value::Date(2023, 5, 1, 0, 0, 0, 0)).as_deref(),
            Some("2023-05-01")
        );
        assert_eq!(
            value_to_text(Value::Date(2023, 5, 1, 10, 20, 30, 400)).as_deref(),
            Some("2023-05-01 10:20:30.000400")
        );
    }
}
