//! Target-side loading: `IMPORT INTO` with progress polling, and the
//! `COPY`-based path used by live mode.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::blobstore::Resource;
use crate::compression::Compression;
use crate::dbconn::{Conn, Dialect};
use crate::dbtable::{quote_if_needed, Name, VerifiedTable};
use crate::error::{MoltError, Result};
use crate::retry::{Retry, RetrySettings};
use crate::sqlbuild::{qualify_table, quote_ident, quote_literal};

pub struct ImportResult {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

fn column_list(table: &VerifiedTable) -> String {
    table
        .all_columns()
        .iter()
        .map(|c| quote_ident(Dialect::PostgresWire, c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Build the `IMPORT INTO` statement for a set of chunk locations.
fn import_into_stmt(
    table: &VerifiedTable,
    locations: &[String],
    compression: Compression,
) -> String {
    let locs = locations
        .iter()
        .map(|l| quote_literal(l))
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = format!(
        "IMPORT INTO {} ({}) CSV DATA ({})",
        qualify_table(Dialect::PostgresWire, &table.name),
        column_list(table),
        locs
    );
    if compression == Compression::Gzip {
        stmt.push_str(" WITH decompress = 'gzip'");
    }
    stmt
}

/// Run `IMPORT INTO` for the exported chunks, retrying transient failures.
pub async fn import_table(
    target: &Conn,
    table: &VerifiedTable,
    resources: &[Arc<dyn Resource>],
    compression: Compression,
) -> Result<ImportResult> {
    let start_time = Utc::now();
    let mut locations = Vec::with_capacity(resources.len());
    for resource in resources {
        locations.push(resource.import_url()?);
    }
    let stmt = import_into_stmt(table, &locations, compression);

    let retry = Retry::new(RetrySettings {
        initial_backoff: Duration::from_secs(1),
        multiplier: 2,
        max_backoff: Duration::ZERO,
        max_retries: 4,
    })?;
    retry
        .do_with(
            || async {
                target.execute(&stmt).await?;
                Ok(())
            },
            |err| {
                error!(table = %table.name, error = %err, "error importing data, retrying");
            },
        )
        .await?;

    Ok(ImportResult {
        start_time,
        end_time: Utc::now(),
    })
}

/// Stream each chunk into `COPY ... FROM STDIN CSV` on the target.
pub async fn copy_table(
    target: &Conn,
    table: &VerifiedTable,
    resources: &[Arc<dyn Resource>],
) -> Result<ImportResult> {
    let start_time = Utc::now();
    let stmt = format!(
        "COPY {} ({}) FROM STDIN CSV",
        qualify_table(Dialect::PostgresWire, &table.name),
        column_list(table)
    );
    let pg = target.pg()?;
    for resource in resources {
        let data = resource.read_all().await?;
        pg.copy_from(&stmt, data).await?;
    }
    Ok(ImportResult {
        start_time,
        end_time: Utc::now(),
    })
}

/// Build the `SHOW JOBS` query that finds this table's import job. Every
/// `%` in the schema or table name is escaped so the LIKE pattern only
/// matches literally; surrounding quotes are stripped because the job
/// description embeds unquoted names.
pub fn get_show_jobs_query(table: &Name, cur_time: &str) -> String {
    let escape = |s: &str| {
        quote_if_needed(s)
            .replace('%', "\\%")
            .trim_matches('"')
            .to_string()
    };
    format!(
        "WITH x as (SHOW JOBS)\n\
         SELECT description, started, fraction_completed\n\
         FROM x\n\
         WHERE job_type='IMPORT'\n\
         \x20   AND description LIKE '%{}.{}(%'\n\
         \x20   AND started > '{}'\n\
         ORDER BY created DESC",
        escape(&table.schema),
        escape(&table.table),
        cur_time
    )
}

/// Poll `SHOW JOBS` until the import job reports completion.
///
/// Runs on a fresh connection so the poll never competes with the import
/// statement itself. This is a recovery loop: it retries on a fixed 10s
/// interval until the job finishes, logging only changed non-zero
/// fractions.
pub async fn report_import_progress(
    target: &Conn,
    table: &Name,
    export_start: DateTime<Utc>,
    testing: bool,
) -> Result<()> {
    let cur_time = export_start.format("%Y-%m-%dT%H:%M:%S").to_string();
    let retry = Retry::new(RetrySettings {
        initial_backoff: Duration::from_secs(10),
        multiplier: 1,
        max_backoff: Duration::ZERO,
        max_retries: u64::MAX,
    })?;

    let conn = target.clone_conn().await?;
    let prev_fraction = Mutex::new(0.0f64);
    let result = retry
        .do_with(
            || async {
                let query = get_show_jobs_query(table, &cur_time);
                let rows = conn.query(&query).await?;
                let first = rows
                    .first()
                    .ok_or_else(|| MoltError::table(table.safe_string(), "no import job found yet"))?;
                let fraction: f64 = first
                    .get(2)
                    .cloned()
                    .flatten()
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| {
                        MoltError::table(table.safe_string(), "unparseable fraction_completed")
                    })?;
                if fraction != 1.0 {
                    let mut prev = prev_fraction.lock().unwrap();
                    if fraction != 0.0 && *prev != fraction {
                        info!(
                            completion = %format!("{:.2}%", fraction * 100.0),
                            table = %table,
                            "progress"
                        );
                    }
                    *prev = fraction;
                    return Err(MoltError::table(
                        table.safe_string(),
                        "import job not finished yet",
                    ));
                }
                if testing {
                    info!("100.00% completed ({})", table.safe_string());
                }
                Ok(())
            },
            |_| {},
        )
        .await;
    conn.close().await?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typeconv::TypeId;

    fn teams_table() -> VerifiedTable {
        VerifiedTable {
            name: Name::new("public", "teams"),
            pk_columns: vec!["id".into()],
            value_columns: vec!["name".into(), "role".into()],
            pk_types: vec![(TypeId::Int8, TypeId::Int8)],
            value_types: vec![
                (TypeId::Text, TypeId::Text),
                (TypeId::Text, TypeId::Text),
            ],
        }
    }

    #[test]
    fn test_show_jobs_query_plain_names() {
        let query = get_show_jobs_query(&Name::new("public", "test1"), "2006-01-02T15:04:05");
        assert_eq!(
            query,
            "WITH x as (SHOW JOBS)\n\
             SELECT description, started, fraction_completed\n\
             FROM x\n\
             WHERE job_type='IMPORT'\n\
             \x20   AND description LIKE '%public.test1(%'\n\
             \x20   AND started > '2006-01-02T15:04:05'\n\
             ORDER BY created DESC"
        );
    }

    #[test]
    fn test_show_jobs_query_escapes_percent() {
        let query = get_show_jobs_query(&Name::new("public", "test%1"), "2006-01-02T15:04:05");
        assert!(query.contains("AND description LIKE '%public.test\\%1(%'"));
    }

    #[test]
    fn test_import_stmt_with_gzip() {
        let stmt = import_into_stmt(
            &teams_table(),
            &["http://localhost:4040/x.csv.gz".to_string()],
            Compression::Gzip,
        );
        assert_eq!(
            stmt,
            "IMPORT INTO \"public\".\"teams\" (\"id\", \"name\", \"role\") \
             CSV DATA ('http://localhost:4040/x.csv.gz') WITH decompress = 'gzip'"
        );
    }

    #[test]
    fn test_import_stmt_without_compression() {
        let stmt = import_into_stmt(
            &teams_table(),
            &[
                "http://localhost:4040/a.csv".to_string(),
                "http://localhost:4040/b.csv".to_string(),
            ],
            Compression::None,
        );
        assert_eq!(
            stmt,
            "IMPORT INTO \"public\".\"teams\" (\"id\", \"name\", \"role\") \
             CSV DATA ('http://localhost:4040/a.csv', 'http://localhost:4040/b.csv')"
        );
    }
}
