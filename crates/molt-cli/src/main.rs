//! molt CLI - onboarding assistance for migrating to CockroachDB.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use molt::blobstore::direct::DirectCopyStore;
use molt::blobstore::gcs::GcsStore;
use molt::blobstore::local::LocalStore;
use molt::blobstore::s3::S3Store;
use molt::blobstore::Store;
use molt::compression::Compression;
use molt::dbconn::{self, OrderedConns};
use molt::fetch::{ExportSettings, FetchConfig, PgReplicationSettings};
use molt::filter::TableFilter;
use molt::retry::RetrySettings;
use molt::verify::inconsistency::{CombinedReporter, FixReporter, Inconsistency, LogReporter, Reporter};
use molt::verify::reverify::LiveReverificationSettings;
use molt::verify::VerifyOpts;
use molt::{MoltError, Result};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "molt")]
#[command(about = "Onboarding assistance for migrating to CockroachDB")]
#[command(
    long_about = "MOLT (Migrate Off Legacy Things) provides tooling which assists migrating \
                  off other database providers to CockroachDB."
)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CommonFlags {
    /// Connection string of the source database (the source of truth).
    #[arg(long)]
    source: String,

    /// Connection string of the target CockroachDB cluster.
    #[arg(long)]
    target: String,

    /// Level to log at (trace/debug/info/warn/error).
    #[arg(long, default_value = "info")]
    logging: String,

    /// Use the console writer, which has cleaner log output but introduces
    /// more latency (defaults to false, which logs as structured JSON).
    #[arg(long)]
    use_console_writer: bool,

    /// If set, writes to the log file specified. Otherwise, only writes to
    /// stdout.
    #[arg(long)]
    log_file: Option<String>,

    /// Address to expose Prometheus metrics on.
    #[arg(long, default_value = "127.0.0.1:3030")]
    metrics_listen_addr: String,

    /// Regex of schemas to include (repeatable; empty includes all).
    #[arg(long = "schema-filter")]
    schema_filter: Vec<String>,

    /// Regex of tables to include (repeatable; empty includes all).
    #[arg(long = "table-filter")]
    table_filter: Vec<String>,

    /// Regex of schemas to exclude (repeatable).
    #[arg(long = "schema-exclusion-filter")]
    schema_exclusion_filter: Vec<String>,

    /// Regex of tables to exclude (repeatable).
    #[arg(long = "table-exclusion-filter")]
    table_exclusion_filter: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Moves data from source to target.
    Fetch {
        #[command(flatten)]
        common: CommonFlags,

        /// Enables direct copy mode, which copies data directly from source
        /// to target without using an intermediate store.
        #[arg(long = "direct-copy")]
        direct_copy: bool,

        /// Whether any created resources should be deleted.
        #[arg(long)]
        cleanup: bool,

        /// Whether the table must be queryable during load import.
        #[arg(long)]
        live: bool,

        /// If set, size (in bytes) before the source data is flushed to
        /// intermediate files.
        #[arg(long = "flush-size", default_value_t = 0)]
        flush_size: usize,

        /// If set, number of rows before the source data is flushed to
        /// intermediate files.
        #[arg(long = "flush-rows", default_value_t = 0)]
        flush_rows: usize,

        /// Number of tables to move at a time.
        #[arg(long, default_value_t = 4)]
        concurrency: usize,

        /// Name of the S3 bucket.
        #[arg(long = "s3-bucket")]
        s3_bucket: Option<String>,

        /// Name of the GCP bucket.
        #[arg(long = "gcp-bucket")]
        gcp_bucket: Option<String>,

        /// Path within the bucket where intermediate files are written.
        #[arg(long = "bucket-path", default_value = "")]
        bucket_path: String,

        /// Path to upload files to locally.
        #[arg(long = "local-path")]
        local_path: Option<String>,

        /// Address of a local store server to listen to for traffic.
        #[arg(long = "local-path-listen-addr")]
        local_path_listen_addr: Option<String>,

        /// Address of data that CockroachDB can access to import from a
        /// local store (defaults to local-path-listen-addr).
        #[arg(long = "local-path-crdb-access-addr")]
        local_path_crdb_access_addr: Option<String>,

        /// Whether to truncate the target tables before source data is
        /// imported.
        #[arg(long)]
        truncate: bool,

        /// Number of rows to select at a time for export from the source
        /// database.
        #[arg(long = "row-batch-size", default_value_t = 100_000)]
        row_batch_size: usize,

        /// Compression type (default/gzip/none) to use (IMPORT INTO mode
        /// only).
        #[arg(long, default_value = "default")]
        compression: Compression,

        /// If set, the name of a replication slot that will be created
        /// before taking a snapshot of data.
        #[arg(long = "pg-logical-replication-slot-name", default_value = "")]
        pg_logical_replication_slot_name: String,

        /// If set, the output plugin used for logical replication under
        /// pg-logical-replication-slot-name.
        #[arg(long = "pg-logical-replication-slot-plugin", default_value = "pgoutput")]
        pg_logical_replication_slot_plugin: String,

        /// If set, drops the replication slot if it exists.
        #[arg(long = "pg-logical-replication-slot-drop-if-exists")]
        pg_logical_replication_slot_drop_if_exists: bool,
    },

    /// Verify table schemas and row data align.
    Verify {
        #[command(flatten)]
        common: CommonFlags,

        /// Number of tables to process at a time (defaults to number of
        /// CPUs).
        #[arg(long, default_value_t = 0)]
        concurrency: usize,

        /// Number of shards to break down each table into while doing
        /// row-based verification.
        #[arg(long = "table-splits", default_value_t = 1, hide = true)]
        table_splits: usize,

        /// Number of source/target rows to scan at a time.
        #[arg(long = "row-batch-size", default_value_t = 20_000)]
        row_batch_size: usize,

        /// If set, maximum number of rows to read per second on each shard.
        #[arg(long = "rows-per-second", default_value_t = 0)]
        rows_per_second: usize,

        /// Whether to fix up inconsistencies found during row verification.
        #[arg(long, hide = true)]
        fixup: bool,

        /// Amount of time to pause between continuous runs (e.g. 1h, 2m).
        #[arg(long = "continuous-pause-between-runs", default_value = "0s", value_parser = parse_duration)]
        continuous_pause_between_runs: Duration,

        /// Whether verification should continuously run on each shard.
        #[arg(long)]
        continuous: bool,

        /// Enable live mode, which attempts to account for rows that can
        /// change in value by retrying them before marking them as
        /// inconsistent.
        #[arg(long)]
        live: bool,

        /// If true, verify both the schema (columns, types) and row data.
        /// If false, verify only the schema.
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        rows: bool,

        /// Maximum number of retry attempts per second (live mode only).
        #[arg(long = "live-runs-per-second", default_value_t = 0)]
        live_runs_per_second: usize,

        /// Maximum number of rows to retry at a time (live mode only).
        #[arg(long = "live-max-batch-size", default_value_t = 1000)]
        live_max_batch_size: usize,

        /// Maximum amount of time to wait before retrying rows (live mode
        /// only).
        #[arg(long = "live-flush-interval", default_value = "1s", value_parser = parse_duration)]
        live_flush_interval: Duration,

        /// Maximum number of retries before marking rows as inconsistent
        /// (live mode only).
        #[arg(long = "live-retries-max-iterations", default_value_t = 5)]
        live_retries_max_iterations: u64,

        /// Maximum amount of time a retry attempt should take before
        /// retrying again (live mode only).
        #[arg(long = "live-retry-max-backoff", default_value = "1s", value_parser = parse_duration)]
        live_retry_max_backoff: Duration,

        /// Amount of time live verification should initially backoff for
        /// before retrying.
        #[arg(long = "live-retry-initial-backoff", default_value = "250ms", value_parser = parse_duration)]
        live_retry_initial_backoff: Duration,

        /// Multiplier to apply to backoff duration after each failed row
        /// verification (live mode only).
        #[arg(long = "live-retry-multiplier", default_value_t = 2)]
        live_retry_multiplier: u32,
    },

    /// Utility to help escape passwords with special characters.
    EscapePassword {
        /// Password to percent-encode.
        password: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::EscapePassword { password } => {
            println!(
                "Substitute the following encoded password in your original connection url string:\n{}",
                utf8_percent_encode(&password, NON_ALPHANUMERIC)
            );
            Ok(())
        }
        command @ Commands::Fetch { .. } => run_fetch(command).await,
        command @ Commands::Verify { .. } => run_verify(command).await,
    }
}

async fn run_fetch(command: Commands) -> Result<()> {
    let Commands::Fetch {
        common,
        direct_copy,
        cleanup,
        live,
        flush_size,
        flush_rows,
        concurrency,
        s3_bucket,
        gcp_bucket,
        bucket_path,
        local_path,
        local_path_listen_addr,
        local_path_crdb_access_addr,
        truncate,
        row_batch_size,
        compression,
        pg_logical_replication_slot_name,
        pg_logical_replication_slot_plugin,
        pg_logical_replication_slot_drop_if_exists,
    } = command
    else {
        unreachable!("dispatched on fetch");
    };

    setup_logging(&common)?;
    setup_metrics(&common);
    let ctx = setup_signal_handler();
    let filter = build_filter(&common)?;
    let conns = load_db_conns(&common).await?;
    if !conns.target().is_cockroach() {
        return Err(MoltError::assertion("target must be cockroach"));
    }

    let cfg = FetchConfig {
        flush_size,
        flush_rows,
        cleanup,
        live,
        truncate,
        concurrency,
        compression,
        export: ExportSettings {
            row_batch_size,
            pg: PgReplicationSettings {
                slot_name: pg_logical_replication_slot_name,
                plugin: pg_logical_replication_slot_plugin,
                drop_if_exists: pg_logical_replication_slot_drop_if_exists,
            },
        },
    };

    let store: Arc<dyn Store> = if direct_copy {
        let target_clone = conns.target().pg()?.clone_conn().await?;
        Arc::new(DirectCopyStore::new(target_clone))
    } else if let Some(bucket) = gcp_bucket {
        Arc::new(GcsStore::new(bucket, bucket_path).await?)
    } else if let Some(bucket) = s3_bucket {
        Arc::new(S3Store::new(bucket, bucket_path).await?)
    } else if let Some(path) = local_path {
        let listen_addr = local_path_listen_addr
            .ok_or_else(|| {
                MoltError::Config("--local-path requires --local-path-listen-addr".to_string())
            })?
            .parse()
            .map_err(|e| MoltError::Config(format!("invalid listen address: {}", e)))?;
        Arc::new(LocalStore::new(path.into(), listen_addr, local_path_crdb_access_addr).await?)
    } else {
        return Err(MoltError::assertion(
            "data source must be configured (--s3-bucket, --gcp-bucket, --local-path, --direct-copy)",
        ));
    };

    molt::fetch::fetch(ctx, cfg, &conns, store, &filter).await
}

async fn run_verify(command: Commands) -> Result<()> {
    let Commands::Verify {
        common,
        concurrency,
        table_splits,
        row_batch_size,
        rows_per_second,
        fixup,
        continuous_pause_between_runs,
        continuous,
        live,
        rows,
        live_runs_per_second,
        live_max_batch_size,
        live_flush_interval,
        live_retries_max_iterations,
        live_retry_max_backoff,
        live_retry_initial_backoff,
        live_retry_multiplier,
    } = command
    else {
        unreachable!("dispatched on verify");
    };

    setup_logging(&common)?;
    setup_metrics(&common);
    let ctx = setup_signal_handler();
    let filter = build_filter(&common)?;
    let conns = load_db_conns(&common).await?;

    let mut reporter = CombinedReporter::default();
    reporter.reporters.push(Box::new(LogReporter));
    if fixup {
        let fixup_conn = conns.target().clone_conn().await?;
        reporter.reporters.push(Box::new(FixReporter::new(fixup_conn)));
    }
    let reporter = Arc::new(reporter);

    let opts = VerifyOpts {
        concurrency,
        table_splits,
        row_batch_size,
        rows_per_second,
        continuous,
        continuous_pause: continuous_pause_between_runs,
        live: live.then(|| LiveReverificationSettings {
            max_batch_size: live_max_batch_size,
            flush_interval: live_flush_interval,
            retry: RetrySettings {
                initial_backoff: live_retry_initial_backoff,
                multiplier: live_retry_multiplier,
                max_backoff: live_retry_max_backoff,
                max_retries: live_retries_max_iterations,
            },
            runs_per_second: live_runs_per_second,
        }),
        rows,
    };

    reporter.report(&Inconsistency::StatusReport {
        info: "verification in progress".to_string(),
    });
    let result = molt::verify::verify(ctx, &conns, reporter.clone(), opts, &filter).await;
    if result.is_ok() {
        reporter.report(&Inconsistency::StatusReport {
            info: "verification complete".to_string(),
        });
    }
    reporter.close().await?;
    result
}

async fn load_db_conns(common: &CommonFlags) -> Result<OrderedConns> {
    let source = dbconn::connect("source", &common.source).await?;
    let target = dbconn::connect("target", &common.target).await?;
    info!(
        source = source.dialect().as_str(),
        target = target.dialect().as_str(),
        "connected to databases"
    );
    Ok(OrderedConns::new(source, target))
}

fn build_filter(common: &CommonFlags) -> Result<TableFilter> {
    TableFilter::new(
        &common.schema_filter,
        &common.table_filter,
        &common.schema_exclusion_filter,
        &common.table_exclusion_filter,
    )
}

fn setup_logging(common: &CommonFlags) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    let filter = tracing_subscriber::EnvFilter::try_new(&common.logging)
        .map_err(|e| MoltError::Config(format!("invalid log level {:?}: {}", common.logging, e)))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match &common.log_file {
        Some(path) => {
            if let Some(dir) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(dir)?;
            }
            let file = Arc::new(
                std::fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(path)?,
            );
            let writer = std::io::stdout.and(file);
            if common.use_console_writer {
                builder.with_writer(writer).init();
            } else {
                builder.json().with_writer(writer).init();
            }
        }
        None => {
            if common.use_console_writer {
                builder.init();
            } else {
                builder.json().init();
            }
        }
    }
    Ok(())
}

fn setup_metrics(common: &CommonFlags) {
    match common
        .metrics_listen_addr
        .parse::<std::net::SocketAddr>()
        .map_err(|e| e.to_string())
        .and_then(|addr| {
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .map_err(|e| e.to_string())
        }) {
        Ok(()) => {
            molt::metrics::register();
            info!(addr = %common.metrics_listen_addr, "metrics server running");
        }
        Err(e) => warn!(error = %e, "cannot start metrics server"),
    }
}

fn setup_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let handler_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received interrupt, shutting down");
            handler_token.cancel();
        }
    });
    token
}

/// Parse durations in the `300ms` / `10s` / `2m` / `1h` forms.
fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| format!("missing unit in duration {:?}", s))?;
    let (value, unit) = s.split_at(split);
    let value: f64 = value
        .parse()
        .map_err(|_| format!("invalid duration {:?}", s))?;
    let seconds = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit {:?}", other)),
    };
    Ok(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10d").is_err());
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
