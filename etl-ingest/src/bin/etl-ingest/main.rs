//! CDC ingestion service binary.
//!
//! Merges change files landed in object storage into their target tables. A run is driven
//! either by an object-created event, by a single object key, or by a prefix to reprocess.
//! Each processed file is reported on stdout as one JSON line.

use clap::{Parser, Subcommand, ValueEnum};
use etl_config::load_config;
use etl_config::shared::IngestServiceConfig;
use etl_ingest::error::EtlResult;
use etl_ingest::event::ObjectEvent;
use etl_ingest::keys::KeyConfig;
use etl_ingest::ledger::postgres::PostgresLedger;
use etl_ingest::migrations::apply_ingest_migrations;
use etl_ingest::notification::ConfiguredNotifier;
use etl_ingest::outcome::IngestOutcome;
use etl_ingest::pipeline::{DEFAULT_REPROCESS_CONCURRENCY, IngestPipeline, ReprocessRequest};
use etl_ingest::store::postgres::{PostgresStore, create_store_pool};
use etl_ingest::types::SourceObject;
use etl_telemetry::metrics::init_metrics;
use etl_telemetry::tracing::{LogFormat, init_tracing};
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

use crate::error::{IngestError, IngestResult};

mod error;
mod sentry;

/// The name of the environment variable which contains version information for this binary.
const APP_VERSION_ENV_NAME: &str = "APP_VERSION";

#[cfg(feature = "s3")]
type Blobs = etl_ingest::blob::S3BlobStore;

#[cfg(not(feature = "s3"))]
type Blobs = etl_ingest::blob::FileBlobStore;

type Pipeline = IngestPipeline<PostgresStore, PostgresLedger, Blobs, ConfiguredNotifier>;

#[derive(Parser, Debug)]
#[command(name = "etl-ingest")]
#[command(about = "Merges CDC change files into their target tables")]
struct Cli {
    /// Format of the log lines written to stderr
    #[arg(long, value_enum, default_value = "json", global = true)]
    log_format: CliLogFormat,

    /// Directory used as blob storage root when built without S3 support
    #[arg(long, default_value = ".", global = true)]
    blob_root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum CliLogFormat {
    Json,
    Pretty,
}

impl From<CliLogFormat> for LogFormat {
    fn from(format: CliLogFormat) -> Self {
        match format {
            CliLogFormat::Json => LogFormat::Json,
            CliLogFormat::Pretty => LogFormat::Pretty,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process the objects named by an event document or a single object key
    Process {
        /// Path to an object-created event document, `-` reads it from stdin
        #[arg(long, conflicts_with = "key", required_unless_present = "key")]
        event: Option<String>,

        /// Object key of a single change file
        #[arg(long)]
        key: Option<String>,

        /// Bucket of `--key`, defaults to the configured source bucket
        #[arg(long, requires = "key")]
        bucket: Option<String>,
    },
    /// Process every object below a prefix
    Reprocess {
        #[arg(long)]
        prefix: String,

        /// Bucket to list, defaults to the configured source bucket
        #[arg(long)]
        bucket: Option<String>,

        /// Only process files of this table, may be repeated
        #[arg(long = "table")]
        tables: Vec<String>,

        /// Remove ledger entries first so completed files are merged again
        #[arg(long)]
        force: bool,

        #[arg(long, default_value_t = DEFAULT_REPROCESS_CONCURRENCY)]
        concurrency: usize,
    },
    /// Remove ledger entries older than the retention window
    Prune,
    /// Create or upgrade the ledger table
    Migrate,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprint!("{}", err.render_report());
            ExitCode::FAILURE
        }
    }
}

/// Loads configuration, initializes telemetry and runs the selected command on a
/// multi-threaded runtime.
fn run() -> IngestResult<()> {
    let cli = Cli::parse();

    let config = load_ingest_config()?;

    let _log_guard =
        init_tracing(env!("CARGO_BIN_NAME"), cli.log_format.into()).map_err(IngestError::config)?;

    // Initialize Sentry before the async runtime starts
    let _sentry_guard = sentry::init(config.sentry.as_ref())?;

    if let Some(metrics) = &config.metrics {
        init_metrics(metrics.port).map_err(IngestError::config)?;
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli, config))
}

fn load_ingest_config() -> IngestResult<IngestServiceConfig> {
    let config = load_config::<IngestServiceConfig>().map_err(IngestError::config)?;
    config.validate().map_err(IngestError::config)?;

    Ok(config)
}

async fn async_main(cli: Cli, config: IngestServiceConfig) -> IngestResult<()> {
    let result = run_command(cli, config).await;

    match &result {
        // Each failed file was already captured on its own.
        Err(err @ IngestError::FilesFailed(_)) => error!("{err}"),
        Err(err) => {
            sentry::capture_error(err);
            error!("{err}");
        }
        Ok(()) => {}
    }

    result
}

async fn run_command(cli: Cli, config: IngestServiceConfig) -> IngestResult<()> {
    if let Command::Migrate = cli.command {
        apply_ingest_migrations(&config.store.connection).await?;
        return Ok(());
    }

    let pipeline = build_pipeline(&cli, config).await?;
    info!(worker_id = pipeline.worker_id(), "ingestion pipeline ready");

    match cli.command {
        Command::Process { event, key, bucket } => {
            let mut results = Vec::new();
            if let Some(path) = event {
                let event = ObjectEvent::from_json(&read_event(&path)?)?;
                let keys = event.objects().into_iter().map(|object| object.key);
                results.extend(keys.zip(pipeline.process_event(&event).await));
            } else if let Some(key) = key {
                let bucket = bucket.unwrap_or_else(|| pipeline.config().source.bucket.clone());
                let object = SourceObject::new(bucket, key);
                let file_key = object.key.clone();
                results.push((file_key, pipeline.process_object(object).await));
            }

            for (file_key, result) in &results {
                report(file_key, result);
            }

            finish(results.iter().filter(|(_, result)| result.is_err()).count())
        }
        Command::Reprocess {
            prefix,
            bucket,
            tables,
            force,
            concurrency,
        } => {
            let request = ReprocessRequest {
                bucket: bucket.unwrap_or_else(|| pipeline.config().source.bucket.clone()),
                prefix,
                tables,
                force,
                concurrency,
            };
            let reprocessed = pipeline.reprocess(&request).await?;
            for (file_key, result) in &reprocessed.results {
                report(file_key, result);
            }

            info!(
                succeeded = reprocessed.succeeded(),
                skipped = reprocessed.skipped(),
                failed = reprocessed.failed(),
                "reprocess finished"
            );

            finish(reprocessed.failed())
        }
        Command::Prune => {
            let pruned = pipeline.prune_ledger().await?;
            println!("{}", serde_json::json!({ "pruned": pruned }));

            Ok(())
        }
        Command::Migrate => Ok(()),
    }
}

async fn build_pipeline(cli: &Cli, config: IngestServiceConfig) -> IngestResult<Pipeline> {
    let pool = create_store_pool(&config.store.connection, config.store.max_connections);
    let store = PostgresStore::new(
        pool.clone(),
        config.source.reader_template.clone(),
        config.source.uri_scheme.clone(),
    );
    let ledger = PostgresLedger::new(pool, &config.ledger);
    let blobs = build_blob_store(cli).await;
    let notifier = ConfiguredNotifier::from_config(config.notifications.as_ref());
    let keys = KeyConfig::load(&config.keys, &blobs).await?;
    info!(tables = keys.len(), "loaded key configuration");

    Ok(IngestPipeline::new(
        Arc::new(config),
        store,
        ledger,
        blobs,
        notifier,
        keys,
    ))
}

#[cfg(feature = "s3")]
async fn build_blob_store(_cli: &Cli) -> Blobs {
    etl_ingest::blob::S3BlobStore::from_env().await
}

#[cfg(not(feature = "s3"))]
async fn build_blob_store(cli: &Cli) -> Blobs {
    etl_ingest::blob::FileBlobStore::new(cli.blob_root.clone())
}

fn read_event(path: &str) -> IngestResult<Vec<u8>> {
    if path == "-" {
        let mut body = Vec::new();
        std::io::stdin().read_to_end(&mut body)?;
        return Ok(body);
    }

    Ok(std::fs::read(path)?)
}

/// Prints one JSON line per file; failures are also captured to Sentry.
fn report(file_key: &str, result: &EtlResult<IngestOutcome>) {
    match result {
        Ok(outcome) => match serde_json::to_string(outcome) {
            Ok(line) => println!("{line}"),
            Err(err) => error!(error = %err, "failed to serialize outcome"),
        },
        Err(err) => {
            sentry::capture_file_error(file_key, err);
            error!(file_key, error = %err, "file failed");
            println!(
                "{}",
                serde_json::json!({
                    "status": "failed",
                    "file_key": file_key,
                    "error_kind": format!("{:?}", err.kind()),
                    "error": err.to_string(),
                })
            );
        }
    }
}

fn finish(failed: usize) -> IngestResult<()> {
    if failed > 0 {
        return Err(IngestError::FilesFailed(failed));
    }

    Ok(())
}
