//! fabric CLI - identity-provider change-event ingestion
//!
//! Runs the consumption engine against NATS JetStream, or pushes single
//! messages and NDJSON files through the same pipeline for inspection.

use clap::{Parser, Subcommand};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use entity_fabric::config::{load_dotenv, ConfigCache, FabricConfig, OutputMode};
use entity_fabric::consumer::{BatchHandler, DlqSink, MemoryBroker, MemoryDlq, WorkerPool, WorkerStats};
use entity_fabric::ingestion::IngestionCoordinator;
use entity_fabric::mapping::{FieldMappingEngine, InMemoryRuleStore, MappingRuleStore};
use entity_fabric::message::RawEntityMessage;
use entity_fabric::nats::{JetStreamConnector, JetStreamDlq};
use entity_fabric::output::sink_for;
use entity_fabric::processing::EntityProcessor;
use entity_fabric::serialization::{NdjsonReader, NdjsonWriter};
use entity_fabric::transform_registry::TransformRegistry;
use entity_fabric::transformer::TransformerFactory;

#[cfg(feature = "postgres")]
use entity_fabric::diesel_runtime::{ensure_schema, Database, PgEntityStore};
#[cfg(feature = "postgres")]
use entity_fabric::mapping::PgRuleStore;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "fabric")]
#[command(version, about = "Identity-provider change-event ingestion", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool against NATS JetStream until interrupted
    Consume {
        /// Pipeline file (overrides PIPELINES_PATH)
        #[arg(short, long)]
        pipelines: Option<PathBuf>,

        /// Service name to look up in the pipeline file
        #[arg(short, long)]
        service: Option<String>,

        /// Pipeline id to look up in the pipeline file
        #[arg(long)]
        pipeline: Option<String>,
    },

    /// Transform one raw message and print the entity graph
    Transform {
        /// JSON file holding one raw message
        input: PathBuf,
    },

    /// Transform one raw message and persist its graph
    Ingest {
        /// JSON file holding one raw message
        input: PathBuf,
    },

    /// Push an NDJSON file of raw messages through the consumption engine
    Replay {
        /// NDJSON file, one raw message per line
        input: PathBuf,

        /// Number of partitions to spread the messages over
        #[arg(long, default_value = "4")]
        partitions: usize,

        /// Worker count (defaults to THREAD_COUNT)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Give up waiting after this many seconds
        #[arg(long, default_value = "60")]
        timeout_secs: u64,

        /// Write each transformed graph to this NDJSON file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate mapping rule files
    CheckMappings {
        /// Rule file or directory (defaults to MAPPINGS_PATH)
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = FabricConfig::from_env();

    let result = match cli.command {
        Commands::Consume { pipelines, service, pipeline } => consume(config, pipelines, service, pipeline).await,
        Commands::Transform { input } => transform(config, &input),
        Commands::Ingest { input } => ingest(config, &input),
        Commands::Replay {
            input,
            partitions,
            workers,
            timeout_secs,
            output,
        } => replay(config, &input, partitions, workers, timeout_secs, output).await,
        Commands::CheckMappings { path } => check_mappings(&config, path),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Connections the pipeline needs beyond the broker.
struct Backend {
    #[cfg(feature = "postgres")]
    database: Option<Database>,
}

impl Backend {
    #[cfg(feature = "postgres")]
    fn connect(config: &FabricConfig, required: bool) -> CliResult<Self> {
        if !required {
            return Ok(Self { database: None });
        }
        let url = config
            .database
            .url
            .clone()
            .ok_or("DATABASE_URL must be set for database output or database mappings")?;
        tracing::info!("Connecting to {}", config.database.redacted_url());
        let database = Database::new_with_config(&url, config.database.clone())?;
        let mut conn = database.get_connection()?;
        ensure_schema(&mut conn)?;
        Ok(Self {
            database: Some(database),
        })
    }

    #[cfg(not(feature = "postgres"))]
    fn connect(_config: &FabricConfig, required: bool) -> CliResult<Self> {
        if required {
            return Err("built without the postgres feature; database output is unavailable".into());
        }
        Ok(Self {})
    }

    fn coordinator(&self) -> Option<IngestionCoordinator> {
        #[cfg(feature = "postgres")]
        if let Some(database) = &self.database {
            return Some(IngestionCoordinator::new(Arc::new(PgEntityStore::new(database.pool().clone()))));
        }
        None
    }

    fn rule_store(&self, config: &FabricConfig) -> CliResult<Arc<dyn MappingRuleStore>> {
        #[cfg(feature = "postgres")]
        if config.transformer.mappings_from_database {
            if let Some(database) = &self.database {
                tracing::info!("Reading mapping rules from the field_mappings table");
                return Ok(Arc::new(PgRuleStore::new(database.pool().clone())));
            }
        }

        let path = &config.transformer.mappings_path;
        if !path.exists() {
            tracing::warn!("Mapping path {} not found; no rules loaded", path.display());
            return Ok(Arc::new(InMemoryRuleStore::new()));
        }
        Ok(Arc::new(InMemoryRuleStore::load(path)?))
    }
}

fn needs_database(config: &FabricConfig) -> bool {
    config.transformer.output_mode == OutputMode::Database || config.transformer.mappings_from_database
}

fn build_processor(config: &FabricConfig, backend: &Backend) -> CliResult<EntityProcessor> {
    let engine = FieldMappingEngine::new(backend.rule_store(config)?, Arc::new(TransformRegistry::new()));
    let factory = Arc::new(TransformerFactory::from_config(&config.transformer, engine));
    let sink = sink_for(config.transformer.output_mode, backend.coordinator());
    Ok(EntityProcessor::new(factory, sink, config.transformer.enabled))
}

fn read_message(input: &Path) -> CliResult<RawEntityMessage> {
    let payload = fs::read(input)?;
    Ok(RawEntityMessage::from_slice(&payload)?)
}

async fn consume(
    mut config: FabricConfig,
    pipelines: Option<PathBuf>,
    service: Option<String>,
    pipeline: Option<String>,
) -> CliResult<()> {
    if let Some(path) = pipelines.or_else(|| config.pipelines_path.clone()) {
        let cache = ConfigCache::load(&path)?;
        let service = service.unwrap_or_else(|| config.consumer.service_name.clone());
        let pipeline_id = pipeline.unwrap_or_else(|| config.consumer.pipeline_id.clone());
        match cache.get(&service, &pipeline_id) {
            Some(entry) => config.consumer.apply_pipeline(&entry),
            None => {
                return Err(format!("pipeline {}/{} not found in {}", service, pipeline_id, path.display()).into())
            }
        }
    }

    let backend = Backend::connect(&config, needs_database(&config))?;
    let handler: Arc<dyn BatchHandler> = Arc::new(build_processor(&config, &backend)?);

    let settings = config.consumer.worker_settings();
    let dlq: Option<Arc<dyn DlqSink>> = settings
        .dlq_topic
        .as_ref()
        .map(|topic| Arc::new(JetStreamDlq::new(config.nats.clone(), topic.clone())) as Arc<dyn DlqSink>);

    tracing::info!(
        "Starting {}/{} with {} workers on {:?}",
        config.consumer.service_name,
        config.consumer.pipeline_id,
        config.consumer.thread_count,
        config.consumer.topics
    );
    let mut pool = WorkerPool::start(
        config.consumer.thread_count,
        Arc::new(JetStreamConnector::new(config.nats.clone())),
        handler,
        dlq,
        settings,
        config.consumer.shutdown_grace(),
    );

    // A worker only stops on its own when it cannot continue
    let exited = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Shutdown requested");
            None
        }
        exited = pool.next_exit() => exited,
    };
    if let Some(Err(e)) = &exited {
        tracing::error!("{}; stopping the remaining workers", e);
    }

    let mut results = pool.shutdown().await;
    results.extend(exited);
    report(&results)
}

fn transform(config: FabricConfig, input: &Path) -> CliResult<()> {
    let backend = Backend::connect(&config, config.transformer.mappings_from_database)?;
    let processor = build_processor(&config, &backend)?;
    let graph = processor.process_entity(&read_message(input)?)?;
    println!("{}", serde_json::to_string_pretty(&graph)?);
    Ok(())
}

fn ingest(mut config: FabricConfig, input: &Path) -> CliResult<()> {
    config.transformer.output_mode = OutputMode::Database;
    let backend = Backend::connect(&config, true)?;
    let processor = build_processor(&config, &backend)?;

    let graph = processor.process_entity(&read_message(input)?)?;
    match processor.ingest_transformed_entity(&graph)? {
        Some(report) => println!("Ingested {} rows: {}", report.total(), graph.summary()),
        None => println!("Graph logged only: {}", graph.summary()),
    }
    Ok(())
}

async fn replay(
    config: FabricConfig,
    input: &Path,
    partitions: usize,
    workers: Option<usize>,
    timeout_secs: u64,
    output: Option<PathBuf>,
) -> CliResult<()> {
    let lines = NdjsonReader::new(BufReader::new(File::open(input)?)).raw_lines()?;
    let partitions = partitions.max(1);
    let topic = config.consumer.topics.first().cloned().unwrap_or_else(|| "replay".to_string());

    let broker = MemoryBroker::new();
    for (index, line) in lines.into_iter().enumerate() {
        broker.publish(&format!("{}.{}", topic, index % partitions), None, line);
    }
    tracing::info!("Replaying {} records over {} partitions", broker.lag(), partitions);

    let backend = Backend::connect(&config, needs_database(&config))?;
    let processor = build_processor(&config, &backend)?;

    // Write graphs up front so the pool only needs the handler
    if let Some(path) = output {
        let mut writer = NdjsonWriter::new(File::create(&path)?);
        let mut reader = NdjsonReader::new(BufReader::new(File::open(input)?));
        while let Some((line, text)) = reader.next_line()? {
            match RawEntityMessage::from_slice(text.as_bytes()) {
                Ok(message) => match processor.process_entity(&message) {
                    Ok(graph) => writer.write(&graph)?,
                    Err(e) => tracing::warn!("line {}: {}", line, e),
                },
                Err(e) => tracing::warn!("line {}: {}", line, e),
            }
        }
        writer.flush()?;
        tracing::info!("Graphs written to {}", path.display());
    }

    let mut settings = config.consumer.worker_settings();
    settings.topics = vec![topic];
    let dlq = MemoryDlq::new();
    let pool = WorkerPool::start(
        workers.unwrap_or(config.consumer.thread_count),
        Arc::new(broker.connector()),
        Arc::new(processor),
        Some(Arc::new(dlq.clone())),
        settings,
        config.consumer.shutdown_grace(),
    );

    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    while broker.lag() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if broker.lag() > 0 {
        tracing::warn!("{} records still uncommitted after {}s", broker.lag(), timeout_secs);
    }

    let results = pool.shutdown().await;
    println!("Dead-lettered: {}", dlq.sent().len());
    report(&results)
}

fn report(results: &[Result<WorkerStats, entity_fabric::consumer::ConsumerError>]) -> CliResult<()> {
    let mut total = WorkerStats::default();
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(stats) => {
                total.batches += stats.batches;
                total.records_processed += stats.records_processed;
                total.records_skipped += stats.records_skipped;
                total.records_failed += stats.records_failed;
                total.batches_abandoned += stats.batches_abandoned;
                total.dead_lettered += stats.dead_lettered;
            }
            Err(e) => failures.push(e.to_string()),
        }
    }
    println!(
        "Batches: {}, processed: {}, skipped: {}, failed: {}, abandoned batches: {}",
        total.batches, total.records_processed, total.records_skipped, total.records_failed, total.batches_abandoned
    );
    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; ").into())
    }
}

fn check_mappings(config: &FabricConfig, path: Option<PathBuf>) -> CliResult<()> {
    let path = path.unwrap_or_else(|| config.transformer.mappings_path.clone());
    let store = InMemoryRuleStore::load(&path)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    use std::io::Write;
    for (vendor, entity_type, target) in store.targets() {
        let rules = store.rules_for(&vendor, &entity_type, &target)?;
        writeln!(out, "{}/{}/{}: {} rules", vendor, entity_type, target, rules.len())?;
    }
    writeln!(out, "{} rules valid in {}", store.rule_count(), path.display())?;
    Ok(())
}
