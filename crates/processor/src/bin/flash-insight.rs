//! flash-insight - replay sales and mention feeds through the stream processor
//!
//! Usage:
//!   flash-insight --sales sales.csv --mentions mentions.csv --out ./out
//!   flash-insight --config insight.json --sales sales.csv --sales-rate 200

use clap::Parser;
use processor::{
    init_tracing, CsvRecordReader, JsonLinesSink, ProcessorConfig, ProcessorError, StreamKind,
    StreamProcessor, StreamProcessorBuilder,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "flash-insight")]
#[command(about = "Windowed sales statistics, anomaly flags, forecasts and mention sentiment")]
struct Cli {
    /// JSON configuration file; defaults are used when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Sales CSV feed
    #[arg(long)]
    sales: Option<PathBuf>,

    /// Mentions CSV feed
    #[arg(long)]
    mentions: Option<PathBuf>,

    /// Directory for the output tables
    #[arg(short, long, default_value = "out")]
    out: PathBuf,

    /// Replay rate for the sales feed in records per second
    #[arg(long)]
    sales_rate: Option<f64>,

    /// Replay rate for the mentions feed in records per second
    #[arg(long)]
    mentions_rate: Option<f64>,

    /// Print the processor metrics in Prometheus text format on exit
    #[arg(long)]
    print_metrics: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match ProcessorConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("flash-insight: {e}");
                return ExitCode::from(2);
            }
        },
        None => ProcessorConfig::default(),
    };

    if let Err(e) = init_tracing(&config.logging) {
        eprintln!("flash-insight: {e}");
        return ExitCode::from(2);
    }

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ ProcessorError::Config(_)) => {
            error!(error = %e, "Invalid configuration");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %e, "Processor failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, config: ProcessorConfig) -> Result<(), ProcessorError> {
    let capacity = config.ingest_channel_capacity;
    let sink = Arc::new(JsonLinesSink::create(&cli.out).await?);
    let processor = StreamProcessorBuilder::new(config).with_sink(sink).build()?;
    processor.start().await?;

    let cancel = CancellationToken::new();
    let mut feeds = Vec::new();
    for (stream, path, rate) in [
        (StreamKind::Sales, cli.sales, cli.sales_rate),
        (StreamKind::Mentions, cli.mentions, cli.mentions_rate),
    ] {
        if let Some(path) = path {
            feeds.push(spawn_feed(&processor, stream, path, rate, capacity, cancel.clone()).await?);
        }
    }
    if feeds.is_empty() {
        warn!("No input feeds given");
    }

    let mut failure = None;
    for (reader, worker) in feeds {
        match reader.await {
            Ok(Ok(records)) => info!(records, "Feed replay complete"),
            Ok(Err(e)) => {
                cancel.cancel();
                failure.get_or_insert(ProcessorError::from(e));
            }
            Err(e) => {
                cancel.cancel();
                warn!(error = %e, "Feed task failed");
            }
        }
        if let Err(e) = worker.await {
            warn!(error = %e, "Ingestion worker failed");
        }
    }

    let flushed = processor.flush().await;
    let stopped = processor.shutdown().await;

    if cli.print_metrics {
        match processor.encode_metrics() {
            Ok(text) => println!("{text}"),
            Err(e) => warn!(error = %e, "Failed to encode metrics"),
        }
    }
    let stats = processor.stats().await;
    info!(
        run_id = %stats.run_id,
        events_received = stats.metrics.events_received,
        events_accepted = stats.metrics.events_accepted,
        malformed = stats.metrics.malformed_records,
        late = stats.metrics.late_events,
        anomalies = stats.metrics.anomalies_flagged,
        out = %cli.out.display(),
        "Run finished"
    );

    if let Some(e) = failure {
        return Err(e);
    }
    flushed?;
    stopped
}

type FeedHandles = (
    JoinHandle<Result<u64, processor::SourceError>>,
    JoinHandle<u64>,
);

async fn spawn_feed(
    processor: &Arc<StreamProcessor>,
    stream: StreamKind,
    path: PathBuf,
    rate: Option<f64>,
    capacity: usize,
    cancel: CancellationToken,
) -> Result<FeedHandles, ProcessorError> {
    let mut reader = CsvRecordReader::open(stream, &path).await?;
    if let Some(rate) = rate {
        reader = reader.with_rate(rate);
    }
    info!(stream = %stream, path = %path.display(), "Replaying feed");

    let (tx, rx) = mpsc::channel(capacity);
    let worker = processor.spawn_ingestion(stream, rx);
    let reader = tokio::spawn(reader.forward(tx, cancel));
    Ok((reader, worker))
}
