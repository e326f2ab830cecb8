use anyhow::{Context, Result};
use barrierqueue::config::{self, ProducerGate, RunConfig, SpawnOrder};
use barrierqueue::eventlog::{EventSink, LineSink, LogFormat};
use barrierqueue::harness::{RunError, RunHarness};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

/// Runs producers and consumers against a self-resizing queue behind a barrier
#[derive(Parser, Debug)]
#[command(name = "barrierqueue")]
#[command(about = "Producer/consumer barrier over an autoscaling ring buffer")]
struct Args {
    /// Number of producer threads.
    #[arg(short = 'p', long = "producers", allow_negative_numbers = true)]
    producers: Option<i64>,

    /// Number of consumer threads.
    #[arg(short = 'c', long = "consumers", allow_negative_numbers = true)]
    consumers: Option<i64>,

    /// Initial queue capacity.
    #[arg(short = 's', long = "size", allow_negative_numbers = true)]
    size: Option<i64>,

    /// Seconds a consumer waits on an empty queue before abandoning.
    #[arg(short = 't', long = "timeout", allow_negative_numbers = true)]
    timeout: Option<i64>,

    /// Event log destination (truncated on start).
    #[arg(long, default_value = "log.txt")]
    log: PathBuf,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[arg(long, value_enum)]
    producer_gate: Option<ProducerGate>,

    #[arg(long, value_enum)]
    spawn_order: Option<SpawnOrder>,

    /// Seed for --spawn-order shuffled.
    #[arg(long)]
    seed: Option<u64>,

    /// JSON file with base settings; flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the run report as JSON on stdout.
    #[arg(long)]
    report: bool,
}

impl Args {
    fn run_config(&self) -> Result<RunConfig, config::ConfigError> {
        let mut settings = match &self.config {
            Some(path) => RunConfig::from_file(path)?,
            None => RunConfig::default(),
        };
        if let Some(p) = self.producers {
            settings.producers = config::positive("producers", p)?;
        }
        if let Some(c) = self.consumers {
            settings.consumers = config::positive("consumers", c)?;
        }
        if let Some(s) = self.size {
            settings.initial_capacity = config::positive("size", s)?;
        }
        if let Some(t) = self.timeout {
            let secs = config::positive("timeout", t)? as u64;
            settings.abandon_timeout_ms = secs.saturating_mul(1_000);
        }
        if let Some(gate) = self.producer_gate {
            settings.producer_gate = gate;
        }
        if let Some(order) = self.spawn_order {
            settings.spawn_order = order;
        }
        if self.seed.is_some() {
            settings.shuffle_seed = self.seed;
        }
        settings.validate()?;
        Ok(settings)
    }
}

// open_sink truncates (or creates) the event log named by --log.
fn open_sink(args: &Args) -> Result<Arc<dyn EventSink>, RunError> {
    let sink = LineSink::create(&args.log, args.log_format).map_err(|source| RunError::Sink {
        path: args.log.clone(),
        source,
    })?;
    Ok(Arc::new(sink))
}

fn main() -> Result<()> {
    // By default, use info level logging.
    env_logger::try_init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    )
    .context("unable to initialise logging")?;

    let args = Args::parse();
    let config = args.run_config().context("invalid configuration")?;
    let harness = RunHarness::new(config)?;

    let sink = open_sink(&args)?;
    let report = harness.run(sink)?;
    if args.report {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
