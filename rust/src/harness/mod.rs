use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use thiserror::Error;

use crate::UnitId;
use crate::config::{ConfigError, RunConfig, SpawnOrder};
use crate::coordinator::{BarrierCoordinator, ConsumerOutcome, CoordinatorConfig, ProducerOutcome};
use crate::eventlog::EventSink;
use crate::ringbuffer::QueueError;
use crate::workqueue::LoggedQueue;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unable to open event log {path}: {source}")]
    Sink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unable to spawn {unit}: {source}")]
    Spawn {
        unit: Unit,
        #[source]
        source: io::Error,
    },
    #[error("run aborted: {0}")]
    ResourceExhaustion(#[source] QueueError),
    #[error("{unit} panicked")]
    UnitPanicked { unit: Unit },
    #[error("unable to flush event log: {0}")]
    Flush(#[source] io::Error),
}

/// One execution unit of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Producer(UnitId),
    Consumer(UnitId),
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Producer(id) => write!(f, "producer {id}"),
            Unit::Consumer(id) => write!(f, "consumer {id}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProducerReport {
    pub id: UnitId,
    #[serde(flatten)]
    pub outcome: ProducerOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumerReport {
    pub id: UnitId,
    #[serde(flatten)]
    pub outcome: ConsumerOutcome,
}

/// The terminal state of every unit, plus what was left in the queue.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub producers: Vec<ProducerReport>,
    pub consumers: Vec<ConsumerReport>,
    pub final_capacity: usize,
    pub remaining_items: usize,
    pub elapsed_ms: u64,
}

impl RunReport {
    // Items taken by consumers, in consumer id order.
    pub fn consumed_items(&self) -> Vec<UnitId> {
        self.consumers
            .iter()
            .filter_map(|c| match c.outcome {
                ConsumerOutcome::Consumed { item } => Some(item),
                _ => None,
            })
            .collect()
    }

    pub fn abandoned(&self) -> usize {
        self.consumers
            .iter()
            .filter(|c| matches!(c.outcome, ConsumerOutcome::Abandoned { .. }))
            .count()
    }

    pub fn unacknowledged(&self) -> usize {
        self.producers
            .iter()
            .filter(|p| p.outcome == ProducerOutcome::Unacknowledged)
            .count()
    }
}

type Handles<T> = Vec<(UnitId, JoinHandle<Result<T, QueueError>>)>;

/// Spawns one thread per producer and consumer, bound to a single coordinator,
/// and joins them all.
pub struct RunHarness {
    config: RunConfig,
}

impl RunHarness {
    pub fn new(config: RunConfig) -> Result<Self, RunError> {
        config.validate()?;
        Ok(RunHarness { config })
    }

    // spawn_schedule lists every unit in the order its thread is started.
    fn spawn_schedule(&self) -> Vec<Unit> {
        let producers = (0..self.config.producers as UnitId).map(Unit::Producer);
        let consumers = (0..self.config.consumers as UnitId).map(Unit::Consumer);
        match self.config.spawn_order {
            SpawnOrder::ProducersFirst => producers.chain(consumers).collect(),
            SpawnOrder::ConsumersFirst => consumers.chain(producers).collect(),
            SpawnOrder::Shuffled => {
                let mut units: Vec<Unit> = producers.chain(consumers).collect();
                let mut rng = match self.config.shuffle_seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_entropy(),
                };
                units.shuffle(&mut rng);
                units
            }
        }
    }

    pub fn run(&self, sink: Arc<dyn EventSink>) -> Result<RunReport, RunError> {
        let started = Instant::now();
        let queue = LoggedQueue::new(self.config.initial_capacity, sink.clone())
            .map_err(RunError::ResourceExhaustion)?;
        let coordinator = Arc::new(BarrierCoordinator::new(
            queue,
            CoordinatorConfig::from(&self.config),
            sink.clone(),
        ));
        info!(
            "starting run: {} producers, {} consumers, capacity {}, timeout {:?}",
            self.config.producers,
            self.config.consumers,
            self.config.initial_capacity,
            self.config.abandon_timeout()
        );

        let mut producers: Handles<ProducerOutcome> = Vec::with_capacity(self.config.producers);
        let mut consumers: Handles<ConsumerOutcome> = Vec::with_capacity(self.config.consumers);
        for unit in self.spawn_schedule() {
            let c = coordinator.clone();
            let spawned = match unit {
                Unit::Producer(id) => thread::Builder::new()
                    .name(format!("producer-{id}"))
                    .spawn(move || c.produce(id))
                    .map(|h| producers.push((id, h))),
                Unit::Consumer(id) => thread::Builder::new()
                    .name(format!("consumer-{id}"))
                    .spawn(move || c.consume(id))
                    .map(|h| consumers.push((id, h))),
            };
            if let Err(source) = spawned {
                coordinator.abort(&format!("unable to spawn {unit}"));
                for (_, h) in producers {
                    let _ = h.join();
                }
                for (_, h) in consumers {
                    let _ = h.join();
                }
                return Err(RunError::Spawn { unit, source });
            }
        }

        let mut fatal = None;
        let mut panicked = None;
        let mut report = RunReport {
            producers: Vec::with_capacity(producers.len()),
            consumers: Vec::with_capacity(consumers.len()),
            final_capacity: 0,
            remaining_items: 0,
            elapsed_ms: 0,
        };
        for (id, handle) in producers {
            let outcome = match handle.join() {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    fatal.get_or_insert(e);
                    ProducerOutcome::Aborted
                }
                Err(_) => {
                    panicked.get_or_insert(Unit::Producer(id));
                    ProducerOutcome::Aborted
                }
            };
            report.producers.push(ProducerReport { id, outcome });
        }
        for (id, handle) in consumers {
            let outcome = match handle.join() {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    fatal.get_or_insert(e);
                    ConsumerOutcome::Aborted
                }
                Err(_) => {
                    panicked.get_or_insert(Unit::Consumer(id));
                    ConsumerOutcome::Aborted
                }
            };
            report.consumers.push(ConsumerReport { id, outcome });
        }

        sink.flush().map_err(RunError::Flush)?;
        if let Some(unit) = panicked {
            return Err(RunError::UnitPanicked { unit });
        }
        if let Some(e) = fatal {
            return Err(RunError::ResourceExhaustion(e));
        }

        let snapshot = coordinator.snapshot();
        report.final_capacity = snapshot.queue_capacity;
        report.remaining_items = snapshot.queue_len;
        report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            "run finished in {} ms: {} consumed, {} abandoned, {} left in queue",
            report.elapsed_ms,
            report.consumed_items().len(),
            report.abandoned(),
            report.remaining_items
        );
        Ok(report)
    }
}
