//! The producer/consumer barrier protocol.
//!
//! One mutex guards the queue together with the barrier bookkeeping, and two
//! condition variables hang off it:
//!
//! -   `consumer_wake`: consumers park here until every producer has enqueued,
//!     and again while they give an empty queue a bounded grace period.
//! -   `producer_wake`: producers park here until the barrier flips and, under
//!     `ProducerGate::Rendezvous`, until some consumer has dequeued.
//!
//! The barrier is monotonic. Once `all_producers_done` is set it never resets,
//! and no dequeue happens before it is set.

use serde::Serialize;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::UnitId;
use crate::config::{ProducerGate, RunConfig};
use crate::eventlog::{EventSink, QueueEvent};
use crate::ringbuffer::QueueError;
use crate::workqueue::WorkQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Some producers have not enqueued yet.
    Collecting,
    /// Every producer has enqueued; consumers may dequeue.
    Releasing,
    /// A fatal error stopped the run; every waiter returns.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProducerOutcome {
    /// Finished at the barrier (`ProducerGate::Barrier`).
    Released,
    /// Saw a successful dequeue before finishing (`ProducerGate::Rendezvous`).
    Acknowledged,
    /// The rendezvous wait ran out without any consumption.
    Unacknowledged,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConsumerOutcome {
    Consumed { item: UnitId },
    /// Found the queue empty and gave up after the grace period.
    Abandoned { waited_ms: u64 },
    Aborted,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub producers: usize,
    pub producer_gate: ProducerGate,
    pub abandon_timeout: Duration,
}

impl From<&RunConfig> for CoordinatorConfig {
    fn from(config: &RunConfig) -> Self {
        CoordinatorConfig {
            producers: config.producers,
            producer_gate: config.producer_gate,
            abandon_timeout: config.abandon_timeout(),
        }
    }
}

/// A point-in-time copy of the coordinator's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoordinatorSnapshot {
    pub phase: Phase,
    pub producers_remaining: usize,
    pub consumed: usize,
    pub queue_len: usize,
    pub queue_capacity: usize,
}

struct CoordinatorState<Q> {
    queue: Q,
    producers_remaining: usize,
    // false -> true exactly once
    all_producers_done: bool,
    consumed: usize,
    aborted: bool,
}

impl<Q> CoordinatorState<Q> {
    fn phase(&self) -> Phase {
        if self.aborted {
            Phase::Aborted
        } else if self.all_producers_done {
            Phase::Releasing
        } else {
            Phase::Collecting
        }
    }
}

pub struct BarrierCoordinator<Q>
where
    Q: WorkQueue,
{
    state: Mutex<CoordinatorState<Q>>,
    producer_wake: Condvar,
    consumer_wake: Condvar,
    sink: Arc<dyn EventSink>,
    config: CoordinatorConfig,
}

impl<Q> BarrierCoordinator<Q>
where
    Q: WorkQueue,
{
    pub fn new(queue: Q, config: CoordinatorConfig, sink: Arc<dyn EventSink>) -> Self {
        let done = config.producers == 0;
        BarrierCoordinator {
            state: Mutex::new(CoordinatorState {
                queue,
                producers_remaining: config.producers,
                all_producers_done: done,
                consumed: 0,
                aborted: false,
            }),
            producer_wake: Condvar::new(),
            consumer_wake: Condvar::new(),
            sink,
            config,
        }
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let state = self.state.lock().unwrap();
        CoordinatorSnapshot {
            phase: state.phase(),
            producers_remaining: state.producers_remaining,
            consumed: state.consumed,
            queue_len: state.queue.len(),
            queue_capacity: state.queue.capacity(),
        }
    }

    /// Runs the producer side of the protocol for unit `id`: enqueue `id`,
    /// count down the barrier, then wait to be let go.
    ///
    /// Returns `Err` only for a fatal queue error, after aborting the run.
    pub fn produce(&self, id: UnitId) -> Result<ProducerOutcome, QueueError> {
        let mut state = self.state.lock().unwrap();
        if state.aborted {
            return Ok(ProducerOutcome::Aborted);
        }

        if let Err(e) = state.queue.enqueue(id) {
            self.abort_locked(&mut state, &e.to_string());
            return Err(e);
        }
        info!("producer {id} enqueued item {id}");

        if state.producers_remaining == 0 {
            warn!("producer {id} was not announced, its item arrives after the barrier");
        }
        state.producers_remaining = state.producers_remaining.saturating_sub(1);
        if state.producers_remaining == 0 && !state.all_producers_done {
            state.all_producers_done = true;
            self.sink.record(&QueueEvent::BarrierReleased {
                producers: self.config.producers,
            });
            info!("all {} producers done, releasing consumers", self.config.producers);
            self.consumer_wake.notify_all();
            self.producer_wake.notify_all();
        } else if state.all_producers_done {
            // a consumer may be sitting out its grace period on an empty queue
            self.consumer_wake.notify_all();
        }

        let state = self
            .producer_wake
            .wait_while(state, |s| !s.all_producers_done && !s.aborted)
            .unwrap();
        if state.aborted {
            return Ok(ProducerOutcome::Aborted);
        }

        match self.config.producer_gate {
            ProducerGate::Barrier => {
                trace!("producer {id} released at the barrier");
                Ok(ProducerOutcome::Released)
            }
            ProducerGate::Rendezvous => Ok(self.await_consumption(state, id)),
        }
    }

    fn await_consumption(
        &self,
        state: MutexGuard<'_, CoordinatorState<Q>>,
        id: UnitId,
    ) -> ProducerOutcome {
        let (state, _) = self
            .producer_wake
            .wait_timeout_while(state, self.config.abandon_timeout, |s| {
                s.consumed == 0 && !s.aborted
            })
            .unwrap();
        if state.aborted {
            ProducerOutcome::Aborted
        } else if state.consumed > 0 {
            trace!("producer {id} acknowledged");
            ProducerOutcome::Acknowledged
        } else {
            warn!(
                "producer {id} saw no consumption within {:?}, finishing anyway",
                self.config.abandon_timeout
            );
            self.sink
                .record(&QueueEvent::ProducerUnacknowledged { producer: id });
            ProducerOutcome::Unacknowledged
        }
    }

    /// Runs the consumer side of the protocol for unit `id`: wait for the
    /// barrier, take one item, and abandon if the queue stays empty for the
    /// whole grace period.
    ///
    /// Returns `Err` only for a fatal queue error, after aborting the run.
    pub fn consume(&self, id: UnitId) -> Result<ConsumerOutcome, QueueError> {
        let mut state = self.state.lock().unwrap();
        if !state.all_producers_done && !state.aborted {
            info!("consumer {id} waiting for producers");
        }
        state = self
            .consumer_wake
            .wait_while(state, |s| !s.all_producers_done && !s.aborted)
            .unwrap();
        if state.aborted {
            return Ok(ConsumerOutcome::Aborted);
        }

        match state.queue.dequeue() {
            Ok(item) => return Ok(self.consumed_locked(&mut state, id, item)),
            Err(QueueError::EmptyQueue) => (),
            Err(e) => {
                self.abort_locked(&mut state, &e.to_string());
                return Err(e);
            }
        }

        info!(
            "consumer {id} found the queue empty, waiting up to {:?}",
            self.config.abandon_timeout
        );
        let started = Instant::now();
        let (mut state, _) = self
            .consumer_wake
            .wait_timeout_while(state, self.config.abandon_timeout, |s| {
                s.queue.is_empty() && !s.aborted
            })
            .unwrap();
        if state.aborted {
            return Ok(ConsumerOutcome::Aborted);
        }
        if !state.queue.is_empty() {
            match state.queue.dequeue() {
                Ok(item) => return Ok(self.consumed_locked(&mut state, id, item)),
                Err(QueueError::EmptyQueue) => (),
                Err(e) => {
                    self.abort_locked(&mut state, &e.to_string());
                    return Err(e);
                }
            }
        }

        let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!("consumer {id} abandoning: nothing to consume");
        self.sink.record(&QueueEvent::ConsumerAbandoned {
            consumer: id,
            waited_ms,
        });
        Ok(ConsumerOutcome::Abandoned { waited_ms })
    }

    fn consumed_locked(
        &self,
        state: &mut CoordinatorState<Q>,
        id: UnitId,
        item: UnitId,
    ) -> ConsumerOutcome {
        state.consumed += 1;
        info!("consumer {id} consumed item {item}");
        self.producer_wake.notify_all();
        ConsumerOutcome::Consumed { item }
    }

    /// Stops the run: every unit waiting now, or arriving later, returns its
    /// `Aborted` outcome. Idempotent.
    pub fn abort(&self, reason: &str) {
        let mut state = self.state.lock().unwrap();
        self.abort_locked(&mut state, reason);
    }

    fn abort_locked(&self, state: &mut CoordinatorState<Q>, reason: &str) {
        if state.aborted {
            return;
        }
        state.aborted = true;
        error!("aborting run: {reason}");
        self.sink.record(&QueueEvent::RunAborted {
            reason: reason.to_string(),
        });
        self.producer_wake.notify_all();
        self.consumer_wake.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventlog::MemorySink;
    use crate::workqueue::LoggedQueue;
    use std::thread;

    fn coordinator(
        producers: usize,
        gate: ProducerGate,
        timeout_ms: u64,
    ) -> (Arc<BarrierCoordinator<LoggedQueue>>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let queue = LoggedQueue::new(2, sink.clone()).unwrap();
        let config = CoordinatorConfig {
            producers,
            producer_gate: gate,
            abandon_timeout: Duration::from_millis(timeout_ms),
        };
        (
            Arc::new(BarrierCoordinator::new(queue, config, sink.clone())),
            sink,
        )
    }

    // A queue whose enqueue always fails, for the abort path.
    struct ExhaustedQueue;

    impl WorkQueue for ExhaustedQueue {
        fn enqueue(&mut self, _: UnitId) -> Result<(), QueueError> {
            Err(QueueError::ResourceExhaustion { capacity: 64 })
        }
        fn dequeue(&mut self) -> Result<UnitId, QueueError> {
            Err(QueueError::EmptyQueue)
        }
        fn is_empty(&self) -> bool {
            true
        }
        fn len(&self) -> usize {
            0
        }
        fn capacity(&self) -> usize {
            1
        }
    }

    #[test]
    fn test_single_pair_rendezvous() {
        let (c, _) = coordinator(1, ProducerGate::Rendezvous, 5_000);
        let p = {
            let c = c.clone();
            thread::spawn(move || c.produce(0).unwrap())
        };
        let consumer = {
            let c = c.clone();
            thread::spawn(move || c.consume(0).unwrap())
        };
        assert_eq!(p.join().unwrap(), ProducerOutcome::Acknowledged);
        assert_eq!(consumer.join().unwrap(), ConsumerOutcome::Consumed { item: 0 });
        let snap = c.snapshot();
        assert_eq!(snap.phase, Phase::Releasing);
        assert_eq!(snap.consumed, 1);
        assert_eq!(snap.producers_remaining, 0);
    }

    #[test]
    fn test_consumer_waits_for_barrier() {
        let (c, _) = coordinator(2, ProducerGate::Barrier, 1_000);
        let consumer = {
            let c = c.clone();
            thread::spawn(move || c.consume(7).unwrap())
        };
        let first = {
            let c = c.clone();
            thread::spawn(move || c.produce(0).unwrap())
        };
        thread::sleep(Duration::from_millis(100));
        let snap = c.snapshot();
        assert_eq!(snap.phase, Phase::Collecting);
        assert_eq!(snap.consumed, 0);
        assert_eq!(snap.queue_len, 1);

        assert_eq!(c.produce(1).unwrap(), ProducerOutcome::Released);
        assert_eq!(first.join().unwrap(), ProducerOutcome::Released);
        assert_eq!(consumer.join().unwrap(), ConsumerOutcome::Consumed { item: 0 });
    }

    #[test]
    fn test_rendezvous_without_consumers_times_out() {
        let (c, sink) = coordinator(2, ProducerGate::Rendezvous, 50);
        let handles: Vec<_> = (0..2)
            .map(|id| {
                let c = c.clone();
                thread::spawn(move || c.produce(id).unwrap())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), ProducerOutcome::Unacknowledged);
        }
        let unacked = sink
            .events()
            .iter()
            .filter(|e| matches!(e, QueueEvent::ProducerUnacknowledged { .. }))
            .count();
        assert_eq!(unacked, 2);
    }

    #[test]
    fn test_barrier_gate_without_consumers() {
        let (c, _) = coordinator(1, ProducerGate::Barrier, 10_000);
        assert_eq!(c.produce(0).unwrap(), ProducerOutcome::Released);
        assert_eq!(c.snapshot().queue_len, 1);
    }

    #[test]
    fn test_extra_consumer_abandons() {
        let (c, sink) = coordinator(1, ProducerGate::Barrier, 100);
        assert_eq!(c.produce(3).unwrap(), ProducerOutcome::Released);
        assert_eq!(c.consume(0).unwrap(), ConsumerOutcome::Consumed { item: 3 });
        match c.consume(1).unwrap() {
            ConsumerOutcome::Abandoned { waited_ms } => assert!(waited_ms >= 50),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            sink.events().last(),
            Some(QueueEvent::ConsumerAbandoned { consumer: 1, .. })
        ));
        // the lock is free again after abandoning
        assert_eq!(c.snapshot().consumed, 1);
    }

    #[test]
    fn test_no_dequeue_before_barrier() {
        let (c, sink) = coordinator(4, ProducerGate::Rendezvous, 200);
        let mut handles = Vec::new();
        for id in 0..3 {
            let c = c.clone();
            handles.push(thread::spawn(move || {
                c.consume(id).unwrap();
            }));
        }
        for id in 0..4 {
            let c = c.clone();
            handles.push(thread::spawn(move || {
                c.produce(id).unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let events = sink.events();
        let barrier = events
            .iter()
            .position(|e| matches!(e, QueueEvent::BarrierReleased { .. }))
            .unwrap();
        let first_dequeue = events
            .iter()
            .position(|e| matches!(e, QueueEvent::Dequeued { .. }))
            .unwrap();
        assert!(barrier < first_dequeue);
        assert_eq!(c.snapshot().consumed, 3);
    }

    #[test]
    fn test_abort_wakes_waiters() {
        let (c, sink) = coordinator(3, ProducerGate::Rendezvous, 10_000);
        let consumer = {
            let c = c.clone();
            thread::spawn(move || c.consume(0).unwrap())
        };
        let producer = {
            let c = c.clone();
            thread::spawn(move || c.produce(0).unwrap())
        };
        thread::sleep(Duration::from_millis(50));
        c.abort("spawn failed");
        c.abort("twice");
        assert_eq!(consumer.join().unwrap(), ConsumerOutcome::Aborted);
        assert_eq!(producer.join().unwrap(), ProducerOutcome::Aborted);
        assert_eq!(c.snapshot().phase, Phase::Aborted);
        let aborts = sink
            .events()
            .iter()
            .filter(|e| matches!(e, QueueEvent::RunAborted { .. }))
            .count();
        assert_eq!(aborts, 1);
    }

    #[test]
    fn test_enqueue_failure_aborts() {
        let sink = Arc::new(MemorySink::new());
        let config = CoordinatorConfig {
            producers: 2,
            producer_gate: ProducerGate::Rendezvous,
            abandon_timeout: Duration::from_secs(10),
        };
        let c = Arc::new(BarrierCoordinator::new(ExhaustedQueue, config, sink.clone()));
        let consumer = {
            let c = c.clone();
            thread::spawn(move || c.consume(0).unwrap())
        };
        assert_eq!(
            c.produce(0).unwrap_err(),
            QueueError::ResourceExhaustion { capacity: 64 }
        );
        assert_eq!(c.produce(1).unwrap(), ProducerOutcome::Aborted);
        assert_eq!(consumer.join().unwrap(), ConsumerOutcome::Aborted);
    }

    #[test]
    fn test_unannounced_producer_feeds_waiting_consumer() {
        let (c, sink) = coordinator(1, ProducerGate::Barrier, 5_000);
        assert_eq!(c.produce(0).unwrap(), ProducerOutcome::Released);
        assert_eq!(c.consume(0).unwrap(), ConsumerOutcome::Consumed { item: 0 });

        // consumer 1 finds the queue empty and sits out its grace period
        let consumer = {
            let c = c.clone();
            thread::spawn(move || c.consume(1).unwrap())
        };
        thread::sleep(Duration::from_millis(100));
        assert_eq!(c.produce(7).unwrap(), ProducerOutcome::Released);
        assert_eq!(consumer.join().unwrap(), ConsumerOutcome::Consumed { item: 7 });

        let snap = c.snapshot();
        assert_eq!(snap.consumed, 2);
        assert_eq!(snap.producers_remaining, 0);
        assert_eq!(snap.queue_len, 0);
        let releases = sink
            .events()
            .iter()
            .filter(|e| matches!(e, QueueEvent::BarrierReleased { .. }))
            .count();
        assert_eq!(releases, 1);
    }

    #[test]
    fn test_abort_after_units_finished() {
        let (c, sink) = coordinator(2, ProducerGate::Barrier, 5_000);
        let first = {
            let c = c.clone();
            thread::spawn(move || c.produce(0).unwrap())
        };
        assert_eq!(c.produce(1).unwrap(), ProducerOutcome::Released);
        assert_eq!(first.join().unwrap(), ProducerOutcome::Released);
        assert!(matches!(c.consume(0).unwrap(), ConsumerOutcome::Consumed { .. }));

        // the next unit failed to start
        c.abort("unable to spawn consumer 1");
        assert_eq!(c.consume(1).unwrap(), ConsumerOutcome::Aborted);
        assert_eq!(c.produce(2).unwrap(), ProducerOutcome::Aborted);

        let snap = c.snapshot();
        assert_eq!(snap.phase, Phase::Aborted);
        assert_eq!(snap.consumed, 1);
        assert_eq!(snap.queue_len, 1);
        let aborts: Vec<_> = sink
            .events()
            .into_iter()
            .filter(|e| matches!(e, QueueEvent::RunAborted { .. }))
            .collect();
        assert_eq!(
            aborts,
            vec![QueueEvent::RunAborted {
                reason: "unable to spawn consumer 1".to_string()
            }]
        );
    }
}
