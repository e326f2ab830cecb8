//! # BarrierQueue - A Self-Resizing Work Queue Behind a Producer/Consumer Barrier
//!
//! A bounded, dynamically resizing FIFO shared by producer and consumer
//! threads, coordinated through a two-phase barrier: no consumer dequeues until
//! every producer has deposited its item, and producers do not finish until
//! consumption has begun (or a bounded wait runs out).
//!
//! ## Features
//!
//! - **Autoscaling ring buffer**: capacity doubles when a push finds it full and
//!   halves when a pop leaves it at most a quarter full, preserving FIFO order
//! - **Observable queue**: every insert, removal and resize is reported to a
//!   pluggable `EventSink` (text or JSON lines, or memory for tests)
//! - **Barrier coordinator**: one mutex, two condition variables, monotonic
//!   release, bounded abandonment for consumers that find the queue empty
//! - **Run harness**: one OS thread per unit, joined into a serializable report
//!
//! ## Basic Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use barrierqueue::config::RunConfig;
//! use barrierqueue::eventlog::MemorySink;
//! use barrierqueue::harness::RunHarness;
//!
//! let config = RunConfig {
//!     producers: 3,
//!     consumers: 1,
//!     initial_capacity: 2,
//!     abandon_timeout_ms: 200,
//!     ..RunConfig::default()
//! };
//! let sink = Arc::new(MemorySink::new());
//! let report = RunHarness::new(config).unwrap().run(sink.clone()).unwrap();
//!
//! // The single consumer takes the first item pushed.
//! assert_eq!(report.consumed_items().len(), 1);
//! assert_eq!(report.remaining_items, 2);
//! ```
//!
//! ## Using the ring buffer directly
//!
//! ```rust
//! use barrierqueue::ringbuffer::{Resize, RingBuffer};
//!
//! let mut rb = RingBuffer::with_capacity(2).unwrap();
//! rb.push("a").unwrap();
//! rb.push("b").unwrap();
//! assert_eq!(rb.push("c").unwrap(), Some(Resize::Grew { from: 2, to: 4 }));
//! assert_eq!(rb.pop().unwrap().0, "a");
//! ```
//!
//! ## Command line
//!
//! ```bash
//! # 10 producers, 5 consumers, initial capacity 50, 1 second abandonment timeout
//! cargo run --bin barrierqueue -- -p 10 -c 5 -s 50 -t 1 --log log.txt
//! ```

#[macro_use]
extern crate log;

pub mod config;
pub mod coordinator;
pub mod eventlog;
pub mod harness;
pub mod ringbuffer;
pub mod workqueue;

/// Identifies a producer or consumer; producers enqueue their own id.
pub type UnitId = u64;
