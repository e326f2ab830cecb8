use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::UnitId;

/// One observable step of a run, in the order it happened under the coordinator lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Grew { capacity: usize },
    Shrank { capacity: usize },
    Enqueued { item: UnitId, len: usize, capacity: usize },
    Dequeued { item: UnitId, len: usize, capacity: usize },
    BarrierReleased { producers: usize },
    ConsumerAbandoned { consumer: UnitId, waited_ms: u64 },
    ProducerUnacknowledged { producer: UnitId },
    RunAborted { reason: String },
}

impl fmt::Display for QueueEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueEvent::Grew { capacity } => write!(f, "queue capacity doubled to {capacity}"),
            QueueEvent::Shrank { capacity } => write!(f, "queue capacity halved to {capacity}"),
            QueueEvent::Enqueued {
                item,
                len,
                capacity,
            } => write!(f, "producer enqueued item {item} (len {len}/{capacity})"),
            QueueEvent::Dequeued {
                item,
                len,
                capacity,
            } => write!(f, "consumer dequeued item {item} (len {len}/{capacity})"),
            QueueEvent::BarrierReleased { producers } => {
                write!(f, "all {producers} producers done, consumers released")
            }
            QueueEvent::ConsumerAbandoned {
                consumer,
                waited_ms,
            } => write!(
                f,
                "consumer {consumer} abandoned after {waited_ms} ms: queue empty"
            ),
            QueueEvent::ProducerUnacknowledged { producer } => {
                write!(f, "producer {producer} finished without seeing a consumption")
            }
            QueueEvent::RunAborted { reason } => write!(f, "run aborted: {reason}"),
        }
    }
}

// The external collaborator that receives queue events.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &QueueEvent);

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

struct LineWriterState<W> {
    out: W,
    failed: bool,
}

/// Append-only, one-event-per-line sink over any writer.
pub struct LineSink<W>
where
    W: Write + Send,
{
    state: Mutex<LineWriterState<W>>,
    format: LogFormat,
}

impl LineSink<BufWriter<File>> {
    /// Creates (or truncates) the file at `path`.
    pub fn create<P: AsRef<Path>>(path: P, format: LogFormat) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(LineSink::new(BufWriter::new(file), format))
    }
}

impl<W> LineSink<W>
where
    W: Write + Send,
{
    pub fn new(out: W, format: LogFormat) -> Self {
        LineSink {
            state: Mutex::new(LineWriterState { out, failed: false }),
            format,
        }
    }

    pub fn into_inner(self) -> W {
        let state = self
            .state
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.out
    }

    fn render(&self, event: &QueueEvent) -> io::Result<String> {
        match self.format {
            LogFormat::Text => Ok(event.to_string()),
            LogFormat::Json => serde_json::to_string(event).map_err(io::Error::other),
        }
    }
}

impl<W> EventSink for LineSink<W>
where
    W: Write + Send,
{
    fn record(&self, event: &QueueEvent) {
        let mut state = self.state.lock().unwrap();
        let written = self
            .render(event)
            .and_then(|line| writeln!(state.out, "{line}"));
        if let Err(e) = written {
            // report once, keep the run going
            if !state.failed {
                warn!("event log write failed: {e}");
                state.failed = true;
            }
        }
    }

    fn flush(&self) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.out.flush()
    }
}

/// Keeps every event in memory, in record order.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<QueueEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    // Returns a copy of the events recorded so far.
    pub fn events(&self) -> Vec<QueueEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().unwrap().is_empty()
    }
}

impl EventSink for MemorySink {
    fn record(&self, event: &QueueEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Discards everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _: &QueueEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::other("disk full"))
        }
    }

    #[test]
    fn test_text_lines() {
        let sink = LineSink::new(Vec::new(), LogFormat::Text);
        sink.record(&QueueEvent::Grew { capacity: 4 });
        sink.record(&QueueEvent::Enqueued {
            item: 2,
            len: 3,
            capacity: 4,
        });
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "queue capacity doubled to 4",
                "producer enqueued item 2 (len 3/4)"
            ]
        );
    }

    #[test]
    fn test_json_lines() {
        let sink = LineSink::new(Vec::new(), LogFormat::Json);
        sink.record(&QueueEvent::Dequeued {
            item: 0,
            len: 2,
            capacity: 4,
        });
        sink.record(&QueueEvent::ConsumerAbandoned {
            consumer: 3,
            waited_ms: 1000,
        });
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let values: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["event"], "dequeued");
        assert_eq!(values[0]["item"], 0);
        assert_eq!(values[1]["event"], "consumer_abandoned");
        assert_eq!(values[1]["waited_ms"], 1000);
    }

    #[test]
    fn test_write_failure_is_swallowed() {
        let sink = LineSink::new(BrokenWriter, LogFormat::Text);
        sink.record(&QueueEvent::Grew { capacity: 2 });
        sink.record(&QueueEvent::Grew { capacity: 4 });
        assert!(sink.flush().is_err());
    }

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());
        sink.record(&QueueEvent::BarrierReleased { producers: 2 });
        sink.record(&QueueEvent::Shrank { capacity: 1 });
        assert_eq!(sink.len(), 2);
        assert_eq!(
            sink.events(),
            vec![
                QueueEvent::BarrierReleased { producers: 2 },
                QueueEvent::Shrank { capacity: 1 }
            ]
        );
    }

    #[test]
    fn test_file_sink() {
        let path = std::env::temp_dir().join(format!("barrierqueue_sink_{}.log", std::process::id()));
        let sink = LineSink::create(&path, LogFormat::Text).unwrap();
        sink.record(&QueueEvent::RunAborted {
            reason: "test".to_string(),
        });
        sink.flush().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "run aborted: test\n");
        let _ = std::fs::remove_file(&path);
    }
}
