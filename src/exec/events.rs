//! Event system for scheduler runs
//!
//! Every state change a reporting collaborator cares about is published as
//! an [`ExecutionRecord`], both to attached [`EventSink`]s and to the run's
//! [`EventStream`].

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use super::outcome::Outcome;
use crate::locks::LockSet;
use crate::tree::{NodeId, NodeKind};

/// Runtime event types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    /// The unit holds its locks and is about to run its own work
    Started {
        kind: NodeKind,
        acquired_locks: LockSet,
    },
    /// Terminal outcome; emitted exactly once per node
    Finished { outcome: Outcome },
    /// Key/value published by a hook or body through its context
    ReportingEntryPublished { key: String, value: String },
}

/// Event envelope with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Per-run, gap-free, in emission order
    pub sequence: u64,
    pub run_id: String,
    pub node_id: NodeId,
    pub event: ExecutionEvent,
    /// Thread that emitted the record
    pub thread: String,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn is_started(&self) -> bool {
        matches!(self.event, ExecutionEvent::Started { .. })
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match &self.event {
            ExecutionEvent::Finished { outcome } => Some(outcome),
            _ => None,
        }
    }

    pub fn report_entry(&self) -> Option<(&str, &str)> {
        match &self.event {
            ExecutionEvent::ReportingEntryPublished { key, value } => {
                Some((key.as_str(), value.as_str()))
            }
            _ => None,
        }
    }
}

/// Event sink trait for observing records as they are produced
pub trait EventSink: Send + Sync {
    fn emit(&self, record: &ExecutionRecord);
}

/// A simple logging event sink
pub struct LoggingEventSink;

impl EventSink for LoggingEventSink {
    fn emit(&self, record: &ExecutionRecord) {
        tracing::debug!(
            run_id = %record.run_id,
            sequence = record.sequence,
            node = %record.node_id,
            thread = %record.thread,
            "Event: {:?}",
            record.event
        );
    }
}

/// A buffering event sink that collects records
#[derive(Clone, Default)]
pub struct BufferingEventSink {
    records: Arc<RwLock<Vec<ExecutionRecord>>>,
}

impl BufferingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_records(&self) -> Vec<ExecutionRecord> {
        self.records.read().clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn clear(&self) {
        self.records.write().clear();
    }
}

impl EventSink for BufferingEventSink {
    fn emit(&self, record: &ExecutionRecord) {
        self.records.write().push(record.clone());
    }
}

/// Label of the calling thread: its name (if any) plus its id
pub fn current_thread_label() -> String {
    let thread = std::thread::current();
    match thread.name() {
        Some(name) => format!("{}-{:?}", name, thread.id()),
        None => format!("{:?}", thread.id()),
    }
}

/// Stamps and fans out records for a single run
pub(crate) struct EventEmitter {
    run_id: String,
    next_sequence: Mutex<u64>,
    tx: mpsc::UnboundedSender<ExecutionRecord>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventEmitter {
    pub(crate) fn new(
        run_id: impl Into<String>,
        tx: mpsc::UnboundedSender<ExecutionRecord>,
        sinks: Vec<Arc<dyn EventSink>>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            next_sequence: Mutex::new(0),
            tx,
            sinks,
        }
    }

    pub(crate) fn emit(&self, node_id: &str, event: ExecutionEvent) {
        // Held across send so stream order matches sequence order.
        let mut next = self.next_sequence.lock();
        let record = ExecutionRecord {
            sequence: *next,
            run_id: self.run_id.clone(),
            node_id: node_id.to_string(),
            event,
            thread: current_thread_label(),
            timestamp: Utc::now(),
        };
        *next += 1;

        for sink in &self.sinks {
            sink.emit(&record);
        }
        // The consumer may have dropped the stream; sinks still saw it.
        let _ = self.tx.send(record);
    }
}

/// Live record sequence of one run. Ends when the run is over.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<ExecutionRecord>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<ExecutionRecord>) -> Self {
        Self { rx }
    }

    pub async fn next_record(&mut self) -> Option<ExecutionRecord> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = ExecutionRecord;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_sequences_are_gap_free_and_fan_out() {
        let (tx, rx) = mpsc::unbounded_channel();
        let buffer = BufferingEventSink::new();
        let emitter = EventEmitter::new("run-1", tx, vec![Arc::new(buffer.clone())]);

        emitter.emit(
            "a",
            ExecutionEvent::ReportingEntryPublished {
                key: "k".into(),
                value: "v".into(),
            },
        );
        emitter.emit(
            "a",
            ExecutionEvent::Finished {
                outcome: Outcome::Success,
            },
        );
        drop(emitter);

        let records: Vec<ExecutionRecord> = EventStream::new(rx).collect().await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sequence, 0);
        assert_eq!(records[1].sequence, 1);
        assert_eq!(records[0].report_entry(), Some(("k", "v")));
        assert_eq!(records[1].outcome(), Some(&Outcome::Success));
        assert!(records.iter().all(|r| r.run_id == "run-1"));
        assert_eq!(buffer.get_records(), records);

        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_emit_after_stream_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let buffer = BufferingEventSink::new();
        let emitter = EventEmitter::new("run-2", tx, vec![Arc::new(buffer.clone())]);
        emitter.emit(
            "x",
            ExecutionEvent::Finished {
                outcome: Outcome::Success,
            },
        );
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_record_serializes() {
        let record = ExecutionRecord {
            sequence: 3,
            run_id: "r".into(),
            node_id: "n".into(),
            event: ExecutionEvent::Started {
                kind: NodeKind::Leaf,
                acquired_locks: [("db", crate::locks::AccessMode::Exclusive)]
                    .into_iter()
                    .collect(),
            },
            thread: current_thread_label(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event"]["type"], "Started");
        assert_eq!(json["event"]["kind"], "leaf");
        assert_eq!(json["event"]["acquired_locks"]["db"], "exclusive");
    }
}
