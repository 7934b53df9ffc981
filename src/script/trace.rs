//! Per-statement execution trace.
//!
//! A unit compiled with tracing reports every top-level statement before it
//! runs and clears the marker after it finishes.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TracePoint {
    pub unit: Arc<str>,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

pub trait TraceSink: Send + Sync {
    fn statement(&self, point: &TracePoint);

    fn clear(&self) {}
}

/// Forwards trace points to the `tracing` subscriber.
#[derive(Debug, Default)]
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn statement(&self, point: &TracePoint) {
        trace!(
            unit = %point.unit,
            start_line = point.start_line,
            start_column = point.start_column,
            end_line = point.end_line,
            end_column = point.end_column,
            "statement"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TraceEvent {
    Statement(TracePoint),
    Clear,
}

/// Keeps every event in order.
#[derive(Debug, Default)]
pub struct RecordingTraceSink {
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// Just the statement points.
    pub fn points(&self) -> Vec<TracePoint> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TraceEvent::Statement(p) => Some(p.clone()),
                TraceEvent::Clear => None,
            })
            .collect()
    }
}

impl TraceSink for RecordingTraceSink {
    fn statement(&self, point: &TracePoint) {
        self.events.lock().push(TraceEvent::Statement(point.clone()));
    }

    fn clear(&self) {
        self.events.lock().push(TraceEvent::Clear);
    }
}
