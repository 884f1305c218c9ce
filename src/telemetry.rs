//! Telemetry emission.
//!
//! The runtime reports spans and events through [`TelemetrySink`]. Sinks
//! are fallible, but a failing sink never fails a run: [`Telemetry`] logs
//! the error and moves on.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{info, warn};

pub type Attributes = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanStatus {
    Ok,
    Error(String),
}

pub trait TelemetrySink: Send + Sync {
    fn emit_span(&self, name: &str, attributes: &Attributes, status: &SpanStatus) -> anyhow::Result<()>;

    fn emit_event(&self, name: &str, attributes: &Attributes) -> anyhow::Result<()>;
}

/// Writes spans and events as `tracing` records under `taskweave::telemetry`.
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit_span(&self, name: &str, attributes: &Attributes, status: &SpanStatus) -> anyhow::Result<()> {
        let attrs = serde_json::to_string(attributes)?;
        match status {
            SpanStatus::Ok => info!(target: "taskweave::telemetry", span = name, status = "ok", %attrs),
            SpanStatus::Error(error) => {
                info!(target: "taskweave::telemetry", span = name, status = "error", %error, %attrs)
            }
        }
        Ok(())
    }

    fn emit_event(&self, name: &str, attributes: &Attributes) -> anyhow::Result<()> {
        let attrs = serde_json::to_string(attributes)?;
        info!(target: "taskweave::telemetry", event = name, %attrs);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub name: String,
    pub attributes: Attributes,
    /// `Some` for spans, `None` for events.
    pub status: Option<SpanStatus>,
}

/// Keeps everything in memory, for tests and embedding hosts.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn events(&self, name: &str) -> Vec<Attributes> {
        self.records()
            .into_iter()
            .filter(|r| r.status.is_none() && r.name == name)
            .map(|r| r.attributes)
            .collect()
    }

    pub fn spans(&self, name: &str) -> Vec<Record> {
        self.records()
            .into_iter()
            .filter(|r| r.status.is_some() && r.name == name)
            .collect()
    }

    fn push(&self, record: Record) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }
}

impl TelemetrySink for MemorySink {
    fn emit_span(&self, name: &str, attributes: &Attributes, status: &SpanStatus) -> anyhow::Result<()> {
        self.push(Record {
            name: name.to_string(),
            attributes: attributes.clone(),
            status: Some(status.clone()),
        });
        Ok(())
    }

    fn emit_event(&self, name: &str, attributes: &Attributes) -> anyhow::Result<()> {
        self.push(Record {
            name: name.to_string(),
            attributes: attributes.clone(),
            status: None,
        });
        Ok(())
    }
}

/// Fan-out to the configured sinks.
#[derive(Clone)]
pub struct Telemetry {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl Telemetry {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>) -> Self {
        Self { sinks }
    }

    pub fn span(&self, name: &str, attributes: &Attributes, status: &SpanStatus) {
        for sink in &self.sinks {
            if let Err(e) = sink.emit_span(name, attributes, status) {
                warn!("Telemetry span {name} dropped: {e}");
            }
        }
    }

    pub fn event(&self, name: &str, attributes: &Attributes) {
        for sink in &self.sinks {
            if let Err(e) = sink.emit_event(name, attributes) {
                warn!("Telemetry event {name} dropped: {e}");
            }
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(vec![Arc::new(TracingSink)])
    }
}

/// Builds an attribute map from `key => value` pairs.
#[macro_export]
macro_rules! attributes {
    ($($key:literal => $value:expr),* $(,)?) => {{
        let mut attrs = $crate::telemetry::Attributes::new();
        $(attrs.insert($key.to_string(), ::serde_json::json!($value));)*
        attrs
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSink;

    impl TelemetrySink for FailingSink {
        fn emit_span(&self, _: &str, _: &Attributes, _: &SpanStatus) -> anyhow::Result<()> {
            anyhow::bail!("collector unreachable")
        }

        fn emit_event(&self, _: &str, _: &Attributes) -> anyhow::Result<()> {
            anyhow::bail!("collector unreachable")
        }
    }

    #[test]
    fn test_memory_sink_separates_spans_and_events() {
        let sink = Arc::new(MemorySink::new());
        let telemetry = Telemetry::new(vec![sink.clone()]);
        telemetry.event("task.attempt", &crate::attributes!("attempt" => 1));
        telemetry.event("task.attempt", &crate::attributes!("attempt" => 2));
        telemetry.span("task.execute", &Attributes::new(), &SpanStatus::Ok);

        let events = sink.events("task.attempt");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1]["attempt"], 2);
        assert_eq!(sink.spans("task.execute").len(), 1);
        assert!(sink.events("task.execute").is_empty());
    }

    #[test]
    fn test_failing_sink_does_not_block_others() {
        let sink = Arc::new(MemorySink::new());
        let telemetry = Telemetry::new(vec![Arc::new(FailingSink), sink.clone()]);
        telemetry.event("task.attempt", &Attributes::new());
        telemetry.span("agent.run", &Attributes::new(), &SpanStatus::Error("x".into()));
        assert_eq!(sink.records().len(), 2);
    }

    #[test]
    fn test_tracing_sink_accepts_records() {
        let sink = TracingSink;
        let attrs = crate::attributes!("task" => "add", "attempt" => 1);
        assert!(sink.emit_event("task.attempt", &attrs).is_ok());
        assert!(sink
            .emit_span("task.execute", &attrs, &SpanStatus::Error("boom".into()))
            .is_ok());
    }
}
