//! Per-question JSONL trace of model and tool activity.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

/// One trace line: `{ts, event, data}` with `data.trace_id` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Unix time in milliseconds.
    pub ts: i64,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl TraceEvent {
    pub fn trace_id(&self) -> Option<&str> {
        self.data.get("trace_id").and_then(Value::as_str).map(str::trim)
    }
}

/// File the trace is appended to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceSink {
    pub path: PathBuf,
    /// Rotate to `{path}.{unix_secs}.bak` once the file is larger; 0 disables.
    pub max_bytes: u64,
}

/// In-memory events of the current question, optionally mirrored to a file.
#[derive(Debug, Default)]
pub struct TraceLog {
    trace_id: String,
    events: Vec<TraceEvent>,
    sink: Option<TraceSink>,
}

impl TraceLog {
    pub fn new(sink: Option<TraceSink>) -> Self {
        Self {
            sink,
            ..Self::default()
        }
    }

    pub fn set_sink(&mut self, sink: Option<TraceSink>) {
        self.sink = sink;
    }

    pub fn sink(&self) -> Option<&TraceSink> {
        self.sink.as_ref()
    }

    /// Starts a new trace and returns its id.
    pub fn begin(&mut self) -> String {
        self.trace_id = format!("tr_{}", uuid::Uuid::new_v4().simple());
        self.events.clear();
        self.trace_id.clone()
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Records `event`; non-object `data` is wrapped as `{"value": data}`.
    pub fn record(&mut self, event: &str, data: Value) {
        let mut data = match data {
            Value::Object(map) => map,
            Value::Null => Default::default(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        if !self.trace_id.is_empty() {
            data.insert("trace_id".to_string(), Value::String(self.trace_id.clone()));
        }
        let event = event.trim();
        let record = TraceEvent {
            ts: chrono::Utc::now().timestamp_millis(),
            event: if event.is_empty() { "event" } else { event }.to_string(),
            data: Value::Object(data),
        };
        if let Some(sink) = &self.sink
            && let Err(e) = append(sink, &record)
        {
            warn!(path = %sink.path.display(), error = %e, "Failed to write trace event");
        }
        self.events.push(record);
    }

    /// Distinct tool names from `tool_call` events, in first-use order.
    pub fn tool_names(&self, limit: usize) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for event in self.events.iter().filter(|e| e.event == "tool_call") {
            let Some(name) = event.data.get("tool_name").and_then(Value::as_str).map(str::trim) else {
                continue;
            };
            if !name.is_empty() && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
            if names.len() >= limit {
                break;
            }
        }
        names
    }
}

fn append(sink: &TraceSink, record: &TraceEvent) -> io::Result<()> {
    let line = serde_json::to_string(record).map_err(io::Error::other)?;
    if sink.max_bytes > 0
        && let Ok(meta) = fs::metadata(&sink.path)
        && meta.len() > sink.max_bytes
    {
        let rotated = format!("{}.{}.bak", sink.path.display(), chrono::Utc::now().timestamp());
        if let Err(e) = fs::rename(&sink.path, &rotated) {
            warn!(path = %sink.path.display(), error = %e, "Failed to rotate trace file");
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(&sink.path)?;
    writeln!(file, "{line}")
}

fn read_events(path: &Path) -> io::Result<Vec<TraceEvent>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str::<TraceEvent>(l).ok())
        .collect())
}

/// Events of one trace, oldest first, at most `max_events`.
pub fn read_trace(path: &Path, trace_id: &str, max_events: usize) -> io::Result<Vec<TraceEvent>> {
    let trace_id = trace_id.trim();
    if trace_id.is_empty() {
        return Ok(Vec::new());
    }
    Ok(read_events(path)?
        .into_iter()
        .filter(|e| e.trace_id() == Some(trace_id))
        .take(max_events)
        .collect())
}

/// The last `max_events` parseable events, oldest first.
pub fn read_tail(path: &Path, max_events: usize) -> io::Result<Vec<TraceEvent>> {
    let mut events = read_events(path)?;
    let skip = events.len().saturating_sub(max_events);
    Ok(events.split_off(skip))
}

/// Compact one-line rendering for terminal output.
pub fn format_event(event: &TraceEvent) -> String {
    let when = chrono::DateTime::from_timestamp_millis(event.ts)
        .map(|t| t.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| event.ts.to_string());
    let mut data = event.data.clone();
    if let Some(map) = data.as_object_mut() {
        map.remove("trace_id");
    }
    let data = if data == json!({}) { String::new() } else { data.to_string() };
    format!("{when} {:<20} {data}", event.event).trim_end().to_string()
}
