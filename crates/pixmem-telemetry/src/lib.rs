use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use pixmem_core::{TelemetryEvent, TelemetrySink};
use reqwest::blocking::Client;
use serde::Serialize;

pub const SINK_ENV: &str = "PIXMEM_TELEMETRY_SINK";
pub const FILE_ENV: &str = "PIXMEM_TELEMETRY_FILE";
pub const ENDPOINT_ENV: &str = "PIXMEM_TELEMETRY_ENDPOINT";

/// Where the `stdout` sink mode actually writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SinkChoice {
    Console(ConsoleStream),
    File(PathBuf),
    Http(String),
}

impl SinkChoice {
    fn into_sink(self) -> Box<dyn TelemetrySink> {
        match self {
            Self::Console(stream) => Box::new(ConsoleSink { stream }),
            Self::File(path) => Box::new(FileSink::new(path)),
            Self::Http(endpoint) => Box::new(HttpSink::new(endpoint)),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn choose_sink(mode: &str, file: Option<String>, endpoint: Option<String>, console: ConsoleStream) -> Option<SinkChoice> {
    match mode.trim().to_ascii_lowercase().as_str() {
        "stdout" => Some(SinkChoice::Console(console)),
        "file" => non_blank(file).map(|path| SinkChoice::File(PathBuf::from(path))),
        "http" => non_blank(endpoint).map(SinkChoice::Http),
        other => {
            log::warn!("unknown telemetry sink '{}'; telemetry disabled", other);
            None
        }
    }
}

pub fn sink_from_env() -> Option<Box<dyn TelemetrySink>> {
    sink_from_env_with_console(ConsoleStream::Stdout)
}

/// Same as `sink_from_env`, but the `stdout` mode writes to `console`.
///
/// Callers that print their own results on stdout pass `Stderr` so event
/// lines do not interleave with that output.
pub fn sink_from_env_with_console(console: ConsoleStream) -> Option<Box<dyn TelemetrySink>> {
    let mode = std::env::var(SINK_ENV).ok()?;
    choose_sink(&mode, std::env::var(FILE_ENV).ok(), std::env::var(ENDPOINT_ENV).ok(), console).map(SinkChoice::into_sink)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryEnvelope {
    event_type: String,
    policy: String,
    duration_ms: Option<u64>,
    detail: Option<String>,
}

impl From<&TelemetryEvent> for TelemetryEnvelope {
    fn from(event: &TelemetryEvent) -> Self {
        Self {
            event_type: format!("{:?}", event.event_type),
            policy: event.policy.label().to_string(),
            duration_ms: event.duration_ms,
            detail: event.detail.clone(),
        }
    }
}

fn envelope_line(event: &TelemetryEvent) -> Option<String> {
    serde_json::to_string(&TelemetryEnvelope::from(event)).ok()
}

/// JSON lines on stdout or stderr.
pub struct ConsoleSink {
    stream: ConsoleStream,
}

impl ConsoleSink {
    pub fn new(stream: ConsoleStream) -> Self {
        Self { stream }
    }
}

impl TelemetrySink for ConsoleSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Some(line) = envelope_line(&event) {
            match self.stream {
                ConsoleStream::Stdout => println!("{}", line),
                ConsoleStream::Stderr => eprintln!("{}", line),
            }
        }
    }
}

pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn write_line(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("creating telemetry log parent directory")?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("opening telemetry file")?;
        writeln!(file, "{}", line).context("writing telemetry line")?;
        Ok(())
    }
}

impl TelemetrySink for FileSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Some(line) = envelope_line(&event) {
            if let Err(err) = self.write_line(&line) {
                log::warn!("telemetry write to {} failed: {:#}", self.path.display(), err);
            }
        }
    }
}

pub struct HttpSink {
    endpoint: String,
    client: Client,
}

impl HttpSink {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: Client::new(),
        }
    }
}

impl TelemetrySink for HttpSink {
    fn emit(&self, event: TelemetryEvent) {
        let payload = TelemetryEnvelope::from(&event);
        if let Err(err) = self.client.post(&self.endpoint).json(&payload).send() {
            log::debug!("telemetry post to {} failed: {}", self.endpoint, err);
        }
    }
}
