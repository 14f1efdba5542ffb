use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::generation::{GenerationRequest, ImageArtifact};
use crate::jobs::Job;

pub type EventPayload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    GenerationStarted,
    JobProgress,
    ArtifactCreated,
    GenerationFailed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GenerationStarted => "generation_started",
            Self::JobProgress => "job_progress",
            Self::ArtifactCreated => "artifact_created",
            Self::GenerationFailed => "generation_failed",
        }
    }
}

/// Append-only generation log, one compact JSON object per line.
///
/// `type`, `run_id` and `ts` are stamped after the payload fields, so a
/// payload key with the same name never replaces them.
#[derive(Debug, Clone)]
pub struct EventWriter {
    shared: Arc<SharedLog>,
}

#[derive(Debug)]
struct SharedLog {
    path: PathBuf,
    run_id: String,
    append: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(SharedLog {
                path: path.into(),
                run_id: run_id.into(),
                append: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn run_id(&self) -> &str {
        &self.shared.run_id
    }

    pub fn generation_started(
        &self,
        provider: &str,
        request: &GenerationRequest,
    ) -> anyhow::Result<Value> {
        let mut payload = to_payload(request)?;
        payload.insert("provider".to_string(), Value::from(provider));
        self.record(EventKind::GenerationStarted, payload)
    }

    pub fn job_progress(&self, job: &Job) -> anyhow::Result<Value> {
        let mut payload = EventPayload::new();
        payload.insert("job_id".to_string(), Value::from(job.id.as_str()));
        payload.insert("status".to_string(), serde_json::to_value(job.status)?);
        payload.insert("percent_complete".to_string(), Value::from(job.percent_complete));
        payload.insert("preview_count".to_string(), Value::from(job.images.len()));
        self.record(EventKind::JobProgress, payload)
    }

    pub fn artifact_created(&self, provider: &str, artifact: &ImageArtifact) -> anyhow::Result<Value> {
        let mut payload = to_payload(artifact)?;
        payload.insert("provider".to_string(), Value::from(provider));
        self.record(EventKind::ArtifactCreated, payload)
    }

    pub fn generation_failed(&self, provider: &str, error: &str) -> anyhow::Result<Value> {
        let mut payload = EventPayload::new();
        payload.insert("provider".to_string(), Value::from(provider));
        payload.insert("error".to_string(), Value::from(error));
        self.record(EventKind::GenerationFailed, payload)
    }

    fn record(&self, kind: EventKind, mut event: EventPayload) -> anyhow::Result<Value> {
        event.insert("type".to_string(), Value::from(kind.as_str()));
        event.insert("run_id".to_string(), Value::from(self.shared.run_id.as_str()));
        event.insert("ts".to_string(), Value::from(now_utc_iso()));
        let line = serde_json::to_string(&event)?;

        if let Some(parent) = self.shared.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _guard = self
            .shared
            .append
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.shared.path)?;
        writeln!(file, "{line}")?;

        Ok(Value::Object(event))
    }
}

fn to_payload(value: &impl Serialize) -> anyhow::Result<EventPayload> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("event payload must be an object, got {other}"),
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
