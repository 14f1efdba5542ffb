use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One realtime frame, decoded once at the channel boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum JobMessage {
    UserSuccess {
        user_id: Option<String>,
    },
    JobSuccess {
        job_id: Option<String>,
    },
    StatusUpdate {
        job_id: String,
        percent: Option<u8>,
        images: Vec<String>,
    },
    Completed {
        job_id: String,
    },
    Failed {
        job_id: String,
        reason: Option<String>,
    },
    Unknown(Value),
}

impl JobMessage {
    pub fn from_frame(raw: &str) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Ok(Self::from_value(value))
    }

    pub fn from_value(value: Value) -> Self {
        let status = value
            .get("current_status")
            .and_then(Value::as_str)
            .map(str::to_string);
        let job_id = string_field(&value, "job_id");

        if let (Some(status), Some(job_id)) = (status, job_id.clone()) {
            return match status.as_str() {
                "running" => JobMessage::StatusUpdate {
                    percent: value.get("percentage_complete").and_then(percent_value),
                    images: inline_images(&value),
                    job_id,
                },
                "completed" => JobMessage::Completed { job_id },
                "failed" => JobMessage::Failed {
                    reason: string_field(&value, "error")
                        .or_else(|| string_field(&value, "message")),
                    job_id,
                },
                _ => JobMessage::Unknown(value),
            };
        }

        match value.get("type").and_then(Value::as_str) {
            Some("user_success") => JobMessage::UserSuccess {
                user_id: string_field(&value, "user_id"),
            },
            Some("job_success") => JobMessage::JobSuccess { job_id },
            _ => JobMessage::Unknown(value),
        }
    }
}

/// Client-side view of a submitted job, mutated by streamed status frames.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub percent_complete: u8,
    /// Latest preview set as `data:image/webp;base64,...` URLs.
    pub images: Vec<String>,
    pub user_id: Option<String>,
    pub failure: Option<String>,
}

impl Job {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Pending,
            percent_complete: 0,
            images: Vec::new(),
            user_id: None,
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies a frame; returns `true` when the job's state changed.
    /// Frames for other jobs and frames after a terminal state are ignored.
    pub fn apply(&mut self, message: &JobMessage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match message {
            JobMessage::UserSuccess { user_id } => {
                self.user_id = user_id.clone();
                false
            }
            JobMessage::JobSuccess { job_id } => {
                if job_id.as_deref().is_some_and(|id| id != self.id) {
                    return false;
                }
                if self.status == JobStatus::Pending {
                    self.status = JobStatus::Success;
                }
                self.advance(5);
                true
            }
            JobMessage::StatusUpdate {
                job_id,
                percent,
                images,
            } => {
                if job_id != &self.id {
                    return false;
                }
                self.status = JobStatus::Running;
                if let Some(percent) = percent {
                    self.advance(*percent);
                }
                if !images.is_empty() {
                    self.images = images.clone();
                }
                true
            }
            JobMessage::Completed { job_id } => {
                if job_id != &self.id {
                    return false;
                }
                self.status = JobStatus::Completed;
                self.percent_complete = 100;
                true
            }
            JobMessage::Failed { job_id, reason } => {
                if job_id != &self.id {
                    return false;
                }
                self.status = JobStatus::Failed;
                self.failure = reason.clone();
                true
            }
            JobMessage::Unknown(_) => false,
        }
    }

    fn advance(&mut self, percent: u8) {
        self.percent_complete = self.percent_complete.max(percent.min(100));
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn percent_value(value: &Value) -> Option<u8> {
    let raw = value
        .as_f64()
        .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))?;
    Some(raw.clamp(0.0, 100.0).round() as u8)
}

fn inline_images(value: &Value) -> Vec<String> {
    value
        .get("imgs")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(|row| row.get("data").and_then(Value::as_str))
                .filter(|data| !data.is_empty())
                .map(|data| format!("data:image/webp;base64,{data}"))
                .collect()
        })
        .unwrap_or_default()
}
