use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use imgen_contracts::{Job, JobMessage, JobStatus};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::config::MidjourneyConfig;
use crate::error::MidjourneyError;
use crate::midjourney::transport::{
    ChannelEvent, ChannelSession, HttpMidjourneyTransport, MidjourneyTransport,
};
use crate::truncate_text;

/// Number of variants Midjourney renders per imagine job.
pub const VARIANT_COUNT: usize = 4;
/// Rendered variants are served from this host whatever `API_BASE` points at.
pub const CDN_BASE: &str = "cdn.midjourney.com";

pub struct JobClient {
    config: MidjourneyConfig,
    transport: Arc<dyn MidjourneyTransport>,
}

impl JobClient {
    pub fn new(config: MidjourneyConfig) -> Result<Self> {
        Ok(Self::with_transport(
            config,
            Arc::new(HttpMidjourneyTransport::new()?),
        ))
    }

    pub fn with_transport(config: MidjourneyConfig, transport: Arc<dyn MidjourneyTransport>) -> Self {
        Self { config, transport }
    }

    pub fn config(&self) -> &MidjourneyConfig {
        &self.config
    }

    /// Runs one imagine job and returns the CDN URLs of its variants.
    pub fn generate_image(
        &self,
        prompt: &str,
        aspect_ratio: &str,
    ) -> Result<Vec<String>, MidjourneyError> {
        let deadline = Instant::now() + self.config.poll_timeout;
        self.generate_image_until(prompt, aspect_ratio, deadline, &mut |_| {})
    }

    /// Like [`JobClient::generate_image`], polling no later than `deadline`
    /// and reporting every job state change to `on_progress`.
    pub fn generate_image_until(
        &self,
        prompt: &str,
        aspect_ratio: &str,
        deadline: Instant,
        on_progress: &mut dyn FnMut(&Job),
    ) -> Result<Vec<String>, MidjourneyError> {
        let result = self.run_job(prompt, aspect_ratio, deadline, on_progress);
        if let Err(err) = &result {
            match std::error::Error::source(err) {
                Some(cause) => error!(prompt, aspect_ratio, "Midjourney job failed: {err}: {cause}"),
                None => error!(prompt, aspect_ratio, "Midjourney job failed: {err}"),
            }
        }
        result
    }

    fn run_job(
        &self,
        prompt: &str,
        aspect_ratio: &str,
        deadline: Instant,
        on_progress: &mut dyn FnMut(&Job),
    ) -> Result<Vec<String>, MidjourneyError> {
        self.config.auth.validate()?;
        let token = self.websocket_token()?;
        let full_prompt = compose_prompt(prompt, aspect_ratio, &self.config.suffix);
        let job_id = self.submit_job(&full_prompt)?;
        let job = self.poll_job(&token, &job_id, deadline, on_progress)?;
        Ok(final_image_urls(&job.id))
    }

    fn websocket_token(&self) -> Result<String, MidjourneyError> {
        let url = format!(
            "https://www.{}/api/auth/websocket-token",
            self.config.auth.api_base
        );
        let reply = self
            .transport
            .get_websocket_token(&url, &self.config.auth)
            .map_err(|err| MidjourneyError::transport_from("websocket token request failed", err))?;
        if reply.status != 200 {
            return Err(MidjourneyError::transport(format!(
                "websocket token request failed ({}): {}",
                reply.status,
                truncate_text(&reply.body, 512)
            )));
        }
        parse_websocket_token(&reply.body).ok_or_else(|| {
            MidjourneyError::transport("websocket token response was empty")
        })
    }

    fn submit_job(&self, full_prompt: &str) -> Result<String, MidjourneyError> {
        let url = format!("https://www.{}/api/app/submit-jobs", self.config.auth.api_base);
        let body = submission_body(full_prompt, &self.config.auth.channel_id);
        let reply = self
            .transport
            .post_job(&url, &self.config.auth, &body)
            .map_err(|err| MidjourneyError::transport_from("job submission request failed", err))?;
        info!(
            channel_id = %self.config.auth.channel_id,
            status = reply.status,
            "submitted Midjourney job"
        );
        if reply.status != 200 {
            return Err(MidjourneyError::Submission(format!(
                "HTTP {}: {}",
                reply.status,
                truncate_text(&reply.body, 512)
            )));
        }
        let job_id = serde_json::from_str::<Value>(&reply.body)
            .ok()
            .as_ref()
            .and_then(submitted_job_id);
        match job_id {
            Some(job_id) => {
                info!(job_id = %job_id, "Midjourney job accepted");
                Ok(job_id)
            }
            None => Err(MidjourneyError::Submission(format!(
                "response carried no job_id: {}",
                truncate_text(&reply.body, 512)
            ))),
        }
    }

    fn poll_job(
        &self,
        token: &str,
        job_id: &str,
        deadline: Instant,
        on_progress: &mut dyn FnMut(&Job),
    ) -> Result<Job, MidjourneyError> {
        let url = websocket_url(&self.config.auth.api_base, token);
        let channel = self
            .transport
            .open_channel(&url, &self.config.auth)
            .map_err(|err| MidjourneyError::transport_from("failed to open realtime channel", err))?;
        let mut session = ChannelSession::new(channel);
        let send = |session: &mut ChannelSession, value: Value| {
            session
                .send_json(&value)
                .map_err(|err| MidjourneyError::transport_from("failed to subscribe on realtime channel", err))
        };
        send(&mut session, json!({"type": "subscribe_to_user"}))?;
        send(&mut session, json!({"type": "subscribe_to_job", "job_id": job_id}))?;

        let mut job = Job::new(job_id);
        while !job.is_terminal() {
            if Instant::now() >= deadline {
                return Err(MidjourneyError::Protocol(format!(
                    "timed out waiting for job {job_id} at {}%",
                    job.percent_complete
                )));
            }
            let raw = match session
                .recv()
                .map_err(|err| MidjourneyError::transport_from("realtime channel read failed", err))?
            {
                ChannelEvent::Frame(raw) => raw,
                ChannelEvent::Idle => continue,
                ChannelEvent::Closed => break,
            };
            let message = match JobMessage::from_frame(&raw) {
                Ok(message) => message,
                Err(err) => {
                    warn!(job_id, "skipping undecodable realtime frame: {err}");
                    continue;
                }
            };
            match &message {
                JobMessage::UserSuccess { user_id } => {
                    debug!(job_id, user_id = user_id.as_deref().unwrap_or(""), "subscribed to user");
                }
                JobMessage::Unknown(value) => {
                    debug!(job_id, frame = %truncate_text(&value.to_string(), 256), "ignoring realtime frame");
                }
                _ => {}
            }
            if job.apply(&message) {
                debug!(
                    job_id,
                    status = ?job.status,
                    percent = job.percent_complete,
                    previews = job.images.len(),
                    "job progress"
                );
                on_progress(&job);
            }
        }
        drop(session);

        match job.status {
            JobStatus::Completed => {
                info!(job_id, "Midjourney job completed");
                Ok(job)
            }
            JobStatus::Failed => Err(MidjourneyError::Protocol(format!(
                "job {job_id} failed: {}",
                job.failure.as_deref().unwrap_or("no reason given")
            ))),
            _ => Err(MidjourneyError::Protocol(format!(
                "realtime channel closed before job {job_id} completed"
            ))),
        }
    }
}

pub fn compose_prompt(prompt: &str, aspect_ratio: &str, suffix: &str) -> String {
    format!("{} --ar {} {}", prompt.trim(), aspect_ratio.trim(), suffix.trim())
        .trim_end()
        .to_string()
}

pub fn submission_body(full_prompt: &str, channel_id: &str) -> Value {
    json!({
        "f": {"mode": "fast", "private": false},
        "channelId": channel_id,
        "metadata": {
            "imagePrompts": 0,
            "imageReferences": 0,
            "characterReferences": 0,
            "depthReferences": 0,
            "lightboxOpen": "",
        },
        "t": "imagine",
        "prompt": full_prompt,
    })
}

/// CDN location of each rendered variant. This is a provider naming
/// convention; the job itself never reports these URLs.
pub fn final_image_urls(job_id: &str) -> Vec<String> {
    (0..VARIANT_COUNT)
        .map(|index| format!("https://{CDN_BASE}/{job_id}/0_{index}_1024_N.webp"))
        .collect()
}

fn websocket_url(api_base: &str, token: &str) -> String {
    let base = format!("wss://ws.{api_base}/ws");
    match reqwest::Url::parse(&base) {
        Ok(mut url) => {
            url.query_pairs_mut()
                .append_pair("token", token)
                .append_pair("v", "4");
            url.to_string()
        }
        Err(_) => format!("{base}?token={token}&v=4"),
    }
}

fn parse_websocket_token(body: &str) -> Option<String> {
    let token = match serde_json::from_str::<Value>(body) {
        Ok(Value::String(token)) => token,
        Ok(Value::Object(map)) => map.get("token").and_then(Value::as_str)?.to_string(),
        Ok(_) => return None,
        Err(_) => body.to_string(),
    };
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn submitted_job_id(payload: &Value) -> Option<String> {
    payload
        .get("success")?
        .as_array()?
        .first()?
        .get("job_id")?
        .as_str()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
