mod client;
mod transport;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use imgen_contracts::{GenerationRequest, ImageArtifact, Job};
use tracing::{error, info, warn};

pub use client::{compose_prompt, final_image_urls, submission_body, JobClient, CDN_BASE, VARIANT_COUNT};
pub use transport::{ChannelEvent, HttpMidjourneyTransport, HttpReply, JobChannel, MidjourneyTransport};

use crate::config::MidjourneyConfig;
use crate::error::MidjourneyError;
use crate::fetch::ImageFetcher;
use crate::{generate_image_id, ImageGenerator};

pub type ProgressObserver = Arc<dyn Fn(&Job) + Send + Sync>;

/// Midjourney behind the uniform adapter contract: runs a job, then
/// downloads and persists its first variant into `files_dir`.
pub struct MidjourneyGenerator {
    client: JobClient,
    fetcher: ImageFetcher,
    files_dir: PathBuf,
    on_progress: Option<ProgressObserver>,
}

impl MidjourneyGenerator {
    pub fn new(config: MidjourneyConfig, files_dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::with_parts(
            JobClient::new(config)?,
            ImageFetcher::new()?,
            files_dir,
        ))
    }

    pub fn with_parts(client: JobClient, fetcher: ImageFetcher, files_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            fetcher,
            files_dir: files_dir.into(),
            on_progress: None,
        }
    }

    pub fn with_progress(mut self, observer: ProgressObserver) -> Self {
        self.on_progress = Some(observer);
        self
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    fn run(&self, request: &GenerationRequest) -> Result<ImageArtifact> {
        info!(
            prompt = %request.prompt,
            aspect_ratio = %request.aspect_ratio,
            "starting Midjourney generation"
        );
        if request.input_image.is_some() {
            warn!("Midjourney has no image-to-image support; ignoring input image");
        }

        let deadline = Instant::now() + self.client.config().poll_timeout;
        let observer = self.on_progress.clone();
        let urls = self.client.generate_image_until(
            &request.prompt,
            &request.aspect_ratio,
            deadline,
            &mut |job| {
                if let Some(observer) = &observer {
                    observer(job);
                }
            },
        )?;
        info!(count = urls.len(), "Midjourney returned candidate URLs");
        self.materialize_first(&urls)
    }

    fn materialize_first(&self, urls: &[String]) -> Result<ImageArtifact> {
        let url = urls.first().ok_or(MidjourneyError::EmptyResult)?;
        let image_id = generate_image_id();
        info!(url = %url, image_id = %image_id, "downloading first Midjourney variant");
        self.fetcher
            .fetch_and_save(url, &self.files_dir.join(&image_id), false)
    }
}

impl ImageGenerator for MidjourneyGenerator {
    fn name(&self) -> &str {
        "midjourney"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<ImageArtifact> {
        self.run(request).inspect_err(|err| {
            error!(prompt = %request.prompt, "error generating image with Midjourney: {err:?}");
        })
    }
}
