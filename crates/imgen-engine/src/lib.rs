use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use imgen_contracts::{GenerationRequest, ImageArtifact};
use rand::Rng;

pub mod config;
pub mod error;
pub mod fetch;
pub mod midjourney;

pub use config::{AuthContext, MidjourneyConfig};
pub use error::{FetchError, MidjourneyError};
pub use fetch::{ImageFetcher, ImageTransport};
pub use midjourney::{JobClient, MidjourneyGenerator};

const IMAGE_ID_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";
const IMAGE_ID_LEN: usize = 8;

/// Uniform contract shared by every image backend.
pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerationRequest) -> Result<ImageArtifact>;
}

#[derive(Default)]
pub struct ImageGeneratorRegistry {
    generators: BTreeMap<String, Box<dyn ImageGenerator>>,
}

impl ImageGeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<G: ImageGenerator + 'static>(&mut self, generator: G) {
        self.generators
            .insert(generator.name().to_string(), Box::new(generator));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageGenerator> {
        self.generators
            .get(name.trim())
            .map(|generator| generator.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.generators.keys().cloned().collect()
    }

    pub fn generate(&self, provider: &str, request: &GenerationRequest) -> Result<ImageArtifact> {
        let Some(generator) = self.get(provider) else {
            anyhow::bail!(
                "unknown image provider '{provider}' (available: {})",
                self.names().join(", ")
            );
        };
        generator.generate(request)
    }
}

pub fn default_generator_registry(
    config: MidjourneyConfig,
    files_dir: impl Into<PathBuf>,
) -> Result<ImageGeneratorRegistry> {
    let mut registry = ImageGeneratorRegistry::new();
    registry.register(MidjourneyGenerator::new(config, files_dir)?);
    Ok(registry)
}

/// `im_` followed by eight URL-safe random characters.
pub fn generate_image_id() -> String {
    let mut rng = rand::thread_rng();
    let id: String = (0..IMAGE_ID_LEN)
        .map(|_| IMAGE_ID_ALPHABET[rng.gen_range(0..IMAGE_ID_ALPHABET.len())] as char)
        .collect();
    format!("im_{id}")
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
