use serde::{Deserialize, Serialize};

pub const DEFAULT_ASPECT_RATIO: &str = "1:1";

/// Arguments of a single `generate` call, identical for every backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    #[serde(default)]
    pub input_image: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            aspect_ratio: default_aspect_ratio(),
            input_image: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: impl Into<String>) -> Self {
        let value = aspect_ratio.into();
        let trimmed = value.trim();
        self.aspect_ratio = if trimmed.is_empty() {
            default_aspect_ratio()
        } else {
            trimmed.to_string()
        };
        self
    }

    pub fn with_input_image(mut self, input_image: impl Into<String>) -> Self {
        self.input_image = Some(input_image.into());
        self
    }
}

fn default_aspect_ratio() -> String {
    DEFAULT_ASPECT_RATIO.to_string()
}

/// A decoded image persisted on local storage.
///
/// `local_filename` is the bare file name (`<stem>.<extension>`), relative to
/// the directory the caller asked the image to be written into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageArtifact {
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub extension: String,
    pub local_filename: String,
}

impl ImageArtifact {
    /// `(mime_type, width, height, filename)` as returned by every adapter.
    pub fn into_tuple(self) -> (String, u32, u32, String) {
        (self.mime_type, self.width, self.height, self.local_filename)
    }
}
