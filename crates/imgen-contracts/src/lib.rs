pub mod events;
pub mod generation;
pub mod jobs;

pub use generation::{GenerationRequest, ImageArtifact};
pub use jobs::{Job, JobMessage, JobStatus};
