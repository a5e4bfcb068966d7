//! External model clients.
//!
//! The pipeline talks to generation models through the `ImageModel` and
//! `VideoModel` traits so phase runners and the chunk scheduler stay
//! testable with fakes; the production impls in `replicate` call a
//! Replicate-style predictions API. `registry` holds the static table of
//! supported video models and their parameter quirks.

pub mod music;
pub mod registry;
pub mod replicate;

use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempPath;

use crate::errors::PhaseError;
use registry::VideoModelConfig;

pub const IMAGE_TIMEOUT: Duration = Duration::from_secs(60);
pub const VIDEO_TIMEOUT: Duration = Duration::from_secs(300);
pub const MUSIC_TIMEOUT: Duration = Duration::from_secs(180);

/// Text-to-image generation; returns a downloaded local file.
#[async_trait]
pub trait ImageModel: Send + Sync {
    async fn generate(&self, prompt: &str, aspect_ratio: &str) -> Result<TempPath, PhaseError>;
}

/// Image-to-video generation. The init image is passed by URL (presigned
/// for private blobs); the output clip is downloaded to a local file.
#[async_trait]
pub trait VideoModel: Send + Sync {
    async fn generate(
        &self,
        model: &VideoModelConfig,
        init_image_url: &str,
        prompt: &str,
        duration_seconds: f64,
        fps: u32,
    ) -> Result<TempPath, PhaseError>;
}
