//! The dependency struct threaded through handlers, phase runners and the
//! editor. Constructed once at startup; no globals.

use std::sync::Arc;

use crate::clients::music::MusicSource;
use crate::clients::{ImageModel, VideoModel};
use crate::config::AppConfig;
use crate::media::MediaTools;
use crate::object_io::ObjectIO;
use crate::progress::ProgressChannel;
use crate::store::DbHandle;

#[derive(Clone)]
pub struct Deps {
    pub db: DbHandle,
    pub objects: ObjectIO,
    pub progress: ProgressChannel,
    pub media: MediaTools,
    pub image_model: Arc<dyn ImageModel>,
    pub video_model: Arc<dyn VideoModel>,
    pub music: MusicSource,
    pub config: AppConfig,
}
