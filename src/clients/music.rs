//! Object-store-backed music catalog.
//!
//! Tracks live under a configurable prefix. Genre comes from the audio
//! file's container tags when readable, from filename heuristics when
//! not, and falls back to the `upbeat` shelf. Only an empty catalog
//! produces a silent final video.

use tracing::debug;

use crate::errors::PhaseError;
use crate::media::MediaTools;
use crate::object_io::ObjectIO;

pub const FALLBACK_GENRE: &str = "upbeat";

#[derive(Debug, Clone)]
pub struct MusicTrack {
    pub key: String,
    pub genre: String,
}

#[derive(Clone)]
pub struct MusicSource {
    objects: ObjectIO,
    media: MediaTools,
    prefix: String,
}

impl MusicSource {
    pub fn new(objects: ObjectIO, media: MediaTools, prefix: String) -> Self {
        Self {
            objects,
            media,
            prefix,
        }
    }

    /// Pick a track for the requested genre. Genre comes from container
    /// tags (a bounded sample of the catalog); filename heuristics cover
    /// untagged files.
    pub async fn select_track(&self, genre_hint: Option<&str>) -> Result<Option<MusicTrack>, PhaseError> {
        let keys: Vec<String> = self
            .objects
            .list_prefix(&self.prefix)
            .await?
            .into_iter()
            .filter(|k| is_audio_key(k))
            .collect();
        if keys.is_empty() {
            debug!(prefix = %self.prefix, "music catalog is empty");
            return Ok(None);
        }

        let genre = genre_hint
            .map(|g| g.trim().to_lowercase())
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| FALLBACK_GENRE.to_string());

        for key in keys.iter().take(10) {
            let local = self.objects.download_temp(key).await?;
            if let Some(tag_genre) = self.media.probe_genre(&local).await {
                if tag_genre.contains(&genre) {
                    return Ok(Some(MusicTrack {
                        key: key.clone(),
                        genre,
                    }));
                }
            }
        }

        // Tags were absent or never matched; fall back to filenames.
        if let Some(key) = match_by_filename(&keys, &genre) {
            return Ok(Some(MusicTrack {
                key: key.clone(),
                genre,
            }));
        }

        if genre != FALLBACK_GENRE {
            if let Some(key) = match_by_filename(&keys, FALLBACK_GENRE) {
                return Ok(Some(MusicTrack {
                    key: key.clone(),
                    genre: FALLBACK_GENRE.to_string(),
                }));
            }
        }

        // Last resort: any track beats silence.
        Ok(Some(MusicTrack {
            key: keys[0].clone(),
            genre: FALLBACK_GENRE.to_string(),
        }))
    }
}

fn is_audio_key(key: &str) -> bool {
    key.ends_with(".mp3") || key.ends_with(".wav")
}

/// First key whose filename contains the genre word.
fn match_by_filename<'a>(keys: &'a [String], genre: &str) -> Option<&'a String> {
    keys.iter().find(|key| {
        key.rsplit('/')
            .next()
            .map(|name| name.to_lowercase().contains(genre))
            .unwrap_or(false)
    })
}
