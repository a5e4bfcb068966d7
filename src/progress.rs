//! Best-effort progress channel backed by redis.
//!
//! This is a cache, not a queue: writes are fire-and-forget and
//! last-write-wins, reads return `None` when redis is unreachable, and
//! nothing in the pipeline depends on it for correctness. The `Status`
//! endpoint consults it first and falls back to the video row.

use std::time::Duration;

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Live view of one video, small enough to rewrite wholesale on every
/// phase transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressDoc {
    pub status: String,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storyboard_urls: Option<Vec<String>>,
}

const DOC_TTL_SECS: u64 = 24 * 3600;

#[derive(Clone)]
pub struct ProgressChannel {
    client: Option<redis::Client>,
    url_cache_ttl: Duration,
}

impl ProgressChannel {
    /// The client connects lazily; a bad URL degrades to a no-op channel.
    pub fn new(redis_url: &str, url_cache_ttl: Duration) -> Self {
        let client = match redis::Client::open(redis_url) {
            Ok(client) => Some(client),
            Err(e) => {
                debug!(error = %e, "progress channel disabled: invalid redis url");
                None
            }
        };
        Self {
            client,
            url_cache_ttl,
        }
    }

    async fn connection(&self) -> Option<redis::aio::MultiplexedConnection> {
        let client = self.client.as_ref()?;
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => Some(conn),
            Err(e) => {
                debug!(error = %e, "progress channel unavailable");
                None
            }
        }
    }

    fn doc_key(video_id: &str) -> String {
        format!("video:{}", video_id)
    }

    fn url_key(video_id: &str) -> String {
        format!("video:{}:urls", video_id)
    }

    /// Overwrite the live progress document. Errors are swallowed.
    pub async fn publish(&self, video_id: &str, doc: &ProgressDoc) {
        let Some(mut conn) = self.connection().await else {
            return;
        };
        let Ok(payload) = serde_json::to_string(doc) else {
            return;
        };
        let result: redis::RedisResult<()> = conn
            .set_ex(Self::doc_key(video_id), payload, DOC_TTL_SECS)
            .await;
        if let Err(e) = result {
            debug!(video_id, error = %e, "progress publish dropped");
        }
    }

    pub async fn get(&self, video_id: &str) -> Option<ProgressDoc> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(Self::doc_key(video_id)).await.ok()?;
        serde_json::from_str(&raw?).ok()
    }

    /// Remember a presigned URL so repeated status polls don't re-sign the
    /// same blob. Entries expire with the presigned URL itself.
    pub async fn cache_presigned(&self, video_id: &str, key: &str, url: &str) {
        let Some(mut conn) = self.connection().await else {
            return;
        };
        let cache_key = Self::url_key(video_id);
        let result: redis::RedisResult<()> = conn.hset(&cache_key, key, url).await;
        if result.is_ok() {
            let _: redis::RedisResult<bool> = conn
                .expire(&cache_key, self.url_cache_ttl.as_secs() as i64)
                .await;
        }
    }

    pub async fn cached_presigned(&self, video_id: &str, key: &str) -> Option<String> {
        let mut conn = self.connection().await?;
        conn.hget(Self::url_key(video_id), key).await.ok()?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_channel() -> ProgressChannel {
        // Nothing listens on port 1; every operation degrades to a no-op.
        ProgressChannel::new("redis://127.0.0.1:1", Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn writes_are_swallowed_without_redis() {
        let channel = unreachable_channel();
        let doc = ProgressDoc {
            status: "running_phase_1".into(),
            progress: 10.0,
            current_phase: Some("phase1_plan".into()),
            ..Default::default()
        };
        channel.publish("vid-1", &doc).await;
        channel.cache_presigned("vid-1", "final", "https://example").await;
        assert!(channel.get("vid-1").await.is_none());
        assert!(channel.cached_presigned("vid-1", "final").await.is_none());
    }

    #[test]
    fn doc_serialization_drops_empty_fields() {
        let doc = ProgressDoc {
            status: "queued".into(),
            progress: 0.0,
            ..Default::default()
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["status"], "queued");
        assert!(json.get("error").is_none());
        assert!(json.get("storyboard_urls").is_none());
    }

    #[test]
    fn keys_are_namespaced_per_video() {
        assert_eq!(ProgressChannel::doc_key("vid-1"), "video:vid-1");
        assert_eq!(ProgressChannel::url_key("vid-1"), "video:vid-1:urls");
    }
}
