use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the VidForge server, read from the
/// environment (a `.env` file is honoured via dotenvy in `main`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP listen port.
    pub port: u16,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Object-store bucket for all blobs.
    pub s3_bucket: String,
    /// Optional S3 endpoint override (minio and friends).
    pub s3_endpoint: Option<String>,
    /// When set, blobs live in this local directory instead of S3.
    pub blob_root: Option<PathBuf>,
    /// Redis URL for the progress cache.
    pub redis_url: String,
    /// Object-store prefix holding the music catalog.
    pub music_prefix: String,
    /// Wall-clock budget for a single stitch pass.
    pub stitch_budget: Duration,
    /// Lifetime of presigned read URLs.
    pub presign_ttl: Duration,
    /// Permissive CORS for local frontends.
    pub dev_mode: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8420,
            db_path: PathBuf::from(".vidforge/vidforge.db"),
            s3_bucket: "vidforge-media".to_string(),
            s3_endpoint: None,
            blob_root: None,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            music_prefix: "music/".to_string(),
            stitch_budget: Duration::from_secs(360),
            presign_ttl: Duration::from_secs(3600),
            dev_mode: false,
        }
    }
}

impl AppConfig {
    /// Build a config from the process environment, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let parse_secs = |var: &str, fallback: Duration| {
            std::env::var(var)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };

        Self {
            port: std::env::var("VIDFORGE_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            db_path: std::env::var("VIDFORGE_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            s3_bucket: std::env::var("VIDFORGE_S3_BUCKET").unwrap_or(defaults.s3_bucket),
            s3_endpoint: std::env::var("VIDFORGE_S3_ENDPOINT").ok(),
            blob_root: std::env::var("VIDFORGE_BLOB_ROOT").map(PathBuf::from).ok(),
            redis_url: std::env::var("VIDFORGE_REDIS_URL").unwrap_or(defaults.redis_url),
            music_prefix: std::env::var("VIDFORGE_MUSIC_PREFIX").unwrap_or(defaults.music_prefix),
            stitch_budget: parse_secs("VIDFORGE_STITCH_BUDGET_SECS", defaults.stitch_budget),
            presign_ttl: parse_secs("VIDFORGE_PRESIGN_TTL_SECS", defaults.presign_ttl),
            dev_mode: std::env::var("VIDFORGE_DEV").map(|v| v == "1").unwrap_or(false),
        }
    }
}
