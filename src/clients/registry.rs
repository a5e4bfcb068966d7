//! Static registry of supported video models.
//!
//! `actual_chunk_duration` is what the model really outputs regardless of
//! what is requested; chunk planning is built on it. Parameter names vary
//! per model: some take `duration` in seconds, the rest take
//! `num_frames` + `fps`.

/// Per-model constants and parameter-name mapping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoModelConfig {
    pub id: &'static str,
    /// Model name on the predictions endpoint.
    pub endpoint_model: &'static str,
    /// Seconds of video one generation actually produces.
    pub actual_chunk_duration: f64,
    /// Flat cost per generation, in USD.
    pub cost_per_generation: f64,
    /// Frame cap for frame-count models.
    pub max_frames: u32,
    /// Models that produce their own soundtrack let Phase 4 skip music.
    pub native_audio: bool,
    pub image_param: &'static str,
    pub prompt_param: &'static str,
    /// `Some(name)` for seconds-based models; `None` means
    /// `num_frames` + `fps`.
    pub duration_param: Option<&'static str>,
}

const MODELS: &[VideoModelConfig] = &[
    VideoModelConfig {
        id: "hailuo",
        endpoint_model: "minimax/video-01",
        actual_chunk_duration: 6.0,
        cost_per_generation: 0.50,
        max_frames: 144,
        native_audio: false,
        image_param: "first_frame_image",
        prompt_param: "prompt",
        duration_param: None,
    },
    VideoModelConfig {
        id: "hailuo_fast",
        endpoint_model: "minimax/video-01-live",
        actual_chunk_duration: 5.0,
        cost_per_generation: 0.25,
        max_frames: 120,
        native_audio: false,
        image_param: "first_frame_image",
        prompt_param: "prompt",
        duration_param: None,
    },
    VideoModelConfig {
        id: "kling",
        endpoint_model: "kwaivgi/kling-v1.6-standard",
        actual_chunk_duration: 5.0,
        cost_per_generation: 0.28,
        max_frames: 120,
        native_audio: false,
        image_param: "start_image",
        prompt_param: "prompt",
        duration_param: Some("duration"),
    },
    VideoModelConfig {
        id: "seedance",
        endpoint_model: "bytedance/seedance-1-lite",
        actual_chunk_duration: 5.0,
        cost_per_generation: 0.18,
        max_frames: 120,
        native_audio: false,
        image_param: "image",
        prompt_param: "prompt",
        duration_param: Some("duration"),
    },
    VideoModelConfig {
        id: "wan",
        endpoint_model: "wavespeedai/wan-2.1-i2v-480p",
        actual_chunk_duration: 5.0,
        cost_per_generation: 0.12,
        max_frames: 81,
        native_audio: false,
        image_param: "image",
        prompt_param: "prompt",
        duration_param: None,
    },
    VideoModelConfig {
        id: "veo_fast",
        endpoint_model: "google/veo-3-fast",
        actual_chunk_duration: 8.0,
        cost_per_generation: 1.20,
        max_frames: 192,
        native_audio: true,
        image_param: "image",
        prompt_param: "prompt",
        duration_param: Some("duration"),
    },
    VideoModelConfig {
        id: "veo",
        endpoint_model: "google/veo-3",
        actual_chunk_duration: 8.0,
        cost_per_generation: 2.40,
        max_frames: 192,
        native_audio: true,
        image_param: "image",
        prompt_param: "prompt",
        duration_param: Some("duration"),
    },
];

pub fn get_model_config(id: &str) -> Option<&'static VideoModelConfig> {
    MODELS.iter().find(|m| m.id == id)
}

pub fn default_model() -> &'static VideoModelConfig {
    get_model_config("hailuo_fast").expect("default model registered")
}

/// The configured model, or the default when the id is unknown.
pub fn model_or_default(id: &str) -> &'static VideoModelConfig {
    get_model_config(id).unwrap_or_else(default_model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_models_resolve() {
        assert_eq!(get_model_config("kling").unwrap().duration_param, Some("duration"));
        assert_eq!(get_model_config("hailuo").unwrap().image_param, "first_frame_image");
        assert!(get_model_config("veo").unwrap().native_audio);
        assert!(get_model_config("nope").is_none());
    }

    #[test]
    fn unknown_model_falls_back_to_default() {
        assert_eq!(model_or_default("zeroscope").id, "hailuo_fast");
        assert_eq!(model_or_default("wan").id, "wan");
    }

    #[test]
    fn chunk_durations_are_positive() {
        for m in MODELS {
            assert!(m.actual_chunk_duration > 0.0, "{}", m.id);
            assert!(m.cost_per_generation > 0.0, "{}", m.id);
        }
    }
}
