//! Replicate-style predictions client and the production model impls.
//!
//! A prediction is created, polled until terminal, and its output URL
//! downloaded to a temp file. Every call carries a hard timeout; 5xx and
//! failed predictions surface as external errors and fail the phase (no
//! inner retry loop here; retries belong to the chunk scheduler).

use std::io::Write;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempPath;
use tracing::debug;

use super::registry::VideoModelConfig;
use super::{IMAGE_TIMEOUT, ImageModel, VIDEO_TIMEOUT, VideoModel};
use crate::errors::PhaseError;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct ReplicateClient {
    http: reqwest::Client,
    api_token: String,
    base_url: String,
}

impl ReplicateClient {
    pub fn new(api_token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_token,
            base_url: "https://api.replicate.com/v1".to_string(),
        }
    }

    pub fn with_base_url(api_token: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_token,
            base_url,
        }
    }

    /// Create a prediction and poll it to completion within `timeout`.
    /// Returns the output URL (first element when the model yields a list).
    pub async fn run(
        &self,
        service: &str,
        model: &str,
        input: serde_json::Value,
        timeout: Duration,
    ) -> Result<String, PhaseError> {
        let started = Instant::now();
        let create_url = format!("{}/models/{}/predictions", self.base_url, model);

        let response = self
            .http
            .post(&create_url)
            .bearer_auth(&self.api_token)
            .json(&json!({ "input": input }))
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| map_reqwest_error(service, timeout, e))?
            .error_for_status()
            .map_err(|e| PhaseError::external(service, e))?;
        let mut prediction: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PhaseError::external(service, e))?;

        loop {
            match prediction["status"].as_str().unwrap_or("") {
                "succeeded" => break,
                "failed" => {
                    let message = prediction["error"]
                        .as_str()
                        .unwrap_or("prediction failed")
                        .to_string();
                    return Err(PhaseError::External {
                        service: service.to_string(),
                        message,
                    });
                }
                "canceled" => {
                    return Err(PhaseError::external(service, "prediction was canceled"));
                }
                _ => {}
            }

            if started.elapsed() > timeout {
                return Err(PhaseError::ExternalTimeout {
                    service: service.to_string(),
                    seconds: timeout.as_secs(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;

            let poll_url = prediction["urls"]["get"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| {
                    format!(
                        "{}/predictions/{}",
                        self.base_url,
                        prediction["id"].as_str().unwrap_or("")
                    )
                });
            prediction = self
                .http
                .get(&poll_url)
                .bearer_auth(&self.api_token)
                .timeout(Duration::from_secs(30))
                .send()
                .await
                .map_err(|e| map_reqwest_error(service, timeout, e))?
                .error_for_status()
                .map_err(|e| PhaseError::external(service, e))?
                .json()
                .await
                .map_err(|e| PhaseError::external(service, e))?;
        }

        extract_output_url(&prediction["output"]).ok_or_else(|| {
            PhaseError::external(service, "prediction succeeded without an output url")
        })
    }

    /// Download a generated blob to a temp file with the right suffix.
    pub async fn download(
        &self,
        service: &str,
        url: &str,
        suffix: &str,
        timeout: Duration,
    ) -> Result<TempPath, PhaseError> {
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(service, timeout, e))?
            .error_for_status()
            .map_err(|e| PhaseError::external(service, e))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PhaseError::external(service, e))?;

        let mut file = tempfile::Builder::new()
            .prefix("vidforge-gen-")
            .suffix(suffix)
            .tempfile()
            .map_err(|e| PhaseError::external(service, e))?;
        file.write_all(&bytes)
            .map_err(|e| PhaseError::external(service, e))?;
        debug!(service, bytes = bytes.len(), "downloaded model output");
        Ok(file.into_temp_path())
    }
}

fn map_reqwest_error(service: &str, timeout: Duration, e: reqwest::Error) -> PhaseError {
    if e.is_timeout() {
        PhaseError::ExternalTimeout {
            service: service.to_string(),
            seconds: timeout.as_secs(),
        }
    } else {
        PhaseError::external(service, e)
    }
}

/// Models return either a plain URL string or a list of URLs.
pub fn extract_output_url(output: &serde_json::Value) -> Option<String> {
    match output {
        serde_json::Value::String(url) => Some(url.clone()),
        serde_json::Value::Array(items) => items.first().and_then(|v| v.as_str()).map(String::from),
        serde_json::Value::Object(map) => map
            .get("url")
            .or_else(|| map.get("output"))
            .or_else(|| map.get("audio"))
            .and_then(|v| v.as_str())
            .map(String::from),
        _ => None,
    }
}

// ── Production model impls ────────────────────────────────────────────

pub struct ReplicateImageModel {
    client: ReplicateClient,
    model: String,
}

impl ReplicateImageModel {
    pub fn new(client: ReplicateClient) -> Self {
        Self {
            client,
            model: "black-forest-labs/flux-schnell".to_string(),
        }
    }
}

#[async_trait]
impl ImageModel for ReplicateImageModel {
    async fn generate(&self, prompt: &str, aspect_ratio: &str) -> Result<TempPath, PhaseError> {
        let input = json!({
            "prompt": prompt,
            "aspect_ratio": aspect_ratio,
            "output_format": "png",
            "output_quality": 90,
        });
        let url = self
            .client
            .run("image-model", &self.model, input, IMAGE_TIMEOUT)
            .await?;
        self.client
            .download("image-model", &url, ".png", IMAGE_TIMEOUT)
            .await
    }
}

pub struct ReplicateVideoModel {
    client: ReplicateClient,
}

impl ReplicateVideoModel {
    pub fn new(client: ReplicateClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VideoModel for ReplicateVideoModel {
    async fn generate(
        &self,
        model: &VideoModelConfig,
        init_image_url: &str,
        prompt: &str,
        duration_seconds: f64,
        fps: u32,
    ) -> Result<TempPath, PhaseError> {
        let mut input = serde_json::Map::new();
        input.insert(model.image_param.to_string(), json!(init_image_url));
        input.insert(model.prompt_param.to_string(), json!(prompt));

        match model.duration_param {
            Some(name) => {
                input.insert(name.to_string(), json!(duration_seconds.round() as u64));
            }
            None => {
                let frames = ((duration_seconds * fps as f64) as u32).min(model.max_frames);
                input.insert("num_frames".to_string(), json!(frames));
                input.insert("fps".to_string(), json!(fps));
            }
        }

        let url = self
            .client
            .run(
                "video-model",
                model.endpoint_model,
                serde_json::Value::Object(input),
                VIDEO_TIMEOUT,
            )
            .await?;
        self.client
            .download("video-model", &url, ".mp4", VIDEO_TIMEOUT)
            .await
    }
}
