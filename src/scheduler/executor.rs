//! Two-phase parallel chunk execution.
//!
//! Phase A runs every anchor concurrently; phase B starts only after all
//! anchors succeeded and runs every continuation concurrently, each
//! conditioned on its anchor's last frame. Chunk jobs get bounded local
//! retries with a short backoff; this is the only retry layer in the
//! pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, warn};

use super::{ChunkPlan, ChunkSpec, InitImage};
use crate::clients::{VideoModel, registry};
use crate::errors::PhaseError;
use crate::media::MediaTools;
use crate::object_io::{ObjectIO, video_key};

/// One generated chunk: blob references plus its cost.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub index: usize,
    pub chunk_url: String,
    pub last_frame_url: String,
    pub cost_usd: f64,
}

/// Generates a single chunk given its spec and a resolved init-image
/// reference. The production impl talks to the video model and the object
/// store; tests substitute fakes.
#[async_trait]
pub trait ChunkWorker: Send + Sync {
    async fn generate(
        &self,
        spec: &ChunkSpec,
        init_image_ref: &str,
    ) -> Result<ChunkResult, PhaseError>;
}

pub struct ChunkScheduler<'a> {
    worker: &'a dyn ChunkWorker,
    max_attempts: u32,
    backoff: Duration,
}

impl<'a> ChunkScheduler<'a> {
    pub fn new(worker: &'a dyn ChunkWorker) -> Self {
        Self {
            worker,
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run all anchor chunks in parallel. Any persistent failure fails
    /// the batch; phase B must not start in that case.
    pub async fn run_anchors(
        &self,
        plan: &ChunkPlan,
    ) -> Result<BTreeMap<usize, ChunkResult>, PhaseError> {
        let jobs: Vec<_> = plan
            .anchors()
            .map(|spec| {
                let init_ref = match &spec.init {
                    InitImage::Storyboard { url, .. } => url.clone(),
                    InitImage::PriorFrame { .. } => unreachable!("anchors are image-conditioned"),
                };
                self.run_with_retries(spec, init_ref)
            })
            .collect();

        info!(count = jobs.len(), "running anchor chunks");
        let mut results = BTreeMap::new();
        for result in join_all(jobs).await {
            let result = result?;
            results.insert(result.index, result);
        }
        Ok(results)
    }

    /// Run all continuation chunks in parallel, each conditioned on the
    /// last frame of its nearest prior anchor.
    pub async fn run_continuations(
        &self,
        plan: &ChunkPlan,
        anchors: &BTreeMap<usize, ChunkResult>,
    ) -> Result<BTreeMap<usize, ChunkResult>, PhaseError> {
        let mut jobs = Vec::new();
        for spec in plan.continuations() {
            let anchor_index = match &spec.init {
                InitImage::PriorFrame { anchor_index } => *anchor_index,
                InitImage::Storyboard { .. } => unreachable!("continuations use prior frames"),
            };
            let anchor = anchors.get(&anchor_index).ok_or_else(|| {
                PhaseError::Integrity(format!(
                    "Chunk {} references anchor {} which produced no result",
                    spec.index, anchor_index
                ))
            })?;
            if anchor.last_frame_url.is_empty() {
                return Err(PhaseError::Integrity(format!(
                    "Anchor chunk {} has no last frame for chunk {}",
                    anchor_index, spec.index
                )));
            }
            jobs.push(self.run_with_retries(spec, anchor.last_frame_url.clone()));
        }

        info!(count = jobs.len(), "running continuation chunks");
        let mut results = BTreeMap::new();
        for result in join_all(jobs).await {
            let result = result?;
            results.insert(result.index, result);
        }
        Ok(results)
    }

    async fn run_with_retries(
        &self,
        spec: &ChunkSpec,
        init_ref: String,
    ) -> Result<ChunkResult, PhaseError> {
        let mut attempt = 1;
        loop {
            match self.worker.generate(spec, &init_ref).await {
                Ok(result) => return Ok(result),
                Err(e) if attempt < self.max_attempts => {
                    warn!(chunk = spec.index, attempt, error = %e, "chunk job failed, retrying");
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(PhaseError::External {
                        service: "chunk-job".to_string(),
                        message: format!(
                            "Chunk {} failed after {} attempts: {}",
                            spec.index, attempt, e
                        ),
                    });
                }
            }
        }
    }
}

/// Merge both phases and validate that the produced indices are exactly
/// `{0, .., chunk_count-1}`.
pub fn collect_ordered(
    plan: &ChunkPlan,
    anchors: BTreeMap<usize, ChunkResult>,
    continuations: BTreeMap<usize, ChunkResult>,
) -> Result<Vec<ChunkResult>, PhaseError> {
    let mut all: BTreeMap<usize, ChunkResult> = anchors;
    all.extend(continuations);

    let expected: Vec<usize> = (0..plan.chunk_count).collect();
    let actual: Vec<usize> = all.keys().copied().collect();
    if expected != actual {
        let missing: Vec<usize> = expected
            .iter()
            .copied()
            .filter(|i| !all.contains_key(i))
            .collect();
        let extra: Vec<usize> = actual
            .iter()
            .copied()
            .filter(|i| *i >= plan.chunk_count)
            .collect();
        let mut message = format!("Expected {} chunks", plan.chunk_count);
        if !missing.is_empty() {
            message.push_str(&format!(", missing {:?}", missing));
        }
        if !extra.is_empty() {
            message.push_str(&format!(", extra {:?}", extra));
        }
        return Err(PhaseError::Integrity(message));
    }

    Ok(all.into_values().collect())
}

// ── Production worker ─────────────────────────────────────────────────

/// Chunk worker backed by the real video model and object store: presign
/// the init image, generate, upload the clip, extract and upload its last
/// frame.
pub struct ModelChunkWorker {
    pub objects: ObjectIO,
    pub media: MediaTools,
    pub video_model: Arc<dyn VideoModel>,
    pub owner_id: String,
    pub video_id: String,
    pub presign_ttl: Duration,
}

#[async_trait]
impl ChunkWorker for ModelChunkWorker {
    async fn generate(
        &self,
        spec: &ChunkSpec,
        init_image_ref: &str,
    ) -> Result<ChunkResult, PhaseError> {
        let model = registry::model_or_default(&spec.model);

        let init_url = if init_image_ref.starts_with("http") {
            init_image_ref.to_string()
        } else {
            self.objects.presign(init_image_ref, self.presign_ttl).await?
        };

        let clip = self
            .video_model
            .generate(model, &init_url, &spec.prompt, spec.duration, spec.fps)
            .await?;

        let chunk_key = video_key(
            &self.owner_id,
            &self.video_id,
            &format!("chunk_{:02}.mp4", spec.index),
        );
        let chunk_blob = self.objects.upload_file(&clip, &chunk_key).await?;

        let frame_file = tempfile::Builder::new()
            .prefix("vidforge-frame-")
            .suffix(".png")
            .tempfile()
            .map_err(|e| PhaseError::Media(format!("Failed to create frame file: {}", e)))?
            .into_temp_path();
        self.media.extract_last_frame(&clip, &frame_file).await?;

        let frame_key = video_key(
            &self.owner_id,
            &self.video_id,
            &format!("chunk_{:02}_last_frame.png", spec.index),
        );
        let frame_blob = self.objects.upload_file(&frame_file, &frame_key).await?;

        Ok(ChunkResult {
            index: spec.index,
            chunk_url: chunk_blob.blob_url,
            last_frame_url: frame_blob.blob_url,
            cost_usd: model.cost_per_generation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::{AudioSpec, Beat, Product, Style, VideoSpec};
    use crate::scheduler::plan_chunks;
    use std::sync::Mutex;

    fn test_spec() -> VideoSpec {
        VideoSpec {
            beats: vec![
                Beat {
                    id: "a".into(),
                    start: 0.0,
                    duration: 7.5,
                    prompt_template: "a".into(),
                    shot_type: "wide".into(),
                    image_url: Some("s3://bucket/beat_a.png".into()),
                },
                Beat {
                    id: "b".into(),
                    start: 7.5,
                    duration: 12.5,
                    prompt_template: "b".into(),
                    shot_type: "close".into(),
                    image_url: Some("s3://bucket/beat_b.png".into()),
                },
            ],
            style: Style {
                aesthetic: "cinematic".into(),
                mood: "calm".into(),
            },
            product: Product {
                name: "kettle".into(),
                description: None,
            },
            audio: AudioSpec::default(),
            duration: 20.0,
            fps: 24,
            model: "hailuo_fast".into(),
            transitions: vec![],
        }
    }

    /// Records every generate call; optionally fails the first N attempts
    /// per chunk.
    struct FakeWorker {
        calls: Mutex<Vec<(usize, String)>>,
        failures_remaining: Mutex<std::collections::HashMap<usize, u32>>,
    }

    impl FakeWorker {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failures_remaining: Mutex::new(Default::default()),
            }
        }

        fn failing(chunk: usize, times: u32) -> Self {
            let worker = Self::new();
            worker.failures_remaining.lock().unwrap().insert(chunk, times);
            worker
        }
    }

    #[async_trait]
    impl ChunkWorker for FakeWorker {
        async fn generate(
            &self,
            spec: &ChunkSpec,
            init_image_ref: &str,
        ) -> Result<ChunkResult, PhaseError> {
            self.calls
                .lock()
                .unwrap()
                .push((spec.index, init_image_ref.to_string()));

            let mut failures = self.failures_remaining.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&spec.index) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(PhaseError::external("video-model", "synthetic 503"));
                }
            }

            Ok(ChunkResult {
                index: spec.index,
                chunk_url: format!("s3://bucket/chunk_{:02}.mp4", spec.index),
                last_frame_url: format!("s3://bucket/chunk_{:02}_last_frame.png", spec.index),
                cost_usd: 0.25,
            })
        }
    }

    #[tokio::test]
    async fn anchors_use_storyboard_images() {
        let plan = plan_chunks(&test_spec()).unwrap();
        let worker = FakeWorker::new();
        let scheduler = ChunkScheduler::new(&worker).with_backoff(Duration::ZERO);

        let anchors = scheduler.run_anchors(&plan).await.unwrap();
        assert_eq!(anchors.len(), 2);

        let calls = worker.calls.lock().unwrap();
        let chunk0 = calls.iter().find(|(i, _)| *i == 0).unwrap();
        assert_eq!(chunk0.1, "s3://bucket/beat_a.png");
        let chunk2 = calls.iter().find(|(i, _)| *i == 2).unwrap();
        assert_eq!(chunk2.1, "s3://bucket/beat_b.png");
    }

    #[tokio::test]
    async fn continuations_use_anchor_last_frames() {
        let plan = plan_chunks(&test_spec()).unwrap();
        let worker = FakeWorker::new();
        let scheduler = ChunkScheduler::new(&worker).with_backoff(Duration::ZERO);

        let anchors = scheduler.run_anchors(&plan).await.unwrap();
        let continuations = scheduler.run_continuations(&plan, &anchors).await.unwrap();
        // Chunks 1 and 3 are continuations of anchors 0 and 2.
        assert_eq!(continuations.len(), 2);

        let calls = worker.calls.lock().unwrap();
        let chunk1 = calls.iter().find(|(i, _)| *i == 1).unwrap();
        assert_eq!(chunk1.1, "s3://bucket/chunk_00_last_frame.png");
        let chunk3 = calls.iter().find(|(i, _)| *i == 3).unwrap();
        assert_eq!(chunk3.1, "s3://bucket/chunk_02_last_frame.png");
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let plan = plan_chunks(&test_spec()).unwrap();
        let worker = FakeWorker::failing(0, 2);
        let scheduler = ChunkScheduler::new(&worker).with_backoff(Duration::ZERO);

        let anchors = scheduler.run_anchors(&plan).await.unwrap();
        assert!(anchors.contains_key(&0));

        let calls = worker.calls.lock().unwrap();
        let chunk0_attempts = calls.iter().filter(|(i, _)| *i == 0).count();
        assert_eq!(chunk0_attempts, 3);
    }

    #[tokio::test]
    async fn persistent_failure_fails_the_batch() {
        let plan = plan_chunks(&test_spec()).unwrap();
        let worker = FakeWorker::failing(2, 10);
        let scheduler = ChunkScheduler::new(&worker).with_backoff(Duration::ZERO);

        let err = scheduler.run_anchors(&plan).await.unwrap_err();
        assert!(err.to_string().contains("Chunk 2"));
        assert!(err.to_string().contains("3 attempts"));
    }

    #[tokio::test]
    async fn missing_anchor_result_is_integrity_error() {
        let plan = plan_chunks(&test_spec()).unwrap();
        let worker = FakeWorker::new();
        let scheduler = ChunkScheduler::new(&worker).with_backoff(Duration::ZERO);

        // Drop anchor 2's result before running continuations.
        let mut anchors = scheduler.run_anchors(&plan).await.unwrap();
        anchors.remove(&2);
        let err = scheduler
            .run_continuations(&plan, &anchors)
            .await
            .unwrap_err();
        assert!(matches!(err, PhaseError::Integrity(_)));
    }

    #[tokio::test]
    async fn collect_validates_gapless_indices() {
        let plan = plan_chunks(&test_spec()).unwrap();
        let worker = FakeWorker::new();
        let scheduler = ChunkScheduler::new(&worker).with_backoff(Duration::ZERO);

        let anchors = scheduler.run_anchors(&plan).await.unwrap();
        let continuations = scheduler.run_continuations(&plan, &anchors).await.unwrap();

        let ordered =
            collect_ordered(&plan, anchors.clone(), continuations.clone()).unwrap();
        assert_eq!(
            ordered.iter().map(|r| r.index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );

        // A gap fails the batch with the missing index named.
        let mut gapped = continuations;
        gapped.remove(&1);
        let err = collect_ordered(&plan, anchors, gapped).unwrap_err();
        assert!(err.to_string().contains("missing [1]"));
    }
}
