//! Chunk planning: slicing a video spec into model-sized chunks and
//! classifying each as an anchor (image-conditioned, starts a beat) or a
//! continuation (conditioned on the prior chunk's last frame).
//!
//! Spacing leaves a 25 % overlap between consecutive chunks. A beat
//! anchors the chunk whose boundary falls within half a second of the
//! beat's start; a beat that lands on no boundary would leave its chunks
//! orphaned, which fails planning before any model is called.

pub mod executor;

use std::collections::BTreeMap;

use crate::clients::registry;
use crate::errors::PhaseError;
use crate::phases::{Beat, VideoSpec};

/// Fraction of each chunk reserved for overlap with its successor.
pub const CHUNK_OVERLAP_FRACTION: f64 = 0.25;

/// How close a chunk boundary must be to a beat start to anchor it.
pub const ANCHOR_TOLERANCE_SECS: f64 = 0.5;

/// Init-image conditioning for one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum InitImage {
    /// Anchor: the beat's storyboard frame.
    Storyboard { beat_index: usize, url: String },
    /// Continuation: the last frame of the nearest prior anchor.
    PriorFrame { anchor_index: usize },
}

/// Ephemeral per-chunk generation input, reconstructed from the approved
/// storyboard spec on every run.
#[derive(Debug, Clone)]
pub struct ChunkSpec {
    pub index: usize,
    pub start_time: f64,
    pub duration: f64,
    pub beat_index: usize,
    pub prompt: String,
    pub model: String,
    pub fps: u32,
    pub init: InitImage,
}

impl ChunkSpec {
    pub fn is_anchor(&self) -> bool {
        matches!(self.init, InitImage::Storyboard { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub chunk_count: usize,
    pub chunk_duration: f64,
    pub chunk_spacing: f64,
    /// chunk index -> beat index, for chunks that start a beat.
    pub beat_to_chunk: BTreeMap<usize, usize>,
    pub specs: Vec<ChunkSpec>,
}

impl ChunkPlan {
    pub fn anchors(&self) -> impl Iterator<Item = &ChunkSpec> {
        self.specs.iter().filter(|s| s.is_anchor())
    }

    pub fn continuations(&self) -> impl Iterator<Item = &ChunkSpec> {
        self.specs.iter().filter(|s| !s.is_anchor())
    }
}

/// Which chunks start a beat. A chunk claimed by several beats keeps the
/// earliest one.
pub fn compute_beat_to_chunk_map(
    beats: &[Beat],
    chunk_spacing: f64,
    chunk_count: usize,
) -> BTreeMap<usize, usize> {
    let mut map = BTreeMap::new();
    for (beat_index, beat) in beats.iter().enumerate() {
        let k = (beat.start / chunk_spacing).floor() as usize;
        if k >= chunk_count {
            continue;
        }
        if (k as f64 * chunk_spacing - beat.start).abs() < ANCHOR_TOLERANCE_SECS {
            map.entry(k).or_insert(beat_index);
        }
    }
    map
}

/// Index of the beat covering a point in time; past the final beat the
/// last one wins.
fn beat_covering(beats: &[Beat], at: f64) -> usize {
    let mut found = beats.len() - 1;
    for (i, beat) in beats.iter().enumerate() {
        if at >= beat.start && at < beat.start + beat.duration {
            found = i;
            break;
        }
    }
    found
}

/// Render a beat's prompt template against the spec, capped at 100 words.
pub fn render_prompt(beat: &Beat, spec: &VideoSpec) -> String {
    let prompt = beat
        .prompt_template
        .replace("{product_name}", &spec.product.name)
        .replace("{style_aesthetic}", &spec.style.aesthetic);
    let words: Vec<&str> = prompt.split_whitespace().collect();
    if words.len() > 100 {
        words[..100].join(" ")
    } else {
        prompt
    }
}

/// Plan all chunks for an approved storyboard spec.
///
/// Fails with an integrity error when the spec has no beats, when a beat
/// has no storyboard image, when a beat acquires no anchor chunk, or when
/// chunk 0 is not an anchor.
pub fn plan_chunks(spec: &VideoSpec) -> Result<ChunkPlan, PhaseError> {
    if spec.beats.is_empty() {
        return Err(PhaseError::Integrity("Spec has zero beats".into()));
    }
    for (i, beat) in spec.beats.iter().enumerate() {
        if beat.image_url.as_deref().unwrap_or("").is_empty() {
            return Err(PhaseError::Integrity(format!(
                "Beat {} has no storyboard image",
                i
            )));
        }
    }

    let model = registry::model_or_default(&spec.model);
    let chunk_duration = model.actual_chunk_duration;
    let chunk_count = (spec.duration / chunk_duration).ceil() as usize;
    if chunk_count == 0 {
        return Err(PhaseError::Integrity("Spec duration is zero".into()));
    }
    let chunk_spacing = chunk_duration * (1.0 - CHUNK_OVERLAP_FRACTION);

    let beat_to_chunk = compute_beat_to_chunk_map(&spec.beats, chunk_spacing, chunk_count);

    for (beat_index, beat) in spec.beats.iter().enumerate() {
        if !beat_to_chunk.values().any(|&b| b == beat_index) {
            return Err(PhaseError::Integrity(format!(
                "Orphan continuation: beat {} ('{}') starting at {:.2}s has no anchor chunk",
                beat_index, beat.id, beat.start
            )));
        }
    }
    if !beat_to_chunk.contains_key(&0) {
        return Err(PhaseError::Integrity(
            "Chunk 0 is not an anchor; the first chunk must start a beat".into(),
        ));
    }

    let mut specs = Vec::with_capacity(chunk_count);
    for index in 0..chunk_count {
        let start_time = index as f64 * chunk_spacing;
        let beat_index = beat_covering(&spec.beats, start_time);
        let beat = &spec.beats[beat_index];

        let init = match beat_to_chunk.get(&index) {
            Some(&anchor_beat) => InitImage::Storyboard {
                beat_index: anchor_beat,
                url: spec.beats[anchor_beat]
                    .image_url
                    .clone()
                    .expect("validated above"),
            },
            None => {
                let anchor_index = *beat_to_chunk
                    .range(..index)
                    .next_back()
                    .map(|(k, _)| k)
                    .expect("chunk 0 is an anchor");
                InitImage::PriorFrame { anchor_index }
            }
        };

        specs.push(ChunkSpec {
            index,
            start_time,
            duration: chunk_duration,
            beat_index,
            prompt: render_prompt(beat, spec),
            model: spec.model.clone(),
            fps: spec.fps,
            init,
        });
    }

    Ok(ChunkPlan {
        chunk_count,
        chunk_duration,
        chunk_spacing,
        beat_to_chunk,
        specs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::{AudioSpec, Product, Style};

    fn beat(id: &str, start: f64, duration: f64, image: bool) -> Beat {
        Beat {
            id: id.to_string(),
            start,
            duration,
            prompt_template: format!("{{product_name}} in a {} shot", id),
            shot_type: "wide".to_string(),
            image_url: image.then(|| format!("s3://bucket/beat_{}.png", id)),
        }
    }

    /// 5s chunks -> 3.75s spacing. Beats are aligned to chunk boundaries
    /// 0, 2, and 3 so every beat anchors.
    fn aligned_spec() -> VideoSpec {
        VideoSpec {
            beats: vec![
                beat("opening", 0.0, 7.5, true),
                beat("middle", 7.5, 3.75, true),
                beat("closing", 11.25, 8.75, true),
            ],
            style: Style {
                aesthetic: "cinematic".into(),
                mood: "bold".into(),
            },
            product: Product {
                name: "chrome kettle".into(),
                description: None,
            },
            audio: AudioSpec::default(),
            duration: 20.0,
            fps: 24,
            model: "hailuo_fast".into(),
            transitions: vec![],
        }
    }

    #[test]
    fn plan_counts_and_spacing() {
        let plan = plan_chunks(&aligned_spec()).unwrap();
        assert_eq!(plan.chunk_count, 4);
        assert_eq!(plan.chunk_duration, 5.0);
        assert!((plan.chunk_spacing - 3.75).abs() < 1e-9);
        assert_eq!(plan.specs.len(), 4);
        for (i, spec) in plan.specs.iter().enumerate() {
            assert_eq!(spec.index, i);
            assert!((spec.start_time - i as f64 * 3.75).abs() < 1e-9);
        }
    }

    #[test]
    fn anchors_and_continuations_are_classified() {
        let plan = plan_chunks(&aligned_spec()).unwrap();
        assert_eq!(
            plan.beat_to_chunk,
            [(0usize, 0usize), (2, 1), (3, 2)].into_iter().collect()
        );
        assert_eq!(plan.anchors().count(), 3);
        assert_eq!(plan.continuations().count(), 1);

        // Chunk 1 continues from anchor chunk 0.
        match &plan.specs[1].init {
            InitImage::PriorFrame { anchor_index } => assert_eq!(*anchor_index, 0),
            other => panic!("expected continuation, got {:?}", other),
        }
        // Chunk 2 is anchored by beat 1's storyboard image.
        match &plan.specs[2].init {
            InitImage::Storyboard { beat_index, url } => {
                assert_eq!(*beat_index, 1);
                assert!(url.contains("beat_middle"));
            }
            other => panic!("expected anchor, got {:?}", other),
        }
    }

    #[test]
    fn chunk_zero_must_be_an_anchor() {
        let mut spec = aligned_spec();
        // Shift every beat so nothing starts at t=0.
        spec.beats = vec![
            beat("late", 3.75, 10.0, true),
            beat("later", 15.0, 5.0, true),
        ];
        spec.duration = 20.0;
        let err = plan_chunks(&spec).unwrap_err();
        assert!(matches!(err, PhaseError::Integrity(_)));
        assert!(err.to_string().contains("Chunk 0"));
    }

    #[test]
    fn misaligned_beat_is_an_orphan() {
        let mut spec = aligned_spec();
        // Beat at 10s: floor(10 / 3.75) = 2, |7.5 - 10| = 2.5 > 0.5.
        spec.beats = vec![
            beat("a", 0.0, 10.0, true),
            beat("b", 10.0, 5.0, true),
            beat("c", 15.0, 15.0, true),
        ];
        spec.duration = 30.0;
        let err = plan_chunks(&spec).unwrap_err();
        assert!(matches!(err, PhaseError::Integrity(_)));
        assert!(err.to_string().contains("Orphan continuation"));
        assert!(err.to_string().contains("beat 1"));
    }

    #[test]
    fn missing_storyboard_image_fails_planning() {
        let mut spec = aligned_spec();
        spec.beats[1].image_url = None;
        let err = plan_chunks(&spec).unwrap_err();
        assert!(err.to_string().contains("no storyboard image"));
    }

    #[test]
    fn empty_beats_fail_planning() {
        let mut spec = aligned_spec();
        spec.beats.clear();
        let err = plan_chunks(&spec).unwrap_err();
        assert!(err.to_string().contains("zero beats"));
    }

    #[test]
    fn tie_break_keeps_earliest_beat() {
        let beats = vec![
            beat("first", 0.0, 0.3, true),
            beat("second", 0.3, 10.0, true),
        ];
        // Both beats land within tolerance of chunk 0's boundary.
        let map = compute_beat_to_chunk_map(&beats, 3.75, 4);
        assert_eq!(map.get(&0), Some(&0));
    }

    #[test]
    fn beats_past_the_chunk_range_are_ignored_by_the_map() {
        let beats = vec![beat("a", 0.0, 5.0, true), beat("z", 100.0, 5.0, true)];
        let map = compute_beat_to_chunk_map(&beats, 3.75, 4);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn prompt_rendering_substitutes_and_caps() {
        let spec = aligned_spec();
        let rendered = render_prompt(&spec.beats[0], &spec);
        assert_eq!(rendered, "chrome kettle in a opening shot");

        let mut long_beat = spec.beats[0].clone();
        long_beat.prompt_template = vec!["word"; 150].join(" ");
        let rendered = render_prompt(&long_beat, &spec);
        assert_eq!(rendered.split_whitespace().count(), 100);
    }

    #[test]
    fn chunk_past_all_beats_falls_back_to_last_beat() {
        // Duration slightly over the final beat's end adds one chunk whose
        // start lies beyond every beat.
        let mut spec = aligned_spec();
        spec.duration = 21.0;
        let plan = plan_chunks(&spec).unwrap();
        assert_eq!(plan.chunk_count, 5);
        assert_eq!(plan.specs[4].beat_index, 2);
    }
}
