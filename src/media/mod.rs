//! ffmpeg/ffprobe wrappers: probing, frame extraction, resolution
//! normalisation, chunk splitting, music mixing, and the budgeted
//! stitcher.
//!
//! Stitching tries a single filter-complex pass first (cleanest output),
//! then falls back to per-chunk normalisation plus the concat demuxer.
//! Every large subprocess call checks the remaining wall-clock budget; the
//! final concat needs at least `STITCH_FLOOR` seconds or the stitch fails
//! with a budget error.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, warn};

use crate::errors::PhaseError;

/// Minimum time the final concat pass must have available.
pub const STITCH_FLOOR: Duration = Duration::from_secs(45);

/// Time reserved for the concat pass while normalising chunks.
const NORMALIZE_RESERVE: Duration = Duration::from_secs(90);

/// Output settings shared by every encode pass.
fn encoder_args() -> [&'static str; 12] {
    [
        "-c:v",
        "libx264",
        "-pix_fmt",
        "yuv420p",
        "-r",
        "24",
        "-preset",
        "ultrafast",
        "-crf",
        "23",
        "-threads",
        "2",
    ]
}

/// Resolution + duration of a video stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaProbe {
    pub width: u32,
    pub height: u32,
    pub duration: f64,
}

/// Wall-clock budget for a stitch pass, counted from construction.
#[derive(Debug, Clone)]
pub struct StitchBudget {
    deadline: Instant,
}

impl StitchBudget {
    pub fn new(total: Duration) -> Self {
        Self {
            deadline: Instant::now() + total,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Remaining time, or a budget error if less than `floor` is left.
    pub fn require(&self, floor: Duration, what: &str) -> Result<Duration, PhaseError> {
        let remaining = self.remaining();
        if remaining < floor {
            return Err(PhaseError::BudgetExceeded(format!(
                "{}s remaining, need {}s for {}",
                remaining.as_secs(),
                floor.as_secs(),
                what
            )));
        }
        Ok(remaining)
    }
}

/// Target output resolution: the maximum width and height across all
/// chunks, rounded up to even (required by yuv420p).
pub fn target_resolution(resolutions: &[(u32, u32)]) -> (u32, u32) {
    let max_width = resolutions.iter().map(|r| r.0).max().unwrap_or(1280);
    let max_height = resolutions.iter().map(|r| r.1).max().unwrap_or(720);
    (round_even(max_width), round_even(max_height))
}

fn round_even(n: u32) -> u32 {
    if n % 2 == 0 { n } else { n + 1 }
}

/// True when any chunk deviates from the target by more than 10 % in
/// either dimension; small deviations are left to the encoder's `-s`.
pub fn needs_normalization(resolutions: &[(u32, u32)], target: (u32, u32)) -> bool {
    let (tw, th) = (target.0 as f64, target.1 as f64);
    resolutions.iter().any(|&(w, h)| {
        let width_diff = (w as f64 - tw).abs() / tw;
        let height_diff = (h as f64 - th).abs() / th;
        width_diff > 0.1 || height_diff > 0.1
    })
}

/// Per-input normalisation chain used by both stitch strategies.
fn normalize_filter(target: (u32, u32)) -> String {
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,fps=24,format=yuv420p",
        w = target.0,
        h = target.1
    )
}

/// filter_complex string that scales, pads and fps-normalises every input
/// to the target, then concatenates them in one pass.
pub fn build_concat_filter(input_count: usize, target: (u32, u32)) -> String {
    if input_count < 2 {
        return "[0:v]copy[v]".to_string();
    }
    let per_input = format!("{},setpts=PTS-STARTPTS", normalize_filter(target));
    let chains: Vec<String> = (0..input_count)
        .map(|i| format!("[{i}:v]{per_input}[v{i}]"))
        .collect();
    let pads: String = (0..input_count).map(|i| format!("[v{i}]")).collect();
    format!(
        "{};{}concat=n={}:v=1:a=0[v]",
        chains.join(";"),
        pads,
        input_count
    )
}

/// concat-demuxer list file body; single quotes in paths are escaped.
pub fn concat_list(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("file '{}'\n", p.display().to_string().replace('\'', "'\\''")))
        .collect()
}

#[derive(Clone, Default)]
pub struct MediaTools;

impl MediaTools {
    pub fn new() -> Self {
        Self
    }

    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<std::process::Output, PhaseError> {
        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);
        let output = tokio::time::timeout(timeout, command.output())
            .await
            .map_err(|_| {
                PhaseError::Media(format!(
                    "{} timed out after {}s",
                    program,
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| PhaseError::Media(format!("Failed to spawn {}: {}", program, e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.chars().rev().take(500).collect::<String>()
                .chars().rev().collect();
            return Err(PhaseError::Media(format!(
                "{} exited with {}: {}",
                program, output.status, tail
            )));
        }
        Ok(output)
    }

    /// Resolution and duration via one ffprobe call.
    pub async fn probe(&self, path: &Path) -> Result<MediaProbe, PhaseError> {
        let args = vec![
            "-v".into(),
            "error".into(),
            "-select_streams".into(),
            "v:0".into(),
            "-show_entries".into(),
            "stream=width,height".into(),
            "-show_entries".into(),
            "format=duration".into(),
            "-of".into(),
            "json".into(),
            path.display().to_string(),
        ];
        let output = self.run("ffprobe", &args, Duration::from_secs(10)).await?;
        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| PhaseError::Media(format!("Unparseable ffprobe output: {}", e)))?;

        let stream = parsed["streams"]
            .get(0)
            .ok_or_else(|| PhaseError::Media("No video stream found".into()))?;
        let width = stream["width"].as_u64().unwrap_or(0) as u32;
        let height = stream["height"].as_u64().unwrap_or(0) as u32;
        let duration = parsed["format"]["duration"]
            .as_str()
            .and_then(|d| d.parse::<f64>().ok())
            .unwrap_or(0.0);
        if width == 0 || height == 0 {
            return Err(PhaseError::Media("Probe returned zero resolution".into()));
        }
        Ok(MediaProbe {
            width,
            height,
            duration,
        })
    }

    /// Resolution with the original's fallback of 1280x720 when the probe
    /// fails; stitch target detection tolerates broken chunks this way.
    pub async fn resolution_or_default(&self, path: &Path) -> (u32, u32) {
        match self.probe(path).await {
            Ok(probe) => (probe.width, probe.height),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "resolution probe failed, assuming 1280x720");
                (1280, 720)
            }
        }
    }

    /// Genre tag from the container metadata, if present.
    pub async fn probe_genre(&self, path: &Path) -> Option<String> {
        let args = vec![
            "-v".into(),
            "error".into(),
            "-show_entries".into(),
            "format_tags=genre".into(),
            "-of".into(),
            "json".into(),
            path.display().to_string(),
        ];
        let output = self.run("ffprobe", &args, Duration::from_secs(10)).await.ok()?;
        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
        parsed["format"]["tags"]["genre"]
            .as_str()
            .map(|g| g.trim().to_lowercase())
            .filter(|g| !g.is_empty())
    }

    async fn count_frames(&self, path: &Path) -> Option<u64> {
        let args = vec![
            "-v".into(),
            "error".into(),
            "-select_streams".into(),
            "v:0".into(),
            "-count_packets".into(),
            "-show_entries".into(),
            "stream=nb_read_packets".into(),
            "-of".into(),
            "csv=p=0".into(),
            path.display().to_string(),
        ];
        let output = self.run("ffprobe", &args, Duration::from_secs(10)).await.ok()?;
        String::from_utf8_lossy(&output.stdout).trim().parse().ok()
    }

    /// Extract the final frame as PNG. Selects by exact frame index when
    /// the packet count is probeable, otherwise seeks 0.1 s from the end.
    pub async fn extract_last_frame(&self, video: &Path, out: &Path) -> Result<(), PhaseError> {
        let args = match self.count_frames(video).await {
            Some(frames) if frames > 0 => vec![
                "-y".into(),
                "-i".into(),
                video.display().to_string(),
                "-vf".into(),
                format!("select=eq(n\\,{})", frames - 1),
                "-vframes".into(),
                "1".into(),
                out.display().to_string(),
            ],
            _ => vec![
                "-y".into(),
                "-sseof".into(),
                "-0.1".into(),
                "-i".into(),
                video.display().to_string(),
                "-vframes".into(),
                "1".into(),
                out.display().to_string(),
            ],
        };
        self.run("ffmpeg", &args, Duration::from_secs(60)).await?;
        if !out.exists() {
            return Err(PhaseError::Media(
                "ffmpeg completed but the frame file is missing".into(),
            ));
        }
        Ok(())
    }

    /// Poster frame for thumbnails.
    pub async fn extract_first_frame(&self, video: &Path, out: &Path) -> Result<(), PhaseError> {
        let args = vec![
            "-y".into(),
            "-i".into(),
            video.display().to_string(),
            "-vframes".into(),
            "1".into(),
            "-q:v".into(),
            "2".into(),
            out.display().to_string(),
        ];
        self.run("ffmpeg", &args, Duration::from_secs(60)).await?;
        Ok(())
    }

    /// Re-encode one chunk to the target resolution.
    pub async fn normalize(
        &self,
        input: &Path,
        output: &Path,
        target: (u32, u32),
        timeout: Duration,
    ) -> Result<(), PhaseError> {
        let mut args = vec![
            "-y".into(),
            "-i".into(),
            input.display().to_string(),
            "-vf".into(),
            normalize_filter(target),
        ];
        args.extend(encoder_args().iter().map(|s| s.to_string()));
        args.push(output.display().to_string());
        self.run("ffmpeg", &args, timeout).await?;
        Ok(())
    }

    /// Cut a chunk into `[0, at)` and `[at, end)` without re-encoding.
    pub async fn split(
        &self,
        input: &Path,
        at_seconds: f64,
        part1: &Path,
        part2: &Path,
    ) -> Result<(), PhaseError> {
        let first = vec![
            "-y".into(),
            "-i".into(),
            input.display().to_string(),
            "-t".into(),
            format!("{}", at_seconds),
            "-c".into(),
            "copy".into(),
            part1.display().to_string(),
        ];
        self.run("ffmpeg", &first, Duration::from_secs(60)).await?;

        let second = vec![
            "-y".into(),
            "-i".into(),
            input.display().to_string(),
            "-ss".into(),
            format!("{}", at_seconds),
            "-c".into(),
            "copy".into(),
            part2.display().to_string(),
        ];
        self.run("ffmpeg", &second, Duration::from_secs(60)).await?;

        if !part1.exists() || !part2.exists() {
            return Err(PhaseError::Media("Split parts were not created".into()));
        }
        Ok(())
    }

    async fn has_audio_stream(&self, path: &Path) -> bool {
        let args = vec![
            "-v".into(),
            "error".into(),
            "-select_streams".into(),
            "a".into(),
            "-show_entries".into(),
            "stream=index".into(),
            "-of".into(),
            "csv=p=0".into(),
            path.display().to_string(),
        ];
        match self.run("ffprobe", &args, Duration::from_secs(10)).await {
            Ok(output) => !String::from_utf8_lossy(&output.stdout).trim().is_empty(),
            Err(_) => false,
        }
    }

    /// Mix a music track under the video at 70 % volume. Keeps the
    /// original audio track when one exists, otherwise the music becomes
    /// the only track.
    pub async fn mix_music(
        &self,
        video: &Path,
        music: &Path,
        output: &Path,
    ) -> Result<(), PhaseError> {
        let filter = if self.has_audio_stream(video).await {
            "[1:a]volume=0.7[bg];[0:a][bg]amix=inputs=2:duration=first[a]"
        } else {
            "[1:a]volume=0.7[a]"
        };
        let args = vec![
            "-y".into(),
            "-i".into(),
            video.display().to_string(),
            "-i".into(),
            music.display().to_string(),
            "-filter_complex".into(),
            filter.into(),
            "-map".into(),
            "0:v".into(),
            "-map".into(),
            "[a]".into(),
            "-c:v".into(),
            "copy".into(),
            "-c:a".into(),
            "aac".into(),
            "-shortest".into(),
            output.display().to_string(),
        ];
        self.run("ffmpeg", &args, Duration::from_secs(180)).await?;
        Ok(())
    }

    /// Stitch ordered chunks into one file inside the wall-clock budget.
    ///
    /// Strategy 1 normalises and concatenates in a single filter-complex
    /// pass. On failure or timeout, strategy 2 normalises chunks one at a
    /// time (skipping them when the budget runs short) and concatenates
    /// via the demuxer list file.
    pub async fn stitch(
        &self,
        chunk_paths: &[PathBuf],
        output: &Path,
        scratch_dir: &Path,
        budget: &StitchBudget,
    ) -> Result<(), PhaseError> {
        if chunk_paths.is_empty() {
            return Err(PhaseError::Integrity("No chunks to stitch".into()));
        }

        let mut resolutions = Vec::with_capacity(chunk_paths.len());
        for path in chunk_paths {
            resolutions.push(self.resolution_or_default(path).await);
        }
        let target = target_resolution(&resolutions);
        debug!(?target, chunks = chunk_paths.len(), "stitching");

        match self
            .stitch_filter_complex(chunk_paths, output, target, budget)
            .await
        {
            Ok(()) => Ok(()),
            Err(e @ PhaseError::BudgetExceeded(_)) => Err(e),
            Err(e) => {
                warn!(error = %e, "filter-complex stitch failed, trying concat demuxer");
                self.stitch_concat_demuxer(
                    chunk_paths,
                    &resolutions,
                    output,
                    scratch_dir,
                    target,
                    budget,
                )
                .await
            }
        }
    }

    async fn stitch_filter_complex(
        &self,
        chunk_paths: &[PathBuf],
        output: &Path,
        target: (u32, u32),
        budget: &StitchBudget,
    ) -> Result<(), PhaseError> {
        let remaining = budget.require(STITCH_FLOOR, "filter-complex stitch")?;

        let mut args = vec!["-y".to_string()];
        for path in chunk_paths {
            args.push("-i".into());
            args.push(path.display().to_string());
        }
        args.push("-filter_complex".into());
        args.push(build_concat_filter(chunk_paths.len(), target));
        args.push("-map".into());
        args.push("[v]".into());
        args.extend(encoder_args().iter().map(|s| s.to_string()));
        args.push("-s".into());
        args.push(format!("{}x{}", target.0, target.1));
        args.push(output.display().to_string());

        self.run("ffmpeg", &args, remaining).await?;
        Ok(())
    }

    async fn stitch_concat_demuxer(
        &self,
        chunk_paths: &[PathBuf],
        resolutions: &[(u32, u32)],
        output: &Path,
        scratch_dir: &Path,
        target: (u32, u32),
        budget: &StitchBudget,
    ) -> Result<(), PhaseError> {
        let mut inputs: Vec<PathBuf> = Vec::with_capacity(chunk_paths.len());

        if needs_normalization(resolutions, target) {
            let remaining = budget.require(STITCH_FLOOR, "chunk normalisation")?;
            let per_chunk = Duration::from_secs_f64(
                (remaining.saturating_sub(NORMALIZE_RESERVE).as_secs_f64()
                    / chunk_paths.len() as f64)
                    .max(20.0),
            );

            for (i, path) in chunk_paths.iter().enumerate() {
                if budget.remaining() < NORMALIZE_RESERVE {
                    warn!(
                        skipped = chunk_paths.len() - i,
                        "stitch budget low, reusing original chunks"
                    );
                    inputs.extend(chunk_paths[i..].iter().cloned());
                    break;
                }
                if resolutions[i] == target {
                    inputs.push(path.clone());
                    continue;
                }
                let normalized = scratch_dir.join(format!("normalized_{:02}.mp4", i));
                match self.normalize(path, &normalized, target, per_chunk).await {
                    Ok(()) => inputs.push(normalized),
                    Err(e) => {
                        warn!(chunk = i, error = %e, "normalisation failed, using original");
                        inputs.push(path.clone());
                    }
                }
            }
        } else {
            inputs.extend(chunk_paths.iter().cloned());
        }

        let list_path = scratch_dir.join("concat_list.txt");
        tokio::fs::write(&list_path, concat_list(&inputs))
            .await
            .map_err(|e| PhaseError::Media(format!("Failed to write concat list: {}", e)))?;

        let remaining = budget.require(STITCH_FLOOR, "final concat")?;
        let mut args = vec![
            "-y".to_string(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_path.display().to_string(),
        ];
        args.extend(encoder_args().iter().map(|s| s.to_string()));
        args.push("-s".into());
        args.push(format!("{}x{}", target.0, target.1));
        args.push(output.display().to_string());

        self.run("ffmpeg", &args, remaining).await?;
        Ok(())
    }
}
