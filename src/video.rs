use anyhow::{anyhow, Context};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{StudioError, StudioResult};
use crate::gemini::{GenerationService, VideoOperation};
use crate::intake::ReferenceImage;
use crate::settings::{DEFAULT_POLL_INTERVAL_SECS, DEFAULT_POLL_TIMEOUT_SECS};

pub const NO_DOWNLOAD_LINK: &str =
    "Video generation completed, but no download link was found.";

pub const VIDEO_LOADING_MESSAGES: [&str; 8] = [
    "Brewing nefarious pixels...",
    "Summoning digital demons...",
    "Animating your wicked vision...",
    "Twisting light into moving shadows...",
    "Consulting the digital oracle...",
    "Warping reality frame by frame...",
    "Patience, my evil apprentice...",
    "The dark arts of AI take time...",
];

const LOADING_MESSAGE_PERIOD: Duration = Duration::from_secs(3);

/// Status line for a video job that has been running for `elapsed`.
pub fn loading_message(elapsed: Duration) -> &'static str {
    let tick = (elapsed.as_secs() / LOADING_MESSAGE_PERIOD.as_secs()) as usize;
    VIDEO_LOADING_MESSAGES[tick % VIDEO_LOADING_MESSAGES.len()]
}

#[derive(Debug, Clone)]
pub struct VideoJobOptions {
    pub poll_interval: Duration,
    /// `None` polls until the service reports completion.
    pub deadline: Option<Duration>,
    pub cancel: CancellationToken,
}

impl Default for VideoJobOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            deadline: Some(Duration::from_secs(DEFAULT_POLL_TIMEOUT_SECS)),
            cancel: CancellationToken::new(),
        }
    }
}

/// Submits a video job, polls it to completion and writes the clip under `output_dir`.
///
/// `on_poll` sees the handle right after submission and after every status fetch.
#[instrument(skip_all, fields(interval_s = options.poll_interval.as_secs()))]
pub async fn run_video<S>(
    service: &S,
    instruction: &str,
    source: &ReferenceImage,
    output_dir: &Path,
    options: &VideoJobOptions,
    mut on_poll: impl FnMut(&VideoOperation),
) -> StudioResult<PathBuf>
where
    S: GenerationService + ?Sized,
{
    let deadline_at = options.deadline.map(|d| Instant::now() + d);
    let timed_out = || StudioError::TimedOut(options.deadline.map_or(0, |d| d.as_secs()));

    let mut op = tokio::select! {
        _ = options.cancel.cancelled() => return Err(StudioError::Cancelled),
        _ = deadline_reached(deadline_at) => {
            warn!("video submission exceeded the deadline");
            return Err(timed_out());
        }
        r = service.start_video(instruction, source) => r?,
    };
    info!(operation = %op.name, "video job submitted");
    on_poll(&op);

    let mut polls: u32 = 0;
    while !op.done {
        tokio::select! {
            biased;
            _ = options.cancel.cancelled() => {
                warn!(operation = %op.name, polls, "video job cancelled");
                return Err(StudioError::Cancelled);
            }
            _ = deadline_reached(deadline_at) => {
                warn!(operation = %op.name, polls, "video job deadline exceeded");
                return Err(timed_out());
            }
            _ = tokio::time::sleep(options.poll_interval) => {}
        }

        op = tokio::select! {
            biased;
            _ = options.cancel.cancelled() => return Err(StudioError::Cancelled),
            _ = deadline_reached(deadline_at) => {
                warn!(operation = %op.name, polls, "video status fetch exceeded the deadline");
                return Err(timed_out());
            }
            r = service.get_video_operation(&op) => r?,
        };
        polls += 1;
        debug!(operation = %op.name, polls, done = op.done, "video job polled");
        on_poll(&op);
    }

    if let Some(err) = &op.error {
        let msg = err.message.as_deref().unwrap_or("unknown error");
        return Err(anyhow!("Video generation failed: {msg}").into());
    }

    let uri = op
        .video_uri()
        .ok_or_else(|| StudioError::Transport(anyhow!(NO_DOWNLOAD_LINK)))?;
    let bytes = service.fetch_asset(uri).await?;
    let path = materialize(output_dir, &bytes).await?;
    info!(path = %path.display(), polls, "video saved");
    Ok(path)
}

/// Resolves at `at`, or never when there is no deadline.
async fn deadline_reached(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn materialize(output_dir: &Path, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(output_dir)
        .await
        .context("create videos dir")?;
    let path = output_dir.join(format!("{}.mp4", Uuid::new_v4()));
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("write video {}", path.display()))?;
    Ok(path)
}
