pub mod edit;
pub mod error;
pub mod gemini;
pub mod history;
pub mod intake;
pub mod outcome;
pub mod prompt;
pub mod settings;
pub mod studio;
pub mod utils;
pub mod video;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::error::{StudioError, StudioResult};
pub use crate::history::{EntryKind, EntryStatus, HistoryEntry, MediaRef};
pub use crate::intake::{GenerationMode, ImageRole, ReferenceImage, RoleSet};
pub use crate::outcome::{Artifact, GenerationOutcome};
pub use crate::studio::{GenerationRequest, Studio, StudioStage, StudioState};

use crate::settings::{load_settings_from_dir, save_settings_to_dir, Settings};
use crate::utils::{ensure_data_dir, logs_dir};
use crate::video::loading_message;

#[derive(Debug, Parser)]
#[command(name = "conjure", version, about = "Reference-guided image edits and image-to-video")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Edit the subject using optional outfit, place and pose references.
    Edit(EditArgs),
    /// Animate the first subject image.
    Video(VideoArgs),
    /// Show or update stored settings.
    Settings(SettingsArgs),
}

#[derive(Debug, Args)]
struct EditArgs {
    /// Subject character image; repeat for more angles.
    #[arg(long = "subject")]
    subjects: Vec<PathBuf>,
    #[arg(long)]
    outfit: Option<PathBuf>,
    #[arg(long)]
    place: Option<PathBuf>,
    #[arg(long)]
    pose: Option<PathBuf>,
    #[arg(long, short)]
    prompt: String,
    /// Pose, size and composition hint.
    #[arg(long)]
    composition: Option<String>,
    /// Things to keep out of the result.
    #[arg(long)]
    negative: Option<String>,
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct VideoArgs {
    #[arg(long = "subject")]
    subjects: Vec<PathBuf>,
    #[arg(long, short)]
    prompt: String,
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct SettingsArgs {
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
    #[arg(long)]
    video_model: Option<String>,
    #[arg(long)]
    poll_interval_secs: Option<u64>,
    /// 0 polls without a deadline.
    #[arg(long)]
    poll_timeout_secs: Option<u64>,
}

// ===== Commands =====

async fn load_roles(
    subjects: &[PathBuf],
    outfit: Option<&Path>,
    place: Option<&Path>,
    pose: Option<&Path>,
) -> Result<RoleSet> {
    let mut roles = RoleSet::default();
    for path in subjects {
        roles.insert(ImageRole::Subject(vec![ReferenceImage::from_path(path).await?]));
    }
    if let Some(path) = outfit {
        roles.insert(ImageRole::Outfit(ReferenceImage::from_path(path).await?));
    }
    if let Some(path) = place {
        roles.insert(ImageRole::Place(ReferenceImage::from_path(path).await?));
    }
    if let Some(path) = pose {
        roles.insert(ImageRole::Pose(ReferenceImage::from_path(path).await?));
    }
    Ok(roles)
}

async fn edit(studio: &Studio, args: EditArgs) -> Result<()> {
    let roles = load_roles(
        &args.subjects,
        args.outfit.as_deref(),
        args.place.as_deref(),
        args.pose.as_deref(),
    )
    .await?;
    let request = GenerationRequest {
        mode: GenerationMode::ImageEdit,
        instruction: args.prompt,
        composition_hint: args.composition,
        negative: args.negative,
        roles,
    };

    let progress = spawn_progress(studio.state());
    let outcome = studio.submit_generation(request).await;
    progress.abort();
    report(outcome?, args.out).await
}

async fn video(studio: &Studio, args: VideoArgs) -> Result<()> {
    let roles = load_roles(&args.subjects, None, None, None).await?;
    let request = GenerationRequest {
        mode: GenerationMode::VideoFromImage,
        instruction: args.prompt,
        composition_hint: None,
        negative: None,
        roles,
    };

    let progress = spawn_progress(studio.state());
    let outcome = cancel_on_interrupt(
        studio,
        studio.submit_generation(request),
        tokio::signal::ctrl_c,
    )
    .await;
    progress.abort();
    report(outcome?, args.out).await
}

/// Drives `submit` to completion, cancelling the running video job on every
/// interrupt. An interrupt that lands before the job has started is retried
/// on the next one.
async fn cancel_on_interrupt<F, I, S>(
    studio: &Studio,
    submit: F,
    mut interrupted: I,
) -> Result<GenerationOutcome>
where
    F: Future<Output = StudioResult<GenerationOutcome>>,
    I: FnMut() -> S,
    S: Future<Output = std::io::Result<()>>,
{
    tokio::pin!(submit);
    loop {
        tokio::select! {
            biased;
            r = &mut submit => return Ok(r?),
            signal = interrupted() => {
                signal.context("listen for interrupt")?;
                if studio.cancel() {
                    warn!("interrupt received, cancelling video job");
                } else {
                    warn!("interrupt received before the video job started");
                }
            }
        }
    }
}

fn spawn_progress(mut state: watch::Receiver<StudioState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(Duration::from_secs(3));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let current = *state.borrow();
                    if let StudioState::InFlight { mode, stage } = current {
                        let line = match mode {
                            GenerationMode::VideoFromImage => loading_message(started.elapsed()),
                            GenerationMode::ImageEdit => stage.status_message(),
                        };
                        eprintln!("{line}");
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

async fn report(outcome: GenerationOutcome, out: Option<PathBuf>) -> Result<()> {
    match outcome {
        GenerationOutcome::Success {
            text,
            artifact: Artifact::Image(image),
        } => {
            let path = out.unwrap_or_else(|| {
                PathBuf::from(format!("conjure-{}.{}", uuid::Uuid::new_v4(), image.extension()))
            });
            tokio::fs::write(&path, image.bytes())
                .await
                .with_context(|| format!("write {}", path.display()))?;
            if let Some(text) = text {
                println!("{text}");
            }
            println!("{}", path.display());
            Ok(())
        }
        GenerationOutcome::Success {
            artifact: Artifact::Video(tmp),
            ..
        } => {
            let path = match out {
                Some(out) => {
                    tokio::fs::copy(&tmp, &out)
                        .await
                        .with_context(|| format!("copy video to {}", out.display()))?;
                    out
                }
                None => tmp,
            };
            println!("{}", path.display());
            Ok(())
        }
        GenerationOutcome::Censored { message, .. } => Err(anyhow!(message)),
        GenerationOutcome::Failed { message } => Err(anyhow!(message)),
    }
}

fn update_settings(data_dir: &Path, args: SettingsArgs) -> Result<()> {
    let mut settings = load_settings_from_dir(data_dir);
    let mut changed = false;
    let mut apply = |slot: &mut Option<String>, value: Option<String>| {
        if let Some(v) = value {
            *slot = Some(v);
            changed = true;
        }
    };
    apply(&mut settings.gemini_api_key, args.api_key);
    apply(&mut settings.api_base, args.api_base);
    apply(&mut settings.image_model, args.image_model);
    apply(&mut settings.video_model, args.video_model);
    if let Some(v) = args.poll_interval_secs {
        settings.video_poll_interval_secs = Some(v);
        changed = true;
    }
    if let Some(v) = args.poll_timeout_secs {
        settings.video_poll_timeout_secs = Some(v);
        changed = true;
    }

    if changed {
        save_settings_to_dir(data_dir, &settings)?;
        info!("settings saved");
    }
    print_settings(&settings);
    Ok(())
}

fn print_settings(s: &Settings) {
    let key = match s.resolve_api_key() {
        Ok(k) if k.chars().count() > 4 => {
            let tail: String = k.chars().skip(k.chars().count() - 4).collect();
            format!("...{tail}")
        }
        Ok(_) => "set".to_string(),
        Err(_) => "missing".to_string(),
    };
    println!("api key:       {key}");
    println!("api base:      {}", s.api_base());
    println!("image model:   {}", s.image_model());
    println!("video model:   {}", s.video_model());
    println!("poll interval: {}s", s.poll_interval().as_secs());
    match s.poll_deadline() {
        Some(d) => println!("poll timeout:  {}s", d.as_secs()),
        None => println!("poll timeout:  none"),
    }
}

// ===== Startup and Main =====

fn init_tracing(data_dir: &Path) -> Result<WorkerGuard> {
    let appender = tracing_appender::rolling::daily(logs_dir(data_dir), "conjure.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("conjure=info,conjure_lib=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()
        .map_err(|e| anyhow!("init tracing: {e}"))?;
    Ok(guard)
}

fn open_studio(data_dir: &Path) -> Result<Studio> {
    let settings = load_settings_from_dir(data_dir);
    Ok(Studio::from_settings(&settings, data_dir)?)
}

async fn dispatch(cli: Cli, data_dir: &Path) -> Result<()> {
    match cli.command {
        Command::Settings(args) => update_settings(data_dir, args),
        Command::Edit(args) => edit(&open_studio(data_dir)?, args).await,
        Command::Video(args) => video(&open_studio(data_dir)?, args).await,
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = ensure_data_dir()?;
    let _log_guard = init_tracing(&data_dir)?;
    info!(data_dir = %data_dir.display(), "conjure starting");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(dispatch(cli, &data_dir))
}
