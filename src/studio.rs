use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::edit::{run_edit, EditStage};
use crate::error::{StudioError, StudioResult};
use crate::gemini::{GeminiClient, GenerationService};
use crate::history::{HistoryEntry, HistoryLedger};
use crate::intake::{GenerationMode, RoleSet};
use crate::outcome::{Artifact, GenerationOutcome};
use crate::prompt::compose;
use crate::settings::Settings;
use crate::utils::videos_dir;
use crate::video::{run_video, VideoJobOptions, VIDEO_LOADING_MESSAGES};

pub const MISSING_INPUT_MESSAGE: &str =
    "A prompt and at least one source character image are required to conjure your vision.";

/// One user action. Built fresh per submission and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub mode: GenerationMode,
    pub instruction: String,
    pub composition_hint: Option<String>,
    pub negative: Option<String>,
    pub roles: RoleSet,
}

impl GenerationRequest {
    pub fn validate(&self) -> StudioResult<()> {
        if self.instruction.trim().is_empty() || self.roles.subjects.is_empty() {
            return Err(StudioError::validation(MISSING_INPUT_MESSAGE));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudioStage {
    Editing,
    Upscaling,
    VideoSubmitted,
    VideoPolling { polls: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudioState {
    Idle,
    InFlight {
        mode: GenerationMode,
        stage: StudioStage,
    },
}

impl StudioStage {
    pub fn status_message(&self) -> &'static str {
        match self {
            Self::Editing => "Applying malignant makeover...",
            Self::Upscaling => "Enhancing wicked details...",
            Self::VideoSubmitted | Self::VideoPolling { .. } => VIDEO_LOADING_MESSAGES[0],
        }
    }
}

impl StudioState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// Returns the studio to `Idle` however the request ends.
struct InFlightGuard<'a> {
    studio: &'a Studio,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.studio.lock_cancel().take();
        self.studio.state.send_replace(StudioState::Idle);
    }
}

/// The surface a UI drives: submit requests, watch state, read history.
pub struct Studio {
    service: Arc<dyn GenerationService>,
    videos_dir: PathBuf,
    poll_interval: Duration,
    poll_deadline: Option<Duration>,
    state: watch::Sender<StudioState>,
    history: Mutex<HistoryLedger>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Studio {
    pub fn new(service: Arc<dyn GenerationService>, videos_dir: PathBuf) -> Self {
        let defaults = VideoJobOptions::default();
        let (state, _) = watch::channel(StudioState::Idle);
        Self {
            service,
            videos_dir,
            poll_interval: defaults.poll_interval,
            poll_deadline: defaults.deadline,
            state,
            history: Mutex::new(HistoryLedger::new()),
            cancel: Mutex::new(None),
        }
    }

    /// Fails when no credential is configured.
    pub fn from_settings(settings: &Settings, data_dir: &Path) -> StudioResult<Self> {
        let client = GeminiClient::from_settings(settings)?;
        Ok(Self::new(Arc::new(client), videos_dir(data_dir))
            .with_video_timing(settings.poll_interval(), settings.poll_deadline()))
    }

    pub fn with_video_timing(mut self, interval: Duration, deadline: Option<Duration>) -> Self {
        self.poll_interval = interval;
        self.poll_deadline = deadline;
        self
    }

    pub fn state(&self) -> watch::Receiver<StudioState> {
        self.state.subscribe()
    }

    /// Validation and busy errors come back as `Err` without touching the
    /// network or the history. Everything else is an outcome, and is recorded.
    #[instrument(skip_all, fields(mode = %request.mode))]
    pub async fn submit_generation(
        &self,
        request: GenerationRequest,
    ) -> StudioResult<GenerationOutcome> {
        request.validate()?;
        let _guard = self.begin(request.mode)?;

        let GenerationRequest {
            mode,
            instruction,
            composition_hint,
            negative,
            roles,
        } = request;
        let roles = roles.for_mode(mode);
        let Some(placeholder) = roles.first_subject().cloned() else {
            return Err(StudioError::validation(MISSING_INPUT_MESSAGE));
        };

        let outcome = match mode {
            GenerationMode::ImageEdit => {
                let prompt = compose(
                    &roles,
                    &instruction,
                    composition_hint.as_deref(),
                    negative.as_deref(),
                );
                run_edit(self.service.as_ref(), &prompt, |stage| {
                    self.set_stage(match stage {
                        EditStage::Editing => StudioStage::Editing,
                        EditStage::Upscaling => StudioStage::Upscaling,
                    })
                })
                .await
            }
            GenerationMode::VideoFromImage => {
                let options = VideoJobOptions {
                    poll_interval: self.poll_interval,
                    deadline: self.poll_deadline,
                    cancel: CancellationToken::new(),
                };
                *self.lock_cancel() = Some(options.cancel.clone());

                let mut reports: u32 = 0;
                let result = run_video(
                    self.service.as_ref(),
                    &instruction,
                    &placeholder,
                    &self.videos_dir,
                    &options,
                    |_| {
                        self.set_stage(match reports {
                            0 => StudioStage::VideoSubmitted,
                            polls => StudioStage::VideoPolling { polls },
                        });
                        reports += 1;
                    },
                )
                .await;
                match result {
                    Ok(path) => GenerationOutcome::Success {
                        text: None,
                        artifact: Artifact::Video(path),
                    },
                    Err(e) => GenerationOutcome::failed(format!("{e:#}")),
                }
            }
        };

        match &outcome {
            GenerationOutcome::Success { .. } => info!("generation succeeded"),
            GenerationOutcome::Censored { .. } => warn!("generation censored"),
            GenerationOutcome::Failed { message } => warn!(%message, "generation failed"),
        }
        self.lock_history().record(mode, &outcome, &placeholder);
        Ok(outcome)
    }

    /// Cancels an in-flight video job. Returns whether there was one.
    pub fn cancel(&self) -> bool {
        match self.lock_cancel().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.lock_history().entries().to_vec()
    }

    pub fn clear_history(&self) {
        self.lock_history().clear();
    }

    pub fn remove_history_entry(&self, id: u64) -> bool {
        self.lock_history().remove(id).is_some()
    }

    fn begin(&self, mode: GenerationMode) -> StudioResult<InFlightGuard<'_>> {
        let started = self.state.send_if_modified(|s| {
            if s.is_idle() {
                *s = StudioState::InFlight {
                    mode,
                    stage: match mode {
                        GenerationMode::ImageEdit => StudioStage::Editing,
                        GenerationMode::VideoFromImage => StudioStage::VideoSubmitted,
                    },
                };
                true
            } else {
                false
            }
        });
        if !started {
            return Err(StudioError::Busy);
        }
        Ok(InFlightGuard { studio: self })
    }

    fn set_stage(&self, new_stage: StudioStage) {
        self.state.send_modify(|s| {
            if let StudioState::InFlight { stage, .. } = s {
                *stage = new_stage;
            }
        });
    }

    fn lock_history(&self) -> MutexGuard<'_, HistoryLedger> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_cancel(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::fake::FakeService;
    use crate::gemini::{
        ContentResponse, GenerateVideoResponse, GeneratedSample, VideoFile, VideoOperation,
        VideoOperationResponse,
    };
    use crate::history::{EntryKind, EntryStatus, MediaRef, CENSORED_LABEL, VIDEO_SUCCESS_LABEL};
    use crate::intake::ReferenceImage;
    use anyhow::anyhow;

    fn img(tag: u8) -> ReferenceImage {
        ReferenceImage::new(vec![tag], "image/png")
    }

    fn studio(svc: Arc<FakeService>, dir: &Path) -> Studio {
        Studio::new(svc, dir.join("videos"))
    }

    fn request(mode: GenerationMode, instruction: &str, roles: RoleSet) -> GenerationRequest {
        GenerationRequest {
            mode,
            instruction: instruction.to_string(),
            composition_hint: None,
            negative: None,
            roles,
        }
    }

    fn done_op(uri: &str) -> anyhow::Result<VideoOperation> {
        Ok(VideoOperation {
            name: "operations/v".into(),
            done: true,
            response: Some(VideoOperationResponse {
                generate_video_response: Some(GenerateVideoResponse {
                    generated_samples: vec![GeneratedSample {
                        video: Some(VideoFile {
                            uri: Some(uri.into()),
                        }),
                    }],
                }),
            }),
            error: None,
        })
    }

    #[tokio::test]
    async fn missing_inputs_never_reach_the_network() {
        let svc = Arc::new(FakeService::default());
        let dir = tempfile::tempdir().unwrap();
        let studio = studio(svc.clone(), dir.path());

        let cases = [
            request(GenerationMode::ImageEdit, "do it", RoleSet::default()),
            request(GenerationMode::ImageEdit, "", RoleSet::with_subjects(vec![img(1)])),
            request(GenerationMode::ImageEdit, "   ", RoleSet::with_subjects(vec![img(1)])),
            request(GenerationMode::VideoFromImage, "move", RoleSet::default()),
        ];
        for req in cases {
            let err = studio.submit_generation(req).await.unwrap_err();
            assert!(matches!(err, StudioError::Validation(_)));
        }
        assert_eq!(svc.total_calls(), 0);
        assert!(studio.history().is_empty());
        assert!(studio.state().borrow().is_idle());
    }

    #[tokio::test]
    async fn image_edit_composes_records_and_returns_to_idle() {
        let result = ReferenceImage::new(vec![42], "image/png");
        let svc = Arc::new(FakeService::with_content(vec![
            Ok(ContentResponse {
                text: Some("voila".into()),
                image: Some(img(40)),
            }),
            Ok(ContentResponse {
                text: None,
                image: Some(result.clone()),
            }),
        ]));
        let dir = tempfile::tempdir().unwrap();
        let studio = studio(svc.clone(), dir.path());
        let roles = RoleSet {
            subjects: vec![img(1), img(2)],
            pose: Some(img(3)),
            ..RoleSet::default()
        };
        let mut req = request(GenerationMode::ImageEdit, "add a monocle", roles);
        req.negative = Some("puppies".into());

        let outcome = studio.submit_generation(req).await.unwrap();
        assert!(outcome.is_success());

        let calls = svc.content_calls.lock().unwrap();
        assert_eq!(calls[0].0, vec![img(1), img(2), img(3)]);
        assert!(calls[0].1.contains("- Image 3 is the **POSE REFERENCE**"));
        assert!(calls[0].1.ends_with("add a monocle --- DO NOT INCLUDE THE FOLLOWING: puppies"));

        let history = studio.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, EntryStatus::Success);
        assert_eq!(history[0].media, MediaRef::Image(result));
        assert_eq!(history[0].label.as_deref(), Some("voila"));
        assert!(studio.state().borrow().is_idle());
    }

    #[tokio::test]
    async fn censored_and_failed_are_both_recorded_with_first_subject() {
        let svc = Arc::new(FakeService::with_content(vec![
            Ok(ContentResponse {
                text: Some("no".into()),
                image: None,
            }),
            Err(anyhow!("gemini error: HTTP 503")),
        ]));
        let dir = tempfile::tempdir().unwrap();
        let studio = studio(svc.clone(), dir.path());
        let roles = RoleSet::with_subjects(vec![img(7), img(8)]);

        let censored = studio
            .submit_generation(request(GenerationMode::ImageEdit, "x", roles.clone()))
            .await
            .unwrap();
        assert!(matches!(censored, GenerationOutcome::Censored { .. }));
        assert_eq!(svc.content_calls.lock().unwrap().len(), 1);

        let failed = studio
            .submit_generation(request(GenerationMode::ImageEdit, "x", roles))
            .await
            .unwrap();
        assert_eq!(failed.user_message(), Some("gemini error: HTTP 503"));

        let history = studio.history();
        assert_eq!(history.len(), 2);
        for entry in &history {
            assert_eq!(entry.status, EntryStatus::Censored);
            assert_eq!(entry.media, MediaRef::Image(img(7)));
            assert_eq!(entry.label.as_deref(), Some(CENSORED_LABEL));
        }
        assert!(history[0].id > history[1].id);
        assert!(studio.state().borrow().is_idle());
    }

    #[tokio::test]
    async fn second_request_while_in_flight_is_busy() {
        let svc = Arc::new(FakeService::default());
        let dir = tempfile::tempdir().unwrap();
        let studio = studio(svc.clone(), dir.path());

        let guard = studio.begin(GenerationMode::ImageEdit).unwrap();
        let err = studio
            .submit_generation(request(
                GenerationMode::ImageEdit,
                "x",
                RoleSet::with_subjects(vec![img(1)]),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StudioError::Busy));
        assert_eq!(svc.total_calls(), 0);

        drop(guard);
        assert!(studio.state().borrow().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn video_uses_raw_instruction_and_first_subject_only() {
        let svc = Arc::new(FakeService::with_operations(
            vec![
                Ok(VideoOperation {
                    name: "operations/v".into(),
                    ..VideoOperation::default()
                }),
                done_op("https://h/v?alt=media"),
            ],
            Ok(b"clip".to_vec()),
        ));
        let dir = tempfile::tempdir().unwrap();
        let studio = studio(svc.clone(), dir.path());
        let roles = RoleSet {
            subjects: vec![img(1), img(2)],
            outfit: Some(img(3)),
            ..RoleSet::default()
        };
        let mut req = request(GenerationMode::VideoFromImage, "lightning strike", roles);
        req.negative = Some("sunshine".into());

        let outcome = studio.submit_generation(req).await.unwrap();
        let GenerationOutcome::Success {
            artifact: Artifact::Video(path),
            ..
        } = &outcome
        else {
            panic!("expected a video, got {outcome:?}");
        };
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"clip");
        assert!(path.starts_with(dir.path().join("videos")));

        let starts = svc.video_starts.lock().unwrap();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].0, "lightning strike");
        assert_eq!(starts[0].1, img(1));

        let history = studio.history();
        assert_eq!(history[0].kind, EntryKind::Video);
        assert_eq!(history[0].label.as_deref(), Some(VIDEO_SUCCESS_LABEL));

        studio.clear_history();
        assert!(studio.history().is_empty());
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_a_running_video_job() {
        let svc = Arc::new(FakeService::with_operations(
            vec![Ok(VideoOperation {
                name: "operations/v".into(),
                ..VideoOperation::default()
            })],
            Ok(vec![]),
        ));
        let dir = tempfile::tempdir().unwrap();
        let studio = studio(svc.clone(), dir.path());
        assert!(!studio.cancel());

        let req = request(
            GenerationMode::VideoFromImage,
            "move",
            RoleSet::with_subjects(vec![img(1)]),
        );
        let (outcome, cancelled) = tokio::join!(studio.submit_generation(req), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            studio.cancel()
        });

        assert!(cancelled);
        assert_eq!(
            outcome.unwrap(),
            GenerationOutcome::failed("video generation cancelled")
        );
        assert_eq!(*svc.status_calls.lock().unwrap(), 0);
        assert_eq!(studio.history()[0].status, EntryStatus::Censored);
        assert!(studio.state().borrow().is_idle());
        assert!(!studio.cancel());
    }
}
