use tracing::{error, info, instrument, warn};

use crate::gemini::{ContentResponse, GenerationService};
use crate::history::CENSORED_LABEL;
use crate::intake::ReferenceImage;
use crate::outcome::{Artifact, GenerationOutcome, CENSORED_MESSAGE};
use crate::prompt::ComposedPrompt;

pub const UPSCALE_INSTRUCTION: &str = "CRITICAL TASK: Upscale this image to a higher resolution. \
Enhance all details, making the image sharper and clearer. \
DO NOT change the artistic style, content, colors, or composition in any way. \
This is a technical enhancement only.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditStage {
    Editing,
    Upscaling,
}

/// Runs the edit call and, when it yields an image, the upscale pass.
///
/// Single attempt, no retries. A response without an image is `Censored` and
/// skips the upscale. An upscale without an image keeps the first-stage result.
#[instrument(skip_all, fields(images = prompt.images.len()))]
pub async fn run_edit<S>(
    service: &S,
    prompt: &ComposedPrompt,
    mut on_stage: impl FnMut(EditStage),
) -> GenerationOutcome
where
    S: GenerationService + ?Sized,
{
    on_stage(EditStage::Editing);
    let first = match service
        .generate_content(&prompt.images, &prompt.instruction)
        .await
    {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "edit call failed");
            return GenerationOutcome::failed(format!("{e:#}"));
        }
    };

    let Some(first_image) = first.image else {
        warn!(text = ?first.text, "edit call returned no image");
        return match prompt.images.first() {
            Some(preview) => GenerationOutcome::Censored {
                preview: preview.clone(),
                label: CENSORED_LABEL.to_string(),
                message: CENSORED_MESSAGE.to_string(),
            },
            None => GenerationOutcome::failed(CENSORED_MESSAGE),
        };
    };

    on_stage(EditStage::Upscaling);
    let upscaled = match upscale(service, &first_image).await {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "upscale call failed");
            return GenerationOutcome::failed(format!("{e:#}"));
        }
    };

    let (image, text) = match upscaled.image {
        Some(image) => {
            info!("upscaled image received");
            (image, upscaled.text.or(first.text))
        }
        None => {
            warn!("upscale returned no image, keeping first-stage result");
            (first_image, first.text)
        }
    };

    GenerationOutcome::Success {
        text,
        artifact: Artifact::Image(image),
    }
}

async fn upscale<S>(service: &S, image: &ReferenceImage) -> anyhow::Result<ContentResponse>
where
    S: GenerationService + ?Sized,
{
    // Same decode path as a fresh upload.
    let payload = ReferenceImage::from_data_url(&image.to_data_url())?;
    service
        .generate_content(std::slice::from_ref(&payload), UPSCALE_INSTRUCTION)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::fake::FakeService;
    use anyhow::{anyhow, Result};

    fn img(tag: u8) -> ReferenceImage {
        ReferenceImage::new(vec![tag], "image/png")
    }

    fn prompt() -> ComposedPrompt {
        ComposedPrompt {
            instruction: "composed".into(),
            images: vec![img(1), img(2)],
        }
    }

    fn reply(text: Option<&str>, image: Option<ReferenceImage>) -> Result<ContentResponse> {
        Ok(ContentResponse {
            text: text.map(str::to_string),
            image,
        })
    }

    #[tokio::test]
    async fn no_image_is_censored_and_skips_upscale() {
        let svc = FakeService::with_content(vec![reply(Some("declined"), None)]);
        let outcome = run_edit(&svc, &prompt(), |_| {}).await;

        match outcome {
            GenerationOutcome::Censored { preview, label, .. } => {
                assert_eq!(preview, img(1));
                assert_eq!(label, CENSORED_LABEL);
            }
            other => panic!("expected censored, got {other:?}"),
        }
        assert_eq!(svc.content_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn images_are_sent_in_order_then_upscaled() {
        let edited = ReferenceImage::new(vec![9, 9], "image/jpeg");
        let upscaled = ReferenceImage::new(vec![8, 8, 8], "image/png");
        let svc = FakeService::with_content(vec![
            reply(Some("first"), Some(edited.clone())),
            reply(Some("sharper"), Some(upscaled.clone())),
        ]);
        let mut stages = Vec::new();
        let outcome = run_edit(&svc, &prompt(), |s| stages.push(s)).await;

        assert_eq!(stages, vec![EditStage::Editing, EditStage::Upscaling]);
        assert_eq!(
            outcome,
            GenerationOutcome::Success {
                text: Some("sharper".into()),
                artifact: Artifact::Image(upscaled),
            }
        );
        let calls = svc.content_calls.lock().unwrap();
        assert_eq!(calls[0].0, vec![img(1), img(2)]);
        assert_eq!(calls[0].1, "composed");
        assert_eq!(calls[1].0, vec![edited]);
        assert_eq!(calls[1].1, UPSCALE_INSTRUCTION);
    }

    #[tokio::test]
    async fn empty_upscale_keeps_first_stage_image_and_text() {
        let edited = ReferenceImage::new(vec![5], "image/png");
        let svc = FakeService::with_content(vec![
            reply(Some("first text"), Some(edited.clone())),
            reply(Some("upscale chatter"), None),
        ]);
        let outcome = run_edit(&svc, &prompt(), |_| {}).await;
        assert_eq!(
            outcome,
            GenerationOutcome::Success {
                text: Some("first text".into()),
                artifact: Artifact::Image(edited),
            }
        );
    }

    #[tokio::test]
    async fn upscale_without_text_falls_back_to_first_text() {
        let svc = FakeService::with_content(vec![
            reply(Some("first text"), Some(img(3))),
            reply(None, Some(img(4))),
        ]);
        let outcome = run_edit(&svc, &prompt(), |_| {}).await;
        assert_eq!(
            outcome,
            GenerationOutcome::Success {
                text: Some("first text".into()),
                artifact: Artifact::Image(img(4)),
            }
        );
    }

    #[tokio::test]
    async fn transport_errors_become_failed_with_message() {
        let svc = FakeService::with_content(vec![Err(anyhow!("gemini error: HTTP 500"))]);
        let outcome = run_edit(&svc, &prompt(), |_| {}).await;
        assert_eq!(outcome, GenerationOutcome::failed("gemini error: HTTP 500"));

        let svc = FakeService::with_content(vec![
            reply(None, Some(img(3))),
            Err(anyhow!("connection reset")),
        ]);
        let outcome = run_edit(&svc, &prompt(), |_| {}).await;
        assert_eq!(outcome, GenerationOutcome::failed("connection reset"));
    }
}
