use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::StudioError;
use crate::intake::ReferenceImage;
use crate::settings::Settings;

/// What one `generateContent` call produced. Either part may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentResponse {
    pub text: Option<String>,
    pub image: Option<ReferenceImage>,
}

/// A long-running video job as reported by the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoOperation {
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<VideoOperationResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoOperationResponse {
    #[serde(default)]
    pub generate_video_response: Option<GenerateVideoResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateVideoResponse {
    #[serde(default)]
    pub generated_samples: Vec<GeneratedSample>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedSample {
    #[serde(default)]
    pub video: Option<VideoFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFile {
    #[serde(default)]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl VideoOperation {
    /// URI of the first produced video, if the job finished with one.
    pub fn video_uri(&self) -> Option<&str> {
        self.response
            .as_ref()?
            .generate_video_response
            .as_ref()?
            .generated_samples
            .iter()
            .filter_map(|s| s.video.as_ref()?.uri.as_deref())
            .find(|u| !u.is_empty())
    }
}

/// The remote generation backend. Orchestrators only talk to this seam.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Images in the given order, then `instruction` as the final part.
    async fn generate_content(
        &self,
        images: &[ReferenceImage],
        instruction: &str,
    ) -> Result<ContentResponse>;

    async fn start_video(&self, instruction: &str, image: &ReferenceImage)
        -> Result<VideoOperation>;

    async fn get_video_operation(&self, op: &VideoOperation) -> Result<VideoOperation>;

    async fn fetch_asset(&self, uri: &str) -> Result<Vec<u8>>;
}

// ===== Wire types =====

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart {
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
    Text {
        text: String,
    },
}

#[derive(Debug, Serialize)]
struct ContentRequest {
    role: &'static str,
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentBody {
    contents: Vec<ContentRequest>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineDataResponse {
    #[serde(alias = "mime_type")]
    mime_type: Option<String>,
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartResponse {
    text: Option<String>,
    #[serde(alias = "inline_data")]
    inline_data: Option<InlineDataResponse>,
}

#[derive(Debug, Deserialize)]
struct ContentResponseBody {
    parts: Option<Vec<PartResponse>>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<ContentResponseBody>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoImage {
    bytes_base64_encoded: String,
    mime_type: String,
}

#[derive(Debug, Serialize)]
struct VideoInstance {
    prompt: String,
    image: VideoImage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoParameters {
    sample_count: u32,
}

#[derive(Debug, Serialize)]
struct PredictLongRunningBody {
    instances: Vec<VideoInstance>,
    parameters: VideoParameters,
}

fn parse_content_response(body: GenerateContentResponse) -> Result<ContentResponse> {
    let mut out = ContentResponse::default();
    let parts = body
        .candidates
        .and_then(|c| c.into_iter().next())
        .and_then(|c| c.content)
        .and_then(|c| c.parts)
        .unwrap_or_default();

    // Order is not guaranteed; scan everything, last of each kind wins.
    for part in parts {
        if let Some(text) = part.text.filter(|t| !t.is_empty()) {
            out.text = Some(text);
        } else if let Some(inline) = part.inline_data {
            let Some(data) = inline.data.filter(|d| !d.is_empty()) else {
                continue;
            };
            let mime = inline.mime_type.unwrap_or_else(|| "image/png".to_string());
            let image = ReferenceImage::from_base64(&data, mime)
                .context("gemini image base64 decode failed")?;
            out.image = Some(image);
        }
    }
    Ok(out)
}

fn with_key(uri: &str, api_key: &str) -> String {
    let sep = if uri.contains('?') { '&' } else { '?' };
    format!("{uri}{sep}key={api_key}")
}

async fn error_for_status(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(300).collect();
    if excerpt.trim().is_empty() {
        Err(anyhow!("{what}: HTTP {status}"))
    } else {
        Err(anyhow!("{what}: HTTP {status}: {}", excerpt.trim()))
    }
}

/// REST client for the Gemini image and Veo video endpoints.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    api_base: String,
    image_model: String,
    video_model: String,
}

impl std::fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiClient")
            .field("api_base", &self.api_base)
            .field("image_model", &self.image_model)
            .field("video_model", &self.video_model)
            .finish()
    }
}

impl GeminiClient {
    pub fn from_settings(settings: &Settings) -> Result<Self, StudioError> {
        let api_key = settings.resolve_api_key()?;
        Ok(Self {
            http: reqwest::Client::new(),
            api_key,
            api_base: settings.api_base(),
            image_model: settings.image_model(),
            video_model: settings.video_model(),
        })
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        let model = model.trim();
        let path = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{model}")
        };
        format!("{}/{}:{}", self.api_base, path, method)
    }
}

#[async_trait]
impl GenerationService for GeminiClient {
    #[instrument(skip_all, fields(model = %self.image_model, images = images.len()))]
    async fn generate_content(
        &self,
        images: &[ReferenceImage],
        instruction: &str,
    ) -> Result<ContentResponse> {
        let mut parts: Vec<RequestPart> = images
            .iter()
            .map(|img| RequestPart::Inline {
                inline_data: InlineData {
                    mime_type: img.mime_type().to_string(),
                    data: img.to_base64(),
                },
            })
            .collect();
        // The instruction is always last.
        parts.push(RequestPart::Text {
            text: instruction.to_string(),
        });

        let body = GenerateContentBody {
            contents: vec![ContentRequest { role: "user", parts }],
            generation_config: GenerationConfig {
                response_modalities: vec!["IMAGE", "TEXT"],
            },
        };

        let resp = self
            .http
            .post(self.model_url(&self.image_model, "generateContent"))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("gemini image request failed")?;
        let resp = error_for_status(resp, "gemini error").await?;

        let value: GenerateContentResponse =
            resp.json().await.context("gemini image parse error")?;
        let out = parse_content_response(value)?;
        debug!(
            has_text = out.text.is_some(),
            has_image = out.image.is_some(),
            "gemini content response"
        );
        Ok(out)
    }

    #[instrument(skip_all, fields(model = %self.video_model))]
    async fn start_video(
        &self,
        instruction: &str,
        image: &ReferenceImage,
    ) -> Result<VideoOperation> {
        let body = PredictLongRunningBody {
            instances: vec![VideoInstance {
                prompt: instruction.to_string(),
                image: VideoImage {
                    bytes_base64_encoded: image.to_base64(),
                    mime_type: image.mime_type().to_string(),
                },
            }],
            parameters: VideoParameters { sample_count: 1 },
        };

        let resp = self
            .http
            .post(self.model_url(&self.video_model, "predictLongRunning"))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("video generation request failed")?;
        let resp = error_for_status(resp, "video generation error").await?;
        let op: VideoOperation = resp.json().await.context("video operation parse error")?;
        if op.name.is_empty() {
            return Err(anyhow!("video generation returned no operation name"));
        }
        Ok(op)
    }

    #[instrument(skip_all, fields(operation = %op.name))]
    async fn get_video_operation(&self, op: &VideoOperation) -> Result<VideoOperation> {
        let url = format!("{}/{}", self.api_base, op.name.trim_start_matches('/'));
        let resp = self
            .http
            .get(url)
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .context("video status request failed")?;
        let resp = error_for_status(resp, "video status error").await?;
        resp.json().await.context("video operation parse error")
    }

    async fn fetch_asset(&self, uri: &str) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(with_key(uri, &self.api_key))
            .send()
            .await
            .context("video download request failed")?;
        if !resp.status().is_success() {
            return Err(anyhow!(
                "Failed to download the generated video. Status: {}",
                resp.status()
            ));
        }

        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| anyhow!("video download stream error: {e}"))?;
            bytes.extend_from_slice(&chunk);
        }
        debug!(len = bytes.len(), "video asset downloaded");
        Ok(bytes)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted stand-in for the remote service that records every call.
    #[derive(Default)]
    pub(crate) struct FakeService {
        pub content: Mutex<VecDeque<Result<ContentResponse>>>,
        pub content_calls: Mutex<Vec<(Vec<ReferenceImage>, String)>>,
        pub operations: Mutex<VecDeque<Result<VideoOperation>>>,
        pub video_starts: Mutex<Vec<(String, ReferenceImage)>>,
        pub status_calls: Mutex<usize>,
        pub asset: Mutex<Option<Result<Vec<u8>>>>,
        pub asset_uris: Mutex<Vec<String>>,
        /// Holds every status fetch for this long before answering.
        pub status_delay: Option<std::time::Duration>,
    }

    impl FakeService {
        pub fn with_content(responses: Vec<Result<ContentResponse>>) -> Self {
            Self {
                content: Mutex::new(responses.into()),
                ..Self::default()
            }
        }

        pub fn with_operations(ops: Vec<Result<VideoOperation>>, asset: Result<Vec<u8>>) -> Self {
            Self {
                operations: Mutex::new(ops.into()),
                asset: Mutex::new(Some(asset)),
                ..Self::default()
            }
        }

        pub fn total_calls(&self) -> usize {
            self.content_calls.lock().unwrap().len()
                + self.video_starts.lock().unwrap().len()
                + *self.status_calls.lock().unwrap()
                + self.asset_uris.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl GenerationService for FakeService {
        async fn generate_content(
            &self,
            images: &[ReferenceImage],
            instruction: &str,
        ) -> Result<ContentResponse> {
            self.content_calls
                .lock()
                .unwrap()
                .push((images.to_vec(), instruction.to_string()));
            self.content
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ContentResponse::default()))
        }

        async fn start_video(
            &self,
            instruction: &str,
            image: &ReferenceImage,
        ) -> Result<VideoOperation> {
            self.video_starts
                .lock()
                .unwrap()
                .push((instruction.to_string(), image.clone()));
            self.operations
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("no scripted operation")))
        }

        async fn get_video_operation(&self, _op: &VideoOperation) -> Result<VideoOperation> {
            *self.status_calls.lock().unwrap() += 1;
            if let Some(delay) = self.status_delay {
                tokio::time::sleep(delay).await;
            }
            self.operations
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("no scripted operation")))
        }

        async fn fetch_asset(&self, uri: &str) -> Result<Vec<u8>> {
            self.asset_uris.lock().unwrap().push(uri.to_string());
            self.asset
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Err(anyhow!("no scripted asset")))
        }
    }
}
