use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// An image captured from the user, held entirely in memory.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceImage {
    bytes: Vec<u8>,
    mime_type: String,
}

impl fmt::Debug for ReferenceImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceImage")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl ReferenceImage {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("read reference image {}", path.display()))?;
        if bytes.is_empty() {
            return Err(anyhow!("reference image {} is empty", path.display()));
        }
        let mime_type = sniff_mime_type(&bytes)
            .or_else(|| mime_from_extension(path))
            .unwrap_or("image/png");
        Ok(Self::new(bytes, mime_type))
    }

    pub fn from_base64(data: &str, mime_type: impl Into<String>) -> Result<Self> {
        let bytes = B64
            .decode(data.trim())
            .map_err(|e| anyhow!("base64 decode: {e}"))?;
        Ok(Self::new(bytes, mime_type))
    }

    /// Parses `data:<mime>;base64,<payload>`.
    pub fn from_data_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("data:")
            .ok_or_else(|| anyhow!("Invalid image data URL format"))?;
        let (mime_type, payload) = rest
            .split_once(";base64,")
            .filter(|(m, p)| !m.is_empty() && !p.is_empty())
            .ok_or_else(|| anyhow!("Invalid image data URL format"))?;
        Self::from_base64(payload, mime_type)
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }

    pub fn to_base64(&self) -> String {
        B64.encode(&self.bytes)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn extension(&self) -> &'static str {
        guess_extension(&self.bytes)
    }
}

/// Which generation path a request takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMode {
    ImageEdit,
    VideoFromImage,
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ImageEdit => write!(f, "image"),
            Self::VideoFromImage => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRole {
    Subject(Vec<ReferenceImage>),
    Outfit(ReferenceImage),
    Place(ReferenceImage),
    Pose(ReferenceImage),
}

/// The role-tagged images of one request. Subject order is capture order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleSet {
    pub subjects: Vec<ReferenceImage>,
    pub outfit: Option<ReferenceImage>,
    pub place: Option<ReferenceImage>,
    pub pose: Option<ReferenceImage>,
}

impl RoleSet {
    pub fn with_subjects(subjects: Vec<ReferenceImage>) -> Self {
        Self {
            subjects,
            ..Self::default()
        }
    }

    /// Later roles replace earlier ones of the same kind; subject images accumulate.
    pub fn from_roles(roles: impl IntoIterator<Item = ImageRole>) -> Self {
        let mut set = Self::default();
        for role in roles {
            set.insert(role);
        }
        set
    }

    pub fn insert(&mut self, role: ImageRole) {
        match role {
            ImageRole::Subject(images) => self.subjects.extend(images),
            ImageRole::Outfit(img) => self.outfit = Some(img),
            ImageRole::Place(img) => self.place = Some(img),
            ImageRole::Pose(img) => self.pose = Some(img),
        }
    }

    /// Video requests only ever use the subject images.
    pub fn for_mode(self, mode: GenerationMode) -> Self {
        match mode {
            GenerationMode::ImageEdit => self,
            GenerationMode::VideoFromImage => Self::with_subjects(self.subjects),
        }
    }

    pub fn first_subject(&self) -> Option<&ReferenceImage> {
        self.subjects.first()
    }
}

fn sniff_mime_type(bytes: &[u8]) -> Option<&'static str> {
    match guess_known_extension(bytes)? {
        "png" => Some("image/png"),
        "jpg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

fn mime_from_extension(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "heic" => Some("image/heic"),
        _ => None,
    }
}

fn guess_known_extension(bytes: &[u8]) -> Option<&'static str> {
    // PNG
    if bytes.len() >= 8 && bytes[0..8] == [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A] {
        return Some("png");
    }
    // JPEG
    if bytes.len() >= 3 && bytes[0..3] == [0xFF, 0xD8, 0xFF] {
        return Some("jpg");
    }
    // WEBP (RIFF....WEBP)
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("webp");
    }
    if bytes.len() >= 6 && (&bytes[0..6] == b"GIF87a" || &bytes[0..6] == b"GIF89a") {
        return Some("gif");
    }
    None
}

pub fn guess_extension(bytes: &[u8]) -> &'static str {
    guess_known_extension(bytes).unwrap_or("png")
}
