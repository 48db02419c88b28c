use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::intake::{GenerationMode, ReferenceImage};
use crate::outcome::{Artifact, GenerationOutcome};

pub const CENSORED_LABEL: &str = "Original Material";
pub const VIDEO_SUCCESS_LABEL: &str = "Sinister Animation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Image,
    Video,
}

impl From<GenerationMode> for EntryKind {
    fn from(mode: GenerationMode) -> Self {
        match mode {
            GenerationMode::ImageEdit => Self::Image,
            GenerationMode::VideoFromImage => Self::Video,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Success,
    Censored,
}

/// Something the UI can display for an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaRef {
    Image(ReferenceImage),
    /// A materialized video owned by the ledger; deleted when the entry goes.
    VideoFile(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: u64,
    pub created_at: String,
    pub kind: EntryKind,
    pub status: EntryStatus,
    pub media: MediaRef,
    pub label: Option<String>,
}

/// Process-local, most-recent-first record of generation attempts.
#[derive(Debug, Default)]
pub struct HistoryLedger {
    entries: Vec<HistoryEntry>,
    last_id: u64,
}

impl HistoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepends an entry and returns its id.
    pub fn append(
        &mut self,
        kind: EntryKind,
        status: EntryStatus,
        media: MediaRef,
        label: Option<String>,
    ) -> u64 {
        let id = self.next_id();
        self.entries.insert(
            0,
            HistoryEntry {
                id,
                created_at: now_iso(),
                kind,
                status,
                media,
                label,
            },
        );
        debug!(id, ?kind, ?status, "history entry recorded");
        id
    }

    /// Records an outcome. Failures are kept as censored entries showing
    /// `placeholder`, so the attempt stays visible without passing the
    /// original image off as output.
    pub fn record(
        &mut self,
        mode: GenerationMode,
        outcome: &GenerationOutcome,
        placeholder: &ReferenceImage,
    ) -> u64 {
        let kind = EntryKind::from(mode);
        match outcome {
            GenerationOutcome::Success {
                text,
                artifact: Artifact::Image(img),
            } => self.append(
                kind,
                EntryStatus::Success,
                MediaRef::Image(img.clone()),
                text.clone(),
            ),
            GenerationOutcome::Success {
                artifact: Artifact::Video(path),
                ..
            } => self.append(
                kind,
                EntryStatus::Success,
                MediaRef::VideoFile(path.clone()),
                Some(VIDEO_SUCCESS_LABEL.to_string()),
            ),
            GenerationOutcome::Censored { preview, label, .. } => self.append(
                kind,
                EntryStatus::Censored,
                MediaRef::Image(preview.clone()),
                Some(label.clone()),
            ),
            GenerationOutcome::Failed { .. } => self.append(
                kind,
                EntryStatus::Censored,
                MediaRef::Image(placeholder.clone()),
                Some(CENSORED_LABEL.to_string()),
            ),
        }
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn remove(&mut self, id: u64) -> Option<HistoryEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        let entry = self.entries.remove(pos);
        release(&entry.media);
        Some(entry)
    }

    pub fn clear(&mut self) {
        for entry in self.entries.drain(..) {
            release(&entry.media);
        }
    }

    // Millisecond clock, bumped so ids stay strictly increasing within a burst.
    fn next_id(&mut self) -> u64 {
        let now = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64;
        self.last_id = now.max(self.last_id + 1);
        self.last_id
    }
}

fn release(media: &MediaRef) {
    if let MediaRef::VideoFile(path) = media {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to release video file");
            }
        }
    }
}

pub fn now_iso() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
