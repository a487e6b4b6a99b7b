//! Per-user profiles: what the engine remembers between runs, and two stores.
//!
//! The engine only ever sees [`ProfileBlob`]s through the [`ProfileStore`]
//! trait; [`UserProfile`] is the shape this crate writes into them.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use quill_coordination::TerminalReason;

use crate::collaborators::{ProfileBlob, ProfileStore, ProfileStoreError};

/// Characters of the final artifact kept for seeding the next run.
const ARTIFACT_KEEP_CHARS: usize = 4_000;

/// What the engine remembers about a user.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub runs: u32,
    pub last_run_id: Option<String>,
    pub last_terminal_reason: Option<TerminalReason>,
    /// Short summary of the last final artifact.
    pub last_summary: Option<String>,
    /// Leading part of the last final artifact, offered to the next run.
    pub last_artifact: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl UserProfile {
    /// Read a blob leniently: unknown or malformed content yields an empty profile.
    pub fn from_blob(blob: &ProfileBlob) -> Self {
        match serde_json::from_value(blob.0.clone()) {
            Ok(profile) => profile,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable profile blob");
                Self::default()
            }
        }
    }

    pub fn to_blob(&self) -> ProfileBlob {
        ProfileBlob(serde_json::to_value(self).unwrap_or_default())
    }

    /// Fold one finished run into the profile.
    pub fn record_run(
        &mut self,
        run_id: &str,
        reason: TerminalReason,
        final_text: Option<&str>,
        summary: Option<String>,
    ) {
        self.runs += 1;
        self.last_run_id = Some(run_id.to_string());
        self.last_terminal_reason = Some(reason);
        if let Some(text) = final_text {
            self.last_artifact = Some(text.chars().take(ARTIFACT_KEEP_CHARS).collect());
            self.last_summary = summary;
        }
        self.updated_at = Some(Utc::now());
    }

    /// Text exposed to stages under the `profile` seed key.
    pub fn seed_text(&self) -> Option<String> {
        self.last_artifact
            .as_ref()
            .filter(|text| !text.trim().is_empty())
            .cloned()
    }
}

/// Process-local store; profiles live as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryProfileStore {
    blobs: RwLock<HashMap<String, ProfileBlob>>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn get(&self, user_id: &str) -> Result<Option<ProfileBlob>, ProfileStoreError> {
        Ok(self.blobs.read().await.get(user_id).cloned())
    }

    async fn put(&self, user_id: &str, blob: ProfileBlob) -> Result<(), ProfileStoreError> {
        self.blobs.write().await.insert(user_id.to_string(), blob);
        Ok(())
    }
}

/// One JSON file per user under a directory.
#[derive(Debug, Clone)]
pub struct DirProfileStore {
    dir: PathBuf,
}

impl DirProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, user_id: &str) -> Result<PathBuf, ProfileStoreError> {
        let valid = !user_id.is_empty()
            && user_id.len() <= 128
            && user_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !user_id.starts_with('.');
        if !valid {
            return Err(ProfileStoreError::InvalidUserId(user_id.to_string()));
        }
        Ok(self.dir.join(format!("{user_id}.json")))
    }
}

#[async_trait]
impl ProfileStore for DirProfileStore {
    async fn get(&self, user_id: &str) -> Result<Option<ProfileBlob>, ProfileStoreError> {
        let path = self.path_for(user_id)?;
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ProfileStoreError::Io {
                    user_id: user_id.to_string(),
                    source,
                })
            }
        };
        let value = serde_json::from_str(&text).map_err(|e| ProfileStoreError::Corrupt {
            user_id: user_id.to_string(),
            message: e.to_string(),
        })?;
        debug!(user_id, path = %path.display(), "Loaded profile");
        Ok(Some(ProfileBlob(value)))
    }

    async fn put(&self, user_id: &str, blob: ProfileBlob) -> Result<(), ProfileStoreError> {
        let path = self.path_for(user_id)?;
        let io_err = |source: std::io::Error| ProfileStoreError::Io {
            user_id: user_id.to_string(),
            source,
        };
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        let json = serde_json::to_string_pretty(&blob.0).map_err(|e| ProfileStoreError::Corrupt {
            user_id: user_id.to_string(),
            message: e.to_string(),
        })?;
        // Atomic replace.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
        debug!(user_id, path = %path.display(), "Saved profile");
        Ok(())
    }
}
