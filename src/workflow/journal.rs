use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

use super::state::WorkflowState;

const JOURNAL_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalFile {
    version: u32,
    saved_at: DateTime<Utc>,
    state: WorkflowState,
}

/// JSON checkpoint of the workflow state, rewritten after every transition
#[derive(Debug, Clone)]
pub struct StateJournal {
    path: PathBuf,
}

impl StateJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing journal is an empty state
    pub async fn load(&self) -> Result<WorkflowState, JournalError> {
        if !fs::try_exists(&self.path).await? {
            debug!(path = %self.path.display(), "No journal yet, starting fresh");
            return Ok(WorkflowState::default());
        }

        let content = fs::read_to_string(&self.path).await?;
        let file: JournalFile = serde_json::from_str(&content)?;
        if file.version != JOURNAL_VERSION {
            return Err(JournalError::VersionMismatch {
                expected: JOURNAL_VERSION,
                found: file.version,
            });
        }

        info!(
            path = %self.path.display(),
            requests = file.state.len(),
            saved_at = %file.saved_at,
            "Loaded workflow journal"
        );
        Ok(file.state)
    }

    pub async fn save(&self, state: &WorkflowState) -> Result<(), JournalError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let file = JournalFile {
            version: JOURNAL_VERSION,
            saved_at: Utc::now(),
            state: state.clone(),
        };
        let serialized = serde_json::to_string_pretty(&file)?;

        // Write to temporary file first, then rename
        let temp_file = format!("{}.tmp", self.path.display());
        fs::write(&temp_file, serialized).await?;
        fs::rename(&temp_file, &self.path).await?;

        debug!(path = %self.path.display(), requests = state.len(), "Journal checkpoint written");
        Ok(())
    }
}
