use std::path::Path;

use serde::{Deserialize, Serialize};

/// Admission decision for one dump request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DumpStatus {
    /// A job for the same novel and volume is still running.
    AlreadyRunning,
    /// Every requested chapter is already saved.
    AlreadyComplete,
    AllAccepted,
    /// Some requested chapters are already saved.
    PartialAccepted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DumpOutcome {
    pub status: DumpStatus,
    /// Chapter references the job will fetch, escaped for transport.
    pub accepted: Vec<String>,
}

impl DumpOutcome {
    pub fn rejected(status: DumpStatus) -> Self {
        Self {
            status,
            accepted: Vec::new(),
        }
    }
}

/// Lock table key of a volume: the folder its chapters are written to.
pub fn job_key(folder: &Path) -> String {
    folder.to_string_lossy().into_owned()
}
