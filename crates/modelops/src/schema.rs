use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{ModelOpsError, Result};

/// Packaging convention for trained artifacts inside `<model>/models/`.
pub const ARTIFACT_SUFFIX: &str = ".tar.gz";

/// Name of the artifact subdirectory of a model directory.
pub const ARTIFACT_DIR: &str = "models";

/// Validated model name. Used verbatim as a directory name and as a prefix
/// of supervised process names, so path separators are rejected.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelName(String);

impl ModelName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= 64
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(ModelOpsError::InvalidModelName(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ModelName {
    type Error = ModelOpsError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ModelName> for String {
    fn from(value: ModelName) -> Self {
        value.0
    }
}

impl std::fmt::Display for ModelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A trained artifact on disk. Filenames embed a sortable timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub filename: String,
    pub path: std::path::PathBuf,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    pub fn other(self) -> Self {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }

    pub fn suffix(self) -> &'static str {
        match self {
            SlotId::A => "a",
            SlotId::B => "b",
        }
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotId::A => f.write_str("A"),
            SlotId::B => f.write_str("B"),
        }
    }
}

/// One of the two fixed deployment targets of a model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: SlotId,
    pub port: u16,
    pub process: String,
}

impl Slot {
    pub fn new(model: &ModelName, id: SlotId, port: u16) -> Self {
        Self {
            id,
            port,
            process: slot_process_name(model, id),
        }
    }
}

pub fn slot_process_name(model: &ModelName, id: SlotId) -> String {
    format!("{}-{}", model, id.suffix())
}

pub fn training_process_name(model: &ModelName) -> String {
    format!("{model}-train")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelPhase {
    Uninitialized,
    Training,
    Starting,
    Replacing,
    Running,
    Stopped,
    Error,
}

/// Last known state of one model. Written only by its controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelStatus {
    pub name: String,
    pub phase: ModelPhase,
    pub message: String,
    pub is_running: bool,
    pub active_artifact: String,
    pub active_slot: SlotId,
    pub active_port: u16,
    pub updated_at: DateTime<Utc>,
}

impl ModelStatus {
    pub fn new(name: &ModelName, active: &Slot) -> Self {
        Self {
            name: name.to_string(),
            phase: ModelPhase::Uninitialized,
            message: String::new(),
            is_running: false,
            active_artifact: String::new(),
            active_slot: active.id,
            active_port: active.port,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_name_rejects_paths() {
        assert!(ModelName::new("faq").is_ok());
        assert!(ModelName::new("faq_v2.1").is_ok());
        assert!(ModelName::new("").is_err());
        assert!(ModelName::new("../etc").is_err());
        assert!(ModelName::new("a/b").is_err());
        assert!(ModelName::new(".hidden").is_err());
    }

    #[test]
    fn test_process_names() {
        let m = ModelName::new("faq").unwrap();
        assert_eq!(slot_process_name(&m, SlotId::A), "faq-a");
        assert_eq!(slot_process_name(&m, SlotId::B), "faq-b");
        assert_eq!(training_process_name(&m), "faq-train");
        assert_eq!(SlotId::A.other(), SlotId::B);
    }
}
