//! Registry data model: profile, model descriptors, artifact kinds and the
//! on-disk manifest.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{CoachError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Status string the registry reports for a fully trained model.
pub const STATUS_READY: &str = "Ready";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    /// Storage locator that scopes every artifact URL of this profile.
    pub bucket: String,
    pub models: Vec<ModelDescriptor>,
}

impl Profile {
    pub fn model(&self, name: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.name == name)
    }
}

/// One trained model as published by the registry. Also the manifest format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelDescriptor {
    pub name: String,
    pub status: String,
    pub version: u32,
    #[serde(rename = "module")]
    pub base_module: String,
    pub labels: Vec<String>,
    #[serde(rename = "coachVersion", alias = "formatVersion")]
    pub format_version: f64,
}

impl ModelDescriptor {
    pub fn is_ready(&self) -> bool { self.status == STATUS_READY }
}

/// Serialized graph encodings the registry publishes, each with a fixed
/// filename inside a model's cache directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// TensorFlow frozen GraphDef.
    #[default]
    Frozen,
    /// GraphDef bytes packaged for the embedded (Unity) runtime.
    Unity,
    /// TensorFlow Lite flatbuffer.
    Mobile,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 3] = [ArtifactKind::Frozen, ArtifactKind::Unity, ArtifactKind::Mobile];

    pub fn file_name(self) -> &'static str {
        match self {
            ArtifactKind::Frozen => "frozen.pb",
            ArtifactKind::Unity => "unity.bytes",
            ArtifactKind::Mobile => "mobile.tflite",
        }
    }

    /// Whether the artifact is a GraphDef that a graph backend can import.
    pub fn is_graph_def(self) -> bool { !matches!(self, ArtifactKind::Mobile) }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self { ArtifactKind::Frozen => "frozen", ArtifactKind::Unity => "unity", ArtifactKind::Mobile => "mobile" };
        f.write_str(s)
    }
}

impl FromStr for ArtifactKind {
    type Err = CoachError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "frozen" => Ok(ArtifactKind::Frozen),
            "unity" => Ok(ArtifactKind::Unity),
            "mobile" => Ok(ArtifactKind::Mobile),
            other => Err(CoachError::InvalidInput(format!("unknown artifact kind '{other}'"))),
        }
    }
}

pub fn manifest_path(model_dir: &Path) -> PathBuf { model_dir.join(MANIFEST_FILE) }

/// Reads the manifest in `model_dir`. `Ok(None)` when there is none yet.
pub async fn read_manifest(model_dir: &Path) -> Result<Option<ModelDescriptor>> {
    let path = manifest_path(model_dir);
    let bytes = match tokio::fs::read(&path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CoachError::io(path, e)),
    };
    parse_manifest(&path, &bytes).map(Some)
}

pub fn parse_manifest(path: &Path, bytes: &[u8]) -> Result<ModelDescriptor> {
    serde_json::from_slice(bytes).map_err(|source| CoachError::Manifest { path: path.to_path_buf(), source })
}

/// Replaces the manifest atomically: write a sibling temp file, then rename.
pub async fn write_manifest(model_dir: &Path, descriptor: &ModelDescriptor) -> Result<()> {
    let path = manifest_path(model_dir);
    let json = serde_json::to_vec_pretty(descriptor)
        .map_err(|source| CoachError::Manifest { path: path.clone(), source })?;
    let tmp = model_dir.join(format!("{MANIFEST_FILE}.tmp"));
    tokio::fs::write(&tmp, &json).await.map_err(|e| CoachError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, &path).await.map_err(|e| CoachError::io(&path, e))?;
    Ok(())
}
