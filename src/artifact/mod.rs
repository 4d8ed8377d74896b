//! Artifact model for the crucible orchestrator.
//!
//! Artifacts are the immutable, versioned outputs steps hand to later
//! steps and to quality gates. Executors return lightweight
//! [`ArtifactDraft`]s; the runner completes them into [`Artifact`]s with
//! identity, provenance and a content digest before storing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod store;

pub use store::ArtifactStore;

use crate::pipeline::content_digest;

/// Unique artifact identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(Uuid);

impl ArtifactId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// What an executor returns: content plus its kind tag. Identity and
/// provenance are stamped on by the runner, not by executors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactDraft {
    /// Artifact kind tag (e.g., "draft_document", "review_notes")
    pub kind: String,
    /// Artifact content
    pub content: String,
}

/// An immutable, stored step output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    /// Unique id
    pub id: ArtifactId,
    /// Kind tag, matched against step input/output declarations
    pub kind: String,
    /// Hex sha256 of the content; the content-addressable reference
    pub digest: String,
    /// Content
    pub content: String,
    /// Step that produced this artifact
    pub produced_by: String,
    /// Phase the producing step ran in
    pub phase: String,
    /// Quality iteration within that phase (1-based)
    pub iteration: u32,
    /// Artifacts consumed while producing this one.
    /// Every listed id was stored strictly before this artifact.
    #[serde(default)]
    pub depends_on: Vec<ArtifactId>,
    /// Store-wide monotonic order; higher means more recent
    pub seq: u64,
    /// When the artifact was stored
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Complete a draft into a stored-shape artifact.
    pub fn from_draft(
        draft: ArtifactDraft,
        produced_by: &str,
        phase: &str,
        iteration: u32,
        depends_on: Vec<ArtifactId>,
        seq: u64,
    ) -> Self {
        let digest = content_digest(&draft.content);
        Self {
            id: ArtifactId::new(),
            kind: draft.kind,
            digest,
            content: draft.content,
            produced_by: produced_by.to_string(),
            phase: phase.to_string(),
            iteration,
            depends_on,
            seq,
            created_at: Utc::now(),
        }
    }

    /// Seed an initial input artifact. Seeds belong to no phase and
    /// carry iteration 0.
    pub fn seed(kind: &str, content: String, seq: u64) -> Self {
        let digest = content_digest(&content);
        Self {
            id: ArtifactId::new(),
            kind: kind.to_string(),
            digest,
            content,
            produced_by: "seed".to_string(),
            phase: String::new(),
            iteration: 0,
            depends_on: Vec::new(),
            seq,
            created_at: Utc::now(),
        }
    }
}
