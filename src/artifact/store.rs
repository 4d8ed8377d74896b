//! Per-run artifact store.
//!
//! Append-only: artifacts are stored complete and never mutated or
//! deleted. A retried step's output shadows earlier iterations through
//! the `seq` order; prior iterations stay retrievable by explicit
//! iteration number. The store is owned by a single run loop, so writes
//! take `&mut self` and need no locking; observers read journal-derived
//! snapshots instead.

use std::collections::HashMap;

use crate::artifact::{Artifact, ArtifactId};
use crate::errors::StoreError;

#[derive(Debug, Default)]
pub struct ArtifactStore {
    artifacts: HashMap<ArtifactId, Artifact>,
    /// Insertion order, ascending `seq`
    order: Vec<ArtifactId>,
    kind_index: HashMap<String, Vec<ArtifactId>>,
    digest_index: HashMap<String, ArtifactId>,
    next_seq: u64,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next value of the monotonic sequence counter. The runner stamps
    /// artifacts with this before storing them.
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Store an artifact. Rejects duplicates and any artifact whose
    /// dependencies are not already present; a stored artifact can only
    /// reference what came strictly before it.
    pub fn put(&mut self, artifact: Artifact) -> Result<ArtifactId, StoreError> {
        if self.artifacts.contains_key(&artifact.id) {
            return Err(StoreError::Duplicate { id: artifact.id });
        }
        for dep in &artifact.depends_on {
            if !self.artifacts.contains_key(dep) {
                return Err(StoreError::DependencyMissing {
                    kind: artifact.kind.clone(),
                    dependency: *dep,
                });
            }
        }

        // Replayed artifacts arrive with their original seq; keep the
        // counter ahead so new artifacts stay ordered after them.
        if artifact.seq >= self.next_seq {
            self.next_seq = artifact.seq + 1;
        }

        let id = artifact.id;
        self.order.push(id);
        self.kind_index
            .entry(artifact.kind.clone())
            .or_default()
            .push(id);
        self.digest_index.insert(artifact.digest.clone(), id);
        self.artifacts.insert(id, artifact);
        Ok(id)
    }

    /// Get an artifact by id.
    pub fn get(&self, id: &ArtifactId) -> Result<&Artifact, StoreError> {
        self.artifacts.get(id).ok_or(StoreError::NotFound(*id))
    }

    /// Content-addressable lookup. Returns the most recently stored
    /// artifact with this digest.
    pub fn get_by_digest(&self, digest: &str) -> Option<&Artifact> {
        self.digest_index
            .get(digest)
            .and_then(|id| self.artifacts.get(id))
    }

    /// All artifacts of a kind produced in a phase, ascending `seq`.
    /// With retries this yields every iteration's output, most recent
    /// last.
    pub fn list_by_kind_and_phase(&self, kind: &str, phase: &str) -> Vec<&Artifact> {
        self.by_kind(kind)
            .filter(|a| a.phase == phase)
            .collect()
    }

    /// The newest artifact of a kind across the whole run. This is what
    /// step input resolution uses, so retried outputs shadow earlier
    /// iterations.
    pub fn latest_by_kind(&self, kind: &str) -> Option<&Artifact> {
        self.by_kind(kind).last()
    }

    /// The artifact of a kind produced in a specific phase iteration.
    /// Shadowed outputs stay reachable through this.
    pub fn get_by_kind_iteration(
        &self,
        kind: &str,
        phase: &str,
        iteration: u32,
    ) -> Option<&Artifact> {
        self.by_kind(kind)
            .filter(|a| a.phase == phase && a.iteration == iteration)
            .last()
    }

    /// All artifacts in storage order.
    pub fn all(&self) -> impl Iterator<Item = &Artifact> {
        self.order.iter().filter_map(|id| self.artifacts.get(id))
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    fn by_kind(&self, kind: &str) -> impl Iterator<Item = &Artifact> {
        self.kind_index
            .get(kind)
            .into_iter()
            .flatten()
            .filter_map(|id| self.artifacts.get(id))
    }
}
