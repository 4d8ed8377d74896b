use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::RunEvent;
use crate::artifact::ArtifactStore;
use crate::errors::StoreError;

/// Append-only JSONL journal for one run.
///
/// One event per line, flushed as it is written. Appending never
/// rewrites earlier lines, so a journal truncated by a crash is still
/// replayable up to the last complete line.
pub struct EventJournal {
    path: PathBuf,
}

impl EventJournal {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Append one event and flush it to disk.
    pub fn append(&self, event: &RunEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let line = serde_json::to_string(event).context("Failed to serialize run event")?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open journal {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .context("Failed to write journal entry")?;
        file.write_all(b"\n")
            .context("Failed to write journal entry")?;
        file.flush().context("Failed to flush journal")?;

        Ok(())
    }

    /// Read every event in append order.
    pub fn read_all(&self) -> Result<Vec<RunEvent>> {
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read journal {}", self.path.display()))?;

        let mut events = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: RunEvent = serde_json::from_str(line)
                .with_context(|| format!("Malformed journal entry at line {}", index + 1))?;
            events.push(event);
        }
        Ok(events)
    }
}

/// Rebuild the artifact store from a replayed journal.
///
/// `RunStarted` carries the seed artifacts and `StepCompleted` the
/// produced ones. Re-inserting them in journal order restores
/// sequence numbers and shadowing exactly as the original run saw
/// them.
pub fn rebuild_store(events: &[RunEvent]) -> Result<ArtifactStore, StoreError> {
    let mut store = ArtifactStore::new();
    for event in events {
        match event {
            RunEvent::RunStarted { seeds, .. } => {
                for artifact in seeds {
                    store.put(artifact.clone())?;
                }
            }
            RunEvent::StepCompleted { artifacts, .. } => {
                for artifact in artifacts {
                    store.put(artifact.clone())?;
                }
            }
            _ => {}
        }
    }
    Ok(store)
}
