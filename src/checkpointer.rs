//! Durable per-source read offsets.
//!
//! Offsets advance only after the destination store has acknowledged the
//! rows they cover, so a crash between write and commit replays records
//! instead of losing them. The on-disk file is replaced atomically via a
//! temporary file and rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::internal_events::{CheckpointCommitted, CheckpointWriteError};

const CHECKPOINT_FILE: &str = "checkpoints.json";
const TMP_FILE: &str = "checkpoints.json.tmp";

#[derive(Debug, Snafu)]
pub enum CheckpointError {
    #[snafu(display("Failed to create data directory {:?}: {}", path, source))]
    CreateDataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Failed to read checkpoint file {:?}: {}", path, source))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Checkpoint file {:?} is corrupt: {}", path, source))]
    ParseFile {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[snafu(display("Failed to persist checkpoint file {:?}: {}", path, source))]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Checkpoint {
    offset: u64,
    committed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    checkpoints: HashMap<String, Checkpoint>,
}

/// Tracker for committed read positions, shared by every consumer task.
#[derive(Clone)]
pub struct Checkpointer {
    path: Arc<PathBuf>,
    state: Arc<Mutex<State>>,
    /// Held across snapshot and file write, so renames land in commit order
    /// and a stale snapshot can never overwrite a newer file.
    persist_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Checkpointer {
    /// Load existing checkpoints from `data_dir`, creating the directory if
    /// needed. A missing file means a fresh start; a corrupt file is an
    /// error, since silently restarting from zero would re-ingest history.
    pub fn load(data_dir: &Path) -> Result<Self, CheckpointError> {
        std::fs::create_dir_all(data_dir).context(CreateDataDirSnafu { path: data_dir })?;
        let path = data_dir.join(CHECKPOINT_FILE);
        let state = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).context(ParseFileSnafu { path: &path })?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => State::default(),
            Err(source) => return Err(CheckpointError::ReadFile { path, source }),
        };
        Ok(Self {
            path: Arc::new(path),
            state: Arc::new(Mutex::new(state)),
            persist_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Committed offset for a source, or zero if it has never committed.
    pub fn get(&self, source_id: &str) -> u64 {
        self.state
            .lock()
            .expect("checkpoint state lock poisoned")
            .checkpoints
            .get(source_id)
            .map_or(0, |c| c.offset)
    }

    /// Advance sources to the given offsets and persist the full state.
    ///
    /// Offsets are monotonic per source: a regressed offset is skipped with a
    /// warning rather than written, since it would re-deliver acknowledged
    /// rows on restart.
    pub async fn commit(
        &self,
        offsets: &HashMap<String, u64>,
    ) -> Result<(), CheckpointError> {
        let _persisting = self.persist_lock.lock().await;
        let snapshot = {
            let mut state = self
                .state
                .lock()
                .expect("checkpoint state lock poisoned");
            for (source_id, &offset) in offsets {
                match state.checkpoints.get(source_id) {
                    Some(current) if current.offset > offset => {
                        warn!(
                            message = "Ignoring checkpoint regression.",
                            source_id = %source_id,
                            committed = %current.offset,
                            requested = %offset,
                        );
                        continue;
                    }
                    _ => {}
                }
                state.checkpoints.insert(
                    source_id.clone(),
                    Checkpoint {
                        offset,
                        committed_at: Utc::now(),
                    },
                );
                emit!(CheckpointCommitted { source_id, offset });
            }
            serde_json::to_vec_pretty(&*state).expect("checkpoint state serializes")
        };
        self.persist(snapshot).await
    }

    /// Drop a source's checkpoint, restarting it from offset zero. Called
    /// when the underlying file is rotated or truncated.
    pub async fn reset(&self, source_id: &str) -> Result<(), CheckpointError> {
        let _persisting = self.persist_lock.lock().await;
        let snapshot = {
            let mut state = self
                .state
                .lock()
                .expect("checkpoint state lock poisoned");
            state.checkpoints.remove(source_id);
            serde_json::to_vec_pretty(&*state).expect("checkpoint state serializes")
        };
        self.persist(snapshot).await
    }

    async fn persist(&self, snapshot: Vec<u8>) -> Result<(), CheckpointError> {
        let path = Arc::clone(&self.path);
        let result = tokio::task::spawn_blocking(move || write_atomically(&path, &snapshot))
            .await
            .unwrap_or_else(|join_error| {
                Err(std::io::Error::other(join_error))
            });
        if let Err(error) = &result {
            emit!(CheckpointWriteError { error });
        }
        result.context(WriteFileSnafu {
            path: self.path.as_ref().clone(),
        })
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let tmp = path.with_file_name(TMP_FILE);
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offsets(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
        pairs
            .iter()
            .map(|(id, offset)| (id.to_string(), *offset))
            .collect()
    }

    #[tokio::test]
    async fn state_survives_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = Checkpointer::load(dir.path()).unwrap();
        checkpointer
            .commit(&offsets(&[("web", 120), ("app", 64)]))
            .await
            .unwrap();

        let reloaded = Checkpointer::load(dir.path()).unwrap();
        assert_eq!(reloaded.get("web"), 120);
        assert_eq!(reloaded.get("app"), 64);
        assert_eq!(reloaded.get("unknown"), 0);
    }

    #[tokio::test]
    async fn offsets_never_regress() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = Checkpointer::load(dir.path()).unwrap();
        checkpointer.commit(&offsets(&[("web", 100)])).await.unwrap();
        checkpointer.commit(&offsets(&[("web", 50)])).await.unwrap();
        assert_eq!(checkpointer.get("web"), 100);
    }

    #[tokio::test]
    async fn reset_returns_a_source_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = Checkpointer::load(dir.path()).unwrap();
        checkpointer
            .commit(&offsets(&[("web", 100), ("app", 7)]))
            .await
            .unwrap();
        checkpointer.reset("web").await.unwrap();

        assert_eq!(checkpointer.get("web"), 0);
        assert_eq!(checkpointer.get("app"), 7);

        let reloaded = Checkpointer::load(dir.path()).unwrap();
        assert_eq!(reloaded.get("web"), 0);
    }

    #[tokio::test]
    async fn concurrent_commits_never_leave_stale_state_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = Checkpointer::load(dir.path()).unwrap();

        let mut handles = Vec::new();
        for i in 1..=20u64 {
            let checkpointer = checkpointer.clone();
            handles.push(tokio::spawn(async move {
                checkpointer.commit(&offsets(&[("web", i * 10)])).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // The file must reflect the highest committed offset, not whichever
        // snapshot happened to be renamed last.
        let reloaded = Checkpointer::load(dir.path()).unwrap();
        assert_eq!(checkpointer.get("web"), 200);
        assert_eq!(reloaded.get("web"), 200);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CHECKPOINT_FILE), b"{not json").unwrap();
        assert!(matches!(
            Checkpointer::load(dir.path()),
            Err(CheckpointError::ParseFile { .. })
        ));
    }

    #[tokio::test]
    async fn commit_leaves_no_temporary_file() {
        let dir = tempfile::tempdir().unwrap();
        let checkpointer = Checkpointer::load(dir.path()).unwrap();
        checkpointer.commit(&offsets(&[("web", 10)])).await.unwrap();
        assert!(dir.path().join(CHECKPOINT_FILE).exists());
        assert!(!dir.path().join(TMP_FILE).exists());
    }
}
