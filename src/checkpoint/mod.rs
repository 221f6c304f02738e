//! Checkpoint snapshot and restore.
//!
//! Three files in the staging directory: `state.json` (counters and writer
//! pointers), `visited.idx` (newline-delimited URL keys), `frontier.json`
//! (pending queue items). All writes go through write-temp-then-rename so
//! a crash mid-checkpoint leaves the previous snapshot intact.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::records::{CheckpointState, FrontierEntry, PartPointer};

const STATE_FILE: &str = "state.json";
const VISITED_FILE: &str = "visited.idx";
const FRONTIER_FILE: &str = "frontier.json";

/// What the scheduler hands over at snapshot time.
#[derive(Debug, Clone)]
pub struct CheckpointSnapshot {
    pub crawl_id: String,
    pub resume_of: Option<String>,
    pub visited: Vec<String>,
    pub frontier: Vec<FrontierEntry>,
    pub part_pointers: BTreeMap<String, PartPointer>,
    pub rss_bytes: u64,
    pub graceful_shutdown: bool,
}

/// A restored checkpoint ready for re-binning.
#[derive(Debug)]
pub struct RestoredCheckpoint {
    pub state: CheckpointState,
    pub visited: HashSet<String>,
    pub frontier: Vec<FrontierEntry>,
}

/// Fire-policy bookkeeping plus the on-disk format.
pub struct CheckpointStore {
    dir: PathBuf,
    enabled: bool,
    every_pages: usize,
    every_duration: Option<Duration>,
    pages_since_save: usize,
    last_save: Instant,
}

impl CheckpointStore {
    #[must_use]
    pub fn new(dir: &Path, enabled: bool, every_pages: usize, every_seconds: Option<u64>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            enabled,
            every_pages: every_pages.max(1),
            every_duration: every_seconds.map(Duration::from_secs),
            pages_since_save: 0,
            last_save: Instant::now(),
        }
    }

    /// Count one finished page; true when the periodic policy says save.
    pub fn page_completed(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        self.pages_since_save += 1;
        if self.pages_since_save >= self.every_pages {
            return true;
        }
        if let Some(every) = self.every_duration {
            if self.last_save.elapsed() >= every {
                return true;
            }
        }
        false
    }

    /// Persist a snapshot; resets the periodic counters.
    pub async fn save(&mut self, snapshot: &CheckpointSnapshot) -> Result<()> {
        let dir = self.dir.clone();
        let snapshot = snapshot.clone();
        tokio::task::spawn_blocking(move || write_snapshot(&dir, &snapshot))
            .await
            .context("checkpoint task panicked")??;
        self.pages_since_save = 0;
        self.last_save = Instant::now();
        debug!("checkpoint saved to {}", self.dir.display());
        Ok(())
    }

    /// Load the three files back from `dir`.
    pub fn restore(dir: &Path) -> Result<RestoredCheckpoint> {
        let state_raw = std::fs::read_to_string(dir.join(STATE_FILE))
            .with_context(|| format!("no checkpoint state in {}", dir.display()))?;
        let state: CheckpointState =
            serde_json::from_str(&state_raw).context("state.json is not valid")?;

        let visited_raw = std::fs::read_to_string(dir.join(VISITED_FILE))
            .context("visited.idx missing from checkpoint")?;
        let visited: HashSet<String> = visited_raw
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        let frontier_raw = std::fs::read_to_string(dir.join(FRONTIER_FILE))
            .context("frontier.json missing from checkpoint")?;
        let frontier: Vec<FrontierEntry> =
            serde_json::from_str(&frontier_raw).context("frontier.json is not valid")?;

        info!(
            visited = visited.len(),
            frontier = frontier.len(),
            crawl_id = %state.crawl_id,
            "checkpoint restored"
        );
        Ok(RestoredCheckpoint {
            state,
            visited,
            frontier,
        })
    }
}

fn write_snapshot(dir: &Path, snapshot: &CheckpointSnapshot) -> Result<()> {
    std::fs::create_dir_all(dir).context("failed to create checkpoint dir")?;

    let mut visited_body = String::with_capacity(snapshot.visited.len() * 41);
    for key in &snapshot.visited {
        visited_body.push_str(key);
        visited_body.push('\n');
    }
    atomic_write(&dir.join(VISITED_FILE), visited_body.as_bytes())?;

    let frontier_body =
        serde_json::to_vec_pretty(&snapshot.frontier).context("frontier serialization failed")?;
    atomic_write(&dir.join(FRONTIER_FILE), &frontier_body)?;

    let state = CheckpointState {
        crawl_id: snapshot.crawl_id.clone(),
        resume_of: snapshot.resume_of.clone(),
        visited_count: snapshot.visited.len() as u64,
        enqueued_count: snapshot.frontier.len() as u64,
        queue_depth: snapshot.frontier.len() as u64,
        visited_index_path: VISITED_FILE.to_string(),
        frontier_path: FRONTIER_FILE.to_string(),
        part_pointers: snapshot.part_pointers.clone(),
        rss_bytes: snapshot.rss_bytes,
        graceful_shutdown: snapshot.graceful_shutdown,
        captured_at: Utc::now(),
    };
    let state_body = serde_json::to_vec_pretty(&state).context("state serialization failed")?;
    atomic_write(&dir.join(STATE_FILE), &state_body)?;
    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .context("checkpoint path has no parent")?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.persist(path)
        .with_context(|| format!("failed to persist {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> CheckpointSnapshot {
        CheckpointSnapshot {
            crawl_id: "crawl-abc".into(),
            resume_of: None,
            visited: vec!["k1".into(), "k2".into()],
            frontier: vec![FrontierEntry {
                url: "https://a.test/next".into(),
                depth: 1,
                discovered_from: Some("https://a.test/".into()),
            }],
            part_pointers: BTreeMap::from([(
                "pages".to_string(),
                PartPointer {
                    part_index: 1,
                    byte_offset: 42,
                    record_count: 2,
                },
            )]),
            rss_bytes: 1024,
            graceful_shutdown: false,
        }
    }

    #[tokio::test]
    async fn save_restore_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::new(tmp.path(), true, 500, None);
        store.save(&snapshot()).await.unwrap();

        let restored = CheckpointStore::restore(tmp.path()).unwrap();
        assert_eq!(restored.state.crawl_id, "crawl-abc");
        assert_eq!(restored.state.visited_count, 2);
        assert_eq!(restored.visited.len(), 2);
        assert!(restored.visited.contains("k1"));
        assert_eq!(restored.frontier.len(), 1);
        assert_eq!(restored.frontier[0].depth, 1);
        assert_eq!(restored.state.part_pointers["pages"].byte_offset, 42);
    }

    #[tokio::test]
    async fn save_overwrites_previous_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::new(tmp.path(), true, 500, None);
        store.save(&snapshot()).await.unwrap();

        let mut second = snapshot();
        second.visited.push("k3".into());
        store.save(&second).await.unwrap();

        let restored = CheckpointStore::restore(tmp.path()).unwrap();
        assert_eq!(restored.visited.len(), 3);
    }

    #[test]
    fn fire_policy_counts_pages() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::new(tmp.path(), true, 3, None);
        assert!(!store.page_completed());
        assert!(!store.page_completed());
        assert!(store.page_completed());
    }

    #[test]
    fn disabled_store_never_fires() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = CheckpointStore::new(tmp.path(), false, 1, Some(0));
        assert!(!store.page_completed());
    }

    #[test]
    fn restore_missing_dir_errors() {
        assert!(CheckpointStore::restore(Path::new("/nonexistent/ckpt")).is_err());
    }
}
