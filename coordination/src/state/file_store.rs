//! Directory-backed event store.
//!
//! ```text
//! <root>/<run_id>/run.json        RunRecord
//!                 events.jsonl    one StatementEvent per line
//!                 snapshot.json   latest RunSnapshot
//!                 votes.json      VoteTally (written once)
//! ```
//!
//! Documents are written to a temp file and renamed into place, so readers
//! never see a half-written record or a partial vote set.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::store::{check_append, EventStore, StoreError, StoreResult};
use super::types::{RunId, RunRecord};
use crate::debate::log::StatementEvent;
use crate::debate::persistence::RunSnapshot;
use crate::debate::voting::VoteTally;

const RUN_FILE: &str = "run.json";
const EVENTS_FILE: &str = "events.jsonl";
const SNAPSHOT_FILE: &str = "snapshot.json";
const VOTES_FILE: &str = "votes.json";

pub struct FileEventStore {
    root: PathBuf,
    // Serializes writers; readers go straight to disk.
    write_lock: Mutex<()>,
}

impl FileEventStore {
    /// Open or create a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &str) -> StoreResult<PathBuf> {
        // Run ids become directory names.
        if run_id.is_empty()
            || run_id == "."
            || run_id == ".."
            || run_id.contains(['/', '\\'])
        {
            return Err(StoreError::NotFound(run_id.to_string()));
        }
        Ok(self.root.join(run_id))
    }

    fn existing_dir(&self, run_id: &str) -> StoreResult<PathBuf> {
        let dir = self.run_dir(run_id)?;
        if !dir.join(RUN_FILE).exists() {
            return Err(StoreError::NotFound(run_id.to_string()));
        }
        Ok(dir)
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, ()>> {
        self.write_lock.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn read_events(dir: &Path) -> StoreResult<Vec<StatementEvent>> {
        Ok(Self::read_event_file(dir)?.events)
    }

    /// Parse `events.jsonl`. A last line without its newline is a write cut
    /// short by a crash: it is dropped if it does not parse. Anything else
    /// that does not parse is corruption.
    fn read_event_file(dir: &Path) -> StoreResult<EventFile> {
        let path = dir.join(EVENTS_FILE);
        if !path.exists() {
            return Ok(EventFile::default());
        }
        let bytes = fs::read(&path)?;
        let mut file = EventFile::default();
        let mut offset = 0;
        for line in bytes.split_inclusive(|b| *b == b'\n') {
            let terminated = line.ends_with(b"\n");
            if line.iter().all(u8::is_ascii_whitespace) {
                offset += line.len();
                continue;
            }
            match serde_json::from_slice(line) {
                Ok(event) => {
                    file.events.push(event);
                    file.unterminated = !terminated;
                }
                Err(e) if !terminated => {
                    warn!(
                        path = %path.display(),
                        bytes = line.len(),
                        error = %e,
                        "Ignoring torn trailing event line"
                    );
                    file.torn_at = Some(offset as u64);
                }
                Err(e) => return Err(StoreError::Deserialization(e.to_string())),
            }
            offset += line.len();
        }
        Ok(file)
    }
}

#[derive(Default)]
struct EventFile {
    events: Vec<StatementEvent>,
    /// Length of the intact prefix when the last line is torn.
    torn_at: Option<u64>,
    /// The last line parsed but lost its newline.
    unterminated: bool,
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let bytes =
        serde_json::to_vec_pretty(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    let value =
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(Some(value))
}

impl EventStore for FileEventStore {
    fn create_run(&self, record: &RunRecord) -> StoreResult<()> {
        let _guard = self.lock()?;
        let dir = self.run_dir(&record.run_id)?;
        if dir.join(RUN_FILE).exists() {
            return Err(StoreError::AlreadyExists(record.run_id.clone()));
        }
        fs::create_dir_all(&dir)?;
        write_json(&dir.join(RUN_FILE), record)?;
        debug!(run_id = %record.run_id, dir = %dir.display(), "Run created");
        Ok(())
    }

    fn get_run(&self, run_id: &str) -> StoreResult<RunRecord> {
        let dir = self.existing_dir(run_id)?;
        read_json(&dir.join(RUN_FILE))?.ok_or_else(|| StoreError::NotFound(run_id.to_string()))
    }

    fn list_runs(&self) -> StoreResult<Vec<RunId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().join(RUN_FILE).exists() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn append_event(&self, run_id: &str, event: &StatementEvent) -> StoreResult<()> {
        let _guard = self.lock()?;
        let dir = self.existing_dir(run_id)?;
        let existing = Self::read_event_file(&dir)?;
        check_append(run_id, existing.events.last(), event)?;

        let mut line =
            serde_json::to_string(event).map_err(|e| StoreError::Serialization(e.to_string()))?;
        line.push('\n');
        if existing.unterminated {
            line.insert(0, '\n');
        }
        let path = dir.join(EVENTS_FILE);
        if let Some(len) = existing.torn_at {
            OpenOptions::new().write(true).open(&path)?.set_len(len)?;
            warn!(run_id, len, "Truncated torn trailing event line");
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn events(&self, run_id: &str) -> StoreResult<Vec<StatementEvent>> {
        let dir = self.existing_dir(run_id)?;
        Self::read_events(&dir)
    }

    fn record_failure(&self, run_id: &str, reason: &str) -> StoreResult<()> {
        let _guard = self.lock()?;
        let dir = self.existing_dir(run_id)?;
        let path = dir.join(RUN_FILE);
        let mut record: RunRecord =
            read_json(&path)?.ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        if record.mark_failed(reason) {
            write_json(&path, &record)?;
        }
        Ok(())
    }

    fn put_snapshot(&self, run_id: &str, snapshot: &RunSnapshot) -> StoreResult<()> {
        let _guard = self.lock()?;
        let dir = self.existing_dir(run_id)?;
        write_json(&dir.join(SNAPSHOT_FILE), snapshot)
    }

    fn latest_snapshot(&self, run_id: &str) -> StoreResult<Option<RunSnapshot>> {
        let dir = self.existing_dir(run_id)?;
        read_json(&dir.join(SNAPSHOT_FILE))
    }

    fn put_votes_if_absent(&self, run_id: &str, tally: &VoteTally) -> StoreResult<VoteTally> {
        let _guard = self.lock()?;
        let dir = self.existing_dir(run_id)?;
        let path = dir.join(VOTES_FILE);
        if let Some(existing) = read_json(&path)? {
            return Ok(existing);
        }
        write_json(&path, tally)?;
        Ok(tally.clone())
    }

    fn get_votes(&self, run_id: &str) -> StoreResult<Option<VoteTally>> {
        let dir = self.existing_dir(run_id)?;
        read_json(&dir.join(VOTES_FILE))
    }
}
