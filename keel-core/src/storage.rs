//! Durable state for a replica.
//!
//! Two independent pieces, each owned by a different component:
//! - `VoteStore`: the `(current_term, voted_for)` pair, rewritten
//!   atomically before any vote-grant reply leaves the replica.
//! - `LogStore`: the entry log as a JSON-lines WAL. Appends go straight
//!   to the open handle; truncations and compaction commits rewrite the
//!   whole file through a temp-file rename.

use crate::cluster::MemberId;
use crate::log::{Entry, Term};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const VOTE_FILE: &str = "vote.json";
const WAL_FILE: &str = "log.wal";

/// Durable election state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VoteState {
    /// Latest term this replica has seen.
    pub current_term: Term,
    /// Candidate granted a vote in the current term, if any.
    pub voted_for: Option<MemberId>,
}

/// Atomic small-file persistence for `VoteState`.
#[derive(Debug)]
pub struct VoteStore {
    path: PathBuf,
    temp_path: PathBuf,
}

impl VoteStore {
    pub fn new(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(VOTE_FILE),
            temp_path: dir.join(format!("{}.tmp", VOTE_FILE)),
        })
    }

    /// Load the recorded state; a missing file yields the default.
    pub fn load(&self) -> io::Result<VoteState> {
        if !self.path.exists() {
            return Ok(VoteState::default());
        }
        let data = fs::read_to_string(&self.path)?;
        match serde_json::from_str(&data) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!("Storage: unreadable vote file, starting fresh: {}", e);
                Ok(VoteState::default())
            }
        }
    }

    /// Write `state` via temp file + rename.
    pub fn save(&self, state: &VoteState) -> io::Result<()> {
        let data = serde_json::to_string(state)?;
        fs::write(&self.temp_path, data)?;
        fs::rename(&self.temp_path, &self.path)?;
        debug!(
            "Storage: saved vote state (term={}, voted_for={:?})",
            state.current_term, state.voted_for
        );
        Ok(())
    }
}

/// JSON-lines WAL for log entries.
pub struct LogStore {
    dir: PathBuf,
    wal: BufWriter<File>,
    fsync_on_write: bool,
}

impl LogStore {
    /// Open the WAL under `dir` and replay it, returning the store and the
    /// recovered entries. Unparseable or non-contiguous trailing lines are
    /// dropped with a warning (torn-write tolerance).
    pub fn open(dir: &Path, fsync_on_write: bool) -> io::Result<(Self, Vec<Entry>)> {
        fs::create_dir_all(dir)?;
        let wal_path = dir.join(WAL_FILE);
        let entries = Self::replay(&wal_path)?;

        let file = OpenOptions::new().create(true).append(true).open(&wal_path)?;
        info!(
            "Storage: opened WAL at {:?} ({} entries recovered)",
            wal_path,
            entries.len()
        );
        Ok((
            Self {
                dir: dir.to_path_buf(),
                wal: BufWriter::new(file),
                fsync_on_write,
            },
            entries,
        ))
    }

    fn replay(wal_path: &Path) -> io::Result<Vec<Entry>> {
        let mut entries: Vec<Entry> = Vec::new();
        if !wal_path.exists() {
            return Ok(entries);
        }

        let reader = BufReader::new(File::open(wal_path)?);
        for (line_num, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!("Storage: WAL read error at line {}: {}", line_num + 1, e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Entry>(&line) {
                Ok(entry) => {
                    if let Some(last) = entries.last() {
                        if entry.index != last.index + 1 {
                            warn!(
                                "Storage: WAL discontinuity at line {} (index {} after {}), dropping tail",
                                line_num + 1,
                                entry.index,
                                last.index
                            );
                            break;
                        }
                    }
                    entries.push(entry);
                }
                Err(e) => {
                    warn!("Storage: WAL parse error at line {}, dropping tail: {}", line_num + 1, e);
                    break;
                }
            }
        }
        Ok(entries)
    }

    /// Append one entry to the WAL.
    pub fn append(&mut self, entry: &Entry) -> io::Result<()> {
        let data = serde_json::to_string(entry)?;
        writeln!(self.wal, "{}", data)?;
        if self.fsync_on_write {
            self.wal.flush()?;
            self.wal.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Replace the WAL contents with `entries` via temp file + rename,
    /// then reopen the append handle.
    pub fn rewrite<'a>(&mut self, entries: impl Iterator<Item = &'a Entry>) -> io::Result<()> {
        let wal_path = self.dir.join(WAL_FILE);
        let temp_path = self.dir.join(format!("{}.tmp", WAL_FILE));

        {
            let mut writer = BufWriter::new(File::create(&temp_path)?);
            for entry in entries {
                let data = serde_json::to_string(entry)?;
                writeln!(writer, "{}", data)?;
            }
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        fs::rename(&temp_path, &wal_path)?;

        let file = OpenOptions::new().append(true).open(&wal_path)?;
        self.wal = BufWriter::new(file);
        debug!("Storage: WAL rewritten");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::Entry;
    use tempfile::tempdir;

    #[test]
    fn test_vote_store_roundtrip() -> io::Result<()> {
        let dir = tempdir()?;
        let store = VoteStore::new(dir.path())?;

        assert_eq!(store.load()?, VoteState::default());

        let state = VoteState {
            current_term: 7,
            voted_for: Some("b".to_string()),
        };
        store.save(&state)?;
        assert_eq!(store.load()?, state);
        Ok(())
    }

    #[test]
    fn test_wal_append_replay() -> io::Result<()> {
        let dir = tempdir()?;

        {
            let (mut store, recovered) = LogStore::open(dir.path(), false)?;
            assert!(recovered.is_empty());
            for i in 1..=3 {
                store.append(&Entry::noop(i, 1))?;
            }
        }

        let (_store, recovered) = LogStore::open(dir.path(), false)?;
        assert_eq!(recovered.len(), 3);
        assert_eq!(recovered[0].index, 1);
        assert_eq!(recovered[2].index, 3);
        Ok(())
    }

    #[test]
    fn test_wal_rewrite_survives_reopen() -> io::Result<()> {
        let dir = tempdir()?;

        {
            let (mut store, _) = LogStore::open(dir.path(), false)?;
            for i in 1..=5 {
                store.append(&Entry::noop(i, 1))?;
            }
            let kept: Vec<Entry> = (3..=5).map(|i| Entry::noop(i, 1)).collect();
            store.rewrite(kept.iter())?;
            // Appends continue after a rewrite.
            store.append(&Entry::noop(6, 2))?;
        }

        let (_store, recovered) = LogStore::open(dir.path(), false)?;
        assert_eq!(recovered.len(), 4);
        assert_eq!(recovered[0].index, 3);
        assert_eq!(recovered[3].index, 6);
        assert_eq!(recovered[3].term, 2);
        Ok(())
    }

    #[test]
    fn test_wal_drops_torn_tail() -> io::Result<()> {
        let dir = tempdir()?;
        {
            let (mut store, _) = LogStore::open(dir.path(), false)?;
            store.append(&Entry::noop(1, 1))?;
            store.append(&Entry::noop(2, 1))?;
        }
        // Simulate a torn write at the end of the file.
        let wal_path = dir.path().join(WAL_FILE);
        let mut data = fs::read(&wal_path)?;
        data.extend_from_slice(b"{\"index\":3,\"term\"");
        fs::write(&wal_path, data)?;

        let (_store, recovered) = LogStore::open(dir.path(), false)?;
        assert_eq!(recovered.len(), 2);
        Ok(())
    }
}
