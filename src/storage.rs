//! Durable snapshot of acceptor-visible state: `minPsns` and
//! `maxAcceptedProposals`, one file per node under `stableStorage/`.
//!
//! Write discipline follows open-write-flush-close into a temp file
//! followed by a rename, so a crash mid-write never leaves a half-written
//! `.bak` file in place (§4.6, §6 of the design notes).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};

use crate::message::Proposal;

/// The durable half of the acceptor's per-slot state.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AcceptorSnapshot {
    pub min_psns: HashMap<u64, u64>,
    pub max_accepted_proposals: HashMap<u64, Proposal>,
}

/// Backing store for one node's `AcceptorSnapshot`, keyed by its string
/// identity under a well-known directory (default `stableStorage/`).
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    pub fn new(dir: impl AsRef<Path>, node_id: impl AsRef<str>) -> Self {
        Storage { path: dir.as_ref().join(format!("{}.bak", node_id.as_ref())) }
    }

    /// Loads the snapshot written by the last completed `save`. A missing
    /// file is a valid "fresh node" state. A present-but-corrupt file is
    /// logged and treated as fresh too, per the documented startup policy
    /// (see DESIGN.md, Open Question: stable-storage read fault).
    pub fn load(&self) -> AcceptorSnapshot {
        match fs::read(&self.path) {
            Ok(bytes) => match bincode::deserialize(&bytes) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::error!("corrupt stable storage snapshot at {:?}: {}; starting fresh", self.path, e);
                    AcceptorSnapshot::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AcceptorSnapshot::default(),
            Err(e) => {
                log::error!("could not read stable storage at {:?}: {}; starting fresh", self.path, e);
                AcceptorSnapshot::default()
            }
        }
    }

    /// Replaces the snapshot in full: write the whole new state to a temp
    /// file in the same directory, flush, close, then rename over the old
    /// file. The rename is what makes the replacement atomic-enough for
    /// crash recovery.
    pub fn save(&self, snapshot: &AcceptorSnapshot) -> Result<(), crate::error::Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("bak.tmp");
        let bytes = bincode::serialize(snapshot)?;
        {
            use std::io::Write;
            let mut f = fs::File::create(&tmp_path)?;
            f.write_all(&bytes)?;
            f.flush()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Removes the snapshot file, if any. Used by `Node::clear_stable_storage`.
    pub fn clear(&self) -> Result<(), crate::error::Error> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_node_has_no_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path(), "0");
        assert_eq!(storage.load(), AcceptorSnapshot::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path(), "2");

        let mut snapshot = AcceptorSnapshot::default();
        snapshot.min_psns.insert(3, 6);
        snapshot.max_accepted_proposals.insert(3, Proposal { csn: 3, psn: 5, value: "X".into() });

        storage.save(&snapshot).unwrap();
        assert_eq!(storage.load(), snapshot);
    }

    #[test]
    fn corrupt_snapshot_degrades_to_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path(), "1");
        fs::write(dir.path().join("1.bak"), b"not a valid bincode snapshot \xff\xff").unwrap();
        assert_eq!(storage.load(), AcceptorSnapshot::default());
    }

    #[test]
    fn clear_removes_the_file_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path(), "0");
        storage.save(&AcceptorSnapshot::default()).unwrap();
        assert!(dir.path().join("0.bak").exists());

        storage.clear().unwrap();
        assert!(!dir.path().join("0.bak").exists());
        storage.clear().unwrap();
    }
}
