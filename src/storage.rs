//! Stable storage for the persisted Raft state and snapshot.
//!
//! The consensus core treats storage as an external collaborator: it hands
//! over two opaque blobs (the encoded state and the state-machine snapshot)
//! and expects them back after a restart. Both blobs are written atomically
//! together; a save that returns `Ok` must survive a crash.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Durable storage of the persisted Raft state plus the snapshot blob.
pub trait Storage: Send + Sync {
    /// Atomically persist both blobs. Durable on return.
    fn save(&mut self, state: &[u8], snapshot: &[u8]) -> io::Result<()>;

    /// Load the last saved blobs, or `None` if nothing was ever saved.
    fn load(&self) -> io::Result<Option<(Vec<u8>, Vec<u8>)>>;
}

/// In-memory storage for tests and single-process drivers.
///
/// Cloning yields a handle to the same backing cell, so a "crashed" node can
/// be restarted with the state it saved before the crash.
#[derive(Clone, Default)]
pub struct MemStorage {
    inner: Arc<Mutex<Option<(Vec<u8>, Vec<u8>)>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn save(&mut self, state: &[u8], snapshot: &[u8]) -> io::Result<()> {
        *self.inner.lock().unwrap() = Some((state.to_vec(), snapshot.to_vec()));
        Ok(())
    }

    fn load(&self) -> io::Result<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(self.inner.lock().unwrap().clone())
    }
}

/// File-backed storage.
///
/// Both blobs live in a single file so one rename commits them together:
/// an 8-byte little-endian length prefix for the state blob, the state
/// bytes, then the snapshot bytes. Writes go to a temp file which is
/// fsynced and renamed over the live file.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Opens (creating if needed) the storage directory.
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("raft-state.bin")
    }
}

impl Storage for FileStorage {
    fn save(&mut self, state: &[u8], snapshot: &[u8]) -> io::Result<()> {
        let mut buf = Vec::with_capacity(8 + state.len() + snapshot.len());
        buf.extend_from_slice(&(state.len() as u64).to_le_bytes());
        buf.extend_from_slice(state);
        buf.extend_from_slice(snapshot);

        let temp_path = self.dir.join("raft-state.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.state_path())?;
        Ok(())
    }

    fn load(&self) -> io::Result<Option<(Vec<u8>, Vec<u8>)>> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&path)?;
        if bytes.len() < 8 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "state file shorter than its length prefix",
            ));
        }
        let mut len_buf = [0u8; 8];
        len_buf.copy_from_slice(&bytes[..8]);
        let state_len = u64::from_le_bytes(len_buf) as usize;
        if bytes.len() < 8 + state_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "state file truncated",
            ));
        }

        let state = bytes[8..8 + state_len].to_vec();
        let snapshot = bytes[8 + state_len..].to_vec();
        Ok(Some((state, snapshot)))
    }
}
