//! Log records describing key-management transitions, and the journal they are
//! appended to. A standby replays them through [`KeyManager::redo`].
//!
//! [`KeyManager::redo`]: crate::manager::KeyManager::redo

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{KeyError, Result};
use crate::keymap::WrappedInternalKeyEnvelope;
use crate::principal::{PrincipalKeyIdentity, PrincipalKeyMetadata};
use crate::scope::KeyScope;

/// 密钥管理日志记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyLogRecord {
    AddPrincipalKey(PrincipalKeyMetadata),
    RotatePrincipalKey {
        previous: PrincipalKeyIdentity,
        current: PrincipalKeyMetadata,
    },
    AddObjectKey {
        scope: KeyScope,
        object_id: u32,
        envelope: WrappedInternalKeyEnvelope,
    },
    DeleteObjectKey {
        scope: KeyScope,
        object_id: u32,
    },
    CleanupScope(KeyScope),
}

impl KeyLogRecord {
    pub fn scope(&self) -> KeyScope {
        match self {
            KeyLogRecord::AddPrincipalKey(meta) => meta.scope,
            KeyLogRecord::RotatePrincipalKey { current, .. } => current.scope,
            KeyLogRecord::AddObjectKey { scope, .. }
            | KeyLogRecord::DeleteObjectKey { scope, .. }
            | KeyLogRecord::CleanupScope(scope) => *scope,
        }
    }
}

/// The host's log service. `append` returns once the record is durable.
pub trait KeyJournal: Send + Sync {
    /// Appends a record and returns its sequence number.
    fn append(&self, record: &KeyLogRecord) -> Result<u64>;
}

/// JSON-lines journal file, synced after every append.
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
    next_seq: AtomicU64,
}

impl FileJournal {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let existing = Self::read_records(&path)?.len() as u64;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            next_seq: AtomicU64::new(existing + 1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every record back in append order.
    pub fn replay_all(&self) -> Result<Vec<KeyLogRecord>> {
        let _file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        Self::read_records(&self.path)
    }

    fn read_records(path: &Path) -> Result<Vec<KeyLogRecord>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(KeyError::Io(e)),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}

impl KeyJournal for FileJournal {
    fn append(&self, record: &KeyLogRecord) -> Result<u64> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&line)?;
        file.sync_data()?;
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        debug!(seq, scope = %record.scope(), "appended key log record");
        Ok(seq)
    }
}

/// 内存日志，用于测试和不需要复制的部署
#[derive(Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<KeyLogRecord>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<KeyLogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl KeyJournal for MemoryJournal {
    fn append(&self, record: &KeyLogRecord) -> Result<u64> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.push(record.clone());
        Ok(records.len() as u64)
    }
}
