//! Tenant scopes and their on-disk layout.
// 中文: 租户作用域（数据库 × 表空间）及其磁盘布局。

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Object id of the log stream whose internal key is held by the bootstrap path.
pub const WAL_OBJECT_ID: u32 = 608;

/// A (database, tablespace) pair. Every provider registry, principal key and key map
/// belongs to exactly one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyScope {
    pub database_id: u32,
    pub tablespace_id: u32,
}

impl KeyScope {
    /// The scope that protects the log stream. Never cached in the shared region.
    pub const GLOBAL: KeyScope = KeyScope {
        database_id: 607,
        tablespace_id: 1664,
    };

    pub const fn new(database_id: u32, tablespace_id: u32) -> Self {
        Self {
            database_id,
            tablespace_id,
        }
    }

    pub fn is_global(&self) -> bool {
        *self == Self::GLOBAL
    }

    /// 作用域目录：`<data_dir>/pg_tde/<db>_<spc>`，全局作用域为 `<data_dir>/pg_tde/global`
    pub fn directory(&self, data_dir: &Path) -> PathBuf {
        let base = data_dir.join("pg_tde");
        if self.is_global() {
            base.join("global")
        } else {
            base.join(format!("{}_{}", self.database_id, self.tablespace_id))
        }
    }

    pub fn registry_path(&self, data_dir: &Path) -> PathBuf {
        self.directory(data_dir).join("keyrings")
    }

    pub fn principal_key_path(&self, data_dir: &Path) -> PathBuf {
        self.directory(data_dir).join("principal_key.json")
    }

    pub fn key_map_path(&self, data_dir: &Path) -> PathBuf {
        self.directory(data_dir).join("key_map.json")
    }
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_global() {
            write!(f, "global")
        } else {
            write!(f, "{}/{}", self.database_id, self.tablespace_id)
        }
    }
}
