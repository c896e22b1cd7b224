use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{KeyError, Result};
use crate::principal::PrincipalKeyMetadata;
use crate::scope::KeyScope;

/// 主密钥元数据存储
///
/// 每个作用域只保存一条当前有效记录，密钥材料本身从不落盘。
/// 内部不加锁，调用方需持有配置锁。
pub struct PrincipalKeyStore {
    scope: KeyScope,
    path: PathBuf,
}

impl PrincipalKeyStore {
    pub fn new(scope: KeyScope, data_dir: &Path) -> Self {
        Self {
            scope,
            path: scope.principal_key_path(data_dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取元数据，不存在时返回 `None`
    pub fn load(&self) -> Result<Option<PrincipalKeyMetadata>> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(KeyError::Io(e)),
        };
        let metadata: PrincipalKeyMetadata = serde_json::from_str(&json)?;
        if metadata.scope != self.scope {
            return Err(KeyError::InvalidOperation(format!(
                "principal key file {} belongs to scope {}, not {}",
                self.path.display(),
                metadata.scope,
                self.scope
            )));
        }
        Ok(Some(metadata))
    }

    /// 原子地覆盖写入元数据（同目录临时文件 + 重命名）
    pub fn save(&self, metadata: &PrincipalKeyMetadata) -> Result<()> {
        let json = serde_json::to_vec_pretty(metadata)?;
        persist_atomically(&self.path, &json)?;

        debug!(
            scope = %self.scope,
            key = metadata.identity.versioned_name(),
            "saved principal key metadata"
        );
        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeyError::Io(e)),
        }
    }
}

/// Replaces `path` with `bytes` through a synced temp file in the same directory.
pub(crate) fn persist_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| KeyError::InvalidArgument(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(dir)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| KeyError::Io(e.error))?;
    Ok(())
}
