use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::error::{KeyError, Result};
use crate::keyring::{KEY_NAME_LEN, KeyInfo, KeyringProvider, MAX_KEY_DATA_SIZE};
use crate::registry::ProviderKind;

/// 单条记录：名称（256）+ 数据（32）+ 长度（u32 LE）
const RECORD_SIZE: usize = KEY_NAME_LEN + MAX_KEY_DATA_SIZE + 4;

/// 文件密钥环
///
/// 以定长记录顺序追加密钥，查找时线性扫描并忽略名称大小写
pub struct FileKeyring {
    provider_name: String,
    path: PathBuf,
}

impl FileKeyring {
    /// 创建文件密钥环
    ///
    /// # 参数
    ///
    /// * `provider_name` - 提供者名称
    /// * `path` - 密钥环文件路径，不存在时视为空密钥环
    pub fn new(provider_name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            provider_name: provider_name.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self, append: bool) -> Result<File> {
        let mut options = OpenOptions::new();
        options.read(true).create(true);
        if append {
            options.append(true);
        } else {
            options.write(true);
        }
        options.open(&self.path).map_err(|e| {
            error!(path = %self.path.display(), "failed to open keyring file: {}", e);
            KeyError::ResourceUnavailable(format!(
                "failed to open keyring file {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn encode(key: &KeyInfo) -> [u8; RECORD_SIZE] {
        let mut record = [0u8; RECORD_SIZE];
        let name = key.name().as_bytes();
        record[..name.len()].copy_from_slice(name);
        let data = key.data();
        record[KEY_NAME_LEN..KEY_NAME_LEN + data.len()].copy_from_slice(data);
        record[KEY_NAME_LEN + MAX_KEY_DATA_SIZE..].copy_from_slice(&(data.len() as u32).to_le_bytes());
        record
    }

    fn decode(&self, record: &[u8; RECORD_SIZE]) -> Result<KeyInfo> {
        let name_end = record[..KEY_NAME_LEN]
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(KEY_NAME_LEN);
        let name = String::from_utf8(record[..name_end].to_vec())?;
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&record[KEY_NAME_LEN + MAX_KEY_DATA_SIZE..]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len == 0 || len > MAX_KEY_DATA_SIZE {
            return Err(KeyError::DataCorrupted {
                path: self.path.clone(),
                expected: MAX_KEY_DATA_SIZE,
                actual: len,
            });
        }
        KeyInfo::new(name, &record[KEY_NAME_LEN..KEY_NAME_LEN + len])
    }

    /// Reads the next full record. `Ok(false)` at a clean end of file.
    fn read_record(&self, file: &mut File, buf: &mut [u8; RECORD_SIZE]) -> Result<bool> {
        let mut filled = 0;
        while filled < RECORD_SIZE {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(KeyError::Io(e)),
            }
        }
        match filled {
            0 => Ok(false),
            RECORD_SIZE => Ok(true),
            actual => {
                error!(path = %self.path.display(), "keyring file has a truncated record");
                Err(KeyError::DataCorrupted {
                    path: self.path.clone(),
                    expected: RECORD_SIZE,
                    actual,
                })
            }
        }
    }
}

impl KeyringProvider for FileKeyring {
    fn provider_name(&self) -> &str {
        &self.provider_name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::File
    }

    fn fetch(&self, name: &str) -> Result<Option<KeyInfo>> {
        let mut file = self.open(false)?;
        let mut buf = [0u8; RECORD_SIZE];
        while self.read_record(&mut file, &mut buf)? {
            let key = self.decode(&buf)?;
            if key.name().eq_ignore_ascii_case(name) {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    fn store(&self, key: &KeyInfo) -> Result<()> {
        if self.fetch(key.name())?.is_some() {
            return Err(KeyError::InvalidOperation(format!(
                "key with name {} already exists in keyring",
                key.name()
            )));
        }

        let mut file = self.open(true)?;
        let record = Self::encode(key);
        file.write_all(&record).map_err(|e| {
            KeyError::ResourceUnavailable(format!(
                "failed to write keyring file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        file.sync_data()?;
        debug!(key = key.name(), path = %self.path.display(), "stored key in file keyring");
        Ok(())
    }
}
