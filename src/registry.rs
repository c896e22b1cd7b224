//! Durable, per-scope registry of keyring providers.
//!
//! The registry file is an append-only sequence of fixed-size records. Records are
//! never rewritten; the only way to remove one is to tear down the whole scope.
//!
//! 中文: 按作用域持久化的密钥环提供者注册表，定长记录只追加不修改。

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::cache::SharedKeyRegion;
use crate::error::{KeyError, Result};
use crate::scope::KeyScope;

/// 提供者名称的最大长度（含结尾 NUL）
pub const MAX_PROVIDER_NAME_LEN: usize = 128;
/// 选项 JSON 的最大长度（含结尾 NUL）
pub const MAX_KEYRING_OPTION_LEN: usize = 1024;
/// 单条注册记录大小：id + 类型 + 名称 + 选项
pub const PROVIDER_RECORD_SIZE: usize = 4 + 4 + MAX_PROVIDER_NAME_LEN + MAX_KEYRING_OPTION_LEN;

const PROVIDER_HINT: &str = "use register_provider to create the key provider";

/// 密钥环提供者类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    File,
    VaultV2,
}

impl ProviderKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ProviderKind::File => "file",
            ProviderKind::VaultV2 => "vault-v2",
        }
    }

    pub fn from_type_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "file" => Ok(ProviderKind::File),
            "vault-v2" => Ok(ProviderKind::VaultV2),
            other => Err(KeyError::InvalidArgument(format!(
                "unknown key provider type \"{}\"",
                other
            ))),
        }
    }

    fn code(&self) -> u32 {
        match self {
            ProviderKind::File => 1,
            ProviderKind::VaultV2 => 2,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(ProviderKind::File),
            2 => Some(ProviderKind::VaultV2),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileKeyringOptions {
    pub path: PathBuf,
}

/// Vault KV v2 connection options. The token is kept as a secret and never logged.
#[derive(Debug)]
pub struct VaultV2Options {
    pub url: String,
    pub token: SecretString,
    pub mount_path: String,
    pub ca_path: Option<PathBuf>,
}

impl Clone for VaultV2Options {
    fn clone(&self) -> Self {
        Self {
            url: self.url.clone(),
            token: SecretString::from(self.token.expose_secret().to_owned()),
            mount_path: self.mount_path.clone(),
            ca_path: self.ca_path.clone(),
        }
    }
}

/// Type-specific provider options.
#[derive(Debug, Clone)]
pub enum ProviderOptions {
    File(FileKeyringOptions),
    VaultV2(VaultV2Options),
}

/// On-disk JSON form of the Vault options.
#[derive(Serialize, Deserialize)]
struct StoredVaultOptions {
    url: String,
    token: String,
    #[serde(rename = "mountPath")]
    mount_path: String,
    #[serde(rename = "caPath", default, skip_serializing_if = "Option::is_none")]
    ca_path: Option<PathBuf>,
}

impl ProviderOptions {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderOptions::File(_) => ProviderKind::File,
            ProviderOptions::VaultV2(_) => ProviderKind::VaultV2,
        }
    }

    /// Parses options as given by an operator, e.g. `{"path": "/tmp/k1"}` for `file`.
    pub fn from_json(kind: ProviderKind, json: &str) -> Result<Self> {
        match kind {
            ProviderKind::File => Ok(ProviderOptions::File(serde_json::from_str(json)?)),
            ProviderKind::VaultV2 => {
                let stored: StoredVaultOptions = serde_json::from_str(json)?;
                Ok(ProviderOptions::VaultV2(VaultV2Options {
                    url: stored.url,
                    token: SecretString::from(stored.token),
                    mount_path: stored.mount_path,
                    ca_path: stored.ca_path,
                }))
            }
        }
    }

    pub fn to_json(&self) -> Result<String> {
        let json = match self {
            ProviderOptions::File(opts) => serde_json::to_string(opts)?,
            ProviderOptions::VaultV2(opts) => serde_json::to_string(&StoredVaultOptions {
                url: opts.url.clone(),
                token: opts.token.expose_secret().to_owned(),
                mount_path: opts.mount_path.clone(),
                ca_path: opts.ca_path.clone(),
            })?,
        };
        Ok(json)
    }
}

/// One registered keyring provider.
#[derive(Debug, Clone)]
pub struct KeyringProviderConfig {
    pub provider_id: u32,
    pub provider_name: String,
    pub options: ProviderOptions,
}

impl KeyringProviderConfig {
    pub fn kind(&self) -> ProviderKind {
        self.options.kind()
    }
}

enum ScanFilter<'a> {
    All,
    ByName(&'a str),
    ById(u32),
    ByKind(ProviderKind),
}

impl ScanFilter<'_> {
    fn matches(&self, record: &KeyringProviderConfig) -> bool {
        match self {
            ScanFilter::All => true,
            ScanFilter::ByName(name) => record.provider_name.eq_ignore_ascii_case(name),
            ScanFilter::ById(id) => record.provider_id == *id,
            ScanFilter::ByKind(kind) => record.kind() == *kind,
        }
    }
}

/// Provider registry of one scope.
///
/// Reads take the shared provider-file lock; `register` takes it exclusively for the
/// whole scan-then-append sequence, so two concurrent registrations of the same name
/// cannot both succeed.
pub struct ProviderRegistry {
    scope: KeyScope,
    path: PathBuf,
    region: Arc<SharedKeyRegion>,
}

impl ProviderRegistry {
    pub fn new(scope: KeyScope, data_dir: &Path, region: Arc<SharedKeyRegion>) -> Self {
        Self {
            scope,
            path: scope.registry_path(data_dir),
            region,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Registers a provider and returns its record with the assigned id.
    ///
    /// Ids are `1 + max(existing)` and therefore strictly increasing across restarts.
    pub fn register(&self, name: &str, options: ProviderOptions) -> Result<KeyringProviderConfig> {
        if name.is_empty() || name.len() >= MAX_PROVIDER_NAME_LEN {
            return Err(KeyError::InvalidArgument(format!(
                "key provider name must be 1..{} bytes",
                MAX_PROVIDER_NAME_LEN
            )));
        }
        let options_json = options.to_json()?;
        if options_json.len() >= MAX_KEYRING_OPTION_LEN {
            return Err(KeyError::InvalidArgument(format!(
                "key provider options must be shorter than {} bytes",
                MAX_KEYRING_OPTION_LEN
            )));
        }

        let _guard = self.region.provider_files_exclusive();

        let existing = self.scan(ScanFilter::All)?;
        if existing
            .iter()
            .any(|p| p.provider_name.eq_ignore_ascii_case(name))
        {
            return Err(KeyError::duplicate(
                format!("key provider \"{}\"", name),
                None,
            ));
        }
        let provider_id = existing.iter().map(|p| p.provider_id).max().unwrap_or(0) + 1;

        let config = KeyringProviderConfig {
            provider_id,
            provider_name: name.to_string(),
            options,
        };
        let record = encode_record(&config, &options_json);

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| {
                error!(path = %self.path.display(), "could not open key provider file: {}", e);
                KeyError::Io(io::Error::new(
                    e.kind(),
                    format!("could not open key provider file {}: {}", self.path.display(), e),
                ))
            })?;
        file.write_all(&record)?;
        file.sync_all()?;

        info!(
            scope = %self.scope,
            provider_id,
            provider = name,
            kind = config.kind().type_name(),
            "registered key provider"
        );
        Ok(config)
    }

    pub fn lookup_by_name(&self, name: &str) -> Result<KeyringProviderConfig> {
        self.scan_one(ScanFilter::ByName(name))?.ok_or_else(|| {
            KeyError::not_found_hint(format!("key provider \"{}\"", name), PROVIDER_HINT)
        })
    }

    pub fn lookup_by_id(&self, provider_id: u32) -> Result<KeyringProviderConfig> {
        self.scan_one(ScanFilter::ById(provider_id))?.ok_or_else(|| {
            KeyError::not_found_hint(format!("key provider with id {}", provider_id), PROVIDER_HINT)
        })
    }

    pub fn lookup_by_kind(&self, kind: ProviderKind) -> Result<Vec<KeyringProviderConfig>> {
        let _guard = self.region.provider_files_shared();
        self.scan(ScanFilter::ByKind(kind))
    }

    pub fn list_all(&self) -> Result<Vec<KeyringProviderConfig>> {
        let _guard = self.region.provider_files_shared();
        self.scan(ScanFilter::All)
    }

    /// Removes the registry file. Used only when the owning scope is torn down.
    pub fn destroy(&self) -> Result<()> {
        let _guard = self.region.provider_files_exclusive();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeyError::Io(e)),
        }
    }

    fn scan_one(&self, filter: ScanFilter<'_>) -> Result<Option<KeyringProviderConfig>> {
        let _guard = self.region.provider_files_shared();
        Ok(self.scan(filter)?.into_iter().next())
    }

    /// Scans the file without locking; callers hold the provider-file lock.
    fn scan(&self, filter: ScanFilter<'_>) -> Result<Vec<KeyringProviderConfig>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(KeyError::ResourceUnavailable(format!(
                    "could not open key provider file {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        let mut providers = Vec::new();
        let mut buf = vec![0u8; PROVIDER_RECORD_SIZE];
        loop {
            let filled = read_full(&mut file, &mut buf)?;
            if filled == 0 {
                break;
            }
            if filled != PROVIDER_RECORD_SIZE {
                error!(
                    path = %self.path.display(),
                    "invalid key provider record size {} expected {}",
                    filled,
                    PROVIDER_RECORD_SIZE
                );
                return Err(KeyError::DataCorrupted {
                    path: self.path.clone(),
                    expected: PROVIDER_RECORD_SIZE,
                    actual: filled,
                });
            }
            let record = self.decode_record(&buf)?;
            debug!(
                provider_id = record.provider_id,
                provider = %record.provider_name,
                "read key provider record"
            );
            if filter.matches(&record) {
                providers.push(record);
            }
        }
        Ok(providers)
    }

    fn decode_record(&self, buf: &[u8]) -> Result<KeyringProviderConfig> {
        let provider_id = read_u32(&buf[0..4]);
        let type_code = read_u32(&buf[4..8]);
        let name = nul_terminated(&buf[8..8 + MAX_PROVIDER_NAME_LEN])?;
        let options_json = nul_terminated(&buf[8 + MAX_PROVIDER_NAME_LEN..])?;

        let kind = ProviderKind::from_code(type_code).ok_or_else(|| {
            KeyError::InvalidOperation(format!(
                "unknown key provider type {} in {}",
                type_code,
                self.path.display()
            ))
        })?;
        Ok(KeyringProviderConfig {
            provider_id,
            provider_name: name,
            options: ProviderOptions::from_json(kind, &options_json)?,
        })
    }
}

fn encode_record(config: &KeyringProviderConfig, options_json: &str) -> Vec<u8> {
    let mut record = vec![0u8; PROVIDER_RECORD_SIZE];
    record[0..4].copy_from_slice(&config.provider_id.to_le_bytes());
    record[4..8].copy_from_slice(&config.kind().code().to_le_bytes());
    let name = config.provider_name.as_bytes();
    record[8..8 + name.len()].copy_from_slice(name);
    let opts = options_json.as_bytes();
    let start = 8 + MAX_PROVIDER_NAME_LEN;
    record[start..start + opts.len()].copy_from_slice(opts);
    record
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    u32::from_le_bytes(raw)
}

fn nul_terminated(bytes: &[u8]) -> Result<String> {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8(bytes[..end].to_vec())?)
}

fn read_full(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(KeyError::Io(e)),
        }
    }
    Ok(filled)
}
