//! Keyring providers: the external systems principal key material is fetched from.
// 中文: 密钥环提供者，即主密钥材料的外部来源。

pub mod file;
#[cfg(feature = "vault")]
pub mod vault;

use rand_core::{OsRng, TryRngCore};
use tracing::{debug, error};
use zeroize::Zeroizing;

use crate::error::{KeyError, Result};
use crate::registry::{KeyringProviderConfig, ProviderKind, ProviderOptions};

/// 密钥名称的最大长度（含结尾 NUL）
pub const KEY_NAME_LEN: usize = 256;
/// 单个密钥数据的最大长度
pub const MAX_KEY_DATA_SIZE: usize = 32;
/// 新生成的主密钥与内部密钥长度
pub const INTERNAL_KEY_LEN: usize = 16;

/// A named key as held by a keyring provider.
///
/// 中文: 密钥环提供者中的一个具名密钥。数据在释放时清零。
#[derive(Clone)]
pub struct KeyInfo {
    name: String,
    data: Zeroizing<Vec<u8>>,
}

impl KeyInfo {
    pub fn new(name: impl Into<String>, data: &[u8]) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() >= KEY_NAME_LEN {
            return Err(KeyError::InvalidArgument(format!(
                "key name must be 1..{} bytes, got {}",
                KEY_NAME_LEN,
                name.len()
            )));
        }
        if data.is_empty() || data.len() > MAX_KEY_DATA_SIZE {
            return Err(KeyError::InvalidArgument(format!(
                "key data must be 1..={} bytes, got {}",
                MAX_KEY_DATA_SIZE,
                data.len()
            )));
        }
        Ok(Self {
            name,
            data: Zeroizing::new(data.to_vec()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl std::fmt::Debug for KeyInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyInfo")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Capability shared by every keyring variant.
///
/// Providers hold no cache of their own; repeated fetches go to the backing store.
///
/// 中文: 所有密钥环变体共享的能力接口。提供者自身不做缓存。
pub trait KeyringProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Looks a key up by name. `Ok(None)` means the provider answered "not found".
    fn fetch(&self, name: &str) -> Result<Option<KeyInfo>>;

    /// Stores a new key. Fails with `InvalidOperation` if the name is already taken.
    fn store(&self, key: &KeyInfo) -> Result<()>;

    /// Like [`fetch`](Self::fetch), but a missing key is an error.
    fn fetch_existing(&self, name: &str) -> Result<KeyInfo> {
        self.fetch(name)?.ok_or_else(|| {
            KeyError::not_found(format!(
                "key \"{}\" in keyring provider \"{}\"",
                name,
                self.provider_name()
            ))
        })
    }
}

/// Builds live providers from registry records.
pub trait KeyringFactory: Send + Sync {
    fn open(&self, config: &KeyringProviderConfig) -> Result<Box<dyn KeyringProvider>>;
}

/// 默认工厂：根据配置构造文件或 Vault 提供者
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultKeyringFactory;

impl KeyringFactory for DefaultKeyringFactory {
    fn open(&self, config: &KeyringProviderConfig) -> Result<Box<dyn KeyringProvider>> {
        match &config.options {
            ProviderOptions::File(opts) => Ok(Box::new(file::FileKeyring::new(
                config.provider_name.clone(),
                opts.path.clone(),
            ))),
            #[cfg(feature = "vault")]
            ProviderOptions::VaultV2(opts) => Ok(Box::new(vault::VaultV2Keyring::new(
                config.provider_name.clone(),
                opts,
            )?)),
            #[cfg(not(feature = "vault"))]
            ProviderOptions::VaultV2(_) => Err(KeyError::InvalidOperation(format!(
                "key provider \"{}\" needs the `vault` feature",
                config.provider_name
            ))),
        }
    }
}

/// Fills `buf` from the OS random source. Failure is fatal: weak key material must
/// never be produced.
pub(crate) fn random_bytes(buf: &mut [u8]) -> Result<()> {
    OsRng.try_fill_bytes(buf).map_err(|e| {
        error!("could not generate random key material: {}", e);
        KeyError::Fatal(format!("could not generate random key material: {}", e))
    })
}

/// Generates `len` random bytes and stores them under `name` in `provider`.
///
/// 中文: 生成随机密钥并存入提供者。
pub fn generate_and_store(
    provider: &dyn KeyringProvider,
    name: &str,
    len: usize,
) -> Result<KeyInfo> {
    let mut data = Zeroizing::new(vec![0u8; len]);
    random_bytes(&mut data)?;
    let key = KeyInfo::new(name, &data)?;
    provider.store(&key)?;
    debug!(
        key = name,
        provider = provider.provider_name(),
        "generated and stored new key"
    );
    Ok(key)
}
