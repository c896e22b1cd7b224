//! Principal key identity, metadata and in-memory material.
// 中文: 主密钥的标识、元数据与内存中的密钥材料。

pub mod lifecycle;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{KeyError, Result};
use crate::keyring::{KEY_NAME_LEN, KeyInfo, MAX_KEY_DATA_SIZE};
use crate::scope::KeyScope;

pub use store::PrincipalKeyStore;

/// 新主密钥名称的初始版本
pub const DEFAULT_PRINCIPAL_KEY_VERSION: u32 = 0;
/// 版本号搜索上限
pub const MAX_PRINCIPAL_KEY_VERSION: u32 = 100_000;

/// Name plus version. `versioned_name` is what a provider is asked for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrincipalKeyIdentity {
    name: String,
    version: u32,
    versioned_name: String,
}

impl PrincipalKeyIdentity {
    pub fn new(name: impl Into<String>, version: u32) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(KeyError::InvalidArgument(
                "principal key name must not be empty".to_string(),
            ));
        }
        let versioned_name = format!("{}_{}", name, version);
        if versioned_name.len() >= KEY_NAME_LEN {
            return Err(KeyError::InvalidArgument(format!(
                "principal key name \"{}\" is too long",
                name
            )));
        }
        Ok(Self {
            name,
            version,
            versioned_name,
        })
    }

    pub fn with_version(&self, version: u32) -> Result<Self> {
        Self::new(self.name.clone(), version)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn versioned_name(&self) -> &str {
        &self.versioned_name
    }
}

impl std::fmt::Display for PrincipalKeyIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.versioned_name)
    }
}

/// 作用域当前有效主密钥的持久化元数据（不含密钥本身）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrincipalKeyMetadata {
    pub identity: PrincipalKeyIdentity,
    pub provider_id: u32,
    pub scope: KeyScope,
    pub creation_time: DateTime<Utc>,
}

impl PrincipalKeyMetadata {
    pub fn new(identity: PrincipalKeyIdentity, provider_id: u32, scope: KeyScope) -> Self {
        Self {
            identity,
            provider_id,
            scope,
            creation_time: Utc::now(),
        }
    }
}

/// Unwrapped principal key. Lives only in memory and is wiped on drop.
///
/// The secret is held inline in a fixed-size buffer so a cache slot never needs a
/// second allocation.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrincipalKeyMaterial {
    #[zeroize(skip)]
    metadata: PrincipalKeyMetadata,
    secret: [u8; MAX_KEY_DATA_SIZE],
    len: usize,
}

impl PrincipalKeyMaterial {
    pub fn new(metadata: PrincipalKeyMetadata, key: &KeyInfo) -> Self {
        let mut secret = [0u8; MAX_KEY_DATA_SIZE];
        secret[..key.len()].copy_from_slice(key.data());
        Self {
            metadata,
            secret,
            len: key.len(),
        }
    }

    pub fn metadata(&self) -> &PrincipalKeyMetadata {
        &self.metadata
    }

    pub fn identity(&self) -> &PrincipalKeyIdentity {
        &self.metadata.identity
    }

    pub fn scope(&self) -> KeyScope {
        self.metadata.scope
    }

    pub fn key_bytes(&self) -> &[u8] {
        &self.secret[..self.len]
    }
}

impl std::fmt::Debug for PrincipalKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrincipalKeyMaterial")
            .field("metadata", &self.metadata)
            .field("len", &self.len)
            .finish()
    }
}

/// Informational view of a scope's active principal key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrincipalKeyInfo {
    pub name: String,
    /// `None` when the provider record no longer exists.
    pub provider_name: Option<String>,
    pub provider_id: u32,
    pub versioned_name: String,
    pub version: u32,
    pub creation_time: DateTime<Utc>,
}
