//! Internal (per-object) keys and the per-scope key map of wrapped envelopes.
// 中文: 内部（每对象）密钥，以及按作用域保存的封装密钥映射。

use std::any::Any;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{KeyError, Result};
use crate::keyring::INTERNAL_KEY_LEN;
use crate::principal::PrincipalKeyIdentity;
use crate::principal::store::persist_atomically;
use crate::scope::KeyScope;

/// 内部密钥所保护对象的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum InternalKeyRelType {
    #[default]
    Unknown,
    Global,
    Smgr,
    Basic,
}

/// Opaque per-key state owned by the cipher layer (e.g. an expanded key schedule).
pub struct CipherContext(Box<dyn Any + Send + Sync>);

impl CipherContext {
    pub fn new<T: Any + Send + Sync>(state: T) -> Self {
        Self(Box::new(state))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

/// An unwrapped per-object key.
///
/// `ctx` belongs to the cipher layer; it is never serialized and a clone starts
/// without one.
pub struct InternalKey {
    key: [u8; INTERNAL_KEY_LEN],
    rel_type: InternalKeyRelType,
    ctx: Option<CipherContext>,
}

impl InternalKey {
    pub fn new(key: [u8; INTERNAL_KEY_LEN], rel_type: InternalKeyRelType) -> Self {
        Self {
            key,
            rel_type,
            ctx: None,
        }
    }

    /// 从操作系统随机源生成新的内部密钥
    pub fn generate(rel_type: InternalKeyRelType) -> Result<Self> {
        let mut key = [0u8; INTERNAL_KEY_LEN];
        crate::keyring::random_bytes(&mut key)?;
        Ok(Self::new(key, rel_type))
    }

    pub fn key_bytes(&self) -> &[u8; INTERNAL_KEY_LEN] {
        &self.key
    }

    pub fn rel_type(&self) -> InternalKeyRelType {
        self.rel_type
    }

    pub fn context(&self) -> Option<&CipherContext> {
        self.ctx.as_ref()
    }

    pub fn set_context(&mut self, ctx: CipherContext) {
        self.ctx = Some(ctx);
    }
}

impl Clone for InternalKey {
    fn clone(&self) -> Self {
        Self::new(self.key, self.rel_type)
    }
}

impl PartialEq for InternalKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.rel_type == other.rel_type
    }
}

impl Eq for InternalKey {}

impl Drop for InternalKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for InternalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalKey")
            .field("rel_type", &self.rel_type)
            .field("has_ctx", &self.ctx.is_some())
            .finish()
    }
}

/// Durable form of an internal key: the ciphertext plus which principal key made it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedInternalKeyEnvelope {
    pub principal_key: PrincipalKeyIdentity,
    pub provider_id: u32,
    pub rel_type: InternalKeyRelType,
    #[serde(with = "serde_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
}

impl WrappedInternalKeyEnvelope {
    pub fn is_wrapped_by(&self, identity: &PrincipalKeyIdentity) -> bool {
        &self.principal_key == identity
    }
}

/// 作用域的密钥映射文件：对象 id → 封装后的内部密钥
///
/// 内部不加锁，调用方需持有配置锁
pub struct KeyMapFile {
    path: PathBuf,
}

impl KeyMapFile {
    pub fn new(scope: KeyScope, data_dir: &Path) -> Self {
        Self {
            path: scope.key_map_path(data_dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_all(&self) -> Result<BTreeMap<u32, WrappedInternalKeyEnvelope>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(KeyError::Io(e)),
        }
    }

    pub fn get(&self, object_id: u32) -> Result<Option<WrappedInternalKeyEnvelope>> {
        Ok(self.load_all()?.remove(&object_id))
    }

    /// 写入（或替换）一个对象的封装密钥
    pub fn put(&self, object_id: u32, envelope: WrappedInternalKeyEnvelope) -> Result<()> {
        let mut entries = self.load_all()?;
        entries.insert(object_id, envelope);
        self.write_all(&entries)
    }

    pub fn remove(&self, object_id: u32) -> Result<bool> {
        let mut entries = self.load_all()?;
        let removed = entries.remove(&object_id).is_some();
        if removed {
            self.write_all(&entries)?;
        }
        Ok(removed)
    }

    pub fn write_all(&self, entries: &BTreeMap<u32, WrappedInternalKeyEnvelope>) -> Result<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        persist_atomically(&self.path, &json)
    }
}
