//! `KeyManager`: the operations the encryption layer and the admin surface call.
//!
//! One `KeyManager` corresponds to one backend. Backends of the same process group
//! share a [`SharedKeyRegion`], and with it the principal-key cache and the named
//! locks. Each backend also keeps a private cache of unwrapped internal keys.
//!
//! 中文: 加密层与管理接口调用的操作集合。每个 `KeyManager` 对应一个后端，
//! 同一进程组的后端共享同一个 `SharedKeyRegion`。

use std::collections::HashMap;
use std::fs;
use std::io;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::bootstrap::BootstrapKeys;
use crate::cache::{RegionAttachment, SharedKeyRegion};
use crate::config::TdeConfig;
use crate::error::{KeyError, Result};
use crate::journal::{FileJournal, KeyJournal, KeyLogRecord};
use crate::keyring::{DefaultKeyringFactory, KeyringFactory, KeyringProvider};
use crate::keymap::{InternalKey, InternalKeyRelType, KeyMapFile, WrappedInternalKeyEnvelope};
use crate::principal::{PrincipalKeyIdentity, PrincipalKeyMaterial, PrincipalKeyStore};
use crate::registry::{KeyringProviderConfig, ProviderKind, ProviderOptions, ProviderRegistry};
use crate::scope::{KeyScope, WAL_OBJECT_ID};
use crate::wrapping;

pub(crate) const SET_KEY_HINT: &str = "use set_principal_key to configure a principal key";

/// Builder for [`KeyManager`]. Every collaborator has a production default.
pub struct KeyManagerBuilder {
    config: TdeConfig,
    region: Option<Arc<SharedKeyRegion>>,
    factory: Option<Arc<dyn KeyringFactory>>,
    journal: Option<Arc<dyn KeyJournal>>,
    bootstrap: Option<Arc<BootstrapKeys>>,
}

impl KeyManagerBuilder {
    /// Attaches to an existing shared region instead of allocating a new one.
    pub fn region(mut self, region: Arc<SharedKeyRegion>) -> Self {
        self.region = Some(region);
        self
    }

    pub fn keyring_factory(mut self, factory: Arc<dyn KeyringFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn journal(mut self, journal: Arc<dyn KeyJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Shares process-lifetime bootstrap keys, or injects preloaded ones.
    pub fn bootstrap(mut self, bootstrap: Arc<BootstrapKeys>) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    /// Builds the manager. Does not touch the global keys; see
    /// [`KeyManager::init_global_keys`].
    pub fn build(self) -> Result<KeyManager> {
        self.config.validate()?;
        fs::create_dir_all(&self.config.data_dir)?;

        let region = self
            .region
            .unwrap_or_else(|| SharedKeyRegion::new(self.config.cache.capacity));
        let journal = match self.journal {
            Some(journal) => journal,
            None => Arc::new(FileJournal::open(
                self.config.data_dir.join("pg_tde").join("keys.journal"),
            )?),
        };

        Ok(KeyManager {
            attachment: region.attach(),
            factory: self
                .factory
                .unwrap_or_else(|| Arc::new(DefaultKeyringFactory)),
            journal,
            bootstrap: self.bootstrap.unwrap_or_default(),
            internal_keys: DashMap::new(),
            config: self.config,
        })
    }
}

/// 密钥管理器
pub struct KeyManager {
    pub(crate) config: TdeConfig,
    pub(crate) attachment: RegionAttachment,
    pub(crate) factory: Arc<dyn KeyringFactory>,
    pub(crate) journal: Arc<dyn KeyJournal>,
    pub(crate) bootstrap: Arc<BootstrapKeys>,
    /// 后端私有的内部密钥缓存
    pub(crate) internal_keys: DashMap<(KeyScope, u32), InternalKey>,
}

impl KeyManager {
    pub fn builder(config: TdeConfig) -> KeyManagerBuilder {
        KeyManagerBuilder {
            config,
            region: None,
            factory: None,
            journal: None,
            bootstrap: None,
        }
    }

    /// Builds a manager with default collaborators and loads the global keys.
    pub fn open(config: TdeConfig) -> Result<Self> {
        let manager = Self::builder(config).build()?;
        manager.init_global_keys()?;
        Ok(manager)
    }

    pub fn config(&self) -> &TdeConfig {
        &self.config
    }

    pub fn region(&self) -> &Arc<SharedKeyRegion> {
        self.attachment.region()
    }

    pub fn bootstrap_keys(&self) -> &Arc<BootstrapKeys> {
        &self.bootstrap
    }

    pub(crate) fn registry(&self, scope: KeyScope) -> ProviderRegistry {
        ProviderRegistry::new(scope, &self.config.data_dir, Arc::clone(self.region()))
    }

    pub(crate) fn principal_store(&self, scope: KeyScope) -> PrincipalKeyStore {
        PrincipalKeyStore::new(scope, &self.config.data_dir)
    }

    pub(crate) fn key_map(&self, scope: KeyScope) -> KeyMapFile {
        KeyMapFile::new(scope, &self.config.data_dir)
    }

    pub(crate) fn open_provider(&self, config: &KeyringProviderConfig) -> Result<Box<dyn KeyringProvider>> {
        self.factory.open(config)
    }

    // --- providers ---

    pub fn register_provider(&self, scope: KeyScope, name: &str, options: ProviderOptions) -> Result<u32> {
        Ok(self.registry(scope).register(name, options)?.provider_id)
    }

    /// Registers a provider from a type name (`file`, `vault-v2`) and an options JSON document.
    pub fn register_provider_json(
        &self,
        scope: KeyScope,
        name: &str,
        type_name: &str,
        options_json: &str,
    ) -> Result<u32> {
        let kind = ProviderKind::from_type_name(type_name)?;
        let options = ProviderOptions::from_json(kind, options_json)?;
        self.register_provider(scope, name, options)
    }

    pub fn list_providers(&self, scope: KeyScope) -> Result<Vec<KeyringProviderConfig>> {
        self.registry(scope).list_all()
    }

    pub fn list_providers_by_kind(&self, scope: KeyScope, kind: ProviderKind) -> Result<Vec<KeyringProviderConfig>> {
        self.registry(scope).lookup_by_kind(kind)
    }

    pub fn provider_by_name(&self, scope: KeyScope, name: &str) -> Result<KeyringProviderConfig> {
        self.registry(scope).lookup_by_name(name)
    }

    // --- internal keys ---

    /// Generates an internal key for `object_id`, wraps it with the scope's active
    /// principal key and records the envelope.
    pub fn create_internal_key(
        &self,
        scope: KeyScope,
        object_id: u32,
        rel_type: InternalKeyRelType,
    ) -> Result<InternalKey> {
        let principal = self
            .resolve_principal_key(scope)?
            .ok_or_else(|| KeyError::not_found_hint(format!("principal key for scope {}", scope), SET_KEY_HINT))?;

        let key = InternalKey::generate(rel_type)?;
        let envelope = wrapping::wrap(object_id, &key, &principal)?;
        {
            let _guard = self.region().key_files_exclusive();
            let key_map = self.key_map(scope);
            if key_map.get(object_id)?.is_some() {
                return Err(KeyError::duplicate(
                    format!("internal key for object {} in scope {}", object_id, scope),
                    None,
                ));
            }
            key_map.put(object_id, envelope.clone())?;
        }
        self.journal.append(&KeyLogRecord::AddObjectKey {
            scope,
            object_id,
            envelope,
        })?;
        self.internal_keys.insert((scope, object_id), key.clone());

        debug!(%scope, object_id, key = %principal.identity(), "created internal key");
        Ok(key)
    }

    /// Returns the unwrapped internal key of `object_id`.
    ///
    /// The log stream's key comes from the bootstrap store. Other keys are unwrapped
    /// with the principal key recorded in their envelope: the active one through the
    /// cache, a retired version straight from its provider.
    pub fn get_internal_key(&self, scope: KeyScope, object_id: u32) -> Result<InternalKey> {
        if scope.is_global() && object_id == WAL_OBJECT_ID {
            return self.bootstrap.get(object_id).cloned();
        }
        if let Some(key) = self.internal_keys.get(&(scope, object_id)) {
            return Ok(key.clone());
        }

        let envelope = {
            let _guard = self.region().key_files_shared();
            self.key_map(scope).get(object_id)?
        }
        .ok_or_else(|| KeyError::not_found(format!("internal key for object {} in scope {}", object_id, scope)))?;

        let principal = self.principal_for_envelope(scope, &envelope)?;
        let key = wrapping::unwrap(&envelope, &principal)?;
        self.internal_keys.insert((scope, object_id), key.clone());
        Ok(key)
    }

    pub fn delete_internal_key(&self, scope: KeyScope, object_id: u32) -> Result<bool> {
        let removed = {
            let _guard = self.region().key_files_exclusive();
            self.key_map(scope).remove(object_id)?
        };
        self.internal_keys.remove(&(scope, object_id));
        if removed {
            self.journal
                .append(&KeyLogRecord::DeleteObjectKey { scope, object_id })?;
        }
        Ok(removed)
    }

    /// Re-wraps every envelope of `scope` not yet protected by the active principal
    /// key. Rotation never does this on its own. Returns the number re-wrapped.
    pub fn rewrap_internal_keys(&self, scope: KeyScope) -> Result<usize> {
        let (active, pending) = self.prepare_rewrap(scope)?;
        if pending.is_empty() {
            return Ok(0);
        }
        let count = self.apply_rewrap(scope, pending)?;
        info!(%scope, count, key = %active.identity(), "re-wrapped internal keys");
        Ok(count)
    }

    /// Unwraps stale envelopes under the shared lock. Each entry keeps the envelope
    /// that was read so the write phase can detect concurrent replacement.
    fn prepare_rewrap(&self, scope: KeyScope) -> Result<(PrincipalKeyMaterial, Vec<PendingRewrap>)> {
        let active = self
            .resolve_principal_key(scope)?
            .ok_or_else(|| KeyError::not_found_hint(format!("principal key for scope {}", scope), SET_KEY_HINT))?;

        let entries = {
            let _guard = self.region().key_files_shared();
            self.key_map(scope).load_all()?
        };

        let mut retired: HashMap<PrincipalKeyIdentity, PrincipalKeyMaterial> = HashMap::new();
        let mut pending = Vec::new();
        for (object_id, envelope) in entries {
            if envelope.is_wrapped_by(active.identity()) {
                continue;
            }
            let old = match retired.get(&envelope.principal_key) {
                Some(old) => old.clone(),
                None => {
                    let old = self.fetch_principal_key_version(
                        scope,
                        &envelope.principal_key,
                        envelope.provider_id,
                    )?;
                    retired.insert(envelope.principal_key.clone(), old.clone());
                    old
                }
            };
            let key = wrapping::unwrap(&envelope, &old)?;
            let rewrapped = wrapping::wrap(object_id, &key, &active)?;
            pending.push(PendingRewrap {
                object_id,
                read: envelope,
                rewrapped,
            });
        }
        Ok((active, pending))
    }

    /// Writes re-wrapped envelopes whose on-disk entry is still the one that was read.
    fn apply_rewrap(&self, scope: KeyScope, mut pending: Vec<PendingRewrap>) -> Result<usize> {
        {
            let _guard = self.region().key_files_exclusive();
            let key_map = self.key_map(scope);
            let mut all = key_map.load_all()?;
            pending.retain(|p| all.get(&p.object_id) == Some(&p.read));
            if pending.is_empty() {
                return Ok(0);
            }
            for p in &pending {
                all.insert(p.object_id, p.rewrapped.clone());
            }
            key_map.write_all(&all)?;
        }
        for p in &pending {
            self.journal.append(&KeyLogRecord::AddObjectKey {
                scope,
                object_id: p.object_id,
                envelope: p.rewrapped.clone(),
            })?;
        }
        Ok(pending.len())
    }

    fn principal_for_envelope(
        &self,
        scope: KeyScope,
        envelope: &WrappedInternalKeyEnvelope,
    ) -> Result<PrincipalKeyMaterial> {
        if let Some(active) = self.resolve_principal_key(scope)? {
            if envelope.is_wrapped_by(active.identity()) {
                return Ok(active);
            }
        }
        self.fetch_principal_key_version(scope, &envelope.principal_key, envelope.provider_id)
    }

    // --- scope lifecycle ---

    /// Removes every key-management file of `scope` and drops its cache entries.
    pub fn cleanup_scope(&self, scope: KeyScope) -> Result<()> {
        if scope.is_global() {
            return Err(KeyError::InvalidOperation(
                "the global scope cannot be removed".to_string(),
            ));
        }
        self.remove_scope_files(scope)?;
        self.journal.append(&KeyLogRecord::CleanupScope(scope))?;
        info!(%scope, "removed key management state of scope");
        Ok(())
    }

    fn remove_scope_files(&self, scope: KeyScope) -> Result<()> {
        {
            let mut guard = self.region().lock_for_update();
            guard.cache_mut().invalidate(scope);
            self.principal_store(scope).delete()?;
        }
        self.registry(scope).destroy()?;
        self.internal_keys.retain(|(s, _), _| *s != scope);

        match fs::remove_dir_all(scope.directory(&self.config.data_dir)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeyError::Io(e)),
        }
    }

    // --- replication ---

    /// Applies a log record written by a primary.
    ///
    /// Only durable state is written and stale cache entries dropped; the provider is
    /// not contacted. The next cold resolve fetches the secret through this node's
    /// own provider configuration.
    pub fn redo(&self, record: &KeyLogRecord) -> Result<()> {
        debug!(scope = %record.scope(), "replaying key log record");
        match record {
            KeyLogRecord::AddPrincipalKey(metadata)
            | KeyLogRecord::RotatePrincipalKey {
                current: metadata, ..
            } => {
                let mut guard = self.region().lock_for_update();
                self.principal_store(metadata.scope).save(metadata)?;
                guard.cache_mut().invalidate(metadata.scope);
            }
            KeyLogRecord::AddObjectKey {
                scope,
                object_id,
                envelope,
            } => {
                {
                    let _guard = self.region().key_files_exclusive();
                    self.key_map(*scope).put(*object_id, envelope.clone())?;
                }
                self.internal_keys.remove(&(*scope, *object_id));
            }
            KeyLogRecord::DeleteObjectKey { scope, object_id } => {
                {
                    let _guard = self.region().key_files_exclusive();
                    self.key_map(*scope).remove(*object_id)?;
                }
                self.internal_keys.remove(&(*scope, *object_id));
            }
            KeyLogRecord::CleanupScope(scope) => self.remove_scope_files(*scope)?,
        }
        Ok(())
    }
}

struct PendingRewrap {
    object_id: u32,
    read: WrappedInternalKeyEnvelope,
    rewrapped: WrappedInternalKeyEnvelope,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;
    use crate::registry::FileKeyringOptions;
    use tempfile::tempdir;

    fn manager(dir: &std::path::Path) -> (KeyManager, Arc<MemoryJournal>) {
        let journal = Arc::new(MemoryJournal::new());
        let manager = KeyManager::builder(TdeConfig::with_data_dir(dir))
            .journal(journal.clone())
            .build()
            .unwrap();
        (manager, journal)
    }

    fn file_provider(dir: &std::path::Path) -> ProviderOptions {
        ProviderOptions::File(FileKeyringOptions {
            path: dir.join("keyring"),
        })
    }

    #[test]
    fn internal_key_lifecycle() {
        let dir = tempdir().unwrap();
        let (manager, journal) = manager(dir.path());
        let scope = KeyScope::new(5, 1663);
        manager.register_provider(scope, "local", file_provider(dir.path())).unwrap();
        manager.set_principal_key(scope, "root-key", "local", false).unwrap();

        let created = manager.create_internal_key(scope, 16384, InternalKeyRelType::Smgr).unwrap();
        assert!(matches!(
            manager.create_internal_key(scope, 16384, InternalKeyRelType::Smgr),
            Err(KeyError::DuplicateObject { .. })
        ));

        // a fresh backend has no private cache and must unwrap from the key map
        let (other, _) = self::manager(dir.path());
        assert_eq!(other.get_internal_key(scope, 16384).unwrap(), created);

        assert!(manager.delete_internal_key(scope, 16384).unwrap());
        assert!(manager.get_internal_key(scope, 16384).unwrap_err().is_not_found());
        assert!(matches!(
            journal.records().last(),
            Some(KeyLogRecord::DeleteObjectKey { object_id: 16384, .. })
        ));
    }

    #[test]
    fn recreated_object_key_is_not_recoverable_from_the_old_one() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        let scope = KeyScope::new(5, 1663);
        manager.register_provider(scope, "local", file_provider(dir.path())).unwrap();
        manager.set_principal_key(scope, "root-key", "local", false).unwrap();

        let k1 = manager.create_internal_key(scope, 16384, InternalKeyRelType::Smgr).unwrap();
        let e1 = manager.key_map(scope).get(16384).unwrap().unwrap();
        assert!(manager.delete_internal_key(scope, 16384).unwrap());
        let k2 = manager.create_internal_key(scope, 16384, InternalKeyRelType::Smgr).unwrap();
        let e2 = manager.key_map(scope).get(16384).unwrap().unwrap();
        assert_eq!(e1.iv, e2.iv);

        let recovered: Vec<u8> = e1
            .ciphertext
            .iter()
            .zip(&e2.ciphertext)
            .zip(k1.key_bytes())
            .map(|((a, b), k)| a ^ b ^ k)
            .collect();
        assert_ne!(recovered.as_slice(), k2.key_bytes().as_slice());
        assert_eq!(manager.get_internal_key(scope, 16384).unwrap(), k2);
    }

    #[test]
    fn internal_key_needs_principal_key() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        let err = manager
            .create_internal_key(KeyScope::new(5, 1663), 1, InternalKeyRelType::Basic)
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("set_principal_key"));
    }

    #[test]
    fn old_envelopes_survive_rotation_until_rewrapped() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        let scope = KeyScope::new(5, 1663);
        manager.register_provider(scope, "local", file_provider(dir.path())).unwrap();
        manager.set_principal_key(scope, "root-key", "local", false).unwrap();
        let key = manager.create_internal_key(scope, 42, InternalKeyRelType::Smgr).unwrap();

        manager.rotate_principal_key(scope, None, None, false).unwrap();

        let (fresh, _) = self::manager(dir.path());
        assert_eq!(fresh.get_internal_key(scope, 42).unwrap(), key);
        let envelope = fresh.key_map(scope).get(42).unwrap().unwrap();
        assert_eq!(envelope.principal_key.version(), 0);

        assert_eq!(manager.rewrap_internal_keys(scope).unwrap(), 1);
        assert_eq!(manager.rewrap_internal_keys(scope).unwrap(), 0);
        let envelope = fresh.key_map(scope).get(42).unwrap().unwrap();
        assert_eq!(envelope.principal_key.version(), 1);

        let (after, _) = self::manager(dir.path());
        assert_eq!(after.get_internal_key(scope, 42).unwrap(), key);
    }

    #[test]
    fn rewrap_keeps_an_envelope_replaced_after_it_was_read() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        let scope = KeyScope::new(5, 1663);
        manager.register_provider(scope, "local", file_provider(dir.path())).unwrap();
        manager.set_principal_key(scope, "root-key", "local", false).unwrap();
        manager.create_internal_key(scope, 42, InternalKeyRelType::Smgr).unwrap();
        let untouched = manager.create_internal_key(scope, 43, InternalKeyRelType::Smgr).unwrap();
        manager.rotate_principal_key(scope, None, None, false).unwrap();

        let (_, pending) = manager.prepare_rewrap(scope).unwrap();
        assert_eq!(pending.len(), 2);

        // object 42 is dropped and re-created between the read and the write
        assert!(manager.delete_internal_key(scope, 42).unwrap());
        let recreated = manager.create_internal_key(scope, 42, InternalKeyRelType::Smgr).unwrap();

        assert_eq!(manager.apply_rewrap(scope, pending).unwrap(), 1);

        let (fresh, _) = self::manager(dir.path());
        assert_eq!(fresh.get_internal_key(scope, 42).unwrap(), recreated);
        assert_eq!(fresh.get_internal_key(scope, 43).unwrap(), untouched);
        let envelope = fresh.key_map(scope).get(43).unwrap().unwrap();
        assert_eq!(envelope.principal_key.version(), 1);
    }

    #[test]
    fn cleanup_removes_scope_state() {
        let dir = tempdir().unwrap();
        let (manager, journal) = manager(dir.path());
        let scope = KeyScope::new(5, 1663);
        manager.register_provider(scope, "local", file_provider(dir.path())).unwrap();
        manager.set_principal_key(scope, "root-key", "local", false).unwrap();
        manager.create_internal_key(scope, 7, InternalKeyRelType::Smgr).unwrap();
        assert!(manager.region().is_cached(scope));

        manager.cleanup_scope(scope).unwrap();
        assert!(!manager.region().is_cached(scope));
        assert!(manager.list_providers(scope).unwrap().is_empty());
        assert!(manager.resolve_principal_key(scope).unwrap().is_none());
        assert!(!scope.directory(dir.path()).exists());
        assert!(matches!(
            journal.records().last(),
            Some(KeyLogRecord::CleanupScope(_))
        ));
        assert!(matches!(
            manager.cleanup_scope(KeyScope::GLOBAL),
            Err(KeyError::InvalidOperation(_))
        ));
    }

    #[test]
    fn register_from_json() {
        let dir = tempdir().unwrap();
        let (manager, _) = manager(dir.path());
        let scope = KeyScope::new(5, 1663);
        let id = manager
            .register_provider_json(scope, "local", "file", r#"{"path":"/tmp/k1"}"#)
            .unwrap();
        assert_eq!(id, 1);
        assert!(matches!(
            manager.register_provider_json(scope, "x", "kmip", "{}"),
            Err(KeyError::InvalidArgument(_))
        ));
        assert_eq!(manager.list_providers_by_kind(scope, ProviderKind::File).unwrap().len(), 1);
        assert_eq!(manager.provider_by_name(scope, "LOCAL").unwrap().provider_id, 1);
    }
}
