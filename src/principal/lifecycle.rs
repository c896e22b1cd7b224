//! Principal key resolution, first-time creation and informational queries.
//!
//! Resolution has a fast path under the shared cache lock and a slow path that takes
//! the config lock (shared) and the cache lock (exclusive) through a
//! `ResolutionGuard`, re-checks the cache, then loads metadata, looks up the provider
//! and fetches the secret. The provider call runs with both locks held: a slow
//! provider stalls cold resolutions of every scope but never a warm hit.
//!
//! 中文: 主密钥解析、首次创建与信息查询。

use tracing::{error, info, warn};

use crate::cache::ResolutionMarker;
use crate::error::{KeyError, Result};
use crate::journal::KeyLogRecord;
use crate::keyring::{INTERNAL_KEY_LEN, generate_and_store};
use crate::manager::{KeyManager, SET_KEY_HINT};
use crate::principal::{
    DEFAULT_PRINCIPAL_KEY_VERSION, PrincipalKeyIdentity, PrincipalKeyInfo, PrincipalKeyMaterial,
    PrincipalKeyMetadata,
};
use crate::rotation::load_latest_versioned_key_name;
use crate::scope::KeyScope;

const ROTATE_HINT: &str = "use rotate_principal_key to change the principal key";

pub(crate) fn reentered(scope: KeyScope) -> KeyError {
    KeyError::InvalidOperation(format!(
        "principal key operation for scope {} started while another one is running on this thread",
        scope
    ))
}

impl KeyManager {
    /// Returns the active principal key of `scope`, or `None` if none is configured,
    /// its provider is gone, or the provider no longer has the key.
    ///
    /// A nested call on the same thread (e.g. from inside a provider) returns `None`
    /// instead of deadlocking. The global scope never goes through the shared cache.
    pub fn resolve_principal_key(&self, scope: KeyScope) -> Result<Option<PrincipalKeyMaterial>> {
        let Some(_marker) = ResolutionMarker::enter(scope) else {
            return Ok(None);
        };

        if scope.is_global() {
            let _guard = self.region().key_files_shared();
            return self.load_principal_key(scope);
        }

        if let Some(material) = self.region().cached(scope) {
            return Ok(Some(material));
        }

        let mut guard = self.region().lock_for_resolve();
        if let Some(material) = guard.cache().get(scope) {
            return Ok(Some(material.clone()));
        }

        let Some(material) = self.load_principal_key(scope)? else {
            return Ok(None);
        };
        guard.cache_mut().put(material.clone());
        Ok(Some(material))
    }

    /// Loads metadata and fetches the secret from its provider. Takes no
    /// principal-key locks; callers hold the config lock.
    pub(crate) fn load_principal_key(&self, scope: KeyScope) -> Result<Option<PrincipalKeyMaterial>> {
        let Some(metadata) = self.principal_store(scope).load()? else {
            return Ok(None);
        };

        let provider_config = match self.registry(scope).lookup_by_id(metadata.provider_id) {
            Ok(config) => config,
            Err(e) if e.is_not_found() => {
                warn!(%scope, provider_id = metadata.provider_id, "key provider of principal key not found");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let provider = self.open_provider(&provider_config)?;

        match provider.fetch(metadata.identity.versioned_name())? {
            Some(key) => Ok(Some(PrincipalKeyMaterial::new(metadata, &key))),
            None => {
                warn!(
                    %scope,
                    key = metadata.identity.versioned_name(),
                    provider = %provider_config.provider_name,
                    "principal key not found in keyring provider"
                );
                Ok(None)
            }
        }
    }

    /// Creates the first principal key of `scope` with key `name` in provider
    /// `provider_name`.
    ///
    /// With `ensure_new_key == false` an existing `name_N` in the provider is reused;
    /// otherwise a version with no provider entry is picked and generated.
    /// Fails with `DuplicateObject` if the scope already has a principal key.
    pub fn set_principal_key(
        &self,
        scope: KeyScope,
        name: &str,
        provider_name: &str,
        ensure_new_key: bool,
    ) -> Result<PrincipalKeyMaterial> {
        let _marker = ResolutionMarker::enter(scope).ok_or_else(|| reentered(scope))?;

        let mut identity = PrincipalKeyIdentity::new(name, DEFAULT_PRINCIPAL_KEY_VERSION)?;
        let provider_config = self.registry(scope).lookup_by_name(provider_name)?;
        let provider = self.open_provider(&provider_config)?;

        let mut guard = self.region().lock_for_update();
        let store = self.principal_store(scope);
        if guard.cache().get(scope).is_some() || store.load()?.is_some() {
            return Err(KeyError::duplicate(
                format!("principal key for scope {}", scope),
                Some(ROTATE_HINT),
            ));
        }

        let key = match load_latest_versioned_key_name(
            &mut identity,
            provider.as_ref(),
            ensure_new_key,
            self.config.rotation.max_key_version,
        )? {
            Some(key) => key,
            None => generate_and_store(provider.as_ref(), identity.versioned_name(), INTERNAL_KEY_LEN)?,
        };

        let metadata = PrincipalKeyMetadata::new(identity, provider_config.provider_id, scope);
        store.save(&metadata)?;
        if let Err(e) = self
            .journal
            .append(&KeyLogRecord::AddPrincipalKey(metadata.clone()))
        {
            // the metadata is durable; let the next resolve load it from disk
            guard.cache_mut().invalidate(scope);
            error!(%scope, "failed to log new principal key: {}", e);
            return Err(e);
        }

        let material = PrincipalKeyMaterial::new(metadata, &key);
        guard.cache_mut().put(material.clone());

        info!(
            %scope,
            key = material.identity().versioned_name(),
            provider = %provider_config.provider_name,
            "principal key set"
        );
        Ok(material)
    }

    /// Fetches a specific (usually retired) version straight from its provider,
    /// bypassing the cache. The returned metadata carries the retrieval time.
    pub fn fetch_principal_key_version(
        &self,
        scope: KeyScope,
        identity: &PrincipalKeyIdentity,
        provider_id: u32,
    ) -> Result<PrincipalKeyMaterial> {
        let provider_config = self.registry(scope).lookup_by_id(provider_id)?;
        let provider = self.open_provider(&provider_config)?;
        let key = provider.fetch_existing(identity.versioned_name())?;
        Ok(PrincipalKeyMaterial::new(
            PrincipalKeyMetadata::new(identity.clone(), provider_id, scope),
            &key,
        ))
    }

    /// Name, provider, version and creation time of the active principal key.
    pub fn principal_key_info(&self, scope: KeyScope) -> Result<PrincipalKeyInfo> {
        let metadata = self.active_metadata(scope)?;
        let provider_name = match self.registry(scope).lookup_by_id(metadata.provider_id) {
            Ok(config) => Some(config.provider_name),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        Ok(PrincipalKeyInfo {
            name: metadata.identity.name().to_string(),
            provider_name,
            provider_id: metadata.provider_id,
            versioned_name: metadata.identity.versioned_name().to_string(),
            version: metadata.identity.version(),
            creation_time: metadata.creation_time,
        })
    }

    pub fn principal_key_provider_id(&self, scope: KeyScope) -> Result<Option<u32>> {
        let _guard = self.region().key_files_shared();
        Ok(self.principal_store(scope).load()?.map(|m| m.provider_id))
    }

    /// Durable metadata of the active key, under the shared config lock.
    pub(crate) fn active_metadata(&self, scope: KeyScope) -> Result<PrincipalKeyMetadata> {
        let _guard = self.region().key_files_shared();
        self.principal_store(scope)
            .load()?
            .ok_or_else(|| KeyError::not_found_hint(format!("principal key for scope {}", scope), SET_KEY_HINT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TdeConfig;
    use crate::journal::MemoryJournal;
    use crate::keyring::KeyringProvider;
    use crate::keyring::file::FileKeyring;
    use crate::registry::{FileKeyringOptions, ProviderOptions};
    use std::sync::Arc;
    use tempfile::tempdir;

    const SCOPE: KeyScope = KeyScope::new(5, 1663);

    fn setup(dir: &std::path::Path) -> (KeyManager, Arc<MemoryJournal>) {
        let journal = Arc::new(MemoryJournal::new());
        let manager = KeyManager::builder(TdeConfig::with_data_dir(dir))
            .journal(journal.clone())
            .build()
            .unwrap();
        manager
            .register_provider(
                SCOPE,
                "local",
                ProviderOptions::File(FileKeyringOptions {
                    path: dir.join("k1"),
                }),
            )
            .unwrap();
        (manager, journal)
    }

    #[test]
    fn set_then_resolve() {
        let dir = tempdir().unwrap();
        let (manager, journal) = setup(dir.path());
        assert!(manager.resolve_principal_key(SCOPE).unwrap().is_none());

        let set = manager.set_principal_key(SCOPE, "root-key", "local", false).unwrap();
        assert_eq!(set.identity().versioned_name(), "root-key_0");
        assert_eq!(set.key_bytes().len(), INTERNAL_KEY_LEN);

        let resolved = manager.resolve_principal_key(SCOPE).unwrap().unwrap();
        assert_eq!(resolved.identity(), set.identity());
        assert_eq!(resolved.key_bytes(), set.key_bytes());
        assert!(matches!(
            journal.records().as_slice(),
            [KeyLogRecord::AddPrincipalKey(_)]
        ));
    }

    #[test]
    fn set_reuses_existing_provider_key() {
        let dir = tempdir().unwrap();
        let (manager, _) = setup(dir.path());
        let keyring = FileKeyring::new("local", dir.path().join("k1"));
        generate_and_store(&keyring, "root-key_0", 16).unwrap();
        generate_and_store(&keyring, "root-key_1", 16).unwrap();

        let set = manager.set_principal_key(SCOPE, "root-key", "local", false).unwrap();
        assert_eq!(set.identity().version(), 1);
        assert_eq!(set.key_bytes(), keyring.fetch("root-key_1").unwrap().unwrap().data());
    }

    #[test]
    fn set_with_ensure_new_key_skips_taken_versions() {
        let dir = tempdir().unwrap();
        let (manager, _) = setup(dir.path());
        let keyring = FileKeyring::new("local", dir.path().join("k1"));
        generate_and_store(&keyring, "root-key_0", 16).unwrap();

        let set = manager.set_principal_key(SCOPE, "root-key", "local", true).unwrap();
        assert_eq!(set.identity().version(), 1);
    }

    #[test]
    fn unknown_provider_has_hint() {
        let dir = tempdir().unwrap();
        let (manager, _) = setup(dir.path());
        let err = manager
            .set_principal_key(SCOPE, "root-key", "missing", false)
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("register_provider"));
    }

    #[test]
    fn info_reports_active_key() {
        let dir = tempdir().unwrap();
        let (manager, _) = setup(dir.path());
        let err = manager.principal_key_info(SCOPE).unwrap_err();
        assert!(err.to_string().contains("set_principal_key"));

        manager.set_principal_key(SCOPE, "root-key", "local", false).unwrap();
        let info = manager.principal_key_info(SCOPE).unwrap();
        assert_eq!(info.name, "root-key");
        assert_eq!(info.provider_name.as_deref(), Some("local"));
        assert_eq!(info.provider_id, 1);
        assert_eq!(info.versioned_name, "root-key_0");
        assert_eq!(info.version, 0);
        assert_eq!(manager.principal_key_provider_id(SCOPE).unwrap(), Some(1));
    }

    #[test]
    fn missing_provider_key_resolves_to_none() {
        let dir = tempdir().unwrap();
        let (manager, _) = setup(dir.path());
        manager.set_principal_key(SCOPE, "root-key", "local", false).unwrap();
        std::fs::remove_file(dir.path().join("k1")).unwrap();

        // a second process with a cold cache
        let (other, _) = setup_without_provider(dir.path());
        assert!(other.resolve_principal_key(SCOPE).unwrap().is_none());
    }

    fn setup_without_provider(dir: &std::path::Path) -> (KeyManager, Arc<MemoryJournal>) {
        let journal = Arc::new(MemoryJournal::new());
        let manager = KeyManager::builder(TdeConfig::with_data_dir(dir))
            .journal(journal.clone())
            .build()
            .unwrap();
        (manager, journal)
    }
}
