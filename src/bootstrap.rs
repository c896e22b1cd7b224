//! The global bootstrap key: the internal key of the log stream.
//!
//! It is needed before the shared cache and the catalog are usable, so it is loaded
//! once at startup, without locks, into process-lifetime memory. The cipher layer may
//! bind state to the key's address, so it is never moved or replaced afterwards.
//!
//! 中文: 全局引导密钥（日志流的内部密钥）。启动时无锁加载一次，驻留于进程生命周期内存中。

use std::sync::OnceLock;

use tracing::info;

use crate::error::{KeyError, Result};
use crate::keyring::{INTERNAL_KEY_LEN, generate_and_store};
use crate::keymap::{InternalKey, InternalKeyRelType};
use crate::manager::KeyManager;
use crate::principal::{
    DEFAULT_PRINCIPAL_KEY_VERSION, PrincipalKeyIdentity, PrincipalKeyMaterial, PrincipalKeyMetadata,
};
use crate::registry::{FileKeyringOptions, ProviderOptions};
use crate::rotation::load_latest_versioned_key_name;
use crate::scope::{KeyScope, WAL_OBJECT_ID};
use crate::wrapping;

/// Process-scoped holder of the bootstrap key. Initialised once, never torn down.
#[derive(Default)]
pub struct BootstrapKeys {
    wal_key: OnceLock<InternalKey>,
}

impl BootstrapKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// A holder that already has its key, for tests and tooling.
    pub fn preloaded(key: InternalKey) -> Self {
        let keys = Self::new();
        keys.install(key);
        keys
    }

    pub fn is_initialized(&self) -> bool {
        self.wal_key.get().is_some()
    }

    /// The bootstrap internal key of `object_id`. Only the log stream has one.
    pub fn get(&self, object_id: u32) -> Result<&InternalKey> {
        if object_id != WAL_OBJECT_ID {
            return Err(KeyError::not_found(format!(
                "global internal key for object {}",
                object_id
            )));
        }
        self.wal_key.get().ok_or_else(|| {
            KeyError::InvalidOperation("global keys are not initialized yet".to_string())
        })
    }

    /// Installs the key unless one is already held; returns the held key.
    fn install(&self, key: InternalKey) -> &InternalKey {
        self.wal_key.get_or_init(|| key)
    }
}

impl KeyManager {
    /// Loads or creates the global keys. Runs once at startup before concurrent
    /// access; a second call is a no-op.
    pub fn init_global_keys(&self) -> Result<()> {
        if self.bootstrap.is_initialized() {
            return Ok(());
        }
        self.init_default_keyring()?;

        let key_map = self.key_map(KeyScope::GLOBAL);
        let key = match key_map.get(WAL_OBJECT_ID)? {
            Some(envelope) => {
                let principal = match self.load_principal_key(KeyScope::GLOBAL)? {
                    Some(active) if envelope.is_wrapped_by(active.identity()) => active,
                    _ => self.fetch_principal_key_version(
                        KeyScope::GLOBAL,
                        &envelope.principal_key,
                        envelope.provider_id,
                    )?,
                };
                wrapping::unwrap(&envelope, &principal)?
            }
            None => {
                let principal = self.global_principal_key()?;
                let key = InternalKey::generate(InternalKeyRelType::Global)?;
                key_map.put(WAL_OBJECT_ID, wrapping::wrap(WAL_OBJECT_ID, &key, &principal)?)?;
                info!(key = %principal.identity(), "created global internal key");
                key
            }
        };

        self.bootstrap.install(key);
        Ok(())
    }

    /// Registers the default global file keyring when the global scope has none.
    fn init_default_keyring(&self) -> Result<()> {
        let registry = self.registry(KeyScope::GLOBAL);
        if !registry.list_all()?.is_empty() {
            return Ok(());
        }
        let path = self.config.global_keyring_path();
        registry.register(
            &self.config.global.provider_name,
            ProviderOptions::File(FileKeyringOptions { path: path.clone() }),
        )?;
        info!(
            provider = %self.config.global.provider_name,
            path = %path.display(),
            "default global keyring provider registered; register a production provider and rotate the global principal key"
        );
        Ok(())
    }

    /// Loads the global principal key, creating it (and its metadata) on first start.
    fn global_principal_key(&self) -> Result<PrincipalKeyMaterial> {
        if let Some(material) = self.load_principal_key(KeyScope::GLOBAL)? {
            return Ok(material);
        }
        let store = self.principal_store(KeyScope::GLOBAL);
        if let Some(metadata) = store.load()? {
            return Err(KeyError::not_found(format!(
                "global principal key {} in its keyring provider",
                metadata.identity
            )));
        }

        let provider_config = self
            .registry(KeyScope::GLOBAL)
            .lookup_by_name(&self.config.global.provider_name)?;
        let provider = self.open_provider(&provider_config)?;
        let mut identity = PrincipalKeyIdentity::new(
            self.config.global.principal_key_name.clone(),
            DEFAULT_PRINCIPAL_KEY_VERSION,
        )?;
        let key = match load_latest_versioned_key_name(
            &mut identity,
            provider.as_ref(),
            false,
            self.config.rotation.max_key_version,
        )? {
            Some(key) => key,
            None => generate_and_store(provider.as_ref(), identity.versioned_name(), INTERNAL_KEY_LEN)?,
        };

        let metadata = PrincipalKeyMetadata::new(identity, provider_config.provider_id, KeyScope::GLOBAL);
        store.save(&metadata)?;
        Ok(PrincipalKeyMaterial::new(metadata, &key))
    }

    /// The bootstrap key by reference, at its process-lifetime address.
    pub fn global_internal_key(&self, object_id: u32) -> Result<&InternalKey> {
        self.bootstrap.get(object_id)
    }
}
