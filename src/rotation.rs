use tracing::{error, info};

use crate::cache::ResolutionMarker;
use crate::error::{KeyError, Result};
use crate::journal::KeyLogRecord;
use crate::keyring::{INTERNAL_KEY_LEN, KeyInfo, KeyringProvider, generate_and_store};
use crate::manager::KeyManager;
use crate::principal::lifecycle::reentered;
use crate::principal::{
    DEFAULT_PRINCIPAL_KEY_VERSION, PrincipalKeyIdentity, PrincipalKeyMaterial, PrincipalKeyMetadata,
};
use crate::scope::KeyScope;

/// 查找名称的最新版本
///
/// 从 `identity` 的当前版本开始，逐个向提供者探测 `name_version`，存在则版本加一继续。
///
/// * `ensure_new_key == false`：若越过了起始版本，回退一个版本并返回该已存在的密钥
/// * 否则在第一个空闲版本处返回 `None`，由调用方生成新密钥
///
/// 提供者返回除"未找到"之外的任何错误都视为致命错误；版本超过 `max_version` 同样如此。
pub fn load_latest_versioned_key_name(
    identity: &mut PrincipalKeyIdentity,
    provider: &dyn KeyringProvider,
    ensure_new_key: bool,
    max_version: u32,
) -> Result<Option<KeyInfo>> {
    let base_version = identity.version();
    let mut last_found: Option<KeyInfo> = None;

    loop {
        let fetched = provider.fetch(identity.versioned_name()).map_err(|e| {
            if e.is_fatal() {
                return e;
            }
            error!(
                key = identity.versioned_name(),
                provider = provider.provider_name(),
                "failed to retrieve principal key from keyring provider: {}",
                e
            );
            KeyError::Fatal(format!(
                "failed to retrieve principal key {} from keyring provider \"{}\": {}",
                identity.versioned_name(),
                provider.provider_name(),
                e
            ))
        })?;

        match fetched {
            None => {
                if !ensure_new_key && identity.version() > base_version {
                    *identity = identity.with_version(identity.version() - 1)?;
                    return Ok(last_found);
                }
                return Ok(None);
            }
            Some(key) => {
                let next = identity.version() + 1;
                if next > max_version {
                    error!(key = identity.name(), max_version, "principal key version limit exceeded");
                    return Err(KeyError::VersionLimit {
                        name: identity.name().to_string(),
                        limit: max_version,
                    });
                }
                *identity = identity.with_version(next)?;
                last_found = Some(key);
            }
        }
    }
}

impl KeyManager {
    /// Retires `current` and activates the next principal key of its scope.
    ///
    /// Without `new_name` the version is bumped. With it, the version restarts at 0
    /// under the new name and `new_provider_name`, if given, switches the provider.
    /// Old versions stay in their provider. Envelopes wrapped by them keep working
    /// until [`rewrap_internal_keys`](KeyManager::rewrap_internal_keys) is called.
    pub fn rotate(
        &self,
        current: &PrincipalKeyMetadata,
        new_name: Option<&str>,
        new_provider_name: Option<&str>,
        ensure_new_key: bool,
    ) -> Result<PrincipalKeyMaterial> {
        let scope = current.scope;
        let _marker = ResolutionMarker::enter(scope).ok_or_else(|| reentered(scope))?;
        let max_version = self.config.rotation.max_key_version;
        let registry = self.registry(scope);

        let (mut identity, provider_config) = match new_name {
            None => {
                let next = current.identity.version() + 1;
                if next > max_version {
                    return Err(KeyError::VersionLimit {
                        name: current.identity.name().to_string(),
                        limit: max_version,
                    });
                }
                (
                    current.identity.with_version(next)?,
                    registry.lookup_by_id(current.provider_id)?,
                )
            }
            Some(name) => {
                let provider_config = match new_provider_name {
                    Some(provider_name) => registry.lookup_by_name(provider_name)?,
                    None => registry.lookup_by_id(current.provider_id)?,
                };
                (
                    PrincipalKeyIdentity::new(name, DEFAULT_PRINCIPAL_KEY_VERSION)?,
                    provider_config,
                )
            }
        };
        let provider = self.open_provider(&provider_config)?;

        let mut guard = self.region().lock_for_update();
        let store = self.principal_store(scope);
        match store.load()? {
            Some(active)
                if active.identity == current.identity && active.provider_id == current.provider_id => {}
            Some(active) => {
                return Err(KeyError::duplicate(
                    format!(
                        "principal key {} for scope {} (rotation from {} lost a race)",
                        active.identity, scope, current.identity
                    ),
                    Some("resolve the current principal key and retry"),
                ));
            }
            None => {
                return Err(KeyError::not_found_hint(
                    format!("principal key for scope {}", scope),
                    crate::manager::SET_KEY_HINT,
                ));
            }
        }

        let key = match load_latest_versioned_key_name(
            &mut identity,
            provider.as_ref(),
            ensure_new_key,
            max_version,
        )? {
            Some(key) => key,
            None => generate_and_store(provider.as_ref(), identity.versioned_name(), INTERNAL_KEY_LEN)?,
        };

        let metadata = PrincipalKeyMetadata::new(identity, provider_config.provider_id, scope);
        store.save(&metadata)?;
        if let Err(e) = self.journal.append(&KeyLogRecord::RotatePrincipalKey {
            previous: current.identity.clone(),
            current: metadata.clone(),
        }) {
            // the retired version must not stay cached once the new metadata is durable
            guard.cache_mut().invalidate(scope);
            error!(%scope, from = %current.identity, "failed to log principal key rotation: {}", e);
            return Err(e);
        }

        let material = PrincipalKeyMaterial::new(metadata, &key);
        let cache = guard.cache_mut();
        cache.invalidate(scope);
        cache.put(material.clone());

        info!(
            %scope,
            from = %current.identity,
            to = %material.identity(),
            provider = %provider_config.provider_name,
            "principal key rotated"
        );
        Ok(material)
    }

    /// Rotates the active principal key of `scope`.
    pub fn rotate_principal_key(
        &self,
        scope: KeyScope,
        new_name: Option<&str>,
        new_provider_name: Option<&str>,
        ensure_new_key: bool,
    ) -> Result<PrincipalKeyMaterial> {
        let current = self.active_metadata(scope)?;
        self.rotate(&current, new_name, new_provider_name, ensure_new_key)
    }
}
