//! The region shared by every backend of one process group: the named locks and the
//! fixed-capacity principal-key cache.
//!
//! The config (key files) lock is always taken before the cache lock; the provider-file
//! lock may be taken inside either. The only way to hold both the config lock and the cache lock is a
//! [`ResolutionGuard`], which acquires them in that order and releases them in reverse.
//!
//! 中文: 进程组内所有后端共享的区域，包括命名锁与固定容量的主密钥缓存。
//! 配置锁必须先于缓存锁获取，`ResolutionGuard` 是同时持有二者的唯一方式。

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use crate::principal::PrincipalKeyMaterial;
use crate::scope::KeyScope;

/// Outcome of [`PrincipalKeyCache::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheInsert {
    Inserted,
    /// An entry already exists; it is left untouched.
    AlreadyPresent,
    /// Every slot is taken. There is no eviction.
    Full,
    /// The global scope is never cached.
    Bypassed,
}

/// Fixed-capacity slot table, addressed by scope through a slot index.
pub struct PrincipalKeyCache {
    slots: Box<[Option<PrincipalKeyMaterial>]>,
    index: HashMap<KeyScope, usize>,
}

impl PrincipalKeyCache {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            index: HashMap::with_capacity(capacity),
        }
    }

    pub fn get(&self, scope: KeyScope) -> Option<&PrincipalKeyMaterial> {
        self.index
            .get(&scope)
            .and_then(|slot| self.slots[*slot].as_ref())
    }

    /// Inserts `material` unless its scope already has an entry.
    pub fn put(&mut self, material: PrincipalKeyMaterial) -> CacheInsert {
        let scope = material.scope();
        if scope.is_global() {
            return CacheInsert::Bypassed;
        }
        if self.index.contains_key(&scope) {
            return CacheInsert::AlreadyPresent;
        }
        match self.slots.iter().position(Option::is_none) {
            Some(slot) => {
                self.slots[slot] = Some(material);
                self.index.insert(scope, slot);
                CacheInsert::Inserted
            }
            None => {
                warn!(%scope, capacity = self.slots.len(), "principal key cache is full");
                CacheInsert::Full
            }
        }
    }

    pub fn invalidate(&mut self, scope: KeyScope) -> bool {
        match self.index.remove(&scope) {
            Some(slot) => {
                // dropping the material wipes the secret
                self.slots[slot] = None;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Locks and cache shared by all backends attached to one process group.
pub struct SharedKeyRegion {
    provider_files: RwLock<()>,
    key_files: RwLock<()>,
    cache: RwLock<PrincipalKeyCache>,
    attached: AtomicUsize,
}

impl SharedKeyRegion {
    /// Allocates the region once per process group.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            provider_files: RwLock::new(()),
            key_files: RwLock::new(()),
            cache: RwLock::new(PrincipalKeyCache::with_capacity(capacity)),
            attached: AtomicUsize::new(0),
        })
    }

    /// Attaches a backend. The attachment is released when dropped.
    pub fn attach(self: &Arc<Self>) -> RegionAttachment {
        let count = self.attached.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(attached = count, "backend attached to shared key region");
        RegionAttachment {
            region: Arc::clone(self),
        }
    }

    pub fn attached_backends(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    /// Fast-path lookup under the shared cache lock.
    pub fn cached(&self, scope: KeyScope) -> Option<PrincipalKeyMaterial> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
            .cloned()
    }

    pub fn is_cached(&self, scope: KeyScope) -> bool {
        self.cached(scope).is_some()
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub(crate) fn provider_files_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.provider_files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn provider_files_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.provider_files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Config lock alone, for key map files. Never call while a `ResolutionGuard` is held.
    pub(crate) fn key_files_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.key_files.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn key_files_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.key_files.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Config lock shared, then cache lock exclusive. Used by the resolve slow path.
    pub(crate) fn lock_for_resolve(&self) -> ResolutionGuard<'_> {
        let config = ConfigLock::Shared(self.key_files.read().unwrap_or_else(PoisonError::into_inner));
        let cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        ResolutionGuard {
            cache,
            _config: config,
        }
    }

    /// Both locks exclusive. Used by set, rotate and replay.
    pub(crate) fn lock_for_update(&self) -> ResolutionGuard<'_> {
        let config =
            ConfigLock::Exclusive(self.key_files.write().unwrap_or_else(PoisonError::into_inner));
        let cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        ResolutionGuard {
            cache,
            _config: config,
        }
    }
}

/// A backend's handle on the shared region.
pub struct RegionAttachment {
    region: Arc<SharedKeyRegion>,
}

impl RegionAttachment {
    pub fn region(&self) -> &Arc<SharedKeyRegion> {
        &self.region
    }
}

impl Drop for RegionAttachment {
    fn drop(&mut self) {
        let count = self.region.attached.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(attached = count, "backend detached from shared key region");
    }
}

enum ConfigLock<'a> {
    Shared(#[allow(dead_code)] RwLockReadGuard<'a, ()>),
    Exclusive(#[allow(dead_code)] RwLockWriteGuard<'a, ()>),
}

/// Config lock plus cache lock, held together.
///
/// Fields drop in declaration order, so the cache lock is released first.
pub struct ResolutionGuard<'a> {
    cache: RwLockWriteGuard<'a, PrincipalKeyCache>,
    _config: ConfigLock<'a>,
}

impl ResolutionGuard<'_> {
    pub fn cache(&self) -> &PrincipalKeyCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut PrincipalKeyCache {
        &mut self.cache
    }
}

thread_local! {
    static IN_PROGRESS: Cell<Option<KeyScope>> = const { Cell::new(None) };
}

/// Marks a principal-key operation as running on the current thread.
///
/// A nested resolution on the same thread, for any scope, would try to take locks
/// this thread already holds. `enter` refuses it instead.
pub struct ResolutionMarker {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl ResolutionMarker {
    pub fn enter(scope: KeyScope) -> Option<Self> {
        IN_PROGRESS.with(|slot| match slot.get() {
            Some(outer) => {
                debug!(%scope, %outer, "nested principal key resolution refused");
                None
            }
            None => {
                slot.set(Some(scope));
                Some(Self {
                    _not_send: std::marker::PhantomData,
                })
            }
        })
    }

    pub fn active() -> Option<KeyScope> {
        IN_PROGRESS.with(Cell::get)
    }
}

impl Drop for ResolutionMarker {
    fn drop(&mut self) {
        IN_PROGRESS.with(|slot| slot.set(None));
    }
}
