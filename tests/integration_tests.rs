mod common;

use std::fs;
use std::sync::{Arc, Barrier, Mutex, OnceLock, Weak};
use std::thread;

use tde_keyring::cache::ResolutionMarker;
use tde_keyring::journal::MemoryJournal;
use tde_keyring::keyring::DefaultKeyringFactory;
use tde_keyring::prelude::*;
use tde_keyring::registry::KeyringProviderConfig;
use tempfile::tempdir;

use common::{CountingFactory, SCOPE, backend, file_options, simple_backend};

#[test]
fn test_concurrent_cold_resolves_fetch_once() {
    let dir = tempdir().unwrap();
    let keyring_path = dir.path().join("k1");
    {
        let (primary, _) = simple_backend(dir.path());
        primary
            .register_provider(SCOPE, "local", file_options(&keyring_path))
            .unwrap();
        primary
            .set_principal_key(SCOPE, "root-key", "local", false)
            .unwrap();
    }

    // a restarted process group: empty region, same data directory
    let region = SharedKeyRegion::new(16);
    let factory = Arc::new(CountingFactory::default());
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let manager = backend(
                dir.path(),
                region.clone(),
                factory.clone(),
                Arc::new(MemoryJournal::new()),
            );
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                manager
                    .resolve_principal_key(SCOPE)
                    .unwrap()
                    .unwrap()
                    .identity()
                    .clone()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap().versioned_name(), "root-key_0");
    }
    assert_eq!(factory.fetches(), 1);
    assert_eq!(region.cached_entries(), 1);
    assert_eq!(region.attached_backends(), 0);
}

#[test]
fn test_concurrent_set_has_one_winner() {
    let dir = tempdir().unwrap();
    let region = SharedKeyRegion::new(16);
    let setup = backend(
        dir.path(),
        region.clone(),
        Arc::new(DefaultKeyringFactory),
        Arc::new(MemoryJournal::new()),
    );
    setup
        .register_provider(SCOPE, "local", file_options(dir.path().join("k1")))
        .unwrap();

    let threads = 6;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let manager = backend(
                dir.path(),
                region.clone(),
                Arc::new(DefaultKeyringFactory),
                Arc::new(MemoryJournal::new()),
            );
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                manager.set_principal_key(SCOPE, &format!("key-{}", i), "local", false)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    for result in &results {
        if let Err(e) = result {
            assert!(matches!(e, KeyError::DuplicateObject { .. }), "unexpected error: {e}");
        }
    }

    let active = setup.resolve_principal_key(SCOPE).unwrap().unwrap();
    assert_eq!(active.identity(), winners[0].identity());
    assert_eq!(active.key_bytes(), winners[0].key_bytes());
}

/// A provider whose fetch asks the manager for a principal key, as a keyring
/// backed by an encrypted table would.
struct ReentrantFactory {
    manager: Arc<OnceLock<Weak<KeyManager>>>,
    nested: Arc<Mutex<Vec<bool>>>,
}

struct ReentrantKeyring {
    inner: Box<dyn KeyringProvider>,
    manager: Arc<OnceLock<Weak<KeyManager>>>,
    nested: Arc<Mutex<Vec<bool>>>,
}

impl KeyringFactory for ReentrantFactory {
    fn open(&self, config: &KeyringProviderConfig) -> Result<Box<dyn KeyringProvider>> {
        Ok(Box::new(ReentrantKeyring {
            inner: DefaultKeyringFactory.open(config)?,
            manager: self.manager.clone(),
            nested: self.nested.clone(),
        }))
    }
}

impl KeyringProvider for ReentrantKeyring {
    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    fn kind(&self) -> ProviderKind {
        self.inner.kind()
    }

    fn fetch(&self, name: &str) -> Result<Option<KeyInfo>> {
        if let Some(manager) = self.manager.get().and_then(Weak::upgrade) {
            let nested = manager.resolve_principal_key(SCOPE)?;
            self.nested.lock().unwrap().push(nested.is_some());
        }
        self.inner.fetch(name)
    }

    fn store(&self, key: &KeyInfo) -> Result<()> {
        self.inner.store(key)
    }
}

#[test]
fn test_nested_resolution_returns_none() {
    let dir = tempdir().unwrap();
    let keyring_path = dir.path().join("k1");
    let slot = Arc::new(OnceLock::new());
    let nested = Arc::new(Mutex::new(Vec::new()));

    let manager = Arc::new(backend(
        dir.path(),
        SharedKeyRegion::new(16),
        Arc::new(ReentrantFactory {
            manager: slot.clone(),
            nested: nested.clone(),
        }),
        Arc::new(MemoryJournal::new()),
    ));
    slot.set(Arc::downgrade(&manager)).unwrap();

    manager
        .register_provider(SCOPE, "local", file_options(&keyring_path))
        .unwrap();
    manager
        .set_principal_key(SCOPE, "root-key", "local", false)
        .unwrap();
    assert!(!nested.lock().unwrap().is_empty());

    // cold resolve through a fresh region whose provider re-enters
    let cold_slot = Arc::new(OnceLock::new());
    let cold = Arc::new(backend(
        dir.path(),
        SharedKeyRegion::new(16),
        Arc::new(ReentrantFactory {
            manager: cold_slot.clone(),
            nested: nested.clone(),
        }),
        Arc::new(MemoryJournal::new()),
    ));
    cold_slot.set(Arc::downgrade(&cold)).unwrap();

    nested.lock().unwrap().clear();
    let resolved = cold.resolve_principal_key(SCOPE).unwrap().unwrap();
    assert_eq!(resolved.identity().versioned_name(), "root-key_0");
    assert_eq!(nested.lock().unwrap().as_slice(), &[false]);

    // the marker is released once the outer call returns
    assert!(cold.resolve_principal_key(SCOPE).unwrap().is_some());
    assert!(ResolutionMarker::active().is_none());
}

#[test]
fn test_standby_replays_primary_log() {
    let primary_dir = tempdir().unwrap();
    let standby_dir = tempdir().unwrap();
    let keyring_path = primary_dir.path().join("shared-keyring");

    let (primary, journal) = simple_backend(primary_dir.path());
    let (standby, _) = simple_backend(standby_dir.path());
    for manager in [&primary, &standby] {
        manager
            .register_provider(SCOPE, "local", file_options(&keyring_path))
            .unwrap();
    }

    primary
        .set_principal_key(SCOPE, "root-key", "local", false)
        .unwrap();
    let key = primary
        .create_internal_key(SCOPE, 16384, InternalKeyRelType::Smgr)
        .unwrap();

    for record in journal.records() {
        standby.redo(&record).unwrap();
    }
    assert_eq!(standby.get_internal_key(SCOPE, 16384).unwrap(), key);
    let before = standby.resolve_principal_key(SCOPE).unwrap().unwrap();
    assert_eq!(before.identity().version(), 0);
    assert!(standby.region().is_cached(SCOPE));

    let replayed = journal.records().len();
    primary
        .rotate_principal_key(SCOPE, None, None, false)
        .unwrap();
    primary.rewrap_internal_keys(SCOPE).unwrap();
    for record in &journal.records()[replayed..] {
        standby.redo(record).unwrap();
    }

    assert!(!standby.region().is_cached(SCOPE));
    let after = standby.resolve_principal_key(SCOPE).unwrap().unwrap();
    assert_eq!(after.identity().version(), 1);
    assert_eq!(
        after.key_bytes(),
        primary.resolve_principal_key(SCOPE).unwrap().unwrap().key_bytes()
    );
    assert_eq!(standby.get_internal_key(SCOPE, 16384).unwrap(), key);

    let replayed = journal.records().len();
    primary.cleanup_scope(SCOPE).unwrap();
    for record in &journal.records()[replayed..] {
        standby.redo(record).unwrap();
    }
    assert!(standby.resolve_principal_key(SCOPE).unwrap().is_none());
    assert!(!SCOPE.directory(standby_dir.path()).exists());
}

#[test]
fn test_separate_regions_see_rotation_after_cache_miss() {
    let dir = tempdir().unwrap();
    let (first, _) = simple_backend(dir.path());
    first
        .register_provider(SCOPE, "local", file_options(dir.path().join("k1")))
        .unwrap();
    first
        .set_principal_key(SCOPE, "root-key", "local", false)
        .unwrap();

    // a second process group with its own shared region
    let (second, _) = simple_backend(dir.path());
    assert_eq!(
        second.resolve_principal_key(SCOPE).unwrap().unwrap().identity().version(),
        0
    );

    first
        .rotate_principal_key(SCOPE, None, None, false)
        .unwrap();

    // no invalidation crosses region boundaries: the warm entry is served as is
    assert_eq!(
        second.resolve_principal_key(SCOPE).unwrap().unwrap().identity().version(),
        0
    );
    let (third, _) = simple_backend(dir.path());
    assert_eq!(
        third.resolve_principal_key(SCOPE).unwrap().unwrap().identity().version(),
        1
    );
}

#[test]
fn test_backends_in_one_region_share_the_cache() {
    let dir = tempdir().unwrap();
    let region = SharedKeyRegion::new(16);
    let factory = Arc::new(CountingFactory::default());
    let a = backend(dir.path(), region.clone(), factory.clone(), Arc::new(MemoryJournal::new()));
    let b = backend(dir.path(), region.clone(), factory.clone(), Arc::new(MemoryJournal::new()));
    assert_eq!(region.attached_backends(), 2);

    a.register_provider(SCOPE, "local", file_options(dir.path().join("k1")))
        .unwrap();
    a.set_principal_key(SCOPE, "root-key", "local", false).unwrap();
    let fetches = factory.fetches();

    let rotated = a.rotate_principal_key(SCOPE, None, None, false).unwrap();
    let fetches_after_rotate = factory.fetches();
    assert!(fetches_after_rotate > fetches);

    let seen = b.resolve_principal_key(SCOPE).unwrap().unwrap();
    assert_eq!(seen.identity(), rotated.identity());
    assert_eq!(factory.fetches(), fetches_after_rotate);

    drop(b);
    assert_eq!(region.attached_backends(), 1);
}

#[test]
fn test_corrupted_registry_is_reported() {
    let dir = tempdir().unwrap();
    let (manager, _) = simple_backend(dir.path());
    manager
        .register_provider(SCOPE, "local", file_options(dir.path().join("k1")))
        .unwrap();
    manager
        .register_provider(SCOPE, "backup", file_options(dir.path().join("k2")))
        .unwrap();

    let path = SCOPE.registry_path(dir.path());
    let mut bytes = fs::read(&path).unwrap();
    bytes.truncate(bytes.len() - 10);
    fs::write(&path, &bytes).unwrap();

    assert!(matches!(
        manager.list_providers(SCOPE),
        Err(KeyError::DataCorrupted { .. })
    ));
    let err = manager
        .set_principal_key(SCOPE, "root-key", "backup", false)
        .unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn test_open_bootstraps_global_keys() {
    let dir = tempdir().unwrap();
    let config = TdeConfig::with_data_dir(dir.path());

    let key = {
        let manager = KeyManager::open(config.clone()).unwrap();
        assert!(manager.bootstrap_keys().is_initialized());
        manager.global_internal_key(WAL_OBJECT_ID).unwrap().clone()
    };
    assert!(config.global_keyring_path().exists());

    let reopened = KeyManager::open(config).unwrap();
    assert_eq!(reopened.global_internal_key(WAL_OBJECT_ID).unwrap(), &key);
    assert_eq!(
        reopened.get_internal_key(KeyScope::GLOBAL, WAL_OBJECT_ID).unwrap(),
        key
    );
    assert!(dir.path().join("pg_tde").join("keys.journal").exists());
}
