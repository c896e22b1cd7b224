//!
//! 集成测试的通用辅助函数
//!
#![allow(dead_code)]

use std::path::Path;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tde_keyring::journal::MemoryJournal;
use tde_keyring::keyring::DefaultKeyringFactory;
use tde_keyring::prelude::*;
use tde_keyring::registry::{FileKeyringOptions, KeyringProviderConfig};

pub const SCOPE: KeyScope = KeyScope::new(16384, 1663);

/// Counts provider calls made through any keyring it opens.
#[derive(Default)]
pub struct CountingFactory {
    pub fetches: Arc<AtomicUsize>,
    pub stores: Arc<AtomicUsize>,
}

impl CountingFactory {
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn stores(&self) -> usize {
        self.stores.load(Ordering::SeqCst)
    }
}

pub struct CountingKeyring {
    inner: Box<dyn KeyringProvider>,
    fetches: Arc<AtomicUsize>,
    stores: Arc<AtomicUsize>,
}

impl KeyringProvider for CountingKeyring {
    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }

    fn kind(&self) -> ProviderKind {
        self.inner.kind()
    }

    fn fetch(&self, name: &str) -> Result<Option<KeyInfo>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch(name)
    }

    fn store(&self, key: &KeyInfo) -> Result<()> {
        self.stores.fetch_add(1, Ordering::SeqCst);
        self.inner.store(key)
    }
}

impl KeyringFactory for CountingFactory {
    fn open(&self, config: &KeyringProviderConfig) -> Result<Box<dyn KeyringProvider>> {
        Ok(Box::new(CountingKeyring {
            inner: DefaultKeyringFactory.open(config)?,
            fetches: self.fetches.clone(),
            stores: self.stores.clone(),
        }))
    }
}

/// A journal whose appends fail once `fail` is switched on.
#[derive(Default)]
pub struct FailingJournal {
    pub fail: AtomicBool,
    inner: MemoryJournal,
}

impl FailingJournal {
    pub fn start_failing(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

impl KeyJournal for FailingJournal {
    fn append(&self, record: &KeyLogRecord) -> Result<u64> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(KeyError::Io(io::Error::other("log device unavailable")));
        }
        self.inner.append(record)
    }
}

/// One backend: its own manager attached to `region`.
pub fn backend(
    data_dir: &Path,
    region: Arc<SharedKeyRegion>,
    factory: Arc<dyn KeyringFactory>,
    journal: Arc<dyn KeyJournal>,
) -> KeyManager {
    KeyManager::builder(TdeConfig::with_data_dir(data_dir))
        .region(region)
        .keyring_factory(factory)
        .journal(journal)
        .build()
        .unwrap()
}

pub fn simple_backend(data_dir: &Path) -> (KeyManager, Arc<MemoryJournal>) {
    let journal = Arc::new(MemoryJournal::new());
    let manager = backend(
        data_dir,
        SharedKeyRegion::new(16),
        Arc::new(DefaultKeyringFactory),
        journal.clone(),
    );
    (manager, journal)
}

pub fn file_options(path: impl AsRef<Path>) -> ProviderOptions {
    ProviderOptions::File(FileKeyringOptions {
        path: path.as_ref().to_path_buf(),
    })
}
