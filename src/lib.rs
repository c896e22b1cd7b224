//! # tde-keyring: key management for transparent data encryption
//!
//! `tde-keyring` manages a two-tier key hierarchy. A few long-lived **principal keys**
//! are fetched from external **keyring providers** (a local file, or a Vault KV v2
//! mount). They wrap many short-lived **internal keys**, one per protected object,
//! which the encryption layer uses as opaque byte buffers.
//!
//! ## Core Concepts
//!
//! - **`KeyringProvider`**: fetch/store capability implemented by each provider kind.
//! - **`ProviderRegistry`**: durable, per-scope list of registered providers.
//! - **`SharedKeyRegion`**: locks and principal-key cache shared by all backends.
//! - **`KeyManager`**: resolve, set and rotate principal keys; create and unwrap
//!   internal keys; replay log records on a standby.
//! - **`BootstrapKeys`**: the log stream's key, loaded once at startup.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tde_keyring::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let manager = KeyManager::open(TdeConfig::with_data_dir("/var/lib/tde"))?;
//!     let scope = KeyScope::new(16384, 1663);
//!
//!     manager.register_provider_json(scope, "local", "file", r#"{"path":"/var/lib/tde/keyring"}"#)?;
//!     manager.set_principal_key(scope, "root-key", "local", false)?;
//!
//!     let key = manager.create_internal_key(scope, 24576, InternalKeyRelType::Smgr)?;
//!     assert_eq!(manager.get_internal_key(scope, 24576)?, key);
//!
//!     manager.rotate_principal_key(scope, None, None, false)?;
//!     Ok(())
//! }
//! ```

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod error;
pub mod journal;
pub mod keymap;
pub mod keyring;
pub mod manager;
pub mod principal;
pub mod registry;
pub mod rotation;
pub mod scope;
pub mod wrapping;

// --- Prelude ---
// The types most callers need.
pub mod prelude {
    pub use crate::bootstrap::BootstrapKeys;
    pub use crate::cache::SharedKeyRegion;
    pub use crate::config::TdeConfig;
    pub use crate::error::{KeyError, Result};
    pub use crate::journal::{KeyJournal, KeyLogRecord};
    pub use crate::keymap::{InternalKey, InternalKeyRelType};
    pub use crate::keyring::{KeyInfo, KeyringFactory, KeyringProvider};
    pub use crate::manager::KeyManager;
    pub use crate::principal::{PrincipalKeyIdentity, PrincipalKeyMaterial, PrincipalKeyMetadata};
    pub use crate::registry::{ProviderKind, ProviderOptions};
    pub use crate::scope::{KeyScope, WAL_OBJECT_ID};
}

/// The version of the `tde-keyring` crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
