//! Defines the error type shared by every layer of `tde-keyring`.
// 中文: 定义 `tde-keyring` 各层共用的错误类型。

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the `tde-keyring` crate.
///
/// Provider adapters classify their own failures (HTTP status codes, short reads,
/// unreachable files) into one of these variants before returning, so the
/// resolution and rotation code never looks at transport details.
///
/// 中文: `tde-keyring` 的主错误类型。提供者适配器在返回前会把自身的失败归类到这些变体中。
#[derive(Debug, Error)]
pub enum KeyError {
    /// Something the caller asked for does not exist (principal key, provider, internal key).
    #[error("{what} not found{}", hint_suffix(.hint))]
    NotFound {
        what: String,
        hint: Option<&'static str>,
    },

    #[error("{what} already exists{}", hint_suffix(.hint))]
    DuplicateObject {
        what: String,
        hint: Option<&'static str>,
    },

    /// The backing file or remote secret manager could not be reached.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("data corrupted in {}: expected {expected} bytes, read {actual}", .path.display())]
    DataCorrupted {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("principal key version limit {limit} exceeded for \"{name}\"")]
    VersionLimit { name: String, limit: u32 },

    /// Unrecoverable environment failure, e.g. the OS random source failed.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error (JSON): {0}")]
    Json(#[from] serde_json::Error),
}

fn hint_suffix(hint: &Option<&'static str>) -> String {
    match hint {
        Some(h) => format!(" (hint: {})", h),
        None => String::new(),
    }
}

impl KeyError {
    pub fn not_found(what: impl Into<String>) -> Self {
        KeyError::NotFound {
            what: what.into(),
            hint: None,
        }
    }

    pub fn not_found_hint(what: impl Into<String>, hint: &'static str) -> Self {
        KeyError::NotFound {
            what: what.into(),
            hint: Some(hint),
        }
    }

    pub fn duplicate(what: impl Into<String>, hint: Option<&'static str>) -> Self {
        KeyError::DuplicateObject {
            what: what.into(),
            hint,
        }
    }

    /// Errors that must stop the current operation rather than be handled by policy.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KeyError::Fatal(_) | KeyError::VersionLimit { .. } | KeyError::DataCorrupted { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KeyError::NotFound { .. })
    }
}

impl From<std::string::FromUtf8Error> for KeyError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        KeyError::InvalidArgument(format!("UTF-8 conversion error: {}", err))
    }
}

impl From<base64::DecodeError> for KeyError {
    fn from(err: base64::DecodeError) -> Self {
        KeyError::ResourceUnavailable(format!("decoding from Base64 failed: {}", err))
    }
}

pub type Result<T, E = KeyError> = std::result::Result<T, E>;
