use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KeyError, Result};

/// 配置来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigSource {
    /// 内存默认值
    #[default]
    Default,
    /// 文件
    File,
    /// 环境变量
    Environment,
}

/// 共享主密钥缓存配置
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// 缓存槽位数量（固定容量，不做淘汰）
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 128 }
    }
}

/// 轮换配置
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RotationConfig {
    /// 版本号搜索的上限，超过即视为致命错误
    pub max_key_version: u32,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_key_version: crate::principal::MAX_PRINCIPAL_KEY_VERSION,
        }
    }
}

/// 全局（WAL）密钥配置
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GlobalKeyConfig {
    /// 全局主密钥名称
    pub principal_key_name: String,
    /// 默认全局密钥环提供者名称
    pub provider_name: String,
    /// 默认文件密钥环路径，相对路径基于 `data_dir`
    pub keyring_path: PathBuf,
}

impl Default for GlobalKeyConfig {
    fn default() -> Self {
        Self {
            principal_key_name: "tde-global-catalog-key".to_string(),
            provider_name: "default_global_tablespace_keyring".to_string(),
            keyring_path: PathBuf::from("pg_tde_default_keyring_CHANGE_IT_AND_REMOVE"),
        }
    }
}

/// 完整配置
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TdeConfig {
    /// 所有作用域文件的根目录
    pub data_dir: PathBuf,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub global: GlobalKeyConfig,
    /// 配置来源，不参与序列化
    #[serde(skip)]
    pub source: ConfigSource,
}

impl Default for TdeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./pg_tde_data"),
            cache: CacheConfig::default(),
            rotation: RotationConfig::default(),
            global: GlobalKeyConfig::default(),
            source: ConfigSource::Default,
        }
    }
}

impl TdeConfig {
    /// 以给定数据目录创建默认配置
    pub fn with_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let mut config: TdeConfig = serde_json::from_str(&contents)?;
        config.source = ConfigSource::File;
        config.validate()?;
        Ok(config)
    }

    /// 从环境变量加载配置
    ///
    /// 无法解析的数值会被忽略，保留默认值。
    pub fn from_env() -> Self {
        let mut config = Self {
            source: ConfigSource::Environment,
            ..Self::default()
        };

        if let Ok(value) = std::env::var("TDE_DATA_DIR") {
            config.data_dir = PathBuf::from(value);
        }

        if let Ok(value) = std::env::var("TDE_CACHE_CAPACITY") {
            if let Ok(capacity) = value.parse::<usize>() {
                config.cache.capacity = capacity;
            }
        }

        if let Ok(value) = std::env::var("TDE_MAX_KEY_VERSION") {
            if let Ok(max) = value.parse::<u32>() {
                config.rotation.max_key_version = max;
            }
        }

        if let Ok(value) = std::env::var("TDE_GLOBAL_KEY_NAME") {
            config.global.principal_key_name = value;
        }

        if let Ok(value) = std::env::var("TDE_GLOBAL_PROVIDER_NAME") {
            config.global.provider_name = value;
        }

        if let Ok(value) = std::env::var("TDE_GLOBAL_KEYRING_PATH") {
            config.global.keyring_path = PathBuf::from(value);
        }

        config
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.capacity == 0 {
            return Err(KeyError::InvalidArgument(
                "cache.capacity must be greater than zero".to_string(),
            ));
        }
        if self.rotation.max_key_version == 0 {
            return Err(KeyError::InvalidArgument(
                "rotation.max_key_version must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// 默认全局密钥环的绝对路径
    pub fn global_keyring_path(&self) -> PathBuf {
        if self.global.keyring_path.is_absolute() {
            self.global.keyring_path.clone()
        } else {
            self.data_dir.join(&self.global.keyring_path)
        }
    }
}
