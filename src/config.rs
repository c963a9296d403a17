//! 应用配置模块
//!
//! 引擎消费的全部配置都来自 config.json 的分节键值存储：服务器地址、
//! 认证 token、同步间隔、网络超时、重试、并发上限和文件过滤规则。
//! 保存采用读-改-写，不破坏其他模块（如 log 节）的配置。

use crate::core::catalog::ScanFilter;
use crate::core::controller::EngineConfig;
use crate::core::queue::QueueConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// 认证配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub remember_me: bool,
}

fn default_server_url() -> String {
    "http://localhost:3000".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            token: None,
            username: None,
            remember_me: false,
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadConfig {
    /// 同时在途的上传数上限
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// 分块大小（字节）。预留字段，当前不做分块
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 线性退避基数（毫秒）
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_max_concurrent() -> usize {
    1
}

fn default_chunk_size() -> u64 {
    1024 * 1024 // 1MB
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            chunk_size: default_chunk_size(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

/// 同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// 周期扫描间隔（秒）
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// 持久化的监控文件夹列表
    #[serde(default)]
    pub folders: Vec<String>,
}

fn default_interval_secs() -> u64 {
    300 // 5 分钟
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            folders: Vec::new(),
        }
    }
}

/// 网络配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// 请求超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    crate::transport::DEFAULT_TIMEOUT_SECS
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// 文件过滤配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    #[serde(default = "default_media_extensions")]
    pub media_extensions: Vec<String>,
    #[serde(default = "default_ignored_patterns")]
    pub ignored_patterns: Vec<String>,
}

fn default_media_extensions() -> Vec<String> {
    ScanFilter::default().media_extensions
}

fn default_ignored_patterns() -> Vec<String> {
    ScanFilter::default().ignored_patterns
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            media_extensions: default_media_extensions(),
            ignored_patterns: default_ignored_patterns(),
        }
    }
}

/// 全量设置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub filters: FilterConfig,
}

impl Settings {
    /// 从配置文件加载（缺失的节/字段取默认值）
    pub fn load(config_dir: &Path) -> Self {
        let config_file = config_dir.join("config.json");
        if config_file.exists() {
            if let Ok(content) = fs::read_to_string(&config_file) {
                if let Ok(settings) = serde_json::from_str::<Settings>(&content) {
                    return settings;
                }
            }
        }
        Self::default()
    }

    /// 保存设置，保留文件里其他模块的节（如 log）
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        let config_file = config_dir.join("config.json");

        // 读取现有配置
        let mut config: serde_json::Value = if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({}))
        } else {
            serde_json::json!({})
        };

        // 更新各节
        let own = serde_json::to_value(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if let (Some(config_map), Some(own_map)) = (config.as_object_mut(), own.as_object()) {
            for (key, value) in own_map {
                config_map.insert(key.clone(), value.clone());
            }
        }

        // 写入文件
        fs::create_dir_all(config_dir)?;
        let content = serde_json::to_string_pretty(&config)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&config_file, content)?;

        Ok(())
    }

    /// 组装引擎配置
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            sync_interval: Duration::from_secs(self.sync.interval_secs),
            queue: QueueConfig {
                max_concurrent: self.upload.max_concurrent.max(1),
                max_retries: self.upload.max_retries,
                retry_base_delay: Duration::from_millis(self.upload.retry_base_delay_ms),
            },
            filter: ScanFilter {
                media_extensions: self.filters.media_extensions.clone(),
                ignored_patterns: self.filters.ignored_patterns.clone(),
            },
        }
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network.timeout_secs)
    }
}

/// 设置存储：引擎读取配置、写回变更的唯一入口
///
/// 引擎不拥有持久化格式，只通过这里的读写方法与 config.json 交互。
pub struct SettingsStore {
    config_dir: PathBuf,
    settings: Mutex<Settings>,
}

impl SettingsStore {
    /// 从配置目录加载（文件不存在时使用默认值）
    pub fn new(config_dir: PathBuf) -> Self {
        let settings = Settings::load(&config_dir);
        Self {
            config_dir,
            settings: Mutex::new(settings),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// 当前设置快照
    pub fn snapshot(&self) -> Settings {
        self.settings.lock().unwrap().clone()
    }

    fn persist(&self, settings: &Settings) {
        if let Err(e) = settings.save(&self.config_dir) {
            tracing::warn!("保存配置失败: {}", e);
        }
    }

    pub fn synced_folders(&self) -> Vec<String> {
        self.settings.lock().unwrap().sync.folders.clone()
    }

    /// 记录监控文件夹（已存在则无操作）
    pub fn add_synced_folder(&self, folder: &str) {
        let mut settings = self.settings.lock().unwrap();
        if !settings.sync.folders.iter().any(|f| f == folder) {
            settings.sync.folders.push(folder.to_string());
            self.persist(&settings);
        }
    }

    pub fn remove_synced_folder(&self, folder: &str) {
        let mut settings = self.settings.lock().unwrap();
        let before = settings.sync.folders.len();
        settings.sync.folders.retain(|f| f != folder);
        if settings.sync.folders.len() != before {
            self.persist(&settings);
        }
    }

    pub fn auth_token(&self) -> Option<String> {
        self.settings.lock().unwrap().auth.token.clone()
    }

    pub fn set_auth(&self, token: Option<String>, username: Option<String>) {
        let mut settings = self.settings.lock().unwrap();
        settings.auth.token = token;
        if username.is_some() {
            settings.auth.username = username;
        }
        self.persist(&settings);
    }

    pub fn server_url(&self) -> String {
        self.settings.lock().unwrap().auth.server_url.clone()
    }

    pub fn set_server_url(&self, url: &str) {
        let mut settings = self.settings.lock().unwrap();
        settings.auth.server_url = url.to_string();
        self.persist(&settings);
    }
}
