use std::path::PathBuf;
use std::sync::Arc;

pub mod api;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod transport;

pub use config::{Settings, SettingsStore};
pub use core::{EngineConfig, SyncController, SyncEvent};
pub use error::SyncError;
pub use transport::{HttpTransport, MediaTransport, TransportError};

/// 应用状态：设置存储 + 传输客户端 + 同步控制器
pub struct AppState {
    pub settings: Arc<SettingsStore>,
    pub transport: Arc<HttpTransport>,
    pub controller: Arc<SyncController>,
    pub config_dir: PathBuf,
}

impl AppState {
    pub fn new() -> anyhow::Result<Self> {
        // 获取默认应用配置目录
        let config_dir = dirs::config_dir()
            .map(|p| p.join("mediasync"))
            .unwrap_or_else(|| PathBuf::from(".mediasync"));

        std::fs::create_dir_all(&config_dir)?;
        Self::with_config_dir(config_dir)
    }

    /// 指定配置目录创建（测试或自定义数据位置）
    pub fn with_config_dir(config_dir: PathBuf) -> anyhow::Result<Self> {
        let settings = Arc::new(SettingsStore::new(config_dir.clone()));
        let snapshot = settings.snapshot();

        let transport = Arc::new(HttpTransport::new(
            &snapshot.auth.server_url,
            snapshot.network_timeout(),
        )?);
        if let Some(token) = settings.auth_token() {
            tracing::debug!("使用持久化的认证 token");
            transport.set_auth_token(Some(token));
        }

        let controller = Arc::new(SyncController::new(
            transport.clone(),
            settings.clone(),
            snapshot.engine_config(),
        )?);

        Ok(Self {
            settings,
            transport,
            controller,
            config_dir,
        })
    }

    /// 登录并持久化 token
    pub async fn login(&self, username: &str, password: &str) -> Result<(), SyncError> {
        let data = self.transport.login(username, password).await?;
        self.transport
            .set_auth_token(Some(data.accessToken.clone()));
        self.settings.set_auth(
            Some(data.accessToken),
            data.username.or_else(|| Some(username.to_string())),
        );
        tracing::info!("登录成功: {}", username);
        Ok(())
    }

    /// 清理资源（应用关闭时调用）
    pub async fn cleanup(&self) {
        tracing::info!("正在清理应用资源...");
        self.controller.stop().await;
        tracing::info!("资源清理完成");
    }
}

// 平台配置/缓存目录
pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }
    }

    pub fn cache_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Caches"))
        } else {
            // Linux
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".cache"))
        }
    }
}
