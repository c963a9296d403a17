//! 错误类型定义
//!
//! 队列级错误分类：校验错误立即上报不重试，传输错误按退避策略重试，
//! 取消和本地文件丢失都是终态。任何错误只影响对应条目，不会中断队列。

use crate::transport::TransportError;
use thiserror::Error;

/// 同步引擎错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 校验失败（路径不是文件夹、URL 格式错误等），不重试
    #[error("校验失败: {0}")]
    Validation(String),

    /// 传输层错误，是否重试由错误类型决定
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// 本地文件在调度时已不存在，终态，不发起网络请求
    #[error("本地文件不存在: {0}")]
    FileNotFound(String),

    /// 重试次数用尽，条目被放弃，队列继续处理后续条目
    #[error("重试 {attempts} 次后仍然失败: {path}")]
    ExhaustedRetries { path: String, attempts: u32 },

    /// 文件系统监听注册失败（目录仍会被定时扫描覆盖）
    #[error("监听失败: {0}")]
    Watch(String),
}

impl SyncError {
    /// 路径不是已存在的文件夹
    pub fn not_a_directory(path: &str) -> Self {
        SyncError::Validation(format!("路径不是文件夹: {}", path))
    }
}
