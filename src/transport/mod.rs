pub mod http;

use crate::api::LoginData;
use async_trait::async_trait;
use thiserror::Error;

pub use http::HttpTransport;

// ============ 公共常量 ============

/// 默认请求超时（秒），可被 network.timeout 配置覆盖
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// 传输层错误分类
///
/// 取消永远不重试；其余类型由调用方按退避策略决定是否重试。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// 连接级失败：拒绝连接、主机不存在、TLS 握手失败等
    #[error("连接失败: {0}")]
    Connection(String),

    /// 请求超过配置的超时时间，已被中止
    #[error("请求超时")]
    Timeout,

    /// 协议级失败：非 2xx 状态码或服务端返回 success=false
    #[error("协议错误 (HTTP {status}): {message}")]
    Protocol { status: u16, message: String },

    /// 响应 JSON 不符合约定结构
    #[error("响应解析失败: {0}")]
    Parse(String),

    /// 请求被显式中止（停止同步、移除文件夹、关闭）
    #[error("请求已取消")]
    Cancelled,

    /// 本地文件在上传时无法读取（通常是调度后被删除）
    #[error("本地读取失败: {0}")]
    LocalFile(String),
}

impl TransportError {
    /// 该错误是否值得重试
    ///
    /// 取消与本地文件丢失不重试，其余类型按退避策略重试。
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransportError::Cancelled | TransportError::LocalFile(_)
        )
    }
}

/// 上传进度回调：参数为 (已发送字节数, 总字节数)
pub type ProgressFn = Box<dyn Fn(u64, u64) + Send + Sync>;

/// 媒体服务传输抽象
///
/// 对 HTTP 能力的薄封装：构造带认证的请求、multipart 上传、
/// 跟踪在途请求并支持中止。实现见 [`HttpTransport`]。
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// 登录换取 bearer token
    async fn login(&self, username: &str, password: &str) -> Result<LoginData, TransportError>;

    /// multipart 上传文件（file 分片 + metadata JSON 分片）
    ///
    /// `progress` 在每个数据块发出后调用。
    async fn upload_file(
        &self,
        local_path: &str,
        file_name: &str,
        modified_time: i64,
        progress: ProgressFn,
    ) -> Result<(), TransportError>;

    /// 在远端创建目录
    ///
    /// `item_path` 是发起请求的队列条目键，用于在途请求跟踪与中止。
    async fn create_directory(
        &self,
        item_path: &str,
        name: &str,
        remote_path: &str,
    ) -> Result<(), TransportError>;

    /// 删除远端条目
    async fn remove_remote(&self, item_path: &str, remote_path: &str)
        -> Result<(), TransportError>;

    /// 中止指定条目的在途请求（幂等，不存在则无操作）
    fn abort(&self, key: &str);

    /// 中止全部在途请求
    fn abort_all(&self);

    /// 设置或清除 bearer token，对下一次请求生效
    fn set_auth_token(&self, token: Option<String>);

    /// 更换服务器地址，URL 非法时返回校验错误
    fn set_server_url(&self, url: &str) -> Result<(), crate::error::SyncError>;
}
