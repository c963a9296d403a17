//! 基于 reqwest 的媒体服务客户端
//!
//! 所有请求都带超时包装并登记到在途请求表，停止同步或移除文件夹时
//! 可以按条目中止。multipart 上传以流式 body 发送并逐块上报进度。

use super::{MediaTransport, ProgressFn, TransportError};
use crate::api::{
    ApiResponse, CreateDirectoryRequest, LoginData, LoginRequest, RemoveRequest, UploadMetadata,
};
use crate::error::SyncError;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart;
use reqwest::Url;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// 登录端点
const LOGIN_PATH: &str = "/api/v1/auth/login";
/// 上传端点
const UPLOAD_PATH: &str = "/api/v1/media/upload";
/// 建目录端点
const CREATE_DIR_PATH: &str = "/api/v1/media/create-directory";
/// 删除端点
const REMOVE_PATH: &str = "/api/v1/media/remove";

/// 在途请求记录
///
/// 由传输层独占持有，请求完成、中止或超时后销毁。
struct OutstandingRequest {
    cancel: CancellationToken,
    /// 关联的队列条目路径（登录等非条目请求为 None）
    item_path: Option<String>,
    started_at: Instant,
    deadline: Instant,
}

/// 可热更新的连接配置
struct ClientState {
    base_url: Url,
    auth_token: Option<String>,
    timeout: Duration,
}

pub struct HttpTransport {
    client: reqwest::Client,
    state: RwLock<ClientState>,
    outstanding: Mutex<HashMap<String, OutstandingRequest>>,
}

impl HttpTransport {
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self, SyncError> {
        let base_url = parse_server_url(server_url)?;

        Ok(Self {
            client: reqwest::Client::new(),
            state: RwLock::new(ClientState {
                base_url,
                auth_token: None,
                timeout,
            }),
            outstanding: Mutex::new(HashMap::new()),
        })
    }

    /// 更新请求超时，对下一次请求生效
    pub fn set_timeout(&self, timeout: Duration) {
        self.state.write().unwrap().timeout = timeout;
    }

    /// 当前在途请求数（含所有条目与非条目请求）
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().unwrap().len()
    }

    fn endpoint(&self, path: &str) -> Url {
        let state = self.state.read().unwrap();
        // base_url 在构造/更新时已校验过，join 固定路径不会失败
        state
            .base_url
            .join(path)
            .unwrap_or_else(|_| state.base_url.clone())
    }

    fn snapshot(&self) -> (Option<String>, Duration) {
        let state = self.state.read().unwrap();
        (state.auth_token.clone(), state.timeout)
    }

    fn track(&self, key: &str, item_path: Option<&str>, timeout: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let now = Instant::now();
        self.outstanding.lock().unwrap().insert(
            key.to_string(),
            OutstandingRequest {
                cancel: cancel.clone(),
                item_path: item_path.map(|p| p.to_string()),
                started_at: now,
                deadline: now + timeout,
            },
        );
        cancel
    }

    fn untrack(&self, key: &str) {
        if let Some(req) = self.outstanding.lock().unwrap().remove(key) {
            let name = req.item_path.as_deref().unwrap_or(key);
            if Instant::now() > req.deadline {
                debug!("请求超过截止时间后结束: {}", name);
            } else {
                debug!("请求结束: {} (耗时 {:?})", name, req.started_at.elapsed());
            }
        }
    }

    /// 发送请求并返回 (状态码, 响应体)
    ///
    /// 超时、连接失败和取消在这里统一分类；调用方只需要处理响应体。
    async fn execute(
        &self,
        key: &str,
        item_path: Option<&str>,
        timeout: Duration,
        builder: reqwest::RequestBuilder,
    ) -> Result<(u16, String), TransportError> {
        let cancel = self.track(key, item_path, timeout);
        // 无论成功、失败还是取消都要从在途表移除
        let _cleanup = scopeguard::guard((), |_| self.untrack(key));

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = builder.timeout(timeout).send() => {
                result.map_err(classify_request_error)?
            }
        };

        let status = response.status().as_u16();
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            text = response.text() => text.map_err(classify_request_error)?,
        };

        Ok((status, body))
    }

    /// 校验统一响应包装，返回 data 部分
    fn check_envelope<T: serde::de::DeserializeOwned>(
        status: u16,
        body: &str,
    ) -> Result<Option<T>, TransportError> {
        if !(200..300).contains(&status) {
            return Err(TransportError::Protocol {
                status,
                message: truncate_body(body),
            });
        }

        let envelope: ApiResponse<T> =
            serde_json::from_str(body).map_err(|e| TransportError::Parse(e.to_string()))?;

        if !envelope.success {
            return Err(TransportError::Protocol {
                status,
                message: envelope
                    .message
                    .unwrap_or_else(|| "服务端返回 success=false".to_string()),
            });
        }

        Ok(envelope.data)
    }
}

#[async_trait]
impl MediaTransport for HttpTransport {
    async fn login(&self, username: &str, password: &str) -> Result<LoginData, TransportError> {
        let (_, timeout) = self.snapshot();
        let key = uuid::Uuid::new_v4().to_string();
        let url = self.endpoint(LOGIN_PATH);

        debug!("登录请求: {}", url);

        let builder = self.client.post(url).json(&LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        });

        let (status, body) = self.execute(&key, None, timeout, builder).await?;
        let data: Option<LoginData> = Self::check_envelope(status, &body)?;

        data.ok_or_else(|| TransportError::Parse("响应缺少 accessToken 数据".to_string()))
    }

    async fn upload_file(
        &self,
        local_path: &str,
        file_name: &str,
        modified_time: i64,
        progress: ProgressFn,
    ) -> Result<(), TransportError> {
        let (token, timeout) = self.snapshot();

        let file = tokio::fs::File::open(local_path)
            .await
            .map_err(|e| TransportError::LocalFile(format!("{}: {}", local_path, e)))?;
        let total = file
            .metadata()
            .await
            .map_err(|e| TransportError::LocalFile(format!("{}: {}", local_path, e)))?
            .len();

        // 流式 body，逐块累计已发送字节并回调进度
        let mut sent: u64 = 0;
        let stream = ReaderStream::new(file).map(move |chunk| {
            if let Ok(ref bytes) = chunk {
                sent += bytes.len() as u64;
                progress(sent, total);
            }
            chunk
        });

        let metadata = UploadMetadata {
            fileName: file_name.to_string(),
            fileSize: total,
            originalPath: local_path.to_string(),
            lastModified: format_modified_time(modified_time),
        };
        let metadata_json = serde_json::to_string(&metadata)
            .map_err(|e| TransportError::Parse(e.to_string()))?;

        let file_part = multipart::Part::stream_with_length(reqwest::Body::wrap_stream(stream), total)
            .file_name(file_name.to_string())
            .mime_str("application/octet-stream")
            .map_err(classify_request_error)?;
        let metadata_part = multipart::Part::text(metadata_json)
            .mime_str("application/json")
            .map_err(classify_request_error)?;

        let form = multipart::Form::new()
            .part("file", file_part)
            .part("metadata", metadata_part);

        let mut builder = self.client.post(self.endpoint(UPLOAD_PATH)).multipart(form);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        debug!("上传文件: {} ({} 字节)", local_path, total);

        let (status, body) = self
            .execute(local_path, Some(local_path), timeout, builder)
            .await?;
        Self::check_envelope::<serde_json::Value>(status, &body)?;
        Ok(())
    }

    async fn create_directory(
        &self,
        item_path: &str,
        name: &str,
        remote_path: &str,
    ) -> Result<(), TransportError> {
        let (token, timeout) = self.snapshot();

        let mut builder = self
            .client
            .post(self.endpoint(CREATE_DIR_PATH))
            .json(&CreateDirectoryRequest {
                name: name.to_string(),
                path: remote_path.to_string(),
            });
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        debug!("创建远端目录: {}/{}", remote_path, name);

        let (status, body) = self
            .execute(item_path, Some(item_path), timeout, builder)
            .await?;
        Self::check_envelope::<serde_json::Value>(status, &body)?;
        Ok(())
    }

    async fn remove_remote(
        &self,
        item_path: &str,
        remote_path: &str,
    ) -> Result<(), TransportError> {
        let (token, timeout) = self.snapshot();

        let mut builder = self
            .client
            .post(self.endpoint(REMOVE_PATH))
            .json(&RemoveRequest {
                path: remote_path.to_string(),
            });
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        debug!("删除远端条目: {}", remote_path);

        let (status, body) = self
            .execute(item_path, Some(item_path), timeout, builder)
            .await?;
        Self::check_envelope::<serde_json::Value>(status, &body)?;
        Ok(())
    }

    fn abort(&self, key: &str) {
        let outstanding = self.outstanding.lock().unwrap();
        if let Some(req) = outstanding.get(key) {
            debug!("中止在途请求: {}", key);
            req.cancel.cancel();
        }
    }

    fn abort_all(&self) {
        let outstanding = self.outstanding.lock().unwrap();
        if !outstanding.is_empty() {
            warn!("中止全部在途请求 ({} 个)", outstanding.len());
        }
        for req in outstanding.values() {
            req.cancel.cancel();
        }
    }

    fn set_auth_token(&self, token: Option<String>) {
        self.state.write().unwrap().auth_token = token;
    }

    fn set_server_url(&self, url: &str) -> Result<(), SyncError> {
        let parsed = parse_server_url(url)?;
        self.state.write().unwrap().base_url = parsed;
        Ok(())
    }
}

/// 解析并校验服务器地址
fn parse_server_url(url: &str) -> Result<Url, SyncError> {
    let parsed =
        Url::parse(url).map_err(|e| SyncError::Validation(format!("服务器地址无效: {}", e)))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(SyncError::Validation(format!(
            "服务器地址必须是 http(s): {}",
            url
        )));
    }

    Ok(parsed)
}

/// 把 reqwest 错误映射到传输错误分类
fn classify_request_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Connection(error.to_string())
    } else if error.is_decode() || error.is_body() {
        TransportError::Parse(error.to_string())
    } else {
        // 其余（请求构造、重定向等）按连接级失败处理
        TransportError::Connection(error.to_string())
    }
}

/// unix 秒 → RFC 3339 字符串
fn format_modified_time(modified_time: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(modified_time, 0)
        .unwrap_or_default()
        .to_rfc3339()
}

/// 错误信息里只保留响应体开头，避免日志爆炸
fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut cut = MAX;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &body[..cut])
    }
}

/// 文件名辅助：取路径最后一段
pub fn file_name_of(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> HttpTransport {
        HttpTransport::new("http://localhost:3000", Duration::from_secs(30)).unwrap()
    }

    #[test]
    fn test_parse_server_url() {
        assert!(parse_server_url("http://localhost:3000").is_ok());
        assert!(parse_server_url("https://media.example.com").is_ok());
        assert!(parse_server_url("not a url").is_err());
        assert!(parse_server_url("ftp://example.com").is_err());
    }

    #[test]
    fn test_endpoint_join() {
        let t = transport();
        assert_eq!(
            t.endpoint(UPLOAD_PATH).as_str(),
            "http://localhost:3000/api/v1/media/upload"
        );
    }

    #[test]
    fn test_set_server_url_rejects_malformed() {
        let t = transport();
        assert!(t.set_server_url("::::").is_err());
        assert!(t.set_server_url("https://other.example.com").is_ok());
        assert_eq!(
            t.endpoint(LOGIN_PATH).as_str(),
            "https://other.example.com/api/v1/auth/login"
        );
    }

    #[test]
    fn test_check_envelope_non_2xx() {
        let err =
            HttpTransport::check_envelope::<serde_json::Value>(500, "internal error").unwrap_err();
        match err {
            TransportError::Protocol { status, .. } => assert_eq!(status, 500),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_check_envelope_malformed_json_is_parse_error() {
        let err = HttpTransport::check_envelope::<serde_json::Value>(200, "<html>oops</html>")
            .unwrap_err();
        assert!(matches!(err, TransportError::Parse(_)));
    }

    #[test]
    fn test_check_envelope_success_false_is_protocol_error() {
        let body = r#"{"success":false,"message":"quota exceeded"}"#;
        let err = HttpTransport::check_envelope::<serde_json::Value>(200, body).unwrap_err();
        match err {
            TransportError::Protocol { status, message } => {
                assert_eq!(status, 200);
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_check_envelope_success() {
        let body = r#"{"success":true,"data":{"id":7}}"#;
        let data =
            HttpTransport::check_envelope::<serde_json::Value>(200, body).unwrap();
        assert_eq!(data.unwrap()["id"], 7);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(TransportError::Timeout.is_retryable());
        assert!(TransportError::Connection("refused".into()).is_retryable());
        assert!(TransportError::Protocol {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!TransportError::Cancelled.is_retryable());
        assert!(!TransportError::LocalFile("gone".into()).is_retryable());
    }

    #[test]
    fn test_abort_is_idempotent_for_unknown_key() {
        let t = transport();
        t.abort("no-such-item");
        t.abort_all();
        assert_eq!(t.outstanding_count(), 0);
    }

    #[test]
    fn test_track_untrack() {
        let t = transport();
        let cancel = t.track("/a/b.mp4", Some("/a/b.mp4"), Duration::from_secs(5));
        assert_eq!(t.outstanding_count(), 1);
        t.abort("/a/b.mp4");
        assert!(cancel.is_cancelled());
        t.untrack("/a/b.mp4");
        assert_eq!(t.outstanding_count(), 0);
    }

    #[test]
    fn test_format_modified_time() {
        assert_eq!(format_modified_time(0), "1970-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_file_name_of() {
        assert_eq!(file_name_of("/data/media/clip.mp4"), "clip.mp4");
        assert_eq!(file_name_of("clip.mp4"), "clip.mp4");
    }
}
