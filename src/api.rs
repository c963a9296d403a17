#![allow(non_snake_case)]

//! 媒体服务 API 的报文类型
//!
//! 服务端统一返回 `{ "success": bool, "data": ... }` 包装；
//! 不符合该结构的 JSON 视为解析错误，绝不当作成功处理。

use serde::{Deserialize, Serialize};

/// 登录请求 `POST /api/v1/auth/login`
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// 登录成功后的数据体
#[derive(Debug, Clone, Deserialize)]
pub struct LoginData {
    pub accessToken: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// 服务端统一响应包装
#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: serde::Deserialize<'de>"))]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(default)]
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

/// 上传文件时附带的 metadata 表单分片
#[derive(Debug, Clone, Serialize)]
pub struct UploadMetadata {
    pub fileName: String,
    pub fileSize: u64,
    pub originalPath: String,
    /// RFC 3339 格式的最后修改时间
    pub lastModified: String,
}

/// 远端建目录请求 `POST /api/v1/media/create-directory`
#[derive(Debug, Clone, Serialize)]
pub struct CreateDirectoryRequest {
    pub name: String,
    pub path: String,
}

/// 远端删除请求 `POST /api/v1/media/remove`
#[derive(Debug, Clone, Serialize)]
pub struct RemoveRequest {
    pub path: String,
}
