//! 传输队列 - 条目状态机
//!
//! 纯内存结构，不做任何 IO。所有变更都由控制器在单一串行化点上调用，
//! 这里只负责维护不变量：每个本地路径至多一个存活条目、按入队顺序
//! 调度、并发上限、线性退避与重试上限、聚合进度和排空信号。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// 条目生命周期状态
///
/// `Pending → Syncing → { Completed | Retrying → Pending | Failed | FileNotFound }`，
/// `Modified` 在调度上等同于 `Pending`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Modified,
    Syncing,
    Retrying,
    Completed,
    Failed,
    FileNotFound,
}

impl ItemStatus {
    /// 是否可被调度
    pub fn is_eligible(&self) -> bool {
        matches!(self, ItemStatus::Pending | ItemStatus::Modified)
    }

    /// 是否终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Failed | ItemStatus::FileNotFound
        )
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemStatus::Pending => write!(f, "pending"),
            ItemStatus::Modified => write!(f, "modified"),
            ItemStatus::Syncing => write!(f, "syncing"),
            ItemStatus::Retrying => write!(f, "retrying"),
            ItemStatus::Completed => write!(f, "completed"),
            ItemStatus::Failed => write!(f, "failed"),
            ItemStatus::FileNotFound => write!(f, "file_not_found"),
        }
    }
}

impl From<&str> for ItemStatus {
    fn from(s: &str) -> Self {
        match s {
            "modified" => ItemStatus::Modified,
            "syncing" => ItemStatus::Syncing,
            "retrying" => ItemStatus::Retrying,
            "completed" => ItemStatus::Completed,
            "failed" => ItemStatus::Failed,
            "file_not_found" => ItemStatus::FileNotFound,
            _ => ItemStatus::Pending,
        }
    }
}

/// 条目对应的远端操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// 文件内容 multipart 上传
    Upload,
    /// 仅在远端创建/确认目录，不传输字节
    CreateDirectory,
    /// 删除远端条目（本地删除的传播）
    Remove,
}

/// 队列条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferItem {
    /// 本地路径，队列内唯一键
    pub local_path: String,
    /// 相对监控根的远端父目录（根下直接子项为空串）
    pub remote_path: String,
    pub file_name: String,
    pub file_size: u64,
    pub modified_time: i64,
    pub kind: TransferKind,
    pub status: ItemStatus,
    pub retry_count: u32,
    /// 本条目的百分比进度 (0..=100)
    pub progress: u8,
}

impl TransferItem {
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, TransferKind::CreateDirectory)
    }

    /// 远端完整路径（父目录 + 名称）
    pub fn remote_target(&self) -> String {
        if self.remote_path.is_empty() {
            self.file_name.clone()
        } else {
            format!("{}/{}", self.remote_path, self.file_name)
        }
    }
}

/// 队列调度配置
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// 同时处于 Syncing 的条目上限（串行流水线为 1）
    pub max_concurrent: usize,
    pub max_retries: u32,
    /// 线性退避基数，实际延迟 = base * retry_count
    pub retry_base_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(2000),
        }
    }
}

/// 失败处理结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// 安排第 attempt 次重试，退避 delay 后重新入队
    Retry { attempt: u32, delay: Duration },
    /// 重试用尽，条目进入 Failed，计数已复位
    Exhausted { attempts: u32 },
    /// 条目不存在或已不在 Syncing（取消、已清理），静默忽略
    Ignored,
}

/// 传输队列
pub struct TransferQueue {
    items: Vec<TransferItem>,
    index: HashMap<String, usize>,
    config: QueueConfig,
    /// 本排空周期是否已发出 drained 信号
    drained_signaled: bool,
}

impl TransferQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
            config,
            drained_signaled: false,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: QueueConfig) {
        self.config = config;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[TransferItem] {
        &self.items
    }

    pub fn get(&self, path: &str) -> Option<&TransferItem> {
        self.index.get(path).map(|&i| &self.items[i])
    }

    fn get_mut(&mut self, path: &str) -> Option<&mut TransferItem> {
        let i = *self.index.get(path)?;
        Some(&mut self.items[i])
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.local_path.clone(), i))
            .collect();
    }

    /// 入队或原地更新
    ///
    /// 同一路径不会产生第二个条目：在队条目只更新元数据
    /// （在途上传继续按旧状态走完），终态条目复活为 `Modified`。
    /// 返回 true 表示队列出现了新的可调度工作。
    pub fn upsert(
        &mut self,
        local_path: &str,
        remote_path: String,
        file_name: String,
        file_size: u64,
        modified_time: i64,
        kind: TransferKind,
    ) -> bool {
        if let Some(item) = self.get_mut(local_path) {
            item.remote_path = remote_path;
            item.file_name = file_name;
            item.file_size = file_size;
            item.modified_time = modified_time;
            item.kind = kind;

            if item.status.is_terminal() {
                item.status = ItemStatus::Modified;
                item.retry_count = 0;
                item.progress = 0;
                self.drained_signaled = false;
                return true;
            }
            return false;
        }

        self.items.push(TransferItem {
            local_path: local_path.to_string(),
            remote_path,
            file_name,
            file_size,
            modified_time,
            kind,
            status: ItemStatus::Pending,
            retry_count: 0,
            progress: 0,
        });
        self.index
            .insert(local_path.to_string(), self.items.len() - 1);
        self.drained_signaled = false;
        true
    }

    /// 彻底移除条目（文件夹移除、删除传播前的清理）
    pub fn remove(&mut self, path: &str) -> Option<TransferItem> {
        let i = *self.index.get(path)?;
        let item = self.items.remove(i);
        self.rebuild_index();
        Some(item)
    }

    /// 移除指定文件夹子树下的所有条目，返回被移除的条目
    pub fn purge_under(&mut self, prefix: &Path) -> Vec<TransferItem> {
        let mut removed = Vec::new();
        self.items.retain(|item| {
            if Path::new(&item.local_path).starts_with(prefix) {
                removed.push(item.clone());
                false
            } else {
                true
            }
        });
        if !removed.is_empty() {
            self.rebuild_index();
            debug!("清理子树 {:?}: 移除 {} 个条目", prefix, removed.len());
        }
        removed
    }

    /// 当前在途条目数
    pub fn syncing_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.status == ItemStatus::Syncing)
            .count()
    }

    /// 取下一个可调度条目（入队顺序），受并发上限约束
    pub fn next_eligible(&self) -> Option<&TransferItem> {
        if self.syncing_count() >= self.config.max_concurrent {
            return None;
        }
        self.items.iter().find(|i| i.status.is_eligible())
    }

    /// 条目开始传输
    pub fn begin(&mut self, path: &str) -> bool {
        match self.get_mut(path) {
            Some(item) if item.status.is_eligible() => {
                item.status = ItemStatus::Syncing;
                true
            }
            _ => false,
        }
    }

    /// 传输成功：终态 Completed，重试计数复位
    pub fn complete(&mut self, path: &str) -> bool {
        match self.get_mut(path) {
            Some(item) if item.status == ItemStatus::Syncing => {
                item.status = ItemStatus::Completed;
                item.progress = 100;
                item.retry_count = 0;
                true
            }
            _ => false,
        }
    }

    /// 传输失败：按线性退避重试或宣告用尽
    pub fn fail(&mut self, path: &str) -> FailureDisposition {
        let max_retries = self.config.max_retries;
        let base = self.config.retry_base_delay;

        match self.get_mut(path) {
            Some(item) if item.status == ItemStatus::Syncing => {
                if item.retry_count < max_retries {
                    item.retry_count += 1;
                    item.status = ItemStatus::Retrying;
                    item.progress = 0;
                    FailureDisposition::Retry {
                        attempt: item.retry_count,
                        delay: base * item.retry_count,
                    }
                } else {
                    let attempts = item.retry_count;
                    item.status = ItemStatus::Failed;
                    item.retry_count = 0;
                    FailureDisposition::Exhausted { attempts }
                }
            }
            _ => FailureDisposition::Ignored,
        }
    }

    /// 本地文件已消失：直接终态，不发起网络请求也不重试
    pub fn file_not_found(&mut self, path: &str) -> bool {
        match self.get_mut(path) {
            Some(item) if !item.status.is_terminal() => {
                item.status = ItemStatus::FileNotFound;
                item.retry_count = 0;
                true
            }
            _ => false,
        }
    }

    /// 退避计时到期，条目重新进入可调度集合
    pub fn retry_due(&mut self, path: &str) -> bool {
        match self.get_mut(path) {
            Some(item) if item.status == ItemStatus::Retrying => {
                item.status = ItemStatus::Pending;
                true
            }
            _ => false,
        }
    }

    /// 停止同步时把在途条目退回 Pending（取消对重试机制静默）
    pub fn revert_syncing(&mut self) -> Vec<String> {
        let mut reverted = Vec::new();
        for item in &mut self.items {
            if item.status == ItemStatus::Syncing {
                item.status = ItemStatus::Pending;
                item.progress = 0;
                reverted.push(item.local_path.clone());
            }
        }
        reverted
    }

    /// 更新条目的字节进度
    pub fn update_progress(&mut self, path: &str, sent: u64, total: u64) -> bool {
        match self.get_mut(path) {
            Some(item) if item.status == ItemStatus::Syncing => {
                item.progress = if total == 0 {
                    100
                } else {
                    ((sent * 100) / total).min(100) as u8
                };
                true
            }
            _ => false,
        }
    }

    /// 聚合进度：各条目百分比之和除以条目数（Completed 计 100，未开始计 0）
    pub fn aggregate_progress(&self) -> u8 {
        if self.items.is_empty() {
            return 0;
        }

        let total: u64 = self
            .items
            .iter()
            .map(|i| match i.status {
                ItemStatus::Completed => 100u64,
                _ => i.progress as u64,
            })
            .sum();

        (total / self.items.len() as u64) as u8
    }

    /// 队列是否已排空（所有条目终态；空队列视为已排空）
    pub fn is_drained(&self) -> bool {
        self.items.iter().all(|i| i.status.is_terminal())
    }

    /// 新周期开始：允许本周期排空时再次发出信号
    pub fn reset_drain_cycle(&mut self) {
        self.drained_signaled = false;
    }

    /// 排空信号，每个排空周期恰好触发一次
    ///
    /// 新工作入队会复位信号，队列再次排空时可以再触发。
    pub fn take_drained_signal(&mut self) -> bool {
        if self.is_drained() && !self.drained_signaled {
            self.drained_signaled = true;
            true
        } else {
            false
        }
    }

    /// 清理终态条目（排空周期结束后调用）
    pub fn clear_terminal(&mut self) {
        let before = self.items.len();
        self.items.retain(|i| !i.status.is_terminal());
        if self.items.len() != before {
            self.rebuild_index();
        }
    }
}
