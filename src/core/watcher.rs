//! 文件系统监听
//!
//! 对底层监听句柄只暴露 watch/unwatch 两个原语，控制器据此维护
//! 根文件夹与已发现子目录的监听集合。事件通过回调送入控制器的
//! 串行化通道，这里不做任何分类。

use crate::error::SyncError;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// 监听原语抽象
pub trait PathWatcher: Send + Sync {
    /// 开始监听单个目录（不递归，子目录由目录模块逐个注册）
    fn watch(&self, path: &Path) -> Result<(), SyncError>;

    /// 停止监听，路径未在监听时无操作
    fn unwatch(&self, path: &Path);
}

/// notify 实现
pub struct NotifyWatcher {
    inner: Mutex<RecommendedWatcher>,
}

impl NotifyWatcher {
    /// 创建监听器，事件路径逐个送入 `on_event`
    pub fn new<F>(on_event: F) -> Result<Self, SyncError>
    where
        F: Fn(PathBuf) + Send + 'static,
    {
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    // 只读访问事件不关心
                    if matches!(event.kind, notify::EventKind::Access(_)) {
                        return;
                    }
                    for path in event.paths {
                        on_event(path);
                    }
                }
                Err(e) => warn!("文件系统监听错误: {}", e),
            }
        })
        .map_err(|e| SyncError::Watch(e.to_string()))?;

        Ok(Self {
            inner: Mutex::new(watcher),
        })
    }
}

impl PathWatcher for NotifyWatcher {
    fn watch(&self, path: &Path) -> Result<(), SyncError> {
        self.inner
            .lock()
            .unwrap()
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| SyncError::Watch(format!("{:?}: {}", path, e)))
    }

    fn unwatch(&self, path: &Path) {
        if let Err(e) = self.inner.lock().unwrap().unwatch(path) {
            debug!("取消监听失败（可能已移除）: {:?} - {}", path, e);
        }
    }
}
