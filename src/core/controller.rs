//! 同步控制器
//!
//! 把三个异步事件源（周期定时器、文件系统监听、网络完成回调）汇聚到
//! 一条控制通道上，由单个任务串行处理；目录与队列的全部变更只发生在
//! 这个串行化点上。扫描在 spawn_blocking 工作线程执行，结果送回串行
//! 路径再应用。重试通过延时投递 RetryDue 消息实现，保持线性退避。

use crate::config::SettingsStore;
use crate::core::catalog::{
    remote_location, scan_tree, stat_entry, CatalogUpdate, FileCatalog, FileChange, ScanFilter,
};
use crate::core::queue::{
    FailureDisposition, ItemStatus, QueueConfig, TransferItem, TransferKind, TransferQueue,
};
use crate::core::watcher::{NotifyWatcher, PathWatcher};
use crate::error::SyncError;
use crate::transport::{MediaTransport, TransportError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 引擎配置（启动时由设置存储读出）
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 周期扫描间隔
    pub sync_interval: Duration,
    pub queue: QueueConfig,
    pub filter: ScanFilter,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(300),
            queue: QueueConfig::default(),
            filter: ScanFilter::default(),
        }
    }
}

/// 投递给观察者的事件（替代 GUI 信号，不假设任何事件循环）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    SyncStarted,
    SyncProgress { percent: u8 },
    ItemStatusChanged { path: String, status: ItemStatus },
    ItemProgress { path: String, percent: u8 },
    SyncFinished,
    SyncError { message: String },
    FolderAdded { path: String },
    FolderRemoved { path: String },
}

/// 控制通道消息：所有事件源都汇聚到这里
pub(crate) enum ControlMsg {
    /// 周期定时器
    Tick,
    /// 手动触发一次扫描+排空
    ForceSync,
    /// 文件系统事件
    Fs(PathBuf),
    /// 退避计时到期
    RetryDue { path: String },
    /// 上传字节进度
    Progress { path: String, sent: u64, total: u64 },
    /// 网络操作完成
    Finished {
        path: String,
        result: Result<(), TransportError>,
    },
}

/// 目录 + 队列，唯一的可变共享状态
struct SyncState {
    catalog: FileCatalog,
    queue: TransferQueue,
}

struct ControllerInner {
    state: Mutex<SyncState>,
    transport: Arc<dyn MediaTransport>,
    watcher: Box<dyn PathWatcher>,
    settings: Arc<SettingsStore>,
    ctrl_tx: mpsc::UnboundedSender<ControlMsg>,
    events_tx: mpsc::Sender<SyncEvent>,
    /// 引擎是否启用（stop 后定时与监听事件都被忽略）
    enabled: AtomicBool,
    /// 当前是否有扫描+排空周期在进行（周期之间不重叠）
    syncing: AtomicBool,
    timer_cancel: std::sync::Mutex<Option<CancellationToken>>,
    sync_interval: Duration,
}

/// 同步控制器
pub struct SyncController {
    inner: Arc<ControllerInner>,
    events_rx: std::sync::Mutex<Option<mpsc::Receiver<SyncEvent>>>,
    loop_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ControlMsg>>>,
}

impl SyncController {
    /// 使用 notify 文件系统监听创建控制器
    pub fn new(
        transport: Arc<dyn MediaTransport>,
        settings: Arc<SettingsStore>,
        config: EngineConfig,
    ) -> Result<Self, SyncError> {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();

        let fs_tx = ctrl_tx.clone();
        let watcher = NotifyWatcher::new(move |path| {
            let _ = fs_tx.send(ControlMsg::Fs(path));
        })?;

        Ok(Self::assemble(
            transport,
            settings,
            config,
            Box::new(watcher),
            ctrl_tx,
            ctrl_rx,
        ))
    }

    /// 注入自定义监听实现（测试用）
    pub fn with_watcher(
        transport: Arc<dyn MediaTransport>,
        settings: Arc<SettingsStore>,
        config: EngineConfig,
        watcher: Box<dyn PathWatcher>,
    ) -> Self {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        Self::assemble(transport, settings, config, watcher, ctrl_tx, ctrl_rx)
    }

    fn assemble(
        transport: Arc<dyn MediaTransport>,
        settings: Arc<SettingsStore>,
        config: EngineConfig,
        watcher: Box<dyn PathWatcher>,
        ctrl_tx: mpsc::UnboundedSender<ControlMsg>,
        ctrl_rx: mpsc::UnboundedReceiver<ControlMsg>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);

        let inner = Arc::new(ControllerInner {
            state: Mutex::new(SyncState {
                catalog: FileCatalog::new(config.filter),
                queue: TransferQueue::new(config.queue),
            }),
            transport,
            watcher,
            settings,
            ctrl_tx,
            events_tx,
            enabled: AtomicBool::new(false),
            syncing: AtomicBool::new(false),
            timer_cancel: std::sync::Mutex::new(None),
            sync_interval: config.sync_interval,
        });

        Self {
            inner,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            loop_rx: std::sync::Mutex::new(Some(ctrl_rx)),
        }
    }

    /// 取出事件接收端，只能调用一次
    pub fn take_events(&self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    /// 启动引擎（幂等）
    ///
    /// 启动控制循环与周期定时器，恢复持久化的文件夹列表，
    /// 并立即触发一次扫描+排空。
    pub async fn start(&self) {
        if self.inner.enabled.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("启动同步引擎 (间隔 {:?})", self.inner.sync_interval);

        // 控制循环只在首次启动时生成，之后跨 stop/start 持续存在
        if let Some(rx) = self.loop_rx.lock().unwrap().take() {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                run_loop(inner, rx).await;
            });
        }

        // 恢复持久化的文件夹列表，已消失的路径跳过
        for folder in self.inner.settings.synced_folders() {
            let path = PathBuf::from(&folder);
            if !path.is_dir() {
                warn!("持久化的文件夹已不存在，跳过: {}", folder);
                continue;
            }
            if let Err(e) = self.add_folder(&path).await {
                warn!("恢复文件夹失败: {} - {}", folder, e);
            }
        }

        // 周期定时器
        let token = CancellationToken::new();
        *self.inner.timer_cancel.lock().unwrap() = Some(token.clone());
        let tx = self.inner.ctrl_tx.clone();
        let interval = self.inner.sync_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let _ = tx.send(ControlMsg::Tick);
                    }
                }
            }
        });

        // 立即来一次完整扫描
        let _ = self.inner.ctrl_tx.send(ControlMsg::ForceSync);
    }

    /// 停止引擎（幂等）：取消定时器并中止所有在途请求
    ///
    /// 被中止的条目退回 Pending，迟到的完成回调不会改变状态。
    pub async fn stop(&self) {
        if !self.inner.enabled.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("停止同步引擎");

        if let Some(token) = self.inner.timer_cancel.lock().unwrap().take() {
            token.cancel();
        }

        self.inner.transport.abort_all();

        let mut state = self.inner.state.lock().await;
        let reverted = state.queue.revert_syncing();
        if !reverted.is_empty() {
            debug!("停止时回退 {} 个在途条目", reverted.len());
        }
        self.inner.syncing.store(false, Ordering::SeqCst);
    }

    /// 立即触发一次扫描+排空；已有周期在进行时是无操作
    pub fn force_sync(&self) {
        let _ = self.inner.ctrl_tx.send(ControlMsg::ForceSync);
    }

    /// 添加监控文件夹：校验、注册监听、立即扫描、持久化
    pub async fn add_folder(&self, path: &Path) -> Result<(), SyncError> {
        let filter = {
            let mut state = self.inner.state.lock().await;
            if !state.catalog.add_root(path)? {
                // 已在监控中
                return Ok(());
            }
            state.catalog.filter().clone()
        };

        if let Err(e) = self.inner.watcher.watch(path) {
            // 监听失败不致命，周期扫描仍会覆盖该目录
            warn!("注册监听失败: {}", e);
        }

        self.inner
            .settings
            .add_synced_folder(&path.to_string_lossy());
        self.inner.emit(SyncEvent::FolderAdded {
            path: path.to_string_lossy().to_string(),
        });

        // 立即扫描现有文件
        let root = path.to_path_buf();
        let scan_root = root.clone();
        let scanned =
            tokio::task::spawn_blocking(move || scan_tree(&scan_root, &filter))
                .await
                .unwrap_or_default();

        let mut state = self.inner.state.lock().await;
        if state.catalog.roots().iter().any(|r| r == &root) {
            let updates = state.catalog.apply_scan(&root, scanned);
            self.inner.apply_updates(&mut state, updates);
        }

        Ok(())
    }

    /// 移除监控文件夹及其子树；未在监控中时是无操作
    ///
    /// 子树下的在途请求被中止，且不会触发正常的成功/失败转移。
    pub async fn remove_folder(&self, path: &Path) {
        let mut state = self.inner.state.lock().await;
        let Some(removed) = state.catalog.remove_root(path) else {
            return;
        };

        for dir in &removed.watch_dirs {
            self.inner.watcher.unwatch(dir);
        }

        for item in state.queue.purge_under(path) {
            if item.status == ItemStatus::Syncing {
                self.inner.transport.abort(&item.local_path);
            }
        }
        drop(state);

        self.inner
            .settings
            .remove_synced_folder(&path.to_string_lossy());
        self.inner.emit(SyncEvent::FolderRemoved {
            path: path.to_string_lossy().to_string(),
        });
    }

    /// 更新认证 token，对下一次派发生效，不影响在途请求
    pub fn set_auth_token(&self, token: Option<String>) {
        self.inner.transport.set_auth_token(token);
    }

    /// 更新服务器地址（校验 URL），对下一次派发生效
    pub fn set_server_url(&self, url: &str) -> Result<(), SyncError> {
        self.inner.transport.set_server_url(url)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::SeqCst)
    }

    /// 当前队列快照（观察者展示用）
    pub async fn queue_snapshot(&self) -> Vec<TransferItem> {
        self.inner.state.lock().await.queue.items().to_vec()
    }

    /// 当前监控中的文件夹
    pub async fn synced_folders(&self) -> Vec<PathBuf> {
        self.inner.state.lock().await.catalog.roots().to_vec()
    }
}

/// 控制循环：唯一触碰目录/队列的任务
async fn run_loop(inner: Arc<ControllerInner>, mut rx: mpsc::UnboundedReceiver<ControlMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            ControlMsg::Tick | ControlMsg::ForceSync => {
                if inner.enabled.load(Ordering::SeqCst) {
                    inner.begin_cycle().await;
                }
            }
            ControlMsg::Fs(path) => {
                if inner.enabled.load(Ordering::SeqCst) {
                    inner.on_fs_event(path).await;
                }
            }
            ControlMsg::RetryDue { path } => {
                inner.on_retry_due(&path).await;
            }
            ControlMsg::Progress { path, sent, total } => {
                inner.on_progress(&path, sent, total).await;
            }
            ControlMsg::Finished { path, result } => {
                inner.on_finished(&path, result).await;
            }
        }
    }
}

impl ControllerInner {
    /// 投递事件给观察者；无人消费时丢弃而不是阻塞引擎
    fn emit(&self, event: SyncEvent) {
        let _ = self.events_tx.try_send(event);
    }

    fn emit_progress(&self, state: &SyncState) {
        self.emit(SyncEvent::SyncProgress {
            percent: state.queue.aggregate_progress(),
        });
    }

    /// 开始一个扫描+排空周期；周期从不重叠
    async fn begin_cycle(&self) {
        if self.syncing.swap(true, Ordering::SeqCst) {
            debug!("同步已在进行，忽略本次触发");
            return;
        }

        self.emit(SyncEvent::SyncStarted);

        let (roots, filter) = {
            let mut state = self.state.lock().await;
            state.queue.reset_drain_cycle();
            (
                state.catalog.roots().to_vec(),
                state.catalog.filter().clone(),
            )
        };

        for root in roots {
            let scan_root = root.clone();
            let scan_filter = filter.clone();
            let scanned =
                tokio::task::spawn_blocking(move || scan_tree(&scan_root, &scan_filter))
                    .await
                    .unwrap_or_default();

            let mut state = self.state.lock().await;
            // 扫描期间文件夹可能已被移除
            if state.catalog.roots().iter().any(|r| r == &root) {
                let updates = state.catalog.apply_scan(&root, scanned);
                self.apply_updates(&mut state, updates);
            }
        }

        self.pump().await;
        self.check_drained().await;
    }

    /// 把目录变更落到队列上
    fn apply_updates(&self, state: &mut SyncState, updates: Vec<CatalogUpdate>) {
        // 本批次里已传播删除的目录，其子树条目不再单独传播
        let mut removed_dirs: Vec<PathBuf> = Vec::new();

        for update in updates {
            let path = Path::new(&update.path);
            let Some(root) = state.catalog.owning_root(path).cloned() else {
                continue;
            };
            let (remote_path, name) = remote_location(&root, path);

            match update.change {
                FileChange::New | FileChange::Modified => {
                    if update.entry.is_dir {
                        if let Err(e) = self.watcher.watch(path) {
                            warn!("注册子目录监听失败: {}", e);
                        }
                    }

                    let kind = if update.entry.is_dir {
                        TransferKind::CreateDirectory
                    } else {
                        TransferKind::Upload
                    };
                    if state.queue.upsert(
                        &update.path,
                        remote_path,
                        name,
                        update.entry.size,
                        update.entry.modified_time,
                        kind,
                    ) {
                        if let Some(item) = state.queue.get(&update.path) {
                            self.emit(SyncEvent::ItemStatusChanged {
                                path: update.path.clone(),
                                status: item.status,
                            });
                        }
                    }
                }
                FileChange::Removed => {
                    if update.entry.is_dir {
                        self.watcher.unwatch(path);
                    }

                    // 本地已删除：清掉旧条目（在途的先中止），再传播删除
                    if let Some(existing) = state.queue.get(&update.path) {
                        if existing.status == ItemStatus::Syncing {
                            self.transport.abort(&update.path);
                        }
                        state.queue.remove(&update.path);
                    }

                    // 上级目录的远端删除已覆盖整个子树
                    if removed_dirs.iter().any(|d| path.starts_with(d)) {
                        continue;
                    }
                    if update.entry.is_dir {
                        removed_dirs.push(path.to_path_buf());
                    }

                    if state.queue.upsert(
                        &update.path,
                        remote_path,
                        name,
                        0,
                        update.entry.modified_time,
                        TransferKind::Remove,
                    ) {
                        if let Some(item) = state.queue.get(&update.path) {
                            self.emit(SyncEvent::ItemStatusChanged {
                                path: update.path.clone(),
                                status: item.status,
                            });
                        }
                    }
                }
            }
        }
    }

    /// 文件系统事件：归类后落到队列，派发留给当前周期或下一次扫描
    async fn on_fs_event(&self, path: PathBuf) {
        let stat = stat_entry(&path);

        let mut state = self.state.lock().await;
        if state.catalog.owning_root(&path).is_none() {
            return;
        }

        if stat.as_ref().map(|e| e.is_dir).unwrap_or(false) {
            // 目录事件：重新枚举该子树（检出新增子目录、新文件和消失的条目）
            let filter = state.catalog.filter().clone();
            drop(state);

            let scan_dir = path.clone();
            let scanned =
                tokio::task::spawn_blocking(move || scan_tree(&scan_dir, &filter))
                    .await
                    .unwrap_or_default();

            let mut state = self.state.lock().await;
            if state.catalog.owning_root(&path).is_some() {
                let updates = state.catalog.apply_scan(&path, scanned);
                self.apply_updates(&mut state, updates);
            }
        } else {
            let update = state.catalog.classify_event(&path, stat);
            if let Some(update) = update {
                self.apply_updates(&mut state, vec![update]);
            }
        }

        // 周期进行中时让新工作立即参与派发
        if self.syncing.load(Ordering::SeqCst) {
            self.pump().await;
        }
    }

    /// 退避计时到期：条目重新可调度
    async fn on_retry_due(&self, path: &str) {
        {
            let mut state = self.state.lock().await;
            if !state.queue.retry_due(path) {
                return;
            }
            self.emit(SyncEvent::ItemStatusChanged {
                path: path.to_string(),
                status: ItemStatus::Pending,
            });
        }
        self.pump().await;
        self.check_drained().await;
    }

    async fn on_progress(&self, path: &str, sent: u64, total: u64) {
        let mut state = self.state.lock().await;
        if state.queue.update_progress(path, sent, total) {
            if let Some(item) = state.queue.get(path) {
                self.emit(SyncEvent::ItemProgress {
                    path: path.to_string(),
                    percent: item.progress,
                });
            }
            self.emit_progress(&state);
        }
    }

    /// 网络操作完成：成功、重试、用尽或静默取消
    async fn on_finished(&self, path: &str, result: Result<(), TransportError>) {
        {
            let mut state = self.state.lock().await;
            match result {
                Ok(()) => {
                    if state.queue.complete(path) {
                        debug!("条目完成: {}", path);
                        self.emit(SyncEvent::ItemStatusChanged {
                            path: path.to_string(),
                            status: ItemStatus::Completed,
                        });
                        self.emit_progress(&state);
                    }
                }
                Err(TransportError::Cancelled) => {
                    // 取消是终态且对重试机制静默：不做任何状态转移
                    debug!("请求已取消: {}", path);
                }
                Err(TransportError::LocalFile(e)) => {
                    // 派发后文件被删除
                    if state.queue.file_not_found(path) {
                        warn!("本地文件消失: {} - {}", path, e);
                        self.emit(SyncEvent::ItemStatusChanged {
                            path: path.to_string(),
                            status: ItemStatus::FileNotFound,
                        });
                        self.emit(SyncEvent::SyncError {
                            message: SyncError::FileNotFound(path.to_string()).to_string(),
                        });
                        self.emit_progress(&state);
                    }
                }
                Err(e) => match state.queue.fail(path) {
                    FailureDisposition::Retry { attempt, delay } => {
                        let max_retries = state.queue.config().max_retries;
                        warn!(
                            "传输失败，{:?} 后重试 ({}/{}): {} - {}",
                            delay, attempt, max_retries, path, e
                        );
                        self.emit(SyncEvent::ItemStatusChanged {
                            path: path.to_string(),
                            status: ItemStatus::Retrying,
                        });

                        let tx = self.ctrl_tx.clone();
                        let path = path.to_string();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(ControlMsg::RetryDue { path });
                        });
                    }
                    FailureDisposition::Exhausted { attempts } => {
                        error!("重试用尽，放弃条目: {} - {}", path, e);
                        self.emit(SyncEvent::ItemStatusChanged {
                            path: path.to_string(),
                            status: ItemStatus::Failed,
                        });
                        self.emit(SyncEvent::SyncError {
                            message: SyncError::ExhaustedRetries {
                                path: path.to_string(),
                                attempts,
                            }
                            .to_string(),
                        });
                        self.emit_progress(&state);
                    }
                    FailureDisposition::Ignored => {
                        debug!("忽略已清理条目的完成回调: {}", path);
                    }
                },
            }
        }

        self.pump().await;
        self.check_drained().await;
    }

    /// 派发循环：在并发上限内按入队顺序启动可调度条目
    async fn pump(&self) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        loop {
            let item = {
                let mut state = self.state.lock().await;
                let Some(candidate) = state.queue.next_eligible().cloned() else {
                    break;
                };

                // 派发前确认本地文件仍然存在（上传条目）
                if candidate.kind == TransferKind::Upload
                    && !Path::new(&candidate.local_path).exists()
                {
                    state.queue.file_not_found(&candidate.local_path);
                    warn!("派发时本地文件已不存在: {}", candidate.local_path);
                    self.emit(SyncEvent::ItemStatusChanged {
                        path: candidate.local_path.clone(),
                        status: ItemStatus::FileNotFound,
                    });
                    self.emit(SyncEvent::SyncError {
                        message: SyncError::FileNotFound(candidate.local_path.clone())
                            .to_string(),
                    });
                    self.emit_progress(&state);
                    continue;
                }

                state.queue.begin(&candidate.local_path);
                candidate
            };

            self.emit(SyncEvent::ItemStatusChanged {
                path: item.local_path.clone(),
                status: ItemStatus::Syncing,
            });
            self.spawn_transfer(item);
        }
    }

    /// 启动一次网络操作，完成后经控制通道汇报
    fn spawn_transfer(&self, item: TransferItem) {
        let transport = self.transport.clone();
        let ctrl_tx = self.ctrl_tx.clone();

        tokio::spawn(async move {
            let path = item.local_path.clone();
            let result = match item.kind {
                TransferKind::Upload => {
                    let progress_tx = ctrl_tx.clone();
                    let progress_path = path.clone();
                    transport
                        .upload_file(
                            &item.local_path,
                            &item.file_name,
                            item.modified_time,
                            Box::new(move |sent, total| {
                                let _ = progress_tx.send(ControlMsg::Progress {
                                    path: progress_path.clone(),
                                    sent,
                                    total,
                                });
                            }),
                        )
                        .await
                }
                TransferKind::CreateDirectory => {
                    transport
                        .create_directory(&item.local_path, &item.file_name, &item.remote_path)
                        .await
                }
                TransferKind::Remove => {
                    transport
                        .remove_remote(&item.local_path, &item.remote_target())
                        .await
                }
            };

            let _ = ctrl_tx.send(ControlMsg::Finished { path, result });
        });
    }

    /// 排空检测：所有条目终态后收尾本周期
    async fn check_drained(&self) {
        let mut state = self.state.lock().await;
        if !self.syncing.load(Ordering::SeqCst) {
            return;
        }
        if state.queue.take_drained_signal() {
            self.emit_progress(&state);
            state.queue.clear_terminal();
            self.syncing.store(false, Ordering::SeqCst);
            self.emit(SyncEvent::SyncFinished);
            info!("同步周期完成");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::LoginData;
    use crate::transport::ProgressFn;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::fs;
    use std::sync::Mutex as StdMutex;

    /// 记录式监听（不接真实文件系统通知）
    #[derive(Default)]
    struct RecordingWatcher {
        watched: StdMutex<Vec<PathBuf>>,
        unwatched: StdMutex<Vec<PathBuf>>,
    }

    impl PathWatcher for RecordingWatcher {
        fn watch(&self, path: &Path) -> Result<(), SyncError> {
            self.watched.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }

        fn unwatch(&self, path: &Path) {
            self.unwatched.lock().unwrap().push(path.to_path_buf());
        }
    }

    /// 脚本化传输：按路径预置失败序列，记录全部调用
    #[derive(Default)]
    struct MockTransport {
        calls: StdMutex<Vec<String>>,
        failures: StdMutex<HashMap<String, VecDeque<TransportError>>>,
        aborted: StdMutex<Vec<String>>,
        /// 标记为 slow 的路径会一直挂起，直到被 abort
        slow_paths: StdMutex<Vec<String>>,
        pending_cancels: StdMutex<HashMap<String, CancellationToken>>,
    }

    impl MockTransport {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn fail_once(&self, path: &str, error: TransportError) {
            self.failures
                .lock()
                .unwrap()
                .entry(path.to_string())
                .or_default()
                .push_back(error);
        }

        fn mark_slow(&self, path: &str) {
            self.slow_paths.lock().unwrap().push(path.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn upload_calls(&self, path: &str) -> usize {
            let needle = format!("upload:{}", path);
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| **c == needle)
                .count()
        }

        fn next_failure(&self, key: &str) -> Option<TransportError> {
            self.failures
                .lock()
                .unwrap()
                .get_mut(key)
                .and_then(|q| q.pop_front())
        }

        async fn maybe_hang(&self, key: &str) -> Option<TransportError> {
            let is_slow = self.slow_paths.lock().unwrap().iter().any(|p| p == key);
            if !is_slow {
                return None;
            }
            let token = CancellationToken::new();
            self.pending_cancels
                .lock()
                .unwrap()
                .insert(key.to_string(), token.clone());
            token.cancelled().await;
            Some(TransportError::Cancelled)
        }
    }

    #[async_trait]
    impl MediaTransport for MockTransport {
        async fn login(&self, username: &str, _password: &str) -> Result<LoginData, TransportError> {
            self.record(format!("login:{}", username));
            Ok(LoginData {
                accessToken: "token".into(),
                username: Some(username.into()),
            })
        }

        async fn upload_file(
            &self,
            local_path: &str,
            _file_name: &str,
            _modified_time: i64,
            progress: ProgressFn,
        ) -> Result<(), TransportError> {
            self.record(format!("upload:{}", local_path));
            if let Some(err) = self.maybe_hang(local_path).await {
                return Err(err);
            }
            if let Some(err) = self.next_failure(local_path) {
                return Err(err);
            }
            progress(1, 2);
            progress(2, 2);
            Ok(())
        }

        async fn create_directory(
            &self,
            item_path: &str,
            name: &str,
            remote_path: &str,
        ) -> Result<(), TransportError> {
            self.record(format!("mkdir:{}/{}", remote_path, name));
            if let Some(err) = self.maybe_hang(item_path).await {
                return Err(err);
            }
            if let Some(err) = self.next_failure(item_path) {
                return Err(err);
            }
            Ok(())
        }

        async fn remove_remote(
            &self,
            item_path: &str,
            remote_path: &str,
        ) -> Result<(), TransportError> {
            self.record(format!("remove:{}", remote_path));
            if let Some(err) = self.maybe_hang(item_path).await {
                return Err(err);
            }
            if let Some(err) = self.next_failure(item_path) {
                return Err(err);
            }
            Ok(())
        }

        fn abort(&self, key: &str) {
            self.aborted.lock().unwrap().push(key.to_string());
            if let Some(token) = self.pending_cancels.lock().unwrap().remove(key) {
                token.cancel();
            }
        }

        fn abort_all(&self) {
            let tokens: Vec<_> = self
                .pending_cancels
                .lock()
                .unwrap()
                .drain()
                .map(|(_, t)| t)
                .collect();
            for token in tokens {
                token.cancel();
            }
        }

        fn set_auth_token(&self, _token: Option<String>) {}

        fn set_server_url(&self, _url: &str) -> Result<(), SyncError> {
            Ok(())
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            sync_interval: Duration::from_secs(3600),
            queue: QueueConfig {
                max_concurrent: 1,
                max_retries: 3,
                retry_base_delay: Duration::from_millis(25),
            },
            filter: ScanFilter::default(),
        }
    }

    struct Fixture {
        controller: SyncController,
        transport: Arc<MockTransport>,
        events: mpsc::Receiver<SyncEvent>,
        _settings_dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let settings_dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsStore::new(settings_dir.path().to_path_buf()));
        let transport = Arc::new(MockTransport::default());
        let controller = SyncController::with_watcher(
            transport.clone(),
            settings,
            test_config(),
            Box::new(RecordingWatcher::default()),
        );
        let events = controller.take_events().unwrap();
        Fixture {
            controller,
            transport,
            events,
            _settings_dir: settings_dir,
        }
    }

    /// 收集事件直到谓词满足或超时
    async fn wait_for<F>(events: &mut mpsc::Receiver<SyncEvent>, mut done: F) -> Vec<SyncEvent>
    where
        F: FnMut(&SyncEvent) -> bool,
    {
        let mut collected = Vec::new();
        let deadline = tokio::time::Duration::from_secs(5);
        let result = tokio::time::timeout(deadline, async {
            while let Some(event) = events.recv().await {
                let stop = done(&event);
                collected.push(event);
                if stop {
                    break;
                }
            }
        })
        .await;
        assert!(result.is_ok(), "等待事件超时，已收到: {:?}", collected);
        collected
    }

    fn write_file(path: &Path, data: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, data).unwrap();
    }

    /// 启动并等待 start() 自带的首次（空）扫描周期结束，
    /// 使后续 add_folder + force_sync 的事件序列确定。
    async fn start_and_settle(fx: &mut Fixture) {
        fx.controller.start().await;
        wait_for(&mut fx.events, |e| matches!(e, SyncEvent::SyncFinished)).await;
    }

    #[tokio::test]
    async fn test_scan_upload_and_drain() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("a.mp4"), b"aaaa");
        write_file(&dir.path().join("b.mp4"), b"bbbb");

        let mut fx = fixture();
        start_and_settle(&mut fx).await;
        fx.controller.add_folder(dir.path()).await.unwrap();
        fx.controller.force_sync();
        let events = wait_for(&mut fx.events, |e| matches!(e, SyncEvent::SyncFinished)).await;

        assert_eq!(fx.transport.upload_calls(&dir.path().join("a.mp4").to_string_lossy()), 1);
        assert_eq!(fx.transport.upload_calls(&dir.path().join("b.mp4").to_string_lossy()), 1);

        // drained 只触发一次
        let finished = events
            .iter()
            .filter(|e| matches!(e, SyncEvent::SyncFinished))
            .count();
        assert_eq!(finished, 1);

        // 聚合进度单调不减
        let mut last = 0u8;
        for event in &events {
            if let SyncEvent::SyncProgress { percent } = event {
                assert!(*percent >= last, "进度回退: {} -> {}", last, percent);
                last = *percent;
            }
        }

        // 队列排空后清理终态条目
        assert!(fx.controller.queue_snapshot().await.is_empty());
        assert!(!fx.controller.is_syncing());
    }

    #[tokio::test]
    async fn test_directory_created_before_files() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("shows/e1.mkv"), b"x");

        let mut fx = fixture();
        start_and_settle(&mut fx).await;
        fx.controller.add_folder(dir.path()).await.unwrap();
        fx.controller.force_sync();
        wait_for(&mut fx.events, |e| matches!(e, SyncEvent::SyncFinished)).await;

        let calls = fx.transport.calls();
        let mkdir_idx = calls.iter().position(|c| c == "mkdir:/shows").unwrap();
        let upload_idx = calls
            .iter()
            .position(|c| c.starts_with("upload:"))
            .unwrap();
        assert!(mkdir_idx < upload_idx, "目录应先于文件创建: {:?}", calls);
    }

    #[tokio::test]
    async fn test_retry_twice_then_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mp4");
        write_file(&file, b"aaaa");
        let key = file.to_string_lossy().to_string();

        let mut fx = fixture();
        fx.transport
            .fail_once(&key, TransportError::Connection("connection refused".into()));
        fx.transport
            .fail_once(&key, TransportError::Connection("connection refused".into()));

        start_and_settle(&mut fx).await;
        fx.controller.add_folder(dir.path()).await.unwrap();
        fx.controller.force_sync();
        let events = wait_for(&mut fx.events, |e| matches!(e, SyncEvent::SyncFinished)).await;

        // 两次失败 + 一次成功 = 3 次上传调用
        assert_eq!(fx.transport.upload_calls(&key), 3);

        let retrying = events
            .iter()
            .filter(|e| {
                matches!(e, SyncEvent::ItemStatusChanged { status, .. } if *status == ItemStatus::Retrying)
            })
            .count();
        assert_eq!(retrying, 2);

        let completed = events.iter().any(|e| {
            matches!(e, SyncEvent::ItemStatusChanged { status, .. } if *status == ItemStatus::Completed)
        });
        assert!(completed);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surfaces_error_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("a.mp4");
        let good = dir.path().join("b.mp4");
        write_file(&bad, b"aaaa");
        write_file(&good, b"bbbb");
        let bad_key = bad.to_string_lossy().to_string();

        let mut fx = fixture();
        // 4 次失败（初次 + 3 次重试）耗尽重试
        for _ in 0..4 {
            fx.transport
                .fail_once(&bad_key, TransportError::Timeout);
        }

        start_and_settle(&mut fx).await;
        fx.controller.add_folder(dir.path()).await.unwrap();
        fx.controller.force_sync();
        let events = wait_for(&mut fx.events, |e| matches!(e, SyncEvent::SyncFinished)).await;

        assert_eq!(fx.transport.upload_calls(&bad_key), 4);

        let failed = events.iter().any(|e| {
            matches!(e, SyncEvent::ItemStatusChanged { path, status } if path == &bad_key && *status == ItemStatus::Failed)
        });
        assert!(failed);
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::SyncError { .. })));

        // 坏条目不阻塞队列
        assert_eq!(
            fx.transport.upload_calls(&good.to_string_lossy()),
            1
        );
    }

    #[tokio::test]
    async fn test_file_deleted_before_dispatch_makes_no_network_call() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mp4");
        write_file(&file, b"aaaa");
        let key = file.to_string_lossy().to_string();

        let mut fx = fixture();
        // 首次上传失败进入退避，退避期间删除文件
        fx.transport
            .fail_once(&key, TransportError::Connection("refused".into()));

        start_and_settle(&mut fx).await;
        fx.controller.add_folder(dir.path()).await.unwrap();
        fx.controller.force_sync();

        wait_for(&mut fx.events, |e| {
            matches!(e, SyncEvent::ItemStatusChanged { status, .. } if *status == ItemStatus::Retrying)
        })
        .await;
        fs::remove_file(&file).unwrap();

        let events = wait_for(&mut fx.events, |e| matches!(e, SyncEvent::SyncFinished)).await;

        // 重派发时发现文件缺失：不再发起网络调用
        assert_eq!(fx.transport.upload_calls(&key), 1);
        assert!(events.iter().any(|e| {
            matches!(e, SyncEvent::ItemStatusChanged { status, .. } if *status == ItemStatus::FileNotFound)
        }));
    }

    #[tokio::test]
    async fn test_remove_folder_aborts_inflight_and_purges() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mp4");
        write_file(&file, b"aaaa");
        let key = file.to_string_lossy().to_string();

        let mut fx = fixture();
        fx.transport.mark_slow(&key);

        start_and_settle(&mut fx).await;
        fx.controller.add_folder(dir.path()).await.unwrap();
        fx.controller.force_sync();

        // 等待上传进入在途
        wait_for(&mut fx.events, |e| {
            matches!(e, SyncEvent::ItemStatusChanged { status, .. } if *status == ItemStatus::Syncing)
        })
        .await;

        fx.controller.remove_folder(dir.path()).await;
        let events = wait_for(&mut fx.events, |e| matches!(e, SyncEvent::SyncFinished)).await;

        assert!(fx
            .transport
            .aborted
            .lock()
            .unwrap()
            .contains(&key));
        assert!(fx.controller.queue_snapshot().await.is_empty());
        assert!(fx.controller.synced_folders().await.is_empty());

        // 取消的请求不触发成功/失败转移
        assert!(!events.iter().any(|e| {
            matches!(e, SyncEvent::ItemStatusChanged { status, .. }
                if *status == ItemStatus::Completed || *status == ItemStatus::Failed)
        }));
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::FolderRemoved { .. })));
    }

    #[tokio::test]
    async fn test_add_folder_idempotent_and_validated() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("a.mp4"), b"aaaa");

        let mut fx = fixture();
        start_and_settle(&mut fx).await;
        fx.controller.add_folder(dir.path()).await.unwrap();
        fx.controller.force_sync();
        wait_for(&mut fx.events, |e| matches!(e, SyncEvent::SyncFinished)).await;

        // 重复添加是无操作
        fx.controller.add_folder(dir.path()).await.unwrap();
        assert_eq!(fx.controller.synced_folders().await.len(), 1);
        assert!(fx.controller.queue_snapshot().await.is_empty());

        // 不存在的路径报校验错误
        let err = fx
            .controller
            .add_folder(&dir.path().join("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        // 移除未监控的文件夹是无操作
        fx.controller
            .remove_folder(Path::new("/nonexistent"))
            .await;
        assert_eq!(fx.controller.synced_folders().await.len(), 1);
    }

    #[tokio::test]
    async fn test_force_sync_does_not_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mp4");
        write_file(&file, b"aaaa");
        let key = file.to_string_lossy().to_string();

        let mut fx = fixture();
        fx.transport.mark_slow(&key);

        start_and_settle(&mut fx).await;
        fx.controller.add_folder(dir.path()).await.unwrap();
        fx.controller.force_sync();

        wait_for(&mut fx.events, |e| {
            matches!(e, SyncEvent::ItemStatusChanged { status, .. } if *status == ItemStatus::Syncing)
        })
        .await;
        assert!(fx.controller.is_syncing());

        // 周期进行中再触发是无操作（不会再发 SyncStarted）
        fx.controller.force_sync();
        fx.controller.force_sync();
        tokio::time::sleep(Duration::from_millis(50)).await;

        fx.controller.stop().await;

        let mut started = 0;
        while let Ok(event) = fx.events.try_recv() {
            if matches!(event, SyncEvent::SyncStarted) {
                started += 1;
            }
        }
        // 只有 start() 触发的那一次
        assert_eq!(started, 0, "同步进行中 force_sync 不应开启新周期");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_reverts_inflight() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mp4");
        write_file(&file, b"aaaa");
        let key = file.to_string_lossy().to_string();

        let mut fx = fixture();
        fx.transport.mark_slow(&key);

        fx.controller.start().await;
        fx.controller.start().await;
        wait_for(&mut fx.events, |e| matches!(e, SyncEvent::SyncFinished)).await;
        fx.controller.add_folder(dir.path()).await.unwrap();
        fx.controller.force_sync();

        wait_for(&mut fx.events, |e| {
            matches!(e, SyncEvent::ItemStatusChanged { status, .. } if *status == ItemStatus::Syncing)
        })
        .await;

        fx.controller.stop().await;
        fx.controller.stop().await;
        assert!(!fx.controller.is_enabled());
        assert!(!fx.controller.is_syncing());

        // 在途条目退回 Pending，等待下一次启动
        let snapshot = fx.controller.queue_snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, ItemStatus::Pending);
        assert_eq!(snapshot[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_fs_event_modified_requeues() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mp4");
        write_file(&file, b"v1");
        let key = file.to_string_lossy().to_string();

        let mut fx = fixture();
        start_and_settle(&mut fx).await;
        fx.controller.add_folder(dir.path()).await.unwrap();
        fx.controller.force_sync();
        wait_for(&mut fx.events, |e| matches!(e, SyncEvent::SyncFinished)).await;
        assert_eq!(fx.transport.upload_calls(&key), 1);

        // 文件变化 + 下一个周期 → 重新上传一次
        write_file(&file, b"v2-longer");
        fx.controller.force_sync();
        wait_for(&mut fx.events, |e| matches!(e, SyncEvent::SyncFinished)).await;
        assert_eq!(fx.transport.upload_calls(&key), 2);
    }

    #[tokio::test]
    async fn test_fs_event_enqueues_until_next_cycle() {
        let dir = tempfile::tempdir().unwrap();

        let mut fx = fixture();
        start_and_settle(&mut fx).await;
        fx.controller.add_folder(dir.path()).await.unwrap();
        fx.controller.force_sync();
        wait_for(&mut fx.events, |e| matches!(e, SyncEvent::SyncFinished)).await;

        // 监听事件送达新文件：只入队，派发等下一个周期
        let file = dir.path().join("clip.mp4");
        write_file(&file, b"xxxx");
        fx.controller
            .inner
            .ctrl_tx
            .send(ControlMsg::Fs(file.clone()))
            .unwrap();

        wait_for(&mut fx.events, |e| {
            matches!(e, SyncEvent::ItemStatusChanged { status, .. } if *status == ItemStatus::Pending)
        })
        .await;
        assert_eq!(fx.transport.upload_calls(&file.to_string_lossy()), 0);
        assert_eq!(fx.controller.queue_snapshot().await.len(), 1);

        // 同一事件重复送达不会产生重复条目
        fx.controller
            .inner
            .ctrl_tx
            .send(ControlMsg::Fs(file.clone()))
            .unwrap();

        fx.controller.force_sync();
        wait_for(&mut fx.events, |e| matches!(e, SyncEvent::SyncFinished)).await;
        assert_eq!(fx.transport.upload_calls(&file.to_string_lossy()), 1);
    }

    #[tokio::test]
    async fn test_directory_event_scans_subtree() {
        let dir = tempfile::tempdir().unwrap();

        let mut fx = fixture();
        start_and_settle(&mut fx).await;
        fx.controller.add_folder(dir.path()).await.unwrap();
        fx.controller.force_sync();
        wait_for(&mut fx.events, |e| matches!(e, SyncEvent::SyncFinished)).await;

        // 新子目录连同内容一起出现（如整体移入），目录事件触发子树扫描
        write_file(&dir.path().join("season1/e1.mkv"), b"x");
        fx.controller
            .inner
            .ctrl_tx
            .send(ControlMsg::Fs(dir.path().to_path_buf()))
            .unwrap();

        fx.controller.force_sync();
        wait_for(&mut fx.events, |e| matches!(e, SyncEvent::SyncFinished)).await;

        let calls = fx.transport.calls();
        assert!(calls.iter().any(|c| c == "mkdir:/season1"), "{:?}", calls);
        assert!(
            calls.iter().any(|c| c.starts_with("upload:") && c.ends_with("e1.mkv")),
            "{:?}",
            calls
        );
    }

    #[tokio::test]
    async fn test_deletion_propagates_remove() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.mp4");
        write_file(&file, b"v1");

        let mut fx = fixture();
        start_and_settle(&mut fx).await;
        fx.controller.add_folder(dir.path()).await.unwrap();
        fx.controller.force_sync();
        wait_for(&mut fx.events, |e| matches!(e, SyncEvent::SyncFinished)).await;

        // 本地删除 → 下一个周期的扫描差异触发远端删除
        fs::remove_file(&file).unwrap();
        fx.controller.force_sync();
        wait_for(&mut fx.events, |e| matches!(e, SyncEvent::SyncFinished)).await;

        assert!(fx
            .transport
            .calls()
            .iter()
            .any(|c| c == "remove:a.mp4"));
    }

    #[tokio::test]
    async fn test_empty_cycle_still_finishes() {
        let dir = tempfile::tempdir().unwrap();

        let mut fx = fixture();
        start_and_settle(&mut fx).await;
        fx.controller.add_folder(dir.path()).await.unwrap();
        fx.controller.force_sync();
        wait_for(&mut fx.events, |e| matches!(e, SyncEvent::SyncFinished)).await;

        // 空文件夹：无网络调用，周期正常收尾
        assert!(fx.transport.calls().is_empty());
        assert!(!fx.controller.is_syncing());

        // 再来一轮也一样
        fx.controller.force_sync();
        wait_for(&mut fx.events, |e| matches!(e, SyncEvent::SyncFinished)).await;
    }
}
