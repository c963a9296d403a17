//! 本地文件目录
//!
//! 维护受监控文件夹下所有可传输文件的最近一次快照（大小 + 修改时间），
//! 把文件系统事件归类为新增/修改/删除。分类只取决于扩展名白名单、
//! 忽略规则和当前 stat 结果，除快照表外没有其他隐藏状态。

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// 文件过滤配置
#[derive(Debug, Clone)]
pub struct ScanFilter {
    /// 媒体扩展名白名单（带点、小写）
    pub media_extensions: Vec<String>,
    /// 忽略规则（glob patterns）
    pub ignored_patterns: Vec<String>,
}

impl Default for ScanFilter {
    fn default() -> Self {
        Self {
            media_extensions: vec![
                ".mp4".to_string(),
                ".avi".to_string(),
                ".mov".to_string(),
                ".mkv".to_string(),
                ".mp3".to_string(),
                ".wav".to_string(),
                ".flac".to_string(),
                ".jpg".to_string(),
                ".jpeg".to_string(),
                ".png".to_string(),
                ".gif".to_string(),
                ".bmp".to_string(),
                ".tiff".to_string(),
                ".webp".to_string(),
            ],
            ignored_patterns: vec![
                "*.tmp".to_string(),
                "*.temp".to_string(),
                "*.cache".to_string(),
                "*.log".to_string(),
                "Thumbs.db".to_string(),
                ".DS_Store".to_string(),
            ],
        }
    }
}

impl ScanFilter {
    /// 文件是否具有媒体扩展名
    fn has_media_extension(&self, path: &Path) -> bool {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e.to_lowercase()))
            .unwrap_or_default();

        self.media_extensions
            .iter()
            .any(|e| e.to_lowercase() == ext)
    }

    /// 路径是否命中忽略规则
    fn is_ignored(&self, path: &str) -> bool {
        self.ignored_patterns
            .iter()
            .any(|pattern| Self::matches_pattern(path, pattern))
    }

    /// 文件是否应进入目录（媒体扩展名 + 未被忽略）
    pub fn qualifies(&self, path: &Path) -> bool {
        self.has_media_extension(path) && !self.is_ignored(&path.to_string_lossy())
    }

    /// 简单的 glob 模式匹配
    fn matches_pattern(path: &str, pattern: &str) -> bool {
        let path = path.to_lowercase().replace('\\', "/");
        let pattern = pattern.to_lowercase();

        // 处理 ** 通配符
        if pattern.contains("**") {
            let parts: Vec<&str> = pattern.split("**").collect();
            if parts.len() == 2 {
                let prefix = parts[0].trim_end_matches('/');
                let suffix = parts[1].trim_start_matches('/');

                if prefix.is_empty() && suffix.is_empty() {
                    return true;
                }

                // 前缀允许出现在任意目录边界（监控路径是绝对路径）
                if !prefix.is_empty()
                    && !path.starts_with(prefix)
                    && !path.contains(&format!("/{}", prefix))
                {
                    return false;
                }

                if !suffix.is_empty() && !path.ends_with(suffix) {
                    return false;
                }

                return true;
            }
        }

        // 处理 * 通配符（只匹配最后一段，目录分隔符不跨越）
        if pattern.contains('*') {
            let regex_pattern = pattern.replace('.', "\\.").replace('*', "[^/]*");

            if let Ok(re) = regex::Regex::new(&format!("(^|/){}$", regex_pattern)) {
                return re.is_match(&path);
            }
        }

        // 精确匹配（完整路径或最后一段）
        path == pattern || path.ends_with(&format!("/{}", pattern))
    }
}

/// 单个路径的最近一次快照
///
/// 每次观察到变化时整体替换，不做合并。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub size: u64,
    pub modified_time: i64,
    pub is_dir: bool,
}

/// 事件分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    New,
    Modified,
    Removed,
}

/// 一次目录变更：路径 + 分类 + 变更后（或删除前）的快照
#[derive(Debug, Clone)]
pub struct CatalogUpdate {
    pub path: String,
    pub change: FileChange,
    pub entry: CatalogEntry,
}

/// 扫描结果条目
#[derive(Debug, Clone)]
pub struct ScannedEntry {
    pub path: PathBuf,
    pub size: u64,
    pub modified_time: i64,
    pub is_dir: bool,
}

/// 被移除文件夹的子树内容
#[derive(Debug, Default)]
pub struct RemovedSubtree {
    /// 子树内全部已知条目（文件与目录）
    pub entries: Vec<(String, CatalogEntry)>,
    /// 需要取消监听的目录（含根文件夹自身）
    pub watch_dirs: Vec<PathBuf>,
}

/// 本地文件目录
pub struct FileCatalog {
    roots: Vec<PathBuf>,
    /// 所有处于监听状态的目录（根 + 已发现的子目录）
    watched_dirs: HashSet<PathBuf>,
    entries: HashMap<String, CatalogEntry>,
    filter: ScanFilter,
}

impl FileCatalog {
    pub fn new(filter: ScanFilter) -> Self {
        Self {
            roots: Vec::new(),
            watched_dirs: HashSet::new(),
            entries: HashMap::new(),
            filter,
        }
    }

    pub fn filter(&self) -> &ScanFilter {
        &self.filter
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// 注册一个根文件夹
    ///
    /// 返回 `Ok(false)` 表示已在监控中（无操作）。注册不触发扫描，
    /// 扫描结果由调用方通过 [`FileCatalog::apply_scan`] 送回。
    pub fn add_root(&mut self, path: &Path) -> Result<bool, SyncError> {
        if !path.is_dir() {
            return Err(SyncError::not_a_directory(&path.to_string_lossy()));
        }

        if self.roots.iter().any(|r| r == path) {
            debug!("文件夹已在监控中: {:?}", path);
            return Ok(false);
        }

        self.roots.push(path.to_path_buf());
        self.watched_dirs.insert(path.to_path_buf());
        Ok(true)
    }

    /// 移除根文件夹及其整个子树
    ///
    /// 返回 `None` 表示该路径不在监控中（无操作）。
    pub fn remove_root(&mut self, path: &Path) -> Option<RemovedSubtree> {
        let pos = self.roots.iter().position(|r| r == path)?;
        self.roots.remove(pos);

        let mut removed = RemovedSubtree::default();

        self.entries.retain(|key, entry| {
            if Path::new(key).starts_with(path) {
                removed.entries.push((key.clone(), entry.clone()));
                false
            } else {
                true
            }
        });

        self.watched_dirs.retain(|dir| {
            if dir.starts_with(path) {
                removed.watch_dirs.push(dir.clone());
                false
            } else {
                true
            }
        });

        debug!(
            "移除文件夹 {:?}: 清理 {} 个条目, {} 个监听目录",
            path,
            removed.entries.len(),
            removed.watch_dirs.len()
        );

        Some(removed)
    }

    /// 查找路径所属的根文件夹
    pub fn owning_root(&self, path: &Path) -> Option<&PathBuf> {
        self.roots.iter().find(|r| path.starts_with(r))
    }

    /// 应用一次完整扫描结果，与快照表做差异
    ///
    /// 扫描中消失的已知条目按删除处理，本地删除由此传播到远端。
    pub fn apply_scan(&mut self, root: &Path, scanned: Vec<ScannedEntry>) -> Vec<CatalogUpdate> {
        let mut updates = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for item in scanned {
            let key = item.path.to_string_lossy().to_string();
            seen.insert(key.clone());

            let entry = CatalogEntry {
                size: item.size,
                modified_time: item.modified_time,
                is_dir: item.is_dir,
            };

            match self.entries.get(&key).cloned() {
                None => {
                    if item.is_dir {
                        self.watched_dirs.insert(item.path.clone());
                    }
                    self.entries.insert(key.clone(), entry.clone());
                    updates.push(CatalogUpdate {
                        path: key,
                        change: FileChange::New,
                        entry,
                    });
                }
                Some(known)
                    if !known.is_dir
                        && (known.size != entry.size
                            || known.modified_time != entry.modified_time) =>
                {
                    self.entries.insert(key.clone(), entry.clone());
                    updates.push(CatalogUpdate {
                        path: key,
                        change: FileChange::Modified,
                        entry,
                    });
                }
                Some(_) => {}
            }
        }

        // 子树内未再出现的条目视为已删除
        let mut vanished: Vec<(String, CatalogEntry)> = self
            .entries
            .iter()
            .filter(|(key, _)| Path::new(key).starts_with(root) && !seen.contains(*key))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        vanished.sort_by(|a, b| a.0.cmp(&b.0));

        for (key, entry) in vanished {
            self.entries.remove(&key);
            if entry.is_dir {
                self.watched_dirs.remove(Path::new(&key));
            }
            updates.push(CatalogUpdate {
                path: key,
                change: FileChange::Removed,
                entry,
            });
        }

        updates
    }

    /// 归类单个文件事件
    ///
    /// `stat` 为 `None` 表示路径已不存在。返回 `None` 表示与目录无关
    /// （被过滤且此前未知，或内容未变化）。
    pub fn classify_event(
        &mut self,
        path: &Path,
        stat: Option<CatalogEntry>,
    ) -> Option<CatalogUpdate> {
        let key = path.to_string_lossy().to_string();

        let entry = match stat {
            Some(entry)
                if (entry.is_dir && !self.filter.is_ignored(&key))
                    || (!entry.is_dir && self.filter.qualifies(path)) =>
            {
                entry
            }
            _ => {
                // 不存在或不再符合过滤条件：此前已知则按删除处理，不再入队
                let known = self.entries.remove(&key)?;
                if known.is_dir {
                    self.watched_dirs.remove(path);
                }
                return Some(CatalogUpdate {
                    path: key,
                    change: FileChange::Removed,
                    entry: known,
                });
            }
        };

        match self.entries.get(&key).cloned() {
            None => {
                if entry.is_dir {
                    self.watched_dirs.insert(path.to_path_buf());
                }
                self.entries.insert(key.clone(), entry.clone());
                Some(CatalogUpdate {
                    path: key,
                    change: FileChange::New,
                    entry,
                })
            }
            Some(known)
                if !known.is_dir
                    && (known.size != entry.size || known.modified_time != entry.modified_time) =>
            {
                self.entries.insert(key.clone(), entry.clone());
                Some(CatalogUpdate {
                    path: key,
                    change: FileChange::Modified,
                    entry,
                })
            }
            Some(_) => None,
        }
    }

    /// 路径是否是处于监听状态的目录
    pub fn is_watched_dir(&self, path: &Path) -> bool {
        self.watched_dirs.contains(path)
    }
}

/// 对 stat 结果做快照（路径不存在时返回 None）
pub fn stat_entry(path: &Path) -> Option<CatalogEntry> {
    let metadata = std::fs::metadata(path).ok()?;
    let modified_time = metadata
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_secs() as i64;

    Some(CatalogEntry {
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        modified_time,
        is_dir: metadata.is_dir(),
    })
}

/// 递归扫描一个根文件夹（阻塞调用，应放在 spawn_blocking 中执行）
///
/// 返回按遍历顺序排列的子目录与合格文件，子目录先于其内容出现，
/// 保证远端目录在文件上传之前创建。
pub fn scan_tree(root: &Path, filter: &ScanFilter) -> Vec<ScannedEntry> {
    let mut result = Vec::new();

    let walker = WalkDir::new(root).follow_links(false).into_iter();
    for entry in walker.filter_entry(|e| {
        // 整个忽略命中的子目录直接跳过
        !(e.file_type().is_dir() && filter.is_ignored(&e.path().to_string_lossy()))
    }) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("扫描条目失败: {}", e);
                continue;
            }
        };

        let path = entry.path();
        if path == root {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!("读取元数据失败: {:?} - {}", path, e);
                continue;
            }
        };

        let is_dir = metadata.is_dir();
        if !is_dir && !filter.qualifies(path) {
            continue;
        }

        let modified_time = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        result.push(ScannedEntry {
            path: path.to_path_buf(),
            size: if is_dir { 0 } else { metadata.len() },
            modified_time,
            is_dir,
        });
    }

    result
}

/// 计算条目相对根文件夹的远端位置：(远端父目录, 名称)
///
/// 远端路径统一使用 `/` 分隔，根文件夹的直接子项父目录为空串。
pub fn remote_location(root: &Path, path: &Path) -> (String, String) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let parent_rel = path
        .strip_prefix(root)
        .ok()
        .and_then(|rel| rel.parent().map(|p| p.to_path_buf()))
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default();

    (parent_rel, name)
}
