pub mod catalog;
pub mod controller;
pub mod queue;
pub mod watcher;

pub use catalog::{CatalogEntry, FileCatalog, FileChange, ScanFilter};
pub use controller::{EngineConfig, SyncController, SyncEvent};
pub use queue::{ItemStatus, QueueConfig, TransferItem, TransferKind, TransferQueue};
pub use watcher::{NotifyWatcher, PathWatcher};
