//! # 监视器层
//!
//! 订阅事件总线、各自负责一件事的反应式子系统。
//!
//! ## 模块结构
//! - `network`: 按目标记录网络请求 (有界环形缓冲)
//! - `storage`: 会话开始时回放 cookie 与按源隔离的 storage, 结束时保存
//! - `dialogs`: 自动处理原生对话框
//! - `downloads`: 下载落盘并避免重名
//! - `tabs`: 新标签页接管、视口设置以及导航/切换/关闭请求的执行
//!
//! 每个监视器声明自己监听和发出的事件类型, 通过 [`attach`] 挂到总线上,
//! 事件处理是对 [`BrowserEvent`] 的一次 `match`。

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::bus::{BrowserEvent, EventBus, EventKind, SubscriptionId};
use crate::Result;

pub mod network;
pub mod storage;
pub mod dialogs;
pub mod downloads;
pub mod tabs;

#[cfg(test)]
mod tests;

pub use dialogs::{DialogRecord, DialogWatchdog};
pub use downloads::{unique_path, DownloadWatchdog};
pub use network::{NetworkLogEntry, NetworkWatchdog};
pub use storage::{Cookie, OriginState, StorageEntry, StorageState, StorageWatchdog};
pub use tabs::{TabsWatchdog, Viewport};

/// A reactive subsystem driven by bus events
#[async_trait]
pub trait Watchdog: Send + Sync {
    fn name(&self) -> &'static str;

    /// Event kinds [`handle`](Self::handle) is registered for
    fn listens_to(&self) -> &'static [EventKind];

    /// Event kinds this watchdog dispatches
    fn emits(&self) -> &'static [EventKind] {
        &[]
    }

    async fn handle(&self, event: BrowserEvent) -> Result<()>;
}

/// Register a watchdog for every kind it listens to
pub fn attach(watchdog: Arc<dyn Watchdog>, bus: &EventBus) -> Vec<SubscriptionId> {
    let ids: Vec<SubscriptionId> = watchdog
        .listens_to()
        .iter()
        .map(|kind| {
            let watchdog = Arc::clone(&watchdog);
            bus.on(*kind, watchdog.name(), move |event| {
                let watchdog = Arc::clone(&watchdog);
                async move { watchdog.handle(event).await }
            })
        })
        .collect();
    debug!(
        "Attached watchdog {} ({} kinds, emits {:?})",
        watchdog.name(),
        ids.len(),
        watchdog.emits()
    );
    ids
}

/// Remove every registration returned by [`attach`]
pub fn detach(ids: &[SubscriptionId], bus: &EventBus) {
    for id in ids {
        bus.off(*id);
    }
}
