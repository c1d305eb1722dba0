//! # DOM/无障碍树模型
//!
//! 为焦点 target 构建合并后的树（原始 DOM + 无障碍角色 + 布局几何），
//! 并提供 "元素句柄 → 实时节点" 的映射。
//!
//! ## 主要功能
//! - **快照**: 每次都重新构建不可变的 arena 树，不做增量修补
//! - **可交互检测**: 纯函数判断节点是否可交互，并按先序分配从 1 开始的索引
//! - **iframe 合并**: 同源 iframe 随文档一起返回，跨源 iframe 通过独立 session 捕获后挂到占位节点下
//! - **撕裂检测**: 捕获期间主框架发生导航时整个快照失败
//!
//! ## 模块结构
//! - `node`: arena 节点与 `DomTree`
//! - `handle`: 元素句柄
//! - `clickable`: 可交互检测
//! - `layout`: `DOMSnapshot.captureSnapshot` 解析
//! - `snapshot`: 快照服务

pub mod node;
pub mod handle;
pub mod clickable;
pub mod layout;
pub mod snapshot;

#[cfg(test)]
mod tests;

pub use clickable::is_interactive;
pub use handle::ElementHandle;
pub use layout::{LayoutInfo, LayoutMap};
pub use node::{DomNode, DomTree, ElementSummary, NodeId, NodeKind, Rect};
pub use snapshot::{DomService, DomSettings};
