//! # 会话/目标管理层
//!
//! 跟踪浏览器上报的所有 target（页面、iframe、worker）以及附着在其上的 session，
//! 为上层提供"获取或创建 session"的统一入口。
//!
//! ## 主要功能
//! - **目标跟踪**: 根据 `Target.*` 事件维护 target 表，并在发现新 target 时同步发布 `TabCreated`
//! - **按需附着**: 同一 target 的并发附着请求只会产生一次 `Target.attachToTarget`
//! - **失效重试**: session 被浏览器分离后自动重新附着，并按指数退避重试命令
//! - **焦点管理**: 同一时刻最多一个 target 处于焦点
//!
//! ## 模块结构
//! - `target`: Target / Session 值类型
//! - `manager`: 会话管理器实现
//!
//! ## 使用示例
//! ```rust,no_run
//! use chaser_engine::bus::{BusConfig, EventBus};
//! use chaser_engine::cdp::CdpWebSocketConnection;
//! use chaser_engine::retry::RetryPolicy;
//! use chaser_engine::session::SessionManager;
//!
//! # async fn example(ws_url: &str) -> Result<(), chaser_engine::Error> {
//! let transport = CdpWebSocketConnection::connect(ws_url).await?;
//! let bus = EventBus::new(BusConfig::default());
//! let manager = SessionManager::new(transport, bus, RetryPolicy::default());
//! manager.start().await?;
//!
//! let Some(page) = manager.pages().into_iter().next() else { return Ok(()) };
//! let title = manager
//!     .send_to_target(&page.target_id, "Runtime.evaluate", serde_json::json!({ "expression": "document.title" }))
//!     .await?;
//! println!("{}", title);
//! # Ok(())
//! # }
//! ```

pub mod target;
pub mod manager;


pub use manager::SessionManager;
pub use target::{Session, Target, TargetKind};
