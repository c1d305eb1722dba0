//! # 交互层
//!
//! 对快照中的元素执行点击、输入与滚动。
//!
//! ## 模块结构
//! - `service`: [`InteractionEngine`] 及各操作共用的元素解析与状态检查
//! - `click`: 点击状态机 (Resolve → PopupCheck → StateCheck → Dispatch → RaceOutcome) 与重试
//! - `typing`: 文本输入与按键
//! - `scroll`: 页面或元素滚动
//! - `input`: 鼠标轨迹与底层输入事件
//! - `policy`: 导航允许列表
//! - `outcome`: [`ClickOutcome`]
//!
//! ## 使用示例
//! ```rust,no_run
//! use chaser_engine::interaction::{ClickOutcome, InteractionEngine};
//!
//! # async fn example(engine: &InteractionEngine) -> Result<(), chaser_engine::Error> {
//! match engine.click_index(3).await? {
//!     ClickOutcome::NavigationTriggered(url) => println!("now at {}", url),
//!     other => println!("{}", other),
//! }
//! # Ok(())
//! # }
//! ```

pub mod outcome;
pub mod policy;
pub mod input;
pub mod service;
pub mod click;
pub mod typing;
pub mod scroll;


pub use outcome::ClickOutcome;
pub use policy::NavigationPolicy;
pub use scroll::ScrollDirection;
pub use service::{InteractionEngine, InteractionSettings};
