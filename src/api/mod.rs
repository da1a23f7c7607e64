//! API 模块
//!
//! 对外提供的 SDK 接口。
//!
//! # 模块概览
//!
//! - `sdk`: [`HotSwapRuntime`] 主接口，提供部署、查询与代理调用
//!
//! # 示例
//!
//! ```rust,no_run
//! use chips_hotswap::{HotSwapRuntime, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RuntimeConfig::builder()
//!         .root_dir("./hotModules")
//!         .log_level("info")
//!         .build();
//!
//!     let mut runtime = HotSwapRuntime::new(config).await?;
//!     runtime.start().await?;
//!     Ok(())
//! }
//! ```

pub mod sdk;

// 重导出主要类型
pub use sdk::{HotSwapRuntime, HotSwapRuntimeBuilder, RuntimeHealth, RuntimeState};
