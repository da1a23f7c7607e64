//! # Chips HotSwap - 薯片热替换运行时
//!
//! 在不停止宿主进程的前提下部署、升级、回滚和删除模块：
//!
//! - **修订管理**: 每次部署产生新的修订，旧修订排空调用后卸载
//! - **代理调用**: 调用方持有代理句柄，始终调用到模块的最新修订
//! - **模块仓库**: 文件系统仓库，多个进程可共享同一根目录
//! - **周期巡检**: 发现其他进程部署的修订并淘汰过时修订
//! - **日志系统**: 结构化日志记录
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use chips_hotswap::{HotSwapRuntime, RuntimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RuntimeConfig::builder().root_dir("./hotModules").build();
//!     let mut runtime = HotSwapRuntime::new(config).await?;
//!
//!     runtime.start().await?;
//!     println!("modules: {:?}", runtime.module_names().await);
//!     runtime.shutdown().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `module` - 修订、注册表、代理与调度器
//! - `store` - 文件系统仓库与跨进程锁
//! - `utils` - 工具函数和错误类型
//! - `core` - 运行时配置
//! - `api` - 公共 API 接口

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod api;
pub mod core;
pub mod module;
pub mod store;
pub mod utils;

// 重导出常用类型，方便使用
pub use module::{
    Bean, BeanBuilder, BeanContext, BeanContextFactory, BeanDefinition, BeanFactoryTable,
    CapabilitySet, DynamicProxy, FactoryInput, LoadedModule, MethodDispatch, ModuleInfo,
    ModuleLoader, ModuleManifest, ModuleRevision, ProxyHandle, ReconcileReport, Registry,
    RevisionState,
};

pub use store::{ModuleRepository, PackageBuilder, ScanReport};

pub use utils::{error_code, status_code, CoreError, Result};
pub use utils::logger::{LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};

pub use crate::core::config::{LogConfig, RepositoryConfig, RuntimeConfig, RuntimeConfigBuilder};
pub use api::sdk::{HotSwapRuntime, HotSwapRuntimeBuilder, RuntimeHealth, RuntimeState};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
