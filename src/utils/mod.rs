//! 工具模块
//!
//! 包含错误类型、标识符生成和日志系统。

pub mod error;
pub mod id;
pub mod logger;

// 重导出常用类型
pub use error::{error_code, status_code, CoreError, Result};
pub use id::{generate_proxy_id, scratch_dir_name, staging_file_name};
pub use logger::{LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};
