//! 模块仓库存储
//!
//! - `lock`: 仓库目录的建议性文件锁
//! - `package`: 模块包的读取与生成
//! - `file_store`: 模块包在磁盘上的布局与修订号分配
//! - `repository`: 部署、回滚、删除与周期巡检

pub mod file_store;
pub mod lock;
pub mod package;
pub mod repository;

pub use file_store::{FileStore, StoredPackage, LOCK_FILE_NAME, PACKAGE_EXTENSION};
pub use lock::{LockMode, RepositoryLock};
pub use package::{ModulePackage, PackageBuilder};
pub use repository::{ModuleRepository, ScanReport};
