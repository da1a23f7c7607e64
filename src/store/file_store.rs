//! 文件系统模块仓库
//!
//! 磁盘布局：
//!
//! ```text
//! <root>/moduleRepository.lck     仓库锁文件
//! <root>/<module>/<revision>.pkg  模块包
//! <root>/temp/                    临时目录，启动时清空
//! ```
//!
//! 修订号不使用内存计数器分配：另一个进程可能刚写入了新修订，
//! 因此总是扫描目录取最大值，并在创建文件冲突时向上探测。

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::lock::{LockMode, RepositoryLock};
use crate::core::config::RepositoryConfig;
use crate::module::manifest::ManifestParser;
use crate::utils::{staging_file_name, CoreError, Result};

/// 锁文件名
pub const LOCK_FILE_NAME: &str = "moduleRepository.lck";

/// 模块包扩展名
pub const PACKAGE_EXTENSION: &str = "pkg";

/// 新写入的模块包
#[derive(Debug, Clone)]
pub struct StoredPackage {
    /// 分配到的修订号
    pub revision: i64,
    /// 包文件路径
    pub path: PathBuf,
}

/// 文件系统模块仓库
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    temp_dir: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    lock_poll_interval: Duration,
}

impl FileStore {
    /// 按仓库配置创建
    pub fn new(config: &RepositoryConfig) -> Self {
        Self {
            root: config.root_dir.clone(),
            temp_dir: config.effective_temp_dir(),
            lock_path: config.root_dir.join(LOCK_FILE_NAME),
            lock_timeout: config.lock_timeout(),
            lock_poll_interval: config.lock_poll_interval(),
        }
    }

    /// 仓库根目录
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 临时目录
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// 锁文件路径
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// 模块目录
    pub fn module_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// 模块包路径
    pub fn package_path(&self, name: &str, revision: i64) -> PathBuf {
        self.module_dir(name)
            .join(format!("{}.{}", revision, PACKAGE_EXTENSION))
    }

    /// 启动时的目录整理
    ///
    /// 1. 创建根目录，清空并重建临时目录
    /// 2. 单次尝试排他锁以初始化锁文件，失败只记录日志
    pub async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;

        match tokio::fs::remove_dir_all(&self.temp_dir).await {
            Ok(()) => debug!(temp_dir = %self.temp_dir.display(), "已清空临时目录"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(temp_dir = %self.temp_dir.display(), error = %e, "清空临时目录失败"),
        }
        tokio::fs::create_dir_all(&self.temp_dir).await?;

        match RepositoryLock::try_acquire(&self.lock_path, LockMode::Exclusive) {
            Ok(lock) => drop(lock),
            Err(e) => warn!(lock = %self.lock_path.display(), error = %e, "启动时获取仓库锁失败"),
        }

        info!(
            root = %self.root.display(),
            temp_dir = %self.temp_dir.display(),
            "模块仓库已初始化"
        );
        Ok(())
    }

    /// 获取排他锁（带超时重试）
    pub async fn lock_exclusive(&self) -> Result<RepositoryLock> {
        RepositoryLock::acquire_exclusive(&self.lock_path, self.lock_timeout, self.lock_poll_interval)
            .await
    }

    /// 单次尝试获取共享锁
    pub fn try_lock_shared(&self) -> Result<RepositoryLock> {
        RepositoryLock::try_acquire(&self.lock_path, LockMode::Shared)
    }

    /// 磁盘上的模块名称（排序）
    ///
    /// 跳过临时目录、锁文件以及名称不合法的目录。
    pub async fn module_names_on_disk(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_dir() || path == self.temp_dir {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if ManifestParser::is_valid_module_name(name) {
                names.push(name.to_string());
            } else {
                debug!(dir = %path.display(), "忽略非模块目录");
            }
        }

        names.sort();
        Ok(names)
    }

    /// 模块在磁盘上的全部修订号（升序）
    pub async fn revisions_on_disk(&self, name: &str) -> Result<Vec<i64>> {
        let mut revisions = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.module_dir(name)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(revisions),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if let Some(revision) = parse_revision(&entry.path()) {
                revisions.push(revision);
            }
        }

        revisions.sort_unstable();
        Ok(revisions)
    }

    /// 模块在磁盘上的最大修订号
    pub async fn last_revision_on_disk(&self, name: &str) -> Result<Option<i64>> {
        Ok(self.revisions_on_disk(name).await?.last().copied())
    }

    /// 模块在磁盘上是否存在至少一个修订
    pub async fn module_exists_on_disk(&self, name: &str) -> Result<bool> {
        Ok(self.last_revision_on_disk(name).await?.is_some())
    }

    /// 写入新修订的模块包
    ///
    /// 调用方必须持有排他锁。修订号取磁盘上的最大值加一（首个修订为 0），
    /// 通过独占创建占位文件认领修订号，冲突时向上探测；内容先写入临时目录，
    /// 再整体替换占位文件。
    pub async fn store_package(
        &self,
        lock: &RepositoryLock,
        name: &str,
        bytes: &[u8],
    ) -> Result<StoredPackage> {
        if !lock.is_exclusive() {
            return Err(CoreError::Internal("写入模块包需要持有排他锁".to_string()));
        }

        tokio::fs::create_dir_all(self.module_dir(name)).await?;
        let mut revision = self
            .last_revision_on_disk(name)
            .await?
            .map(|last| last + 1)
            .unwrap_or(0);

        let path = loop {
            let candidate = self.package_path(name, revision);
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
                .await
            {
                Ok(_) => break candidate,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => revision += 1,
                Err(e) => return Err(e.into()),
            }
        };

        if let Err(e) = self.write_package_content(&path, bytes).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }

        info!(module = %name, revision, path = %path.display(), "模块包已写入");
        Ok(StoredPackage { revision, path })
    }

    async fn write_package_content(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let staged = self.temp_dir.join(staging_file_name());

        let mut file = tokio::fs::File::create(&staged).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&staged, path).await {
            // 临时目录与仓库不在同一文件系统时退回为复制
            debug!(error = %e, "重命名失败，改为复制模块包");
            tokio::fs::copy(&staged, path).await?;
            let _ = tokio::fs::remove_file(&staged).await;
        }
        Ok(())
    }

    /// 读取某个修订的模块包内容
    ///
    /// # Errors
    ///
    /// 包文件不存在时返回 `RevisionNotFound`
    pub async fn read_package(&self, name: &str, revision: i64) -> Result<Vec<u8>> {
        let path = self.package_path(name, revision);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(CoreError::RevisionNotFound {
                module: name.to_string(),
                revision,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// 删除模块目录及其全部修订（调用方必须持有排他锁）
    pub async fn remove_module(&self, lock: &RepositoryLock, name: &str) -> Result<()> {
        if !lock.is_exclusive() {
            return Err(CoreError::Internal("删除模块需要持有排他锁".to_string()));
        }

        match tokio::fs::remove_dir_all(self.module_dir(name)).await {
            Ok(()) => {
                info!(module = %name, "模块目录已删除");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 从 `<revision>.pkg` 文件名解析修订号
fn parse_revision(path: &Path) -> Option<i64> {
    if path.extension()?.to_str()? != PACKAGE_EXTENSION {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .parse::<i64>()
        .ok()
        .filter(|revision| *revision >= 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> FileStore {
        let config = RepositoryConfig {
            root_dir: dir.path().to_path_buf(),
            lock_timeout_ms: 500,
            lock_poll_interval_ms: 20,
            ..Default::default()
        };
        FileStore::new(&config)
    }

    #[test]
    fn test_parse_revision() {
        assert_eq!(parse_revision(Path::new("/r/m/0.pkg")), Some(0));
        assert_eq!(parse_revision(Path::new("/r/m/42.pkg")), Some(42));
        assert_eq!(parse_revision(Path::new("/r/m/-1.pkg")), None);
        assert_eq!(parse_revision(Path::new("/r/m/abc.pkg")), None);
        assert_eq!(parse_revision(Path::new("/r/m/3.jar")), None);
        assert_eq!(parse_revision(Path::new("/r/m/3")), None);
    }

    #[test]
    fn test_layout() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert_eq!(store.lock_path(), dir.path().join("moduleRepository.lck"));
        assert_eq!(store.temp_dir(), dir.path().join("temp"));
        assert_eq!(
            store.package_path("Greeter", 3),
            dir.path().join("Greeter").join("3.pkg")
        );
    }

    #[tokio::test]
    async fn test_initialize_clears_temp_dir() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        tokio::fs::create_dir_all(store.temp_dir().join("Greeter.0"))
            .await
            .unwrap();
        tokio::fs::write(store.temp_dir().join("stale.pkg"), b"x")
            .await
            .unwrap();

        store.initialize().await.unwrap();

        assert!(store.temp_dir().exists());
        assert!(std::fs::read_dir(store.temp_dir()).unwrap().next().is_none());
        assert!(store.lock_path().exists());
    }

    #[tokio::test]
    async fn test_initialize_tolerates_held_lock() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let _held = RepositoryLock::try_acquire(store.lock_path(), LockMode::Shared).unwrap();

        assert!(store.initialize().await.is_ok());
    }

    #[tokio::test]
    async fn test_revisions_start_at_zero_and_increase() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.initialize().await.unwrap();

        let lock = store.lock_exclusive().await.unwrap();
        let first = store.store_package(&lock, "Greeter", b"rev0").await.unwrap();
        let second = store.store_package(&lock, "Greeter", b"rev1").await.unwrap();
        drop(lock);

        assert_eq!(first.revision, 0);
        assert_eq!(second.revision, 1);
        assert_eq!(store.revisions_on_disk("Greeter").await.unwrap(), vec![0, 1]);
        assert_eq!(store.read_package("Greeter", 1).await.unwrap(), b"rev1");
    }

    #[tokio::test]
    async fn test_revision_allocation_follows_disk() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.initialize().await.unwrap();

        // 另一个进程写入的修订
        tokio::fs::create_dir_all(store.module_dir("Greeter")).await.unwrap();
        tokio::fs::write(store.package_path("Greeter", 7), b"peer").await.unwrap();

        let lock = store.lock_exclusive().await.unwrap();
        let stored = store.store_package(&lock, "Greeter", b"mine").await.unwrap();
        assert_eq!(stored.revision, 8);
    }

    #[tokio::test]
    async fn test_store_requires_exclusive_lock() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.initialize().await.unwrap();

        let shared = store.try_lock_shared().unwrap();
        let result = store.store_package(&shared, "Greeter", b"x").await;
        assert!(matches!(result, Err(CoreError::Internal(_))));
    }

    #[tokio::test]
    async fn test_read_missing_revision() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.initialize().await.unwrap();

        let result = store.read_package("Greeter", 5).await;
        assert!(matches!(
            result,
            Err(CoreError::RevisionNotFound { revision: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_module_names_skip_temp_and_invalid() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.initialize().await.unwrap();

        tokio::fs::create_dir_all(store.module_dir("Beta")).await.unwrap();
        tokio::fs::create_dir_all(store.module_dir("Alpha")).await.unwrap();
        tokio::fs::create_dir_all(dir.path().join(".hidden")).await.unwrap();

        let names = store.module_names_on_disk().await.unwrap();
        assert_eq!(names, vec!["Alpha".to_string(), "Beta".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_module() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.initialize().await.unwrap();

        let lock = store.lock_exclusive().await.unwrap();
        store.store_package(&lock, "Greeter", b"rev0").await.unwrap();
        store.remove_module(&lock, "Greeter").await.unwrap();
        // 重复删除不报错
        store.remove_module(&lock, "Greeter").await.unwrap();
        drop(lock);

        assert!(!store.module_exists_on_disk("Greeter").await.unwrap());
    }
}
