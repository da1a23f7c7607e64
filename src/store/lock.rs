//! 仓库文件锁
//!
//! 整个仓库目录共用根目录下的一个锁文件，使用操作系统的建议性文件锁：
//!
//! - 写操作（部署、回滚、删除）持有排他锁，带超时重试
//! - 周期巡检持有共享锁，只尝试一次，失败则跳过本轮
//!
//! 锁是建议性的，所有写入方都必须经由 [`FileStore`](super::FileStore)。

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::utils::{CoreError, Result};

/// 锁模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// 共享锁（读）
    Shared,
    /// 排他锁（写）
    Exclusive,
}

/// 已持有的仓库锁，丢弃时释放
#[derive(Debug)]
pub struct RepositoryLock {
    file: File,
    mode: LockMode,
    path: PathBuf,
}

impl RepositoryLock {
    /// 单次尝试获取锁，不重试
    ///
    /// # Errors
    ///
    /// - 锁被其他持有者占用时返回 `LockUnavailable`
    /// - 锁文件无法打开时返回 `Io`
    pub fn try_acquire(path: &Path, mode: LockMode) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // 显式走 fs2 的 trait 方法，避免与 std 的同名方法混淆
        let attempt = match mode {
            LockMode::Shared => fs2::FileExt::try_lock_shared(&file),
            LockMode::Exclusive => fs2::FileExt::try_lock_exclusive(&file),
        };

        match attempt {
            Ok(()) => {
                trace!(path = %path.display(), mode = ?mode, "已获取仓库锁");
                let mut lock = Self {
                    file,
                    mode,
                    path: path.to_path_buf(),
                };
                if mode == LockMode::Exclusive {
                    lock.stamp()?;
                }
                Ok(lock)
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Err(
                CoreError::LockUnavailable(format!("{} ({:?})", path.display(), mode)),
            ),
            Err(e) => Err(CoreError::Io(e)),
        }
    }

    /// 获取排他锁，按轮询间隔重试直到超时
    ///
    /// # Errors
    ///
    /// 超时返回 `LockTimeout`；锁文件 IO 错误立即返回
    pub async fn acquire_exclusive(
        path: &Path,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self> {
        let begin = Instant::now();
        debug!(path = %path.display(), "等待仓库排他锁");

        loop {
            match Self::try_acquire(path, LockMode::Exclusive) {
                Ok(lock) => return Ok(lock),
                Err(CoreError::LockUnavailable(_)) => {}
                Err(e) => return Err(e),
            }

            let waited = begin.elapsed();
            if waited >= timeout {
                warn!(path = %path.display(), waited_ms = waited.as_millis() as u64, "获取仓库排他锁超时");
                return Err(CoreError::LockTimeout {
                    path: path.display().to_string(),
                    waited_ms: waited.as_millis() as u64,
                });
            }

            tokio::time::sleep(poll_interval.min(timeout - waited)).await;
        }
    }

    /// 锁模式
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// 是否为排他锁
    pub fn is_exclusive(&self) -> bool {
        self.mode == LockMode::Exclusive
    }

    /// 锁文件路径
    pub fn path(&self) -> &Path {
        &self.path
    }

    // 首次获得排他锁时写入标记，便于人工识别锁文件
    fn stamp(&mut self) -> Result<()> {
        if self.file.metadata()?.len() == 0 {
            self.file.write_all(b"LOCK")?;
            self.file.sync_all()?;
        }
        Ok(())
    }
}

impl Drop for RepositoryLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "释放仓库锁失败");
        } else {
            trace!(path = %self.path.display(), mode = ?self.mode, "已释放仓库锁");
        }
    }
}
