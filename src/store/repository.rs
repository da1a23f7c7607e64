//! 模块仓库
//!
//! 把 [`FileStore`] 与 [`Registry`] 组合起来：部署类操作先在排他锁下写入模块包，
//! 再加载修订并注册；周期巡检在共享锁下扫描磁盘，发现其他进程的部署与删除。

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::file_store::FileStore;
use super::lock::RepositoryLock;
use crate::module::info::ModuleInfo;
use crate::module::loader::RevisionLoader;
use crate::module::manifest::ManifestParser;
use crate::module::registry::Registry;
use crate::module::revision::ModuleRevision;
use crate::module::scheduler::ReconciliationTarget;
use crate::utils::{CoreError, Result};

/// 一次磁盘巡检的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// 共享锁不可用，本轮跳过
    pub skipped: bool,
    /// 新加载为当前修订的修订（`name#revision`）
    pub loaded: Vec<String>,
    /// 补登记的历史修订
    pub history: Vec<String>,
    /// 磁盘上已不存在、被标记待删除的模块
    pub marked_for_removal: Vec<String>,
    /// 修订序列被其他进程重建、整体重新发现的模块
    pub rediscovered: Vec<String>,
}

impl ScanReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    /// 本轮是否有任何变化
    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
            && self.history.is_empty()
            && self.marked_for_removal.is_empty()
            && self.rediscovered.is_empty()
    }
}

/// 模块仓库
#[derive(Debug)]
pub struct ModuleRepository {
    store: FileStore,
    registry: Arc<Registry>,
    loader: RevisionLoader,
    // 串行化本进程内的部署与巡检
    deploy_lock: Mutex<()>,
}

impl ModuleRepository {
    /// 创建仓库
    pub fn new(store: FileStore, registry: Arc<Registry>, loader: RevisionLoader) -> Self {
        Self {
            store,
            registry,
            loader,
            deploy_lock: Mutex::new(()),
        }
    }

    /// 文件仓库
    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// 注册表
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// 启动时的目录整理
    pub async fn initialize(&self) -> Result<()> {
        self.store.initialize().await?;
        tokio::fs::create_dir_all(self.loader.scratch_dir()).await?;
        Ok(())
    }

    // ========================================================================
    // 部署
    // ========================================================================

    /// 添加新模块
    ///
    /// # Errors
    ///
    /// - 清单名称缺失或非法返回 `InvalidModuleName`
    /// - 同名模块已注册或已存在于磁盘返回 `ModuleAlreadyExists`
    /// - 排他锁超时返回 `LockTimeout`
    pub async fn add_module(&self, bytes: &[u8]) -> Result<ModuleInfo> {
        let manifest = ManifestParser::parse_archive(bytes)?;
        let name = manifest.name;

        let _deploy = self.deploy_lock.lock().await;
        if self.registry.has_module(&name).await {
            return Err(CoreError::ModuleAlreadyExists(name));
        }

        let lock = self.store.lock_exclusive().await?;
        if self.store.module_exists_on_disk(&name).await? {
            return Err(CoreError::ModuleAlreadyExists(name));
        }
        self.deploy_locked(lock, &name, bytes).await
    }

    /// 部署模块的新修订，模块不存在时创建修订 0
    ///
    /// # Errors
    ///
    /// 清单名称与 `name` 不一致时返回 `InvalidModuleName`
    pub async fn update_module(&self, name: &str, bytes: &[u8]) -> Result<ModuleInfo> {
        ManifestParser::validate_module_name(name)?;
        check_package_name(name, bytes)?;

        let _deploy = self.deploy_lock.lock().await;
        let lock = self.store.lock_exclusive().await?;
        self.deploy_locked(lock, name, bytes).await
    }

    /// 以旧修订的内容部署新修订
    ///
    /// 回滚不会改写历史：修订 K 的内容以新的修订号重新部署。
    ///
    /// # Errors
    ///
    /// - 修订 K 的模块包不存在时返回 `RevisionNotFound`
    /// - 修订 K 的清单名称与 `name` 不一致时返回 `InvalidModuleName`
    pub async fn revert_module(&self, name: &str, revision: i64) -> Result<ModuleInfo> {
        ManifestParser::validate_module_name(name)?;

        let _deploy = self.deploy_lock.lock().await;
        let lock = self.store.lock_exclusive().await?;
        let bytes = self.store.read_package(name, revision).await?;
        check_package_name(name, &bytes)?;
        info!(module = %name, from = revision, "回滚模块");
        self.deploy_locked(lock, name, &bytes).await
    }

    /// 删除模块
    ///
    /// 删除磁盘目录并立即 reconcile：模块随即不可见，仍在进行的调用排空后再卸载。
    ///
    /// # Errors
    ///
    /// 模块既未注册也不在磁盘上时返回 `ModuleNotFound`
    pub async fn remove_module(&self, name: &str) -> Result<()> {
        let _deploy = self.deploy_lock.lock().await;
        let lock = self.store.lock_exclusive().await?;

        let on_disk = self.store.module_exists_on_disk(name).await?;
        let registered = self.registry.mark_pending_removal(name).await;
        if !registered && !on_disk {
            return Err(CoreError::ModuleNotFound(name.to_string()));
        }

        self.store.remove_module(&lock, name).await?;
        drop(lock);

        let report = self.registry.reconcile().await;
        info!(module = %name, retiring = report.retiring, "模块已删除");
        Ok(())
    }

    // 持有排他锁写入模块包，释放锁后加载并注册
    async fn deploy_locked(
        &self,
        lock: RepositoryLock,
        name: &str,
        bytes: &[u8],
    ) -> Result<ModuleInfo> {
        let stored = self.store.store_package(&lock, name, bytes).await?;

        // 其他进程部署过而本进程尚未见过的修订
        let registered = self.registry.registered_revisions(name).await;
        let missing: Vec<i64> = self
            .store
            .revisions_on_disk(name)
            .await?
            .into_iter()
            .filter(|r| *r < stored.revision && !registered.contains(r))
            .collect();
        drop(lock);

        let revision = self.load_revision(name, stored.revision, stored.path).await;
        let info = self.install(revision).await;

        // 先注册新修订再补登记历史，当前修订始终是最新的
        for revision in missing {
            let history = self.history_revision(name, revision).await;
            self.registry.register(history).await;
        }
        info!(
            module = %name,
            revision = info.revision,
            state = %info.state,
            "模块已部署"
        );
        Ok(info)
    }

    // 注册已加载的修订；同一修订已被注册时卸载重复加载的副本
    async fn install(&self, revision: Arc<ModuleRevision>) -> ModuleInfo {
        if self.registry.register(Arc::clone(&revision)).await {
            return revision.info();
        }

        debug!(module = %revision.name(), revision = revision.revision(), "修订已注册，丢弃重复加载");
        revision.unload();
        self.registry
            .revision(revision.name(), revision.revision())
            .await
            .map(|r| r.info())
            .unwrap_or_else(|| revision.info())
    }

    // 加载任务本身异常退出时同样得到 Error 修订
    async fn load_revision(&self, name: &str, revision: i64, path: PathBuf) -> Arc<ModuleRevision> {
        let loader = self.loader.clone();
        let owned = name.to_string();
        match tokio::task::spawn_blocking(move || loader.load(&owned, revision, &path)).await {
            Ok(revision) => revision,
            Err(e) => {
                warn!(module = %name, revision, error = %e, "加载任务异常退出");
                ModuleRevision::failed(
                    ModuleInfo::new(name, None, None, revision, Utc::now()),
                    format!("加载任务异常退出: {}", e),
                )
            }
        }
    }

    async fn history_revision(&self, name: &str, revision: i64) -> Arc<ModuleRevision> {
        let loader = self.loader.clone();
        let owned = name.to_string();
        let path = self.store.package_path(name, revision);
        match tokio::task::spawn_blocking(move || loader.history(&owned, revision, &path)).await {
            Ok(revision) => revision,
            Err(e) => {
                warn!(module = %name, revision, error = %e, "读取历史修订任务异常退出");
                ModuleRevision::unloaded(ModuleInfo::new(name, None, None, revision, Utc::now()))
            }
        }
    }

    // ========================================================================
    // 巡检
    // ========================================================================

    /// 扫描磁盘，同步其他进程所做的变更
    ///
    /// 只尝试一次共享锁，锁不可用时跳过本轮。比已注册修订更新的最新修订被加载为当前修订，
    /// 其余未见过的修订补登记为历史；磁盘上已不存在的模块标记为待删除。
    /// 已注册的修订在磁盘上消失时，模块被整体注销后重新发现。
    /// 单个模块同步失败只记录日志，不影响其他模块。
    pub async fn check_for_updates(&self) -> Result<ScanReport> {
        let _deploy = self.deploy_lock.lock().await;
        let lock = match self.store.try_lock_shared() {
            Ok(lock) => lock,
            Err(CoreError::LockUnavailable(_)) => {
                debug!("仓库正被写入，跳过本轮巡检");
                return Ok(ScanReport::skipped());
            }
            Err(e) => return Err(e),
        };

        let mut report = ScanReport::default();
        let mut present = BTreeSet::new();

        for name in self.store.module_names_on_disk().await? {
            // 单个模块失败不影响其余模块，下一轮重试
            match self.sync_module(&name, &mut report).await {
                Ok(true) => {
                    present.insert(name);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(module = %name, error = %e, "同步模块失败，等待下一轮巡检");
                    present.insert(name);
                }
            }
        }

        for name in self.registry.module_names().await {
            if !present.contains(&name) && self.registry.mark_pending_removal(&name).await {
                report.marked_for_removal.push(name);
            }
        }
        drop(lock);

        if !report.is_empty() {
            debug!(
                loaded = report.loaded.len(),
                history = report.history.len(),
                marked = report.marked_for_removal.len(),
                rediscovered = report.rediscovered.len(),
                "仓库巡检完成"
            );
        }
        Ok(report)
    }

    // 同步单个模块，返回磁盘上是否有该模块的修订
    async fn sync_module(&self, name: &str, report: &mut ScanReport) -> Result<bool> {
        let on_disk = self.store.revisions_on_disk(name).await?;
        let Some(&latest) = on_disk.last() else {
            return Ok(false);
        };

        let mut registered = self.registry.registered_revisions(name).await;
        // 已注册的修订从磁盘消失：模块被删除后重新部署，修订号重新开始
        if registered.iter().any(|r| !on_disk.contains(r)) {
            info!(module = %name, "磁盘上的修订序列已重建，重新发现模块");
            self.registry.evict(name).await;
            report.rediscovered.push(name.to_string());
            registered.clear();
        }
        let newest_registered = registered.last().copied();

        if newest_registered.map(|max| latest > max).unwrap_or(true) {
            let path = self.store.package_path(name, latest);
            let revision = self.load_revision(name, latest, path).await;
            let info = self.install(revision).await;
            info!(module = %name, revision = latest, state = %info.state, "发现外部部署的修订");
            report.loaded.push(format!("{}#{}", name, latest));
        }

        for &revision in on_disk
            .iter()
            .filter(|r| **r < latest && !registered.contains(r))
        {
            let history = self.history_revision(name, revision).await;
            if self.registry.register(history).await {
                report.history.push(format!("{}#{}", name, revision));
            }
        }
        Ok(true)
    }

    /// 卸载全部修订后按磁盘内容重新加载
    pub async fn reinitialize(&self) -> Result<ScanReport> {
        warn!("重新初始化模块仓库，全部修订将被卸载");
        self.registry.destroy().await;
        self.check_for_updates().await
    }
}

// 清单名称必须与目标模块一致
fn check_package_name(name: &str, bytes: &[u8]) -> Result<()> {
    let manifest = ManifestParser::parse_archive(bytes)?;
    if manifest.name != name {
        return Err(CoreError::InvalidModuleName(format!(
            "模块包声明的名称 '{}' 与目标模块 '{}' 不一致",
            manifest.name, name
        )));
    }
    Ok(())
}

#[async_trait]
impl ReconciliationTarget for ModuleRepository {
    async fn run_check(&self) -> Result<()> {
        let scan = self.check_for_updates().await;
        self.registry.reconcile().await;
        scan.map(|_| ())
    }
}
