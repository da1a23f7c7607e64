//! 热替换运行时 SDK
//!
//! [`HotSwapRuntime`] 是对外的统一入口，组合模块仓库、注册表与周期调度器：
//!
//! - 部署：添加、更新、回滚、删除模块
//! - 查询：模块列表、修订信息与历史、Bean 是否存在及其类型
//! - 调用：获取指向模块 Bean 的代理句柄
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
//!         .check_interval_ms(5_000)
//!         .build();
//!
//!     let mut runtime = HotSwapRuntime::new(config).await?;
//!     runtime.start().await?;
//!
//!     for info in runtime.module_infos().await {
//!         println!("{}", info);
//!     }
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use serde::Serialize;
use std::any::TypeId;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::core::config::RuntimeConfig;
use crate::module::context::{BeanContextFactory, BeanFactoryTable, ManifestBeanContextFactory};
use crate::module::info::ModuleInfo;
use crate::module::loader::{ArchiveModuleLoader, ModuleLoader, RevisionLoader};
use crate::module::proxy::{CapabilitySet, DynamicProxy, ProxyHandle};
use crate::module::registry::{ReconcileReport, Registry};
use crate::module::scheduler::ReconciliationScheduler;
use crate::store::file_store::FileStore;
use crate::store::repository::{ModuleRepository, ScanReport};
use crate::utils::{scratch_dir_name, CoreError, Result};

// ============================================================================
// 运行时状态
// ============================================================================

/// 运行时状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RuntimeState {
    /// 已创建，尚未启动
    Initialized,
    /// 正在启动
    Starting,
    /// 运行中
    Running,
    /// 正在关闭
    ShuttingDown,
    /// 已关闭
    Shutdown,
}

impl RuntimeState {
    /// 检查是否可以启动
    pub fn can_start(&self) -> bool {
        matches!(self, RuntimeState::Initialized)
    }

    /// 检查是否可以关闭
    pub fn can_shutdown(&self) -> bool {
        matches!(self, RuntimeState::Running)
    }

    /// 检查是否正在运行
    pub fn is_running(&self) -> bool {
        matches!(self, RuntimeState::Running)
    }
}

// ============================================================================
// HotSwapRuntime 主结构体
// ============================================================================

/// 热替换运行时
///
/// # 生命周期
///
/// 1. `new()` / `builder()` - 创建运行时
/// 2. `start()` - 整理仓库目录，加载磁盘上已有的模块，启动周期巡检
/// 3. `shutdown()` - 停止巡检并卸载全部修订
pub struct HotSwapRuntime {
    /// 运行时配置
    config: RuntimeConfig,

    /// 运行时状态
    state: Arc<RwLock<RuntimeState>>,

    /// 注册表
    registry: Arc<Registry>,

    /// 模块仓库
    repository: Arc<ModuleRepository>,

    /// 默认上下文工厂使用的 Bean 工厂表
    bean_factories: Option<Arc<BeanFactoryTable>>,

    /// 周期调度器
    scheduler: Option<ReconciliationScheduler>,

    /// 启动时间
    started_at: Option<Instant>,
}

impl HotSwapRuntime {
    // ========================================================================
    // 初始化和生命周期
    // ========================================================================

    /// 以默认加载器与默认 Bean 上下文创建运行时
    ///
    /// # Errors
    ///
    /// 配置取值不合法时返回 `InvalidConfigValue`
    pub async fn new(config: RuntimeConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// 创建运行时构建器
    pub fn builder(config: RuntimeConfig) -> HotSwapRuntimeBuilder {
        HotSwapRuntimeBuilder {
            config,
            module_loader: None,
            context_factory: None,
            bean_factories: None,
        }
    }

    /// 启动运行时
    ///
    /// 1. 整理仓库目录（清空临时目录、初始化锁文件）
    /// 2. 立即巡检一次，加载磁盘上已有的模块
    /// 3. 按配置启动周期巡检
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if !state.can_start() {
                return Err(CoreError::InitFailed(format!(
                    "运行时当前状态 {:?} 不允许启动",
                    *state
                )));
            }
            *state = RuntimeState::Starting;
        }

        info!(root = %self.config.repository.root_dir.display(), "启动热替换运行时...");
        if let Err(e) = self.bootstrap().await {
            *self.state.write().await = RuntimeState::Initialized;
            return Err(e);
        }

        if self.config.repository.scheduler_enabled {
            self.scheduler = Some(ReconciliationScheduler::start(
                self.repository.clone(),
                self.config.repository.initial_delay(),
                self.config.repository.check_interval(),
            ));
        } else {
            debug!("周期巡检已禁用");
        }

        *self.state.write().await = RuntimeState::Running;
        self.started_at = Some(Instant::now());

        info!(modules = self.registry.module_names().await.len(), "热替换运行时已启动");
        Ok(())
    }

    async fn bootstrap(&self) -> Result<()> {
        self.repository.initialize().await?;
        let scan = self.repository.check_for_updates().await?;
        self.registry.reconcile().await;
        debug!(loaded = scan.loaded.len(), history = scan.history.len(), "初始巡检完成");
        Ok(())
    }

    /// 关闭运行时
    ///
    /// 停止周期巡检并卸载全部修订。未运行时静默返回。
    pub async fn shutdown(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if !state.can_shutdown() {
                return Ok(());
            }
            *state = RuntimeState::ShuttingDown;
        }
        info!("正在关闭热替换运行时...");

        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop().await;
        }
        self.registry.destroy().await;

        *self.state.write().await = RuntimeState::Shutdown;
        info!("热替换运行时已关闭");
        Ok(())
    }

    async fn ensure_running(&self) -> Result<()> {
        let state = self.state.read().await;
        if state.is_running() {
            Ok(())
        } else {
            Err(CoreError::InvalidState(format!(
                "运行时当前状态 {:?} 不允许部署操作",
                *state
            )))
        }
    }

    // ========================================================================
    // 部署
    // ========================================================================

    /// 添加新模块
    pub async fn add_module(&self, bytes: &[u8]) -> Result<ModuleInfo> {
        self.ensure_running().await?;
        self.repository.add_module(bytes).await
    }

    /// 从文件添加新模块
    pub async fn add_module_file(&self, path: impl AsRef<Path>) -> Result<ModuleInfo> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        self.add_module(&bytes).await
    }

    /// 部署模块的新修订
    pub async fn update_module(&self, name: &str, bytes: &[u8]) -> Result<ModuleInfo> {
        self.ensure_running().await?;
        self.repository.update_module(name, bytes).await
    }

    /// 从文件部署模块的新修订
    pub async fn update_module_file(
        &self,
        name: &str,
        path: impl AsRef<Path>,
    ) -> Result<ModuleInfo> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        self.update_module(name, &bytes).await
    }

    /// 以旧修订的内容部署新修订
    pub async fn revert_module(&self, name: &str, revision: i64) -> Result<ModuleInfo> {
        self.ensure_running().await?;
        self.repository.revert_module(name, revision).await
    }

    /// 删除模块
    pub async fn remove_module(&self, name: &str) -> Result<()> {
        self.ensure_running().await?;
        self.repository.remove_module(name).await
    }

    // ========================================================================
    // 查询
    // ========================================================================

    /// 全部模块名
    pub async fn module_names(&self) -> BTreeSet<String> {
        self.registry.module_names().await
    }

    /// 全部模块当前修订的信息
    pub async fn module_infos(&self) -> Vec<ModuleInfo> {
        self.registry.current_infos().await
    }

    /// 模块当前修订的信息
    pub async fn current_info(&self, name: &str) -> Result<ModuleInfo> {
        self.registry
            .info_for(name)
            .await
            .ok_or_else(|| CoreError::ModuleNotFound(name.to_string()))
    }

    /// 模块的全部修订信息
    pub async fn history(&self, name: &str) -> Result<Vec<ModuleInfo>> {
        self.registry
            .history_for(name)
            .await
            .ok_or_else(|| CoreError::ModuleNotFound(name.to_string()))
    }

    /// 模块是否存在
    pub async fn has_module(&self, name: &str) -> bool {
        self.registry.has_module(name).await
    }

    /// 模块当前修订是否有该 Bean
    pub async fn has_bean(&self, module: &str, bean: &str) -> bool {
        self.registry.has_bean(module, bean).await
    }

    /// Bean 的具体类型
    pub async fn bean_type(&self, module: &str, bean: &str) -> Option<TypeId> {
        self.registry.bean_type(module, bean).await
    }

    /// Bean 的具体类型名
    pub async fn bean_type_name(&self, module: &str, bean: &str) -> Option<String> {
        self.registry.bean_type_name(module, bean).await
    }

    // ========================================================================
    // 代理
    // ========================================================================

    /// 获取指向 Bean 能力 `C` 的代理，模块可以尚未部署
    pub fn proxy<C>(&self, module: &str, bean: &str) -> ProxyHandle<C>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        ProxyHandle::new(self.registry.clone(), module, bean)
    }

    /// 获取按方法名调用的代理
    pub fn dynamic_proxy(
        &self,
        module: &str,
        bean: &str,
        capabilities: CapabilitySet,
    ) -> DynamicProxy {
        DynamicProxy::new(self.registry.clone(), module, bean, capabilities)
    }

    // ========================================================================
    // 维护
    // ========================================================================

    /// 立即执行一轮巡检与 reconcile
    pub async fn check_repository(&self) -> Result<(ScanReport, ReconcileReport)> {
        let scan = self.repository.check_for_updates().await?;
        let reconcile = self.registry.reconcile().await;
        Ok((scan, reconcile))
    }

    /// 立即淘汰过时修订
    pub async fn reconcile(&self) -> ReconcileReport {
        self.registry.reconcile().await
    }

    /// 卸载全部修订后按磁盘内容重新加载
    pub async fn reinitialize(&self) -> Result<ScanReport> {
        self.ensure_running().await?;
        self.repository.reinitialize().await
    }

    // ========================================================================
    // 访问器
    // ========================================================================

    /// 获取运行时状态
    pub async fn state(&self) -> RuntimeState {
        *self.state.read().await
    }

    /// 检查运行时是否正在运行
    pub async fn is_running(&self) -> bool {
        self.state.read().await.is_running()
    }

    /// 获取配置
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// 获取注册表
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// 获取模块仓库
    pub fn repository(&self) -> &Arc<ModuleRepository> {
        &self.repository
    }

    /// 默认上下文工厂使用的 Bean 工厂表（使用自定义上下文工厂时为 `None`）
    pub fn bean_factories(&self) -> Option<&Arc<BeanFactoryTable>> {
        self.bean_factories.as_ref()
    }

    /// 获取运行时间
    pub fn uptime(&self) -> Option<std::time::Duration> {
        self.started_at.map(|t| t.elapsed())
    }

    /// 获取健康状态
    pub async fn health(&self) -> RuntimeHealth {
        RuntimeHealth {
            state: self.state().await,
            uptime_secs: self.uptime().map(|d| d.as_secs()),
            modules: self.registry.module_names().await.len(),
            retiring: self.registry.retiring_count().await,
            scheduler_ticks: self.scheduler.as_ref().map(|s| s.tick_count()),
        }
    }
}

impl Drop for HotSwapRuntime {
    fn drop(&mut self) {
        if self.scheduler.is_some() {
            warn!("运行时未关闭即被释放，周期巡检随之停止");
        }
        info!("热替换运行时实例被释放");
    }
}

impl std::fmt::Debug for HotSwapRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotSwapRuntime")
            .field("root", &self.config.repository.root_dir)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// 构建器
// ============================================================================

/// 运行时构建器
///
/// 未指定的协作方使用默认实现：[`ArchiveModuleLoader`] 与基于清单的 Bean 上下文。
pub struct HotSwapRuntimeBuilder {
    config: RuntimeConfig,
    module_loader: Option<Arc<dyn ModuleLoader>>,
    context_factory: Option<Arc<dyn BeanContextFactory>>,
    bean_factories: Option<Arc<BeanFactoryTable>>,
}

impl HotSwapRuntimeBuilder {
    /// 指定模块加载器
    pub fn module_loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.module_loader = Some(loader);
        self
    }

    /// 指定 Bean 上下文工厂
    pub fn context_factory(mut self, factory: Arc<dyn BeanContextFactory>) -> Self {
        self.context_factory = Some(factory);
        self
    }

    /// 指定默认上下文工厂使用的 Bean 工厂表
    pub fn bean_factories(mut self, factories: Arc<BeanFactoryTable>) -> Self {
        self.bean_factories = Some(factories);
        self
    }

    /// 构建运行时
    pub fn build(self) -> Result<HotSwapRuntime> {
        self.config.validate()?;

        let (context_factory, bean_factories) = match self.context_factory {
            Some(factory) => (factory, None),
            None => {
                let table = self
                    .bean_factories
                    .unwrap_or_else(|| Arc::new(BeanFactoryTable::new()));
                let factory: Arc<dyn BeanContextFactory> =
                    Arc::new(ManifestBeanContextFactory::new(table.clone()));
                (factory, Some(table))
            }
        };
        let module_loader = self
            .module_loader
            .unwrap_or_else(|| Arc::new(ArchiveModuleLoader::new()));

        let store = FileStore::new(&self.config.repository);
        let scratch = store.temp_dir().join(scratch_dir_name());
        let loader = RevisionLoader::new(module_loader, context_factory, scratch);
        let registry = Arc::new(Registry::new());
        let repository = Arc::new(ModuleRepository::new(store, registry.clone(), loader));

        info!("初始化热替换运行时 v{}", crate::VERSION);
        Ok(HotSwapRuntime {
            config: self.config,
            state: Arc::new(RwLock::new(RuntimeState::Initialized)),
            registry,
            repository,
            bean_factories,
            scheduler: None,
            started_at: None,
        })
    }
}

// ============================================================================
// 健康信息
// ============================================================================

/// 健康状态信息
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeHealth {
    /// 运行时状态
    pub state: RuntimeState,
    /// 运行时间（秒）
    pub uptime_secs: Option<u64>,
    /// 已注册模块数
    pub modules: usize,
    /// 等待排空的已注销修订数
    pub retiring: usize,
    /// 周期巡检已执行的轮数
    pub scheduler_ticks: Option<u64>,
}

// ============================================================================
// 单元测试
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> RuntimeConfig {
        RuntimeConfig::builder()
            .root_dir(dir.path())
            .without_scheduler()
            .build()
    }

    #[tokio::test]
    async fn test_runtime_creation() {
        let dir = TempDir::new().unwrap();
        let runtime = HotSwapRuntime::new(config(&dir)).await.unwrap();
        assert_eq!(runtime.state().await, RuntimeState::Initialized);
        assert!(runtime.bean_factories().is_some());
        assert!(runtime.uptime().is_none());
    }

    #[tokio::test]
    async fn test_runtime_start_shutdown() {
        let dir = TempDir::new().unwrap();
        let mut runtime = HotSwapRuntime::new(config(&dir)).await.unwrap();

        runtime.start().await.unwrap();
        assert!(runtime.is_running().await);
        assert!(dir.path().join("moduleRepository.lck").exists());
        assert!(dir.path().join("temp").is_dir());

        // 重复启动失败
        assert!(matches!(
            runtime.start().await,
            Err(CoreError::InitFailed(_))
        ));

        runtime.shutdown().await.unwrap();
        assert_eq!(runtime.state().await, RuntimeState::Shutdown);

        // 重复关闭静默返回
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_deploy_requires_running() {
        let dir = TempDir::new().unwrap();
        let runtime = HotSwapRuntime::new(config(&dir)).await.unwrap();

        let err = runtime.remove_module("Greeter").await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.repository.lock_poll_interval_ms = 1_000;
        assert!(matches!(
            HotSwapRuntime::new(config).await,
            Err(CoreError::InvalidConfigValue { .. })
        ));
    }

    #[tokio::test]
    async fn test_queries_on_empty_runtime() {
        let dir = TempDir::new().unwrap();
        let mut runtime = HotSwapRuntime::new(config(&dir)).await.unwrap();
        runtime.start().await.unwrap();

        assert!(runtime.module_names().await.is_empty());
        assert!(!runtime.has_module("Greeter").await);
        assert!(matches!(
            runtime.current_info("Greeter").await,
            Err(CoreError::ModuleNotFound(_))
        ));
        assert!(matches!(
            runtime.history("Greeter").await,
            Err(CoreError::ModuleNotFound(_))
        ));

        let health = runtime.health().await;
        assert_eq!(health.state, RuntimeState::Running);
        assert_eq!(health.modules, 0);
        assert!(health.scheduler_ticks.is_none());

        runtime.shutdown().await.unwrap();
    }
}
