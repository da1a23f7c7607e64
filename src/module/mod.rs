//! 模块管理
//!
//! 包含热替换运行时的核心组件：
//! - 修订信息与生命周期状态机
//! - 修订历史（家族）与注册表
//! - Bean、Bean 上下文与模块加载器
//! - 代理句柄与周期调度器

pub mod bean;
pub mod context;
pub mod family;
pub mod info;
pub mod loader;
pub mod manifest;
pub mod proxy;
pub mod registry;
pub mod revision;
pub mod scheduler;

// 重导出常用类型
pub use bean::{Bean, BeanBuilder, MethodDispatch};
pub use context::{
    BeanContext, BeanContextFactory, BeanFactory, BeanFactoryTable, FactoryInput,
    ManifestBeanContext, ManifestBeanContextFactory,
};
pub use family::ModuleFamily;
pub use info::{ModuleInfo, RevisionState, UNKNOWN_VERSION};
pub use loader::{ArchiveModuleLoader, ExtractedModule, LoadedModule, ModuleLoader, RevisionLoader};
pub use manifest::{BeanDefinition, ManifestParser, ModuleManifest, MANIFEST_FILE_NAME};
pub use proxy::{CapabilitySet, DynamicProxy, ProxyHandle};
pub use registry::{ReconcileReport, Registry};
pub use revision::{ModuleRevision, UsageGuard};
pub use scheduler::{ReconciliationScheduler, ReconciliationTarget};
