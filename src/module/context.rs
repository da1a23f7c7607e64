//! Bean 上下文
//!
//! Bean 上下文负责在已加载的模块内构建 Bean 图，是可替换的外部协作方。
//! 默认实现 [`ManifestBeanContext`] 按清单中的 Bean 声明，
//! 调用进程内登记的工厂创建 Bean。

use parking_lot::RwLock;
use std::any::TypeId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::bean::Bean;
use super::loader::LoadedModule;
use super::manifest::{BeanDefinition, ModuleManifest};
use crate::utils::{CoreError, Result};

/// Bean 上下文
pub trait BeanContext: Send + Sync {
    /// 初始化（构建全部 Bean）
    fn init(&mut self) -> Result<()>;

    /// 销毁，释放全部 Bean
    fn destroy(&mut self);

    /// 获取 Bean
    fn get_bean(&self, name: &str) -> Option<Bean>;

    /// 全部 Bean 名称
    fn bean_names(&self) -> Vec<String>;

    /// 是否存在 Bean
    fn has_bean(&self, name: &str) -> bool {
        self.get_bean(name).is_some()
    }

    /// Bean 的具体类型
    fn bean_type(&self, name: &str) -> Option<TypeId> {
        self.get_bean(name).map(|bean| bean.type_id())
    }

    /// Bean 的具体类型名
    fn bean_type_name(&self, name: &str) -> Option<String> {
        self.get_bean(name).map(|bean| bean.type_name().to_string())
    }
}

/// Bean 上下文工厂
pub trait BeanContextFactory: Send + Sync {
    /// 为已加载的模块创建（尚未初始化的）上下文
    fn create_context(
        &self,
        manifest: &ModuleManifest,
        unit: &dyn LoadedModule,
    ) -> Result<Box<dyn BeanContext>>;
}

/// 传给 Bean 工厂的参数
#[derive(Debug, Clone, Copy)]
pub struct FactoryInput<'a> {
    /// 模块名称
    pub module: &'a str,
    /// Bean 声明
    pub definition: &'a BeanDefinition,
    /// 模块解压后的位置
    pub location: Option<&'a Path>,
}

/// Bean 工厂函数
pub type BeanFactory = dyn Fn(&FactoryInput<'_>) -> anyhow::Result<Bean> + Send + Sync;

/// 进程内 Bean 工厂表
///
/// 工厂按 ID 登记，清单中的 `factory` 字段引用这些 ID。
/// 工厂可以在运行时启动后继续登记，只影响之后加载的修订。
#[derive(Default)]
pub struct BeanFactoryTable {
    factories: RwLock<HashMap<String, Arc<BeanFactory>>>,
}

impl BeanFactoryTable {
    /// 创建空表
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记工厂，同 ID 的旧工厂被替换
    pub fn register<F>(&self, id: impl Into<String>, factory: F)
    where
        F: Fn(&FactoryInput<'_>) -> anyhow::Result<Bean> + Send + Sync + 'static,
    {
        let id = id.into();
        debug!(factory = %id, "登记 Bean 工厂");
        self.factories.write().insert(id, Arc::new(factory));
    }

    /// 移除工厂
    pub fn unregister(&self, id: &str) -> bool {
        self.factories.write().remove(id).is_some()
    }

    /// 获取工厂
    pub fn get(&self, id: &str) -> Option<Arc<BeanFactory>> {
        self.factories.read().get(id).cloned()
    }

    /// 是否已登记
    pub fn contains(&self, id: &str) -> bool {
        self.factories.read().contains_key(id)
    }

    /// 已登记的工厂 ID（排序）
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for BeanFactoryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeanFactoryTable")
            .field("ids", &self.ids())
            .finish()
    }
}

/// 按清单声明构建 Bean 的上下文
pub struct ManifestBeanContext {
    module: String,
    definitions: Vec<BeanDefinition>,
    location: Option<PathBuf>,
    factories: Arc<BeanFactoryTable>,
    beans: HashMap<String, Bean>,
}

impl ManifestBeanContext {
    /// 创建上下文
    pub fn new(
        manifest: &ModuleManifest,
        location: Option<PathBuf>,
        factories: Arc<BeanFactoryTable>,
    ) -> Self {
        Self {
            module: manifest.name.clone(),
            definitions: manifest.beans.clone(),
            location,
            factories,
            beans: HashMap::new(),
        }
    }
}

impl BeanContext for ManifestBeanContext {
    fn init(&mut self) -> Result<()> {
        let mut beans = HashMap::with_capacity(self.definitions.len());

        for definition in &self.definitions {
            let factory = self.factories.get(&definition.factory).ok_or_else(|| {
                CoreError::InvalidManifest(format!(
                    "Bean '{}' 引用了未登记的工厂 '{}'",
                    definition.name, definition.factory
                ))
            })?;

            let input = FactoryInput {
                module: &self.module,
                definition,
                location: self.location.as_deref(),
            };
            let bean = factory(&input).map_err(|e| {
                CoreError::Other(e.context(format!("创建 Bean '{}' 失败", definition.name)))
            })?;
            beans.insert(definition.name.clone(), bean);
        }

        debug!(module = %self.module, beans = beans.len(), "Bean 上下文已初始化");
        self.beans = beans;
        Ok(())
    }

    fn destroy(&mut self) {
        debug!(module = %self.module, beans = self.beans.len(), "销毁 Bean 上下文");
        self.beans.clear();
    }

    fn get_bean(&self, name: &str) -> Option<Bean> {
        self.beans.get(name).cloned()
    }

    fn bean_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.beans.keys().cloned().collect();
        names.sort();
        names
    }
}

/// 默认的上下文工厂
#[derive(Debug, Clone)]
pub struct ManifestBeanContextFactory {
    factories: Arc<BeanFactoryTable>,
}

impl ManifestBeanContextFactory {
    /// 以工厂表创建
    pub fn new(factories: Arc<BeanFactoryTable>) -> Self {
        Self { factories }
    }

    /// 工厂表
    pub fn factories(&self) -> &Arc<BeanFactoryTable> {
        &self.factories
    }
}

impl BeanContextFactory for ManifestBeanContextFactory {
    fn create_context(
        &self,
        manifest: &ModuleManifest,
        unit: &dyn LoadedModule,
    ) -> Result<Box<dyn BeanContext>> {
        Ok(Box::new(ManifestBeanContext::new(
            manifest,
            unit.location().map(Path::to_path_buf),
            Arc::clone(&self.factories),
        )))
    }
}
