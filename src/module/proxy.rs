//! 代理句柄
//!
//! [`ProxyHandle`] 是调用方长期持有的间接引用，绑定 (模块名, Bean 名, 能力)，
//! 每次调用前按需重新解析目标，使热替换对调用方透明：
//!
//! 1. 缓存的修订为空或不再 Active 时，向注册表查询当前修订；
//!    当前修订与缓存不同则整体替换缓存的修订与目标
//! 2. 没有修订时返回 `ModuleNotFound`
//! 3. 有修订但取不到目标时返回 `BeanNotFound`（Bean 存在但未暴露该能力时返回
//!    `CapabilityNotExposed`）
//! 4. 登记调用计数后执行调用，结束时（包括 panic）释放计数
//!
//! 解析过程串行化，同一代理观察到的修订号单调不减。

use parking_lot::RwLock;
use serde_json::Value;
use std::any::type_name;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, trace};

use super::bean::MethodDispatch;
use super::info::RevisionState;
use super::registry::Registry;
use super::revision::{ModuleRevision, UsageGuard};
use crate::utils::{generate_proxy_id, CoreError, Result};

// 解析失败时最多重试一次，覆盖检查与登记之间修订被替换的情况
const DISPATCH_ATTEMPTS: usize = 2;

struct CachedTarget<C: ?Sized> {
    revision: Option<Arc<ModuleRevision>>,
    bean_found: bool,
    target: Option<Arc<C>>,
}

struct ProxyInner<C: ?Sized> {
    id: String,
    module_name: String,
    bean_name: String,
    registry: Arc<Registry>,
    cache: RwLock<CachedTarget<C>>,
    resolve_lock: tokio::sync::Mutex<()>,
}

/// 指向某模块 Bean 的能力 `C` 的代理
///
/// `C` 通常是 trait 对象，如 `ProxyHandle<dyn Greeter>`。克隆代价很低，
/// 克隆出的句柄共享同一份缓存。
pub struct ProxyHandle<C: ?Sized + Send + Sync + 'static> {
    inner: Arc<ProxyInner<C>>,
}

impl<C: ?Sized + Send + Sync + 'static> Clone for ProxyHandle<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: ?Sized + Send + Sync + 'static> ProxyHandle<C> {
    /// 创建代理，不要求模块已经存在
    pub fn new(
        registry: Arc<Registry>,
        module_name: impl Into<String>,
        bean_name: impl Into<String>,
    ) -> Self {
        let proxy = Self {
            inner: Arc::new(ProxyInner {
                id: generate_proxy_id(),
                module_name: module_name.into(),
                bean_name: bean_name.into(),
                registry,
                cache: RwLock::new(CachedTarget {
                    revision: None,
                    bean_found: false,
                    target: None,
                }),
                resolve_lock: tokio::sync::Mutex::new(()),
            }),
        };
        debug!(
            proxy = %proxy.inner.id,
            module = %proxy.inner.module_name,
            bean = %proxy.inner.bean_name,
            capability = type_name::<C>(),
            "创建代理"
        );
        proxy
    }

    /// 代理 ID
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// 模块名称
    pub fn module_name(&self) -> &str {
        &self.inner.module_name
    }

    /// Bean 名称
    pub fn bean_name(&self) -> &str {
        &self.inner.bean_name
    }

    /// 缓存的修订号
    pub fn cached_revision(&self) -> Option<i64> {
        self.inner.cache.read().revision.as_ref().map(|r| r.revision())
    }

    /// 缓存是否需要重新解析
    pub fn needs_revalidation(&self) -> bool {
        self.inner
            .cache
            .read()
            .revision
            .as_ref()
            .map(|r| r.state() != RevisionState::Active)
            .unwrap_or(true)
    }

    /// 强制按注册表的当前修订重新解析
    pub async fn revalidate(&self) {
        self.inner.registry.resolve_proxy(self).await;
    }

    pub(crate) fn resolve_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.inner.resolve_lock
    }

    /// 用注册表给出的当前修订更新缓存，返回缓存是否改变
    ///
    /// 与缓存为同一修订对象时不做任何事。
    pub(crate) fn apply_resolution(&self, current: Option<Arc<ModuleRevision>>) -> bool {
        let mut cache = self.inner.cache.write();
        let unchanged = match (&cache.revision, &current) {
            (Some(cached), Some(current)) => Arc::ptr_eq(cached, current),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return false;
        }

        let bean = current
            .as_ref()
            .and_then(|revision| revision.get_bean(&self.inner.bean_name));
        cache.bean_found = bean.is_some();
        cache.target = bean.and_then(|bean| bean.capability::<C>());

        trace!(
            proxy = %self.inner.id,
            from = ?cache.revision.as_ref().map(|r| r.revision()),
            to = ?current.as_ref().map(|r| r.revision()),
            resolved = cache.target.is_some(),
            "代理目标已切换"
        );
        cache.revision = current;
        true
    }

    async fn dispatch_target(&self) -> Result<(UsageGuard, Arc<C>)> {
        for _ in 0..DISPATCH_ATTEMPTS {
            if self.needs_revalidation() {
                self.revalidate().await;
            }

            let (revision, target, bean_found) = {
                let cache = self.inner.cache.read();
                (cache.revision.clone(), cache.target.clone(), cache.bean_found)
            };

            let revision = revision
                .ok_or_else(|| CoreError::ModuleNotFound(self.inner.module_name.clone()))?;

            let target = match target {
                Some(target) => target,
                None if bean_found => {
                    return Err(CoreError::CapabilityNotExposed {
                        module: self.inner.module_name.clone(),
                        bean: self.inner.bean_name.clone(),
                        capability: type_name::<C>().to_string(),
                    })
                }
                None => {
                    return Err(CoreError::BeanNotFound {
                        module: self.inner.module_name.clone(),
                        bean: self.inner.bean_name.clone(),
                    })
                }
            };

            if let Some(guard) = revision.acquire() {
                return Ok((guard, target));
            }
            trace!(proxy = %self.inner.id, revision = revision.revision(), "缓存修订已失效，重新解析");
        }

        Err(CoreError::ModuleNotFound(self.inner.module_name.clone()))
    }

    /// 同步调用目标
    pub async fn call<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&C) -> R,
    {
        let (_guard, target) = self.dispatch_target().await?;
        Ok(f(&target))
    }

    /// 异步调用目标
    ///
    /// 调用计数持续到返回的 future 完成为止。
    pub async fn call_async<F, Fut, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(Arc<C>) -> Fut,
        Fut: Future<Output = R>,
    {
        let (_guard, target) = self.dispatch_target().await?;
        Ok(f(target).await)
    }
}

impl<C: ?Sized + Send + Sync + 'static> fmt::Debug for ProxyHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("id", &self.inner.id)
            .field("module", &self.inner.module_name)
            .field("bean", &self.inner.bean_name)
            .field("capability", &type_name::<C>())
            .field("cached_revision", &self.cached_revision())
            .finish()
    }
}

/// 动态代理允许调用的方法集合
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilitySet {
    /// 不限制
    All,
    /// 只允许列出的方法
    Methods(BTreeSet<String>),
}

impl CapabilitySet {
    /// 不限制方法
    pub fn all() -> Self {
        CapabilitySet::All
    }

    /// 只允许给定方法
    pub fn methods<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CapabilitySet::Methods(methods.into_iter().map(Into::into).collect())
    }

    /// 是否允许调用方法
    pub fn allows(&self, method: &str) -> bool {
        match self {
            CapabilitySet::All => true,
            CapabilitySet::Methods(methods) => methods.contains(method),
        }
    }
}

/// 按方法名调用的代理
///
/// 目标 Bean 需要登记 [`MethodDispatch`] 实现。
#[derive(Debug, Clone)]
pub struct DynamicProxy {
    handle: ProxyHandle<dyn MethodDispatch>,
    capabilities: CapabilitySet,
}

impl DynamicProxy {
    /// 创建动态代理
    pub fn new(
        registry: Arc<Registry>,
        module_name: impl Into<String>,
        bean_name: impl Into<String>,
        capabilities: CapabilitySet,
    ) -> Self {
        Self {
            handle: ProxyHandle::new(registry, module_name, bean_name),
            capabilities,
        }
    }

    /// 底层代理句柄
    pub fn handle(&self) -> &ProxyHandle<dyn MethodDispatch> {
        &self.handle
    }

    /// 允许的方法集合
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// 调用方法
    ///
    /// # Errors
    ///
    /// - 方法不在能力集合内返回 `MethodNotAllowed`
    /// - 分派失败返回 `ModuleNotFound` / `BeanNotFound` / `CapabilityNotExposed`
    /// - 目标方法自身的错误原样返回
    pub async fn call_method(&self, method: &str, args: Value) -> Result<Value> {
        if !self.capabilities.allows(method) {
            return Err(CoreError::MethodNotAllowed {
                module: self.handle.module_name().to_string(),
                bean: self.handle.bean_name().to_string(),
                method: method.to_string(),
            });
        }

        self.handle
            .call_async(|dispatcher| async move { dispatcher.call(method, args).await })
            .await?
    }
}
