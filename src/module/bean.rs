//! Bean：模块修订对外暴露的具名对象
//!
//! 一个 [`Bean`] 记录自身的具体类型，并登记若干"能力"（capability）。
//! 能力可以是具体类型，也可以是 trait 对象（如 `Arc<dyn Greeter>`），
//! 代理按能力类型取出目标，调用方只依赖能力接口而不依赖模块内部类型。
//!
//! 需要按方法名动态调用时，Bean 额外登记一个 [`MethodDispatch`] 实现。

use async_trait::async_trait;
use serde_json::Value;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::utils::Result;

/// 按方法名分派调用的通用接口
#[async_trait]
pub trait MethodDispatch: Send + Sync {
    /// 支持的方法名
    fn methods(&self) -> Vec<String>;

    /// 调用指定方法
    async fn call(&self, method: &str, args: Value) -> Result<Value>;
}

struct CapabilityEntry {
    type_name: &'static str,
    // 实际存放的是 Arc<C>
    handle: Box<dyn Any + Send + Sync>,
}

struct BeanInner {
    name: String,
    type_name: &'static str,
    type_id: TypeId,
    capabilities: HashMap<TypeId, CapabilityEntry>,
}

/// 模块内的具名对象
#[derive(Clone)]
pub struct Bean {
    inner: Arc<BeanInner>,
}

impl Bean {
    /// 以具体实例创建 Bean 构建器
    ///
    /// 实例本身的类型 `T` 会自动登记为一种能力。
    pub fn builder<T>(name: impl Into<String>, instance: Arc<T>) -> BeanBuilder
    where
        T: Any + Send + Sync,
    {
        BeanBuilder {
            name: name.into(),
            type_name: type_name::<T>(),
            type_id: TypeId::of::<T>(),
            capabilities: HashMap::new(),
        }
        .expose::<T>(instance)
    }

    /// Bean 名称
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 具体类型名
    pub fn type_name(&self) -> &'static str {
        self.inner.type_name
    }

    /// 具体类型 ID
    pub fn type_id(&self) -> TypeId {
        self.inner.type_id
    }

    /// 取出能力 `C`
    pub fn capability<C>(&self) -> Option<Arc<C>>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.inner
            .capabilities
            .get(&TypeId::of::<C>())
            .and_then(|entry| entry.handle.downcast_ref::<Arc<C>>())
            .cloned()
    }

    /// 是否暴露能力 `C`
    pub fn exposes<C>(&self) -> bool
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.inner.capabilities.contains_key(&TypeId::of::<C>())
    }

    /// 已登记能力的类型名
    pub fn capability_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self
            .inner
            .capabilities
            .values()
            .map(|entry| entry.type_name)
            .collect();
        names.sort_unstable();
        names
    }

    /// 动态分派实现
    pub fn dispatcher(&self) -> Option<Arc<dyn MethodDispatch>> {
        self.capability::<dyn MethodDispatch>()
    }
}

impl fmt::Debug for Bean {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bean")
            .field("name", &self.inner.name)
            .field("type_name", &self.inner.type_name)
            .field("capabilities", &self.capability_names())
            .finish()
    }
}

/// Bean 构建器
pub struct BeanBuilder {
    name: String,
    type_name: &'static str,
    type_id: TypeId,
    capabilities: HashMap<TypeId, CapabilityEntry>,
}

impl BeanBuilder {
    /// 登记能力 `C`
    ///
    /// ```rust
    /// use chips_hotswap::module::bean::Bean;
    /// use std::sync::Arc;
    ///
    /// trait Greeter: Send + Sync {
    ///     fn greet(&self) -> String;
    /// }
    ///
    /// struct English;
    /// impl Greeter for English {
    ///     fn greet(&self) -> String {
    ///         "hello".to_string()
    ///     }
    /// }
    ///
    /// let instance = Arc::new(English);
    /// let bean = Bean::builder("svc", instance.clone())
    ///     .expose::<dyn Greeter>(instance)
    ///     .build();
    ///
    /// assert_eq!(bean.capability::<dyn Greeter>().unwrap().greet(), "hello");
    /// ```
    pub fn expose<C>(mut self, capability: Arc<C>) -> Self
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.capabilities.insert(
            TypeId::of::<C>(),
            CapabilityEntry {
                type_name: type_name::<C>(),
                handle: Box::new(capability),
            },
        );
        self
    }

    /// 登记动态分派实现
    pub fn dispatch(self, dispatcher: Arc<dyn MethodDispatch>) -> Self {
        self.expose::<dyn MethodDispatch>(dispatcher)
    }

    /// 构建 Bean
    pub fn build(self) -> Bean {
        Bean {
            inner: Arc::new(BeanInner {
                name: self.name,
                type_name: self.type_name,
                type_id: self.type_id,
                capabilities: self.capabilities,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::CoreError;
    use serde_json::json;

    trait Greeter: Send + Sync {
        fn greet(&self, who: &str) -> String;
    }

    trait Counter: Send + Sync {
        fn count(&self) -> usize;
    }

    struct English;

    impl Greeter for English {
        fn greet(&self, who: &str) -> String {
            format!("hello {}", who)
        }
    }

    #[async_trait]
    impl MethodDispatch for English {
        fn methods(&self) -> Vec<String> {
            vec!["greet".to_string()]
        }

        async fn call(&self, method: &str, args: Value) -> Result<Value> {
            match method {
                "greet" => Ok(json!(self.greet(args.as_str().unwrap_or("world")))),
                other => Err(CoreError::Internal(format!("unknown method {}", other))),
            }
        }
    }

    fn english_bean() -> Bean {
        let instance = Arc::new(English);
        Bean::builder("svc", instance.clone())
            .expose::<dyn Greeter>(instance.clone())
            .dispatch(instance)
            .build()
    }

    #[test]
    fn test_bean_metadata() {
        let bean = english_bean();
        assert_eq!(bean.name(), "svc");
        assert!(bean.type_name().ends_with("English"));
        assert_eq!(bean.type_id(), TypeId::of::<English>());
    }

    #[test]
    fn test_capability_lookup() {
        let bean = english_bean();
        let greeter = bean.capability::<dyn Greeter>().unwrap();
        assert_eq!(greeter.greet("bob"), "hello bob");

        assert!(bean.exposes::<English>());
        assert!(bean.capability::<English>().is_some());
        assert!(!bean.exposes::<dyn Counter>());
        assert!(bean.capability::<dyn Counter>().is_none());
    }

    #[test]
    fn test_capability_names_sorted() {
        let bean = english_bean();
        let names = bean.capability_names();
        assert_eq!(names.len(), 3);
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
    }

    #[tokio::test]
    async fn test_dispatcher() {
        let bean = english_bean();
        let dispatcher = bean.dispatcher().unwrap();
        assert_eq!(dispatcher.methods(), vec!["greet"]);
        let result = dispatcher.call("greet", json!("alice")).await.unwrap();
        assert_eq!(result, json!("hello alice"));
    }

    #[test]
    fn test_clone_shares_instance() {
        let bean = english_bean();
        let copy = bean.clone();
        let a = bean.capability::<English>().unwrap();
        let b = copy.capability::<English>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
