//! 集成测试共用的辅助结构

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chips_hotswap::module::{BeanDefinition, FactoryInput, ModuleManifest};
use chips_hotswap::{
    Bean, BeanFactoryTable, CoreError, HotSwapRuntime, MethodDispatch, PackageBuilder,
    RuntimeConfig,
};
use serde_json::{json, Value};
use tempfile::TempDir;

/// 模块对外暴露的能力
pub trait Greeter: Send + Sync {
    /// 打招呼
    fn greet(&self, who: &str) -> String;
}

/// 按清单属性 `greeting` 打招呼的实现
pub struct TextGreeter {
    pub greeting: String,
}

impl Greeter for TextGreeter {
    fn greet(&self, who: &str) -> String {
        format!("{} {}", self.greeting, who)
    }
}

#[async_trait]
impl MethodDispatch for TextGreeter {
    fn methods(&self) -> Vec<String> {
        vec!["greet".to_string()]
    }

    async fn call(&self, method: &str, args: Value) -> chips_hotswap::Result<Value> {
        match method {
            "greet" => Ok(json!(self.greet(args.as_str().unwrap_or("world")))),
            other => Err(CoreError::Internal(format!("unknown method {}", other))),
        }
    }
}

/// 登记了 `greeter` 工厂的工厂表
pub fn factories() -> Arc<BeanFactoryTable> {
    let table = Arc::new(BeanFactoryTable::new());
    table.register("greeter", |input: &FactoryInput<'_>| {
        let greeting = input
            .definition
            .string_property("greeting")
            .unwrap_or("hello")
            .to_string();
        let instance = Arc::new(TextGreeter { greeting });
        Ok(Bean::builder(input.definition.name.clone(), instance.clone())
            .expose::<dyn Greeter>(instance.clone())
            .dispatch(instance)
            .build())
    });
    table
}

/// 在 `greeter` 之外再登记一个创建 Bean 时 panic 的 `exploding` 工厂
pub fn factories_with_exploding() -> Arc<BeanFactoryTable> {
    let table = factories();
    table.register("exploding", |_: &FactoryInput<'_>| -> anyhow::Result<Bean> {
        panic!("factory exploded")
    });
    table
}

/// 测试配置：关闭周期巡检，缩短锁超时
pub fn config(root: &Path) -> RuntimeConfig {
    RuntimeConfig::builder()
        .root_dir(root)
        .lock_timeout_ms(300)
        .lock_poll_interval_ms(20)
        .without_scheduler()
        .build()
}

/// 已启动的运行时
pub async fn runtime(root: &Path) -> HotSwapRuntime {
    let mut runtime = HotSwapRuntime::builder(config(root))
        .bean_factories(factories())
        .build()
        .unwrap();
    runtime.start().await.unwrap();
    runtime
}

/// 声明一个 `svc` Bean 的模块包
pub fn package(name: &str, greeting: &str) -> Vec<u8> {
    PackageBuilder::new(
        ModuleManifest::new(name)
            .with_version("1.0.0")
            .with_bean(BeanDefinition::new("svc", "greeter").with_property("greeting", json!(greeting))),
    )
    .build()
    .unwrap()
}

/// Bean 引用了未登记工厂的模块包，加载必然失败
pub fn broken_package(name: &str) -> Vec<u8> {
    PackageBuilder::new(
        ModuleManifest::new(name).with_bean(BeanDefinition::new("svc", "no-such-factory")),
    )
    .build()
    .unwrap()
}

/// Bean 工厂会 panic 的模块包
pub fn exploding_package(name: &str) -> Vec<u8> {
    PackageBuilder::new(
        ModuleManifest::new(name).with_bean(BeanDefinition::new("svc", "exploding")),
    )
    .build()
    .unwrap()
}

/// 新建临时仓库目录
pub fn temp_root() -> TempDir {
    TempDir::new().unwrap()
}
