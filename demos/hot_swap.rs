//! 热替换示例
//!
//! 本示例展示了热替换运行时的基本使用方法，包括：
//!
//! - 登记 Bean 工厂并启动运行时
//! - 部署模块并通过代理调用
//! - 部署新修订，同一个代理自动切换
//! - 回滚与删除
//!
//! # 运行示例
//!
//! ```bash
//! cargo run --example hot_swap
//! ```

use std::sync::Arc;

use chips_hotswap::module::{BeanDefinition, FactoryInput, ModuleManifest};
use chips_hotswap::{Bean, BeanFactoryTable, HotSwapRuntime, PackageBuilder, RuntimeConfig};
use serde_json::json;

/// 模块对外暴露的能力
trait Greeter: Send + Sync {
    fn greet(&self, who: &str) -> String;
}

struct TextGreeter {
    greeting: String,
}

impl Greeter for TextGreeter {
    fn greet(&self, who: &str) -> String {
        format!("{}, {}!", self.greeting, who)
    }
}

fn greeter_package(greeting: &str, version: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let manifest = ModuleManifest::new("Greeter")
        .with_version(version)
        .with_bean(BeanDefinition::new("svc", "greeter").with_property("greeting", json!(greeting)));
    Ok(PackageBuilder::new(manifest).build()?)
}

/// 主函数
///
/// 演示热替换运行时的基本用法。
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== 热替换运行时示例 ===\n");

    // -------------------------------------------------------------------------
    // 1. 登记 Bean 工厂并创建运行时
    // -------------------------------------------------------------------------
    println!("1. 创建运行时...");

    let factories = Arc::new(BeanFactoryTable::new());
    factories.register("greeter", |input: &FactoryInput<'_>| {
        let greeting = input.definition.string_property("greeting").unwrap_or("Hello");
        let instance = Arc::new(TextGreeter {
            greeting: greeting.to_string(),
        });
        Ok(Bean::builder(input.definition.name.clone(), instance.clone())
            .expose::<dyn Greeter>(instance)
            .build())
    });

    let root = tempfile::TempDir::new()?;
    let config = RuntimeConfig::builder()
        .root_dir(root.path())
        .without_scheduler()
        .build();
    println!("   仓库目录: {}", root.path().display());

    let mut runtime = HotSwapRuntime::builder(config)
        .bean_factories(factories)
        .build()?;
    runtime.start().await?;
    println!("   ✅ 运行时启动成功\n");

    // -------------------------------------------------------------------------
    // 2. 部署模块并调用
    // -------------------------------------------------------------------------
    println!("2. 部署 Greeter...");
    let info = runtime.add_module(&greeter_package("Hello", "1.0.0")?).await?;
    println!("   {}", info);

    let proxy = runtime.proxy::<dyn Greeter>("Greeter", "svc");
    println!("   调用: {}\n", proxy.call(|g| g.greet("world")).await?);

    // -------------------------------------------------------------------------
    // 3. 部署新修订
    // -------------------------------------------------------------------------
    println!("3. 部署新修订...");
    let info = runtime
        .update_module("Greeter", &greeter_package("Bonjour", "1.1.0")?)
        .await?;
    println!("   {}", info);
    println!("   同一个代理: {}", proxy.call(|g| g.greet("world")).await?);

    let report = runtime.reconcile().await;
    println!("   已卸载的旧修订: {:?}\n", report.unloaded);

    // -------------------------------------------------------------------------
    // 4. 回滚
    // -------------------------------------------------------------------------
    println!("4. 回滚到修订 0...");
    let info = runtime.revert_module("Greeter", 0).await?;
    println!("   {}", info);
    println!("   调用: {}", proxy.call(|g| g.greet("world")).await?);

    println!("   修订历史:");
    for info in runtime.history("Greeter").await? {
        println!("   - #{} {} {}", info.revision, info.version, info.state);
    }
    println!();

    // -------------------------------------------------------------------------
    // 5. 删除模块
    // -------------------------------------------------------------------------
    println!("5. 删除模块...");
    runtime.remove_module("Greeter").await?;
    match proxy.call(|g| g.greet("world")).await {
        Ok(text) => println!("   意外的调用结果: {}", text),
        Err(e) => println!("   调用失败（预期）: {}", e),
    }
    println!();

    // -------------------------------------------------------------------------
    // 6. 关闭运行时
    // -------------------------------------------------------------------------
    println!("6. 关闭运行时...");
    runtime.shutdown().await?;
    println!("   ✅ 运行时关闭成功\n");

    println!("=== 示例结束 ===");
    Ok(())
}
