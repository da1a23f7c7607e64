//! # 修订生命周期集成测试
//!
//! 用计数的加载器与 Bean 上下文替换默认实现，验证：
//! - 每个已加载修订的上下文销毁与加载单元卸载恰好各一次
//! - 仍有进行中调用的修订不会被卸载
//! - 加载器或上下文失败时修订进入 Error 状态，且资源被清理
//! - 上下文销毁时 panic 不影响加载单元卸载
//! - Bean 工厂 panic 时修订进入 Error 状态，其他进程照常启动与巡检

mod common;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chips_hotswap::module::ModuleManifest;
use chips_hotswap::store::ModulePackage;
use chips_hotswap::{
    Bean, BeanContext, BeanContextFactory, CoreError, HotSwapRuntime, LoadedModule, ModuleLoader,
    PackageBuilder, RevisionState,
};
use common::{
    config, exploding_package, factories_with_exploding, package as greeter_package, temp_root,
    Greeter, TextGreeter,
};
use tokio::sync::oneshot;

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// 测试辅助结构
// ============================================================================

#[derive(Default)]
struct Counters {
    loads: AtomicUsize,
    teardowns: AtomicUsize,
    inits: AtomicUsize,
    destroys: AtomicUsize,
}

impl Counters {
    fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// 不解压、只计数的加载器；描述为 `fail-load` 的模块加载失败
struct CountingLoader {
    counters: Arc<Counters>,
}

struct CountingUnit {
    counters: Arc<Counters>,
}

impl LoadedModule for CountingUnit {
    fn location(&self) -> Option<&Path> {
        None
    }

    fn teardown(&mut self) -> chips_hotswap::Result<()> {
        self.counters.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl ModuleLoader for CountingLoader {
    fn load(
        &self,
        package: &ModulePackage,
        _scratch_dir: &Path,
    ) -> chips_hotswap::Result<Box<dyn LoadedModule>> {
        if package.manifest.description.as_deref() == Some("fail-load") {
            return Err(CoreError::InvalidPackage("loader refused".to_string()));
        }
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingUnit {
            counters: self.counters.clone(),
        }))
    }
}

/// 以清单描述作为问候语的上下文；描述为 `fail-init` 时初始化失败，
/// 为 `panic-destroy` 时销毁时 panic
struct CountingContext {
    greeting: String,
    counters: Arc<Counters>,
    beans: HashMap<String, Bean>,
}

impl BeanContext for CountingContext {
    fn init(&mut self) -> chips_hotswap::Result<()> {
        self.counters.inits.fetch_add(1, Ordering::SeqCst);
        if self.greeting == "fail-init" {
            return Err(CoreError::Internal("init refused".to_string()));
        }
        let instance = Arc::new(TextGreeter {
            greeting: self.greeting.clone(),
        });
        let bean = Bean::builder("svc", instance.clone())
            .expose::<dyn Greeter>(instance)
            .build();
        self.beans.insert("svc".to_string(), bean);
        Ok(())
    }

    fn destroy(&mut self) {
        self.counters.destroys.fetch_add(1, Ordering::SeqCst);
        self.beans.clear();
        if self.greeting == "panic-destroy" {
            panic!("destroy exploded");
        }
    }

    fn get_bean(&self, name: &str) -> Option<Bean> {
        self.beans.get(name).cloned()
    }

    fn bean_names(&self) -> Vec<String> {
        self.beans.keys().cloned().collect()
    }
}

struct CountingContextFactory {
    counters: Arc<Counters>,
}

impl BeanContextFactory for CountingContextFactory {
    fn create_context(
        &self,
        manifest: &ModuleManifest,
        _unit: &dyn LoadedModule,
    ) -> chips_hotswap::Result<Box<dyn BeanContext>> {
        Ok(Box::new(CountingContext {
            greeting: manifest.description.clone().unwrap_or_default(),
            counters: self.counters.clone(),
            beans: HashMap::new(),
        }))
    }
}

async fn counting_runtime(root: &Path) -> (HotSwapRuntime, Arc<Counters>) {
    let counters = Arc::new(Counters::default());
    let mut runtime = HotSwapRuntime::builder(config(root))
        .module_loader(Arc::new(CountingLoader {
            counters: counters.clone(),
        }))
        .context_factory(Arc::new(CountingContextFactory {
            counters: counters.clone(),
        }))
        .build()
        .unwrap();
    runtime.start().await.unwrap();
    (runtime, counters)
}

fn package(name: &str, description: &str) -> Vec<u8> {
    PackageBuilder::new(ModuleManifest::new(name).with_description(description))
        .build()
        .unwrap()
}

async fn wait_until(counter: &AtomicUsize, expected: usize) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if counter.load(Ordering::SeqCst) == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ============================================================================
// 测试
// ============================================================================

#[tokio::test]
async fn test_each_revision_is_torn_down_exactly_once() {
    let root = temp_root();
    let (mut rt, counters) = counting_runtime(root.path()).await;
    assert!(rt.bean_factories().is_none());

    rt.add_module(&package("Greeter", "r0")).await.unwrap();
    rt.update_module("Greeter", &package("Greeter", "r1"))
        .await
        .unwrap();
    rt.update_module("Greeter", &package("Greeter", "r2"))
        .await
        .unwrap();
    assert_eq!(Counters::get(&counters.loads), 3);

    // 多次 reconcile 不会重复卸载
    for _ in 0..3 {
        rt.reconcile().await;
    }
    assert!(wait_until(&counters.teardowns, 2).await);
    assert_eq!(Counters::get(&counters.destroys), 2);

    let proxy = rt.proxy::<dyn Greeter>("Greeter", "svc");
    assert_eq!(proxy.call(|g| g.greet("x")).await.unwrap(), "r2 x");

    rt.shutdown().await.unwrap();
    assert!(wait_until(&counters.teardowns, 3).await);
    assert_eq!(Counters::get(&counters.destroys), 3);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(Counters::get(&counters.teardowns), 3);
}

#[tokio::test]
async fn test_in_use_revision_is_not_unloaded() {
    let root = temp_root();
    let (mut rt, counters) = counting_runtime(root.path()).await;
    rt.add_module(&package("Greeter", "r0")).await.unwrap();

    let proxy = rt.proxy::<dyn Greeter>("Greeter", "svc");
    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let in_flight = {
        let proxy = proxy.clone();
        tokio::spawn(async move {
            proxy
                .call_async(|g| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    g.greet("held")
                })
                .await
        })
    };
    started_rx.await.unwrap();

    rt.update_module("Greeter", &package("Greeter", "r1"))
        .await
        .unwrap();
    for _ in 0..3 {
        rt.reconcile().await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(Counters::get(&counters.teardowns), 0);

    let old = rt.registry().revision("Greeter", 0).await.unwrap();
    assert_eq!(old.state(), RevisionState::Inactive);
    assert!(old.in_use());

    release_tx.send(()).unwrap();
    assert_eq!(in_flight.await.unwrap().unwrap(), "r0 held");

    rt.reconcile().await;
    assert!(old.wait_for_state(RevisionState::Unloaded, WAIT).await);
    assert_eq!(Counters::get(&counters.teardowns), 1);

    rt.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_removed_module_drains_before_unload() {
    let root = temp_root();
    let (mut rt, counters) = counting_runtime(root.path()).await;
    rt.add_module(&package("Greeter", "r0")).await.unwrap();

    let proxy = rt.proxy::<dyn Greeter>("Greeter", "svc");
    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let in_flight = {
        let proxy = proxy.clone();
        tokio::spawn(async move {
            proxy
                .call_async(|g| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    g.greet("held")
                })
                .await
        })
    };
    started_rx.await.unwrap();

    let revision = rt.registry().current_revision("Greeter").await.unwrap();
    rt.remove_module("Greeter").await.unwrap();

    // 模块已不可见，但修订仍在排空
    assert!(!rt.has_module("Greeter").await);
    assert_eq!(rt.registry().retiring_count().await, 1);
    assert_eq!(revision.state(), RevisionState::Inactive);
    assert_eq!(Counters::get(&counters.teardowns), 0);

    release_tx.send(()).unwrap();
    assert_eq!(in_flight.await.unwrap().unwrap(), "r0 held");

    let report = rt.reconcile().await;
    assert_eq!(report.retiring, 0);
    assert!(revision.wait_for_state(RevisionState::Unloaded, WAIT).await);
    assert_eq!(Counters::get(&counters.teardowns), 1);

    rt.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_load_failures_become_error_revisions() {
    let root = temp_root();
    let (mut rt, counters) = counting_runtime(root.path()).await;

    let info = rt.add_module(&package("Loader", "fail-load")).await.unwrap();
    assert_eq!(info.state, RevisionState::Error);
    assert!(info.error_reason.unwrap().contains("loader refused"));
    assert_eq!(Counters::get(&counters.inits), 0);

    // 初始化失败时已加载的单元被清理
    let info = rt.add_module(&package("Context", "fail-init")).await.unwrap();
    assert_eq!(info.state, RevisionState::Error);
    assert!(info.error_reason.unwrap().contains("init refused"));
    assert_eq!(Counters::get(&counters.loads), 1);
    assert_eq!(Counters::get(&counters.teardowns), 1);
    assert_eq!(Counters::get(&counters.destroys), 1);

    let proxy = rt.proxy::<dyn Greeter>("Context", "svc");
    let err = proxy.call(|g| g.greet("x")).await.unwrap_err();
    assert!(matches!(err, CoreError::BeanNotFound { .. }));

    rt.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(Counters::get(&counters.teardowns), 1);
}

#[tokio::test]
async fn test_panic_in_destroy_still_tears_down_unit() {
    let root = temp_root();
    let (mut rt, counters) = counting_runtime(root.path()).await;
    rt.add_module(&package("Greeter", "panic-destroy")).await.unwrap();
    let revision = rt.registry().current_revision("Greeter").await.unwrap();

    rt.update_module("Greeter", &package("Greeter", "fine"))
        .await
        .unwrap();
    rt.reconcile().await;

    assert!(revision.wait_for_state(RevisionState::Unloaded, WAIT).await);
    assert_eq!(Counters::get(&counters.destroys), 1);
    assert_eq!(Counters::get(&counters.teardowns), 1);

    let proxy = rt.proxy::<dyn Greeter>("Greeter", "svc");
    assert_eq!(proxy.call(|g| g.greet("x")).await.unwrap(), "fine x");

    rt.shutdown().await.unwrap();
}

async fn exploding_runtime(root: &Path) -> HotSwapRuntime {
    let mut runtime = HotSwapRuntime::builder(config(root))
        .bean_factories(factories_with_exploding())
        .build()
        .unwrap();
    runtime.start().await.unwrap();
    runtime
}

#[tokio::test]
async fn test_panicking_factory_becomes_error_revision() {
    let root = temp_root();
    let mut a = exploding_runtime(root.path()).await;

    let info = a.add_module(&exploding_package("Bad")).await.unwrap();
    assert_eq!(info.state, RevisionState::Error);
    assert!(info.error_reason.unwrap().contains("factory exploded"));
    assert!(a.has_module("Bad").await);

    let proxy = a.proxy::<dyn Greeter>("Bad", "svc");
    let err = proxy.call(|g| g.greet("x")).await.unwrap_err();
    assert!(matches!(err, CoreError::BeanNotFound { .. }));

    a.add_module(&greeter_package("Greeter", "hi")).await.unwrap();

    // 其他进程启动时同样得到 Error 修订，其余模块照常加载
    let mut b = exploding_runtime(root.path()).await;
    assert_eq!(
        b.current_info("Bad").await.unwrap().state,
        RevisionState::Error
    );
    let greeter = b.proxy::<dyn Greeter>("Greeter", "svc");
    assert_eq!(greeter.call(|g| g.greet("x")).await.unwrap(), "hi x");

    // 损坏修订之后的更新仍能被巡检发现
    a.update_module("Bad", &greeter_package("Bad", "fixed"))
        .await
        .unwrap();
    let (scan, _) = b.check_repository().await.unwrap();
    assert_eq!(scan.loaded, vec!["Bad#1"]);
    let fixed = b.proxy::<dyn Greeter>("Bad", "svc");
    assert_eq!(fixed.call(|g| g.greet("x")).await.unwrap(), "fixed x");

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}
