//! 代理调用性能基准测试
//!
//! 使用 Criterion 框架进行性能测试，包括：
//! - 缓存命中时的代理调用
//! - 每次调用前都发生修订切换的代理调用
//! - 注册表当前修订查找
//! - 并发代理调用

use chips_hotswap::{
    Bean, BeanContext, LoadedModule, ModuleInfo, ModuleRevision, ProxyHandle, Registry,
};
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

// ============================================================================
// 测试辅助结构
// ============================================================================

trait Adder: Send + Sync {
    fn add(&self, a: u64, b: u64) -> u64;
}

struct PlainAdder;

impl Adder for PlainAdder {
    fn add(&self, a: u64, b: u64) -> u64 {
        a + b
    }
}

struct BenchUnit;

impl LoadedModule for BenchUnit {
    fn location(&self) -> Option<&Path> {
        None
    }

    fn teardown(&mut self) -> chips_hotswap::Result<()> {
        Ok(())
    }
}

struct BenchContext {
    beans: HashMap<String, Bean>,
}

impl BenchContext {
    fn new() -> Self {
        let instance = Arc::new(PlainAdder);
        let bean = Bean::builder("adder", instance.clone())
            .expose::<dyn Adder>(instance)
            .build();
        Self {
            beans: HashMap::from([("adder".to_string(), bean)]),
        }
    }
}

impl BeanContext for BenchContext {
    fn init(&mut self) -> chips_hotswap::Result<()> {
        Ok(())
    }

    fn destroy(&mut self) {
        self.beans.clear();
    }

    fn get_bean(&self, name: &str) -> Option<Bean> {
        self.beans.get(name).cloned()
    }

    fn bean_names(&self) -> Vec<String> {
        self.beans.keys().cloned().collect()
    }
}

fn revision(name: &str, revision: i64) -> Arc<ModuleRevision> {
    ModuleRevision::active(
        ModuleInfo::new(name, None, None, revision, Utc::now()),
        Box::new(BenchUnit),
        Box::new(BenchContext::new()),
    )
}

async fn registry_with_modules(count: usize) -> Arc<Registry> {
    let registry = Arc::new(Registry::new());
    for i in 0..count {
        registry.register(revision(&format!("Module{}", i), 0)).await;
    }
    registry
}

// ============================================================================
// 代理调用基准测试
// ============================================================================

/// 缓存命中的代理调用
fn proxy_cached_call_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = rt.block_on(registry_with_modules(1));
    let proxy: ProxyHandle<dyn Adder> = ProxyHandle::new(registry, "Module0", "adder");

    c.bench_function("proxy_cached_call", |b| {
        b.to_async(&rt).iter(|| async {
            let sum = proxy.call(|adder| adder.add(black_box(1), black_box(2))).await;
            black_box(sum.unwrap())
        });
    });
}

/// 每次调用前部署新修订，代理必须重新解析
fn proxy_swap_call_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = rt.block_on(registry_with_modules(1));
    let proxy: ProxyHandle<dyn Adder> = ProxyHandle::new(registry.clone(), "Module0", "adder");
    let next = std::sync::atomic::AtomicI64::new(1);

    c.bench_function("proxy_call_after_swap", |b| {
        b.to_async(&rt).iter(|| async {
            let n = next.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            registry.register(revision("Module0", n)).await;
            let sum = proxy.call(|adder| adder.add(black_box(1), black_box(2))).await;
            registry.reconcile().await;
            black_box(sum.unwrap())
        });
    });
}

// ============================================================================
// 注册表查找基准测试
// ============================================================================

/// 不同模块数量下的当前修订查找
fn registry_lookup_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("registry_current_revision");

    for count in [10usize, 100, 1000] {
        let registry = rt.block_on(registry_with_modules(count));
        let target = format!("Module{}", count / 2);

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.to_async(&rt).iter(|| async {
                black_box(registry.current_revision(&target).await)
            });
        });
    }
    group.finish();
}

// ============================================================================
// 并发调用基准测试
// ============================================================================

/// 多个任务共享同一代理并发调用
fn concurrent_proxy_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = rt.block_on(registry_with_modules(1));
    let proxy: ProxyHandle<dyn Adder> = ProxyHandle::new(registry, "Module0", "adder");

    let mut group = c.benchmark_group("concurrent_proxy_calls");
    for tasks in [4u64, 16, 64] {
        group.throughput(Throughput::Elements(tasks));
        group.bench_with_input(BenchmarkId::from_parameter(tasks), &tasks, |b, &tasks| {
            b.to_async(&rt).iter(|| async {
                let calls = (0..tasks).map(|i| {
                    let proxy = proxy.clone();
                    tokio::spawn(async move { proxy.call(|adder| adder.add(i, i)).await })
                });
                for result in futures::future::join_all(calls).await {
                    black_box(result.unwrap().unwrap());
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    proxy_benches,
    proxy_cached_call_benchmark,
    proxy_swap_call_benchmark,
);

criterion_group!(
    registry_benches,
    registry_lookup_benchmark,
    concurrent_proxy_benchmark,
);

criterion_main!(proxy_benches, registry_benches);
