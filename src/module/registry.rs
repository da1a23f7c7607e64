//! 模块注册表
//!
//! 管理模块名到 [`ModuleFamily`] 的映射，提供修订的注册、查询，
//! 驱动代理的重新解析，以及淘汰过时修订的 [`reconcile`](Registry::reconcile)。
//!
//! # 锁顺序
//!
//! 注册表的锁在外，修订自身的锁在内，任何路径都不会反向获取。

use serde::Serialize;
use std::any::TypeId;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::family::ModuleFamily;
use super::info::{ModuleInfo, RevisionState};
use super::proxy::ProxyHandle;
use super::revision::ModuleRevision;

#[derive(Debug, Default)]
struct RegistryState {
    families: HashMap<String, ModuleFamily>,
    // 已注销但仍有调用未排空的修订
    retiring: Vec<Arc<ModuleRevision>>,
}

/// 一次 reconcile 的结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// 本轮失活的修订（`name#revision`）
    pub inactivated: Vec<String>,
    /// 本轮开始卸载的修订
    pub unloaded: Vec<String>,
    /// 本轮注销的模块
    pub unregistered: Vec<String>,
    /// 仍在等待排空的已注销修订数
    pub retiring: usize,
}

impl ReconcileReport {
    /// 本轮是否有任何变化
    pub fn is_empty(&self) -> bool {
        self.inactivated.is_empty() && self.unloaded.is_empty() && self.unregistered.is_empty()
    }
}

/// 模块注册表
#[derive(Debug, Default)]
pub struct Registry {
    state: RwLock<RegistryState>,
}

impl Registry {
    /// 创建空注册表
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // 结构变更
    // ========================================================================

    /// 注册修订
    ///
    /// 家族不存在时自动创建。新修订到来会撤销家族的待删除标记，
    /// 成为当前修订时原当前修订随即失活。
    /// 返回是否实际添加（同一标识的修订只注册一次）。
    pub async fn register(&self, revision: Arc<ModuleRevision>) -> bool {
        let mut state = self.state.write().await;
        let family = state
            .families
            .entry(revision.name().to_string())
            .or_insert_with(|| ModuleFamily::new(revision.name()));

        family.mark_pending_removal(false);
        let previous = family.current().cloned();
        if !family.add_revision(Arc::clone(&revision)) {
            return false;
        }
        debug!(
            module = %revision.name(),
            revision = revision.revision(),
            state = %revision.state(),
            "注册修订"
        );

        // 被取代的当前修订立即失活，代理在下一次调用时切换到新修订
        if let Some(previous) = previous {
            let superseded = family
                .current()
                .map(|current| !Arc::ptr_eq(current, &previous))
                .unwrap_or(false);
            if superseded && previous.inactivate() {
                debug!(module = %previous.name(), revision = previous.revision(), "旧修订已被取代");
            }
        }
        true
    }

    /// 注销修订，家族为空时一并删除
    pub async fn unregister(&self, revision: &ModuleRevision) -> bool {
        let mut state = self.state.write().await;
        let Some(family) = state.families.get_mut(revision.name()) else {
            return false;
        };

        let removed = family.remove_revision(revision);
        if family.is_empty() {
            state.families.remove(revision.name());
            debug!(module = %revision.name(), "模块家族已清空并删除");
        }
        removed
    }

    /// 标记模块待删除，下一次 reconcile 时注销
    pub async fn mark_pending_removal(&self, name: &str) -> bool {
        let mut state = self.state.write().await;
        match state.families.get_mut(name) {
            Some(family) => {
                family.mark_pending_removal(true);
                info!(module = %name, "模块已标记为待删除");
                true
            }
            None => false,
        }
    }

    /// 立即注销整个模块
    ///
    /// 用于磁盘上的修订序列已被重建的情况。已加载的修订失活后等待排空再卸载。
    pub async fn evict(&self, name: &str) -> bool {
        let mut guard = self.state.write().await;
        let RegistryState { families, retiring } = &mut *guard;
        let Some(family) = families.remove(name) else {
            return false;
        };

        let mut report = ReconcileReport::default();
        for revision in family.all() {
            retire(revision, retiring, &mut report);
        }
        info!(
            module = %name,
            revisions = family.len(),
            retiring = retiring.len(),
            "模块已整体注销"
        );
        true
    }

    // ========================================================================
    // 查询
    // ========================================================================

    /// 当前修订
    pub async fn current_revision(&self, name: &str) -> Option<Arc<ModuleRevision>> {
        let state = self.state.read().await;
        state.families.get(name).and_then(|f| f.current().cloned())
    }

    /// 指定修订
    pub async fn revision(&self, name: &str, revision: i64) -> Option<Arc<ModuleRevision>> {
        let state = self.state.read().await;
        state
            .families
            .get(name)
            .and_then(|f| f.find(revision).cloned())
    }

    /// 全部模块名（不含待删除的模块）
    pub async fn module_names(&self) -> BTreeSet<String> {
        let state = self.state.read().await;
        state
            .families
            .values()
            .filter(|f| !f.is_pending_removal())
            .map(|f| f.name().to_string())
            .collect()
    }

    /// 已注册的修订号，模块不存在时为空
    pub async fn registered_revisions(&self, name: &str) -> Vec<i64> {
        let state = self.state.read().await;
        state
            .families
            .get(name)
            .map(|f| f.revision_numbers())
            .unwrap_or_default()
    }

    /// 当前修订的信息
    pub async fn info_for(&self, name: &str) -> Option<ModuleInfo> {
        self.current_revision(name).await.map(|r| r.info())
    }

    /// 全部修订的信息，模块不存在时返回 `None`
    pub async fn history_for(&self, name: &str) -> Option<Vec<ModuleInfo>> {
        let state = self.state.read().await;
        state.families.get(name).map(|f| f.info_snapshot())
    }

    /// 全部模块当前修订的信息（按名称排序）
    pub async fn current_infos(&self) -> Vec<ModuleInfo> {
        let state = self.state.read().await;
        let mut infos: Vec<ModuleInfo> = state
            .families
            .values()
            .filter(|f| !f.is_pending_removal())
            .filter_map(|f| f.current().map(|r| r.info()))
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// 模块是否存在（待删除的模块视为不存在）
    pub async fn has_module(&self, name: &str) -> bool {
        let state = self.state.read().await;
        state
            .families
            .get(name)
            .map(|f| !f.is_pending_removal())
            .unwrap_or(false)
    }

    /// 模块当前修订是否有该 Bean
    pub async fn has_bean(&self, module: &str, bean: &str) -> bool {
        match self.current_revision(module).await {
            Some(revision) => revision.has_bean(bean),
            None => false,
        }
    }

    /// Bean 的具体类型
    pub async fn bean_type(&self, module: &str, bean: &str) -> Option<TypeId> {
        self.current_revision(module)
            .await
            .and_then(|r| r.bean_type(bean))
    }

    /// Bean 的具体类型名
    pub async fn bean_type_name(&self, module: &str, bean: &str) -> Option<String> {
        self.current_revision(module)
            .await
            .and_then(|r| r.bean_type_name(bean))
    }

    /// 已注销但未排空的修订数
    pub async fn retiring_count(&self) -> usize {
        self.state.read().await.retiring.len()
    }

    // ========================================================================
    // 代理解析
    // ========================================================================

    /// 按当前修订重新解析代理
    ///
    /// 同一代理的解析是串行的，排队期间已被其他调用解析过则不再重复。
    pub async fn resolve_proxy<C>(&self, proxy: &ProxyHandle<C>)
    where
        C: ?Sized + Send + Sync + 'static,
    {
        let _serial = proxy.resolve_lock().lock().await;
        if !proxy.needs_revalidation() {
            return;
        }
        let current = self.current_revision(proxy.module_name()).await;
        proxy.apply_resolution(current);
    }

    // ========================================================================
    // 淘汰
    // ========================================================================

    /// 淘汰过时修订
    ///
    /// 对每个模块的每个修订：
    ///
    /// - 模块待删除：立即注销，已加载的修订失活后等待排空再卸载
    /// - 不是当前修订且仍为 Active：失活
    /// - 已失活且没有进行中的调用：卸载
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut guard = self.state.write().await;
        let RegistryState { families, retiring } = &mut *guard;

        let pending: Vec<String> = families
            .values()
            .filter(|f| f.is_pending_removal())
            .map(|f| f.name().to_string())
            .collect();
        for name in pending {
            if let Some(family) = families.remove(&name) {
                for revision in family.all() {
                    retire(revision, retiring, &mut report);
                }
                info!(module = %name, "模块已注销");
                report.unregistered.push(name);
            }
        }

        for family in families.values() {
            let current = family.current();
            for revision in family.all() {
                let is_current = current.map(|c| Arc::ptr_eq(c, revision)).unwrap_or(false);
                let state = revision.state();

                if !is_current && state == RevisionState::Active {
                    if revision.inactivate() {
                        report.inactivated.push(identity(revision));
                    }
                } else if state == RevisionState::Inactive
                    && !revision.in_use()
                    && revision.unload_if_idle()
                {
                    report.unloaded.push(identity(revision));
                }
            }
        }

        retiring.retain(|revision| match revision.state() {
            RevisionState::Active | RevisionState::Inactive => {
                revision.inactivate();
                if revision.unload_if_idle() {
                    report.unloaded.push(identity(revision));
                    false
                } else {
                    true
                }
            }
            _ => false,
        });
        report.retiring = retiring.len();

        if !report.is_empty() {
            debug!(
                inactivated = report.inactivated.len(),
                unloaded = report.unloaded.len(),
                unregistered = report.unregistered.len(),
                retiring = report.retiring,
                "reconcile 完成"
            );
        }
        report
    }

    /// 强制卸载全部修订并清空注册表
    pub async fn destroy(&self) {
        let mut state = self.state.write().await;
        let families = std::mem::take(&mut state.families);
        let retiring = std::mem::take(&mut state.retiring);

        let mut count = 0usize;
        for revision in families
            .values()
            .flat_map(|f| f.all().iter())
            .chain(retiring.iter())
        {
            if revision.unload() {
                count += 1;
            }
        }
        info!(modules = families.len(), unloaded = count, "注册表已销毁");
    }
}

fn identity(revision: &ModuleRevision) -> String {
    format!("{}#{}", revision.name(), revision.revision())
}

// 注销时仍在使用的修订放入 retiring 等待排空
fn retire(
    revision: &Arc<ModuleRevision>,
    retiring: &mut Vec<Arc<ModuleRevision>>,
    report: &mut ReconcileReport,
) {
    match revision.state() {
        RevisionState::Active | RevisionState::Inactive => {
            if revision.inactivate() {
                report.inactivated.push(identity(revision));
            }
            if revision.unload_if_idle() {
                report.unloaded.push(identity(revision));
            } else {
                retiring.push(Arc::clone(revision));
            }
        }
        _ => {}
    }
}
