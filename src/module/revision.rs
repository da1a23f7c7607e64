//! 模块修订
//!
//! [`ModuleRevision`] 是单个修订的生命周期对象，持有状态机、调用计数，
//! 以及（加载期间）独占的加载单元和 Bean 上下文。
//!
//! # 状态机
//!
//! ```text
//! Unloaded → Active ⇄ Inactive → Unloading → Unloaded
//!              └─ 加载失败 → Error
//! ```
//!
//! 卸载时先在修订自身的锁内切换到 `Unloading` 并取走加载单元与上下文，
//! 随后由独立的清理任务在不持有任何锁的情况下依次销毁上下文、卸载加载单元，
//! 完成后修订进入 `Unloaded`。

use chrono::Utc;
use parking_lot::Mutex;
use std::any::TypeId;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::bean::Bean;
use super::context::BeanContext;
use super::info::{ModuleInfo, RevisionState};
use super::loader::LoadedModule;

/// 已加载修订独占的资源
pub(crate) struct LoadedParts {
    unit: Box<dyn LoadedModule>,
    context: Box<dyn BeanContext>,
}

struct RevisionInner {
    info: ModuleInfo,
    parts: Option<LoadedParts>,
}

/// 单个模块修订
pub struct ModuleRevision {
    name: String,
    revision: i64,
    inner: Mutex<RevisionInner>,
    state_tx: watch::Sender<RevisionState>,
}

impl ModuleRevision {
    fn with_state(
        mut info: ModuleInfo,
        state: RevisionState,
        parts: Option<LoadedParts>,
    ) -> Arc<Self> {
        info.state = state;
        info.last_state_change = Utc::now();
        let (state_tx, _) = watch::channel(state);

        Arc::new(Self {
            name: info.name.clone(),
            revision: info.revision,
            inner: Mutex::new(RevisionInner { info, parts }),
            state_tx,
        })
    }

    /// 以已初始化的加载单元与上下文创建 Active 修订
    pub fn active(
        info: ModuleInfo,
        unit: Box<dyn LoadedModule>,
        context: Box<dyn BeanContext>,
    ) -> Arc<Self> {
        Self::with_state(
            info,
            RevisionState::Active,
            Some(LoadedParts { unit, context }),
        )
    }

    /// 创建仅作为历史记录的 Unloaded 修订
    pub fn unloaded(info: ModuleInfo) -> Arc<Self> {
        Self::with_state(info, RevisionState::Unloaded, None)
    }

    /// 创建加载失败的 Error 修订
    pub fn failed(mut info: ModuleInfo, reason: impl Into<String>) -> Arc<Self> {
        info.error_reason = Some(reason.into());
        Self::with_state(info, RevisionState::Error, None)
    }

    /// 模块名称
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 修订号
    pub fn revision(&self) -> i64 {
        self.revision
    }

    /// 信息快照（副本）
    pub fn info(&self) -> ModuleInfo {
        self.inner.lock().info.clone()
    }

    /// 当前状态
    pub fn state(&self) -> RevisionState {
        self.inner.lock().info.state
    }

    /// 错误原因
    pub fn error_reason(&self) -> Option<String> {
        self.inner.lock().info.error_reason.clone()
    }

    /// 是否有调用正在进行
    pub fn in_use(&self) -> bool {
        self.inner.lock().info.usage_count > 0
    }

    /// 进行中的调用数
    pub fn usage_count(&self) -> i64 {
        self.inner.lock().info.usage_count
    }

    /// 是否与另一修订为同一修订（按名称与修订号比较）
    pub fn same_identity(&self, other: &ModuleRevision) -> bool {
        self.revision == other.revision && self.name == other.name
    }

    // ========================================================================
    // 调用计数
    // ========================================================================

    /// 登记一次调用
    ///
    /// 只有已加载的修订接受调用，否则返回 `None`。
    /// 返回的守卫丢弃时自动释放计数，调用方 panic 时同样会释放。
    pub fn acquire(self: &Arc<Self>) -> Option<UsageGuard> {
        let mut inner = self.inner.lock();
        if !inner.info.state.accepts_calls() {
            return None;
        }
        inner.info.usage_count += 1;

        Some(UsageGuard {
            revision: Arc::clone(self),
        })
    }

    fn release(&self) {
        let mut inner = self.inner.lock();
        if inner.info.usage_count > 0 {
            inner.info.usage_count -= 1;
        } else {
            warn!(revision = %inner.info.identity(), "调用计数已为 0，忽略多余的释放");
        }
    }

    // ========================================================================
    // 状态迁移
    // ========================================================================

    /// Active → Inactive
    ///
    /// 返回是否发生了迁移。
    pub fn inactivate(&self) -> bool {
        let mut inner = self.inner.lock();
        if !inner.info.state.can_inactivate() {
            return false;
        }
        self.transition(&mut inner, RevisionState::Inactive);
        debug!(revision = %inner.info.identity(), "修订已失活");
        true
    }

    /// 进入卸载流程
    ///
    /// 在 `Active`/`Inactive`/`Unloading` 状态下立即切换到 `Unloading`，
    /// 取走加载单元与上下文并交给清理任务。不检查调用计数，
    /// 按需排空时使用 [`unload_if_idle`](Self::unload_if_idle)。
    pub fn unload(self: &Arc<Self>) -> bool {
        let parts = {
            let mut inner = self.inner.lock();
            if !inner.info.state.can_unload() {
                return false;
            }
            if inner.info.state != RevisionState::Unloading {
                self.transition(&mut inner, RevisionState::Unloading);
                info!(revision = %inner.info.identity(), usage = inner.info.usage_count, "开始卸载修订");
            }
            inner.parts.take()
        };

        if let Some(parts) = parts {
            self.spawn_teardown(parts, true);
        }
        true
    }

    /// 仅当修订已失活且没有进行中的调用时卸载
    pub fn unload_if_idle(self: &Arc<Self>) -> bool {
        {
            let inner = self.inner.lock();
            if inner.info.state != RevisionState::Inactive || inner.info.usage_count > 0 {
                return false;
            }
        }
        self.unload()
    }

    /// 任意状态 → Error
    ///
    /// 已加载的资源会被取走并清理，修订停留在 Error 状态。
    pub fn set_error(self: &Arc<Self>, reason: impl Into<String>) {
        let reason = reason.into();
        let parts = {
            let mut inner = self.inner.lock();
            inner.info.error_reason = Some(reason.clone());
            self.transition(&mut inner, RevisionState::Error);
            error!(revision = %inner.info.identity(), reason = %reason, "修订进入错误状态");
            inner.parts.take()
        };

        if let Some(parts) = parts {
            self.spawn_teardown(parts, false);
        }
    }

    fn transition(&self, inner: &mut RevisionInner, state: RevisionState) {
        inner.info.state = state;
        inner.info.last_state_change = Utc::now();
        self.state_tx.send_replace(state);
    }

    fn finish_unload(&self) {
        let mut inner = self.inner.lock();
        if inner.info.state == RevisionState::Unloading {
            self.transition(&mut inner, RevisionState::Unloaded);
            info!(revision = %inner.info.identity(), "修订已卸载");
        }
    }

    // 清理在阻塞线程池中进行，不持有任何锁；没有运行时则就地执行
    fn spawn_teardown(self: &Arc<Self>, parts: LoadedParts, finish: bool) {
        let revision = Arc::clone(self);
        let task = move || {
            let LoadedParts {
                mut unit,
                mut context,
            } = parts;
            let identity = format!("{}#{}", revision.name, revision.revision);

            if catch_unwind(AssertUnwindSafe(|| context.destroy())).is_err() {
                error!(revision = %identity, "销毁 Bean 上下文时发生 panic");
            }
            drop(context);

            match catch_unwind(AssertUnwindSafe(|| unit.teardown())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(revision = %identity, error = %e, "卸载加载单元失败"),
                Err(_) => error!(revision = %identity, "卸载加载单元时发生 panic"),
            }
            drop(unit);

            if finish {
                revision.finish_unload();
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(task);
            }
            Err(_) => task(),
        }
    }

    // ========================================================================
    // Bean 查询
    // ========================================================================

    /// 获取 Bean，未加载的修订永远返回 `None`
    pub fn get_bean(&self, name: &str) -> Option<Bean> {
        let inner = self.inner.lock();
        inner.parts.as_ref().and_then(|p| p.context.get_bean(name))
    }

    /// 是否存在 Bean
    pub fn has_bean(&self, name: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .parts
            .as_ref()
            .map(|p| p.context.has_bean(name))
            .unwrap_or(false)
    }

    /// Bean 的具体类型
    pub fn bean_type(&self, name: &str) -> Option<TypeId> {
        let inner = self.inner.lock();
        inner.parts.as_ref().and_then(|p| p.context.bean_type(name))
    }

    /// Bean 的具体类型名
    pub fn bean_type_name(&self, name: &str) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .parts
            .as_ref()
            .and_then(|p| p.context.bean_type_name(name))
    }

    /// 全部 Bean 名称
    pub fn bean_names(&self) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .parts
            .as_ref()
            .map(|p| p.context.bean_names())
            .unwrap_or_default()
    }

    // ========================================================================
    // 状态观察
    // ========================================================================

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<RevisionState> {
        self.state_tx.subscribe()
    }

    /// 等待修订到达指定状态，超时返回 `false`
    pub async fn wait_for_state(&self, target: RevisionState, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|state| *state == target)).await;
        matches!(reached, Ok(Ok(_)))
    }
}

impl fmt::Debug for ModuleRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ModuleRevision")
            .field("name", &self.name)
            .field("revision", &self.revision)
            .field("state", &inner.info.state)
            .field("usage_count", &inner.info.usage_count)
            .field("loaded", &inner.parts.is_some())
            .finish()
    }
}

/// 调用计数守卫
///
/// 持有期间修订不会被 [`unload_if_idle`](ModuleRevision::unload_if_idle) 卸载。
pub struct UsageGuard {
    revision: Arc<ModuleRevision>,
}

impl UsageGuard {
    /// 被登记调用的修订
    pub fn revision(&self) -> &Arc<ModuleRevision> {
        &self.revision
    }
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        self.revision.release();
    }
}

impl fmt::Debug for UsageGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsageGuard")
            .field("name", &self.revision.name)
            .field("revision", &self.revision.revision)
            .finish()
    }
}
