//! 周期调度器
//!
//! 按固定间隔驱动 [`ReconciliationTarget`]：首次在启动后短暂延迟执行，
//! 之后每个间隔执行一次。单轮失败只记录日志，下一轮照常进行。

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::utils::Result;

/// 调度器驱动的一轮检查
#[async_trait]
pub trait ReconciliationTarget: Send + Sync {
    /// 执行一轮检查
    async fn run_check(&self) -> Result<()>;
}

/// 周期调度器
///
/// 丢弃时发出停止信号，不等待当前一轮结束；需要等待时调用 [`stop`](Self::stop)。
pub struct ReconciliationScheduler {
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
    ticks: Arc<AtomicU64>,
}

impl ReconciliationScheduler {
    /// 启动调度器，必须在 tokio 运行时内调用
    pub fn start(
        target: Arc<dyn ReconciliationTarget>,
        initial_delay: Duration,
        interval: Duration,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);

        info!(
            initial_delay_ms = initial_delay.as_millis() as u64,
            interval_ms = interval.as_millis() as u64,
            "启动周期调度器"
        );

        let handle = tokio::spawn(async move {
            let mut timer =
                tokio::time::interval_at(tokio::time::Instant::now() + initial_delay, interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        let tick = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        debug!(tick, "执行周期检查");
                        if let Err(e) = target.run_check().await {
                            warn!(tick, error = %e, "周期检查失败，等待下一轮");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("周期调度器收到停止信号");
                        break;
                    }
                }
            }
        });

        Self {
            shutdown_tx,
            handle: Some(handle),
            ticks,
        }
    }

    /// 已执行的轮数
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// 是否仍在运行
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// 停止调度器并等待当前一轮结束
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "周期调度任务异常退出");
            }
        }
        info!(ticks = self.tick_count(), "周期调度器已停止");
    }
}

impl Drop for ReconciliationScheduler {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl std::fmt::Debug for ReconciliationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationScheduler")
            .field("ticks", &self.tick_count())
            .field("running", &self.is_running())
            .finish()
    }
}
