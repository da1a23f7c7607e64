//! 模块修订信息
//!
//! [`ModuleInfo`] 是单个修订的元数据快照。调用方拿到的永远是副本，
//! 对快照的修改不会影响运行时状态。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 清单未声明版本时使用的占位版本号
pub const UNKNOWN_VERSION: &str = "n/a";

/// 修订生命周期状态
///
/// `Unloaded → Active ⇄ Inactive → Unloading → Unloaded`，加载失败时直接进入 `Error`。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionState {
    /// 加载失败（对该修订是终态）
    Error,
    /// 未加载（历史记录或已完成卸载）
    #[default]
    Unloaded,
    /// 当前生效
    Active,
    /// 已被新修订取代，等待调用排空
    Inactive,
    /// 正在异步卸载
    Unloading,
}

impl RevisionState {
    /// 是否持有加载器与 Bean 上下文
    pub fn is_loaded(&self) -> bool {
        matches!(self, RevisionState::Active | RevisionState::Inactive)
    }

    /// 是否可以失活
    pub fn can_inactivate(&self) -> bool {
        matches!(self, RevisionState::Active)
    }

    /// 是否可以进入卸载流程
    pub fn can_unload(&self) -> bool {
        matches!(
            self,
            RevisionState::Active | RevisionState::Inactive | RevisionState::Unloading
        )
    }

    /// 是否允许新的调用进入
    pub fn accepts_calls(&self) -> bool {
        self.is_loaded()
    }
}

impl fmt::Display for RevisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RevisionState::Error => "error",
            RevisionState::Unloaded => "unloaded",
            RevisionState::Active => "active",
            RevisionState::Inactive => "inactive",
            RevisionState::Unloading => "unloading",
        };
        f.write_str(name)
    }
}

/// 单个模块修订的元数据快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// 模块名称
    pub name: String,

    /// 模块描述
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// 模块版本（清单未声明时为 "n/a"）
    pub version: String,

    /// 修订号（同一模块内从 0 起单调递增）
    pub revision: i64,

    /// 部署时间（模块包文件的修改时间）
    pub deployed_at: DateTime<Utc>,

    /// 正在进行中的调用数
    pub usage_count: i64,

    /// 当前状态
    pub state: RevisionState,

    /// 最近一次状态变更时间
    pub last_state_change: DateTime<Utc>,

    /// 错误原因（仅 Error 状态）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl ModuleInfo {
    /// 创建处于 Unloaded 状态的信息
    pub fn new(
        name: impl Into<String>,
        version: Option<String>,
        description: Option<String>,
        revision: i64,
        deployed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            description,
            version: version
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN_VERSION.to_string()),
            revision,
            deployed_at,
            usage_count: 0,
            state: RevisionState::Unloaded,
            last_state_change: Utc::now(),
            error_reason: None,
        }
    }

    /// 是否处于 Active 状态
    pub fn is_active(&self) -> bool {
        self.state == RevisionState::Active
    }

    /// 是否处于 Error 状态
    pub fn is_error(&self) -> bool {
        self.state == RevisionState::Error
    }

    /// 是否有调用正在进行
    pub fn in_use(&self) -> bool {
        self.usage_count > 0
    }

    /// 修订标识，形如 `Greeter#3`
    pub fn identity(&self) -> String {
        format!("{}#{}", self.name, self.revision)
    }
}

impl fmt::Display for ModuleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} v{} rev {} [{}] deployed {} usage {}",
            self.name,
            self.version,
            self.revision,
            self.state,
            self.deployed_at.format("%Y-%m-%d %H:%M:%S"),
            self.usage_count
        )?;
        if let Some(ref reason) = self.error_reason {
            write!(f, " error: {}", reason)?;
        }
        Ok(())
    }
}
