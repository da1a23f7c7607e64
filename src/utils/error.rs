//! 薯片热替换运行时错误类型定义
//!
//! 本模块定义了运行时中使用的所有错误类型。

use thiserror::Error;

/// 热替换运行时核心错误类型
#[derive(Error, Debug)]
pub enum CoreError {
    // ==================== 调用分派错误 ====================
    /// 模块未找到
    #[error("模块未找到: '{0}'")]
    ModuleNotFound(String),

    /// Bean 未找到
    #[error("Bean 未找到: 模块 '{module}' 中不存在 '{bean}'")]
    BeanNotFound {
        /// 模块名称
        module: String,
        /// Bean 名称
        bean: String,
    },

    /// Bean 未暴露所请求的能力
    #[error("Bean '{module}/{bean}' 未暴露能力 '{capability}'")]
    CapabilityNotExposed {
        /// 模块名称
        module: String,
        /// Bean 名称
        bean: String,
        /// 能力类型名称
        capability: String,
    },

    /// 方法不在代理声明的能力集合内
    #[error("方法 '{method}' 不在 '{module}/{bean}' 代理的能力集合内")]
    MethodNotAllowed {
        /// 模块名称
        module: String,
        /// Bean 名称
        bean: String,
        /// 方法名称
        method: String,
    },

    // ==================== 模块部署错误 ====================
    /// 模块名称无效（缺失或与目标不一致）
    #[error("模块名称无效: {0}")]
    InvalidModuleName(String),

    /// 模块已存在
    #[error("模块已存在: '{0}'")]
    ModuleAlreadyExists(String),

    /// 修订版本不存在
    #[error("修订版本不存在: 模块 '{module}' 的修订 {revision}")]
    RevisionNotFound {
        /// 模块名称
        module: String,
        /// 修订号
        revision: i64,
    },

    /// 模块加载失败
    #[error("模块加载失败: '{module}' 修订 {revision} - {reason}")]
    LoadFailure {
        /// 模块名称
        module: String,
        /// 修订号
        revision: i64,
        /// 失败原因
        reason: String,
    },

    /// 模块包无效
    #[error("模块包无效: {0}")]
    InvalidPackage(String),

    /// 模块清单无效
    #[error("模块清单无效: {0}")]
    InvalidManifest(String),

    // ==================== 仓库锁错误 ====================
    /// 获取仓库排他锁超时
    #[error("获取仓库锁超时: {path} (已等待 {waited_ms} ms)")]
    LockTimeout {
        /// 锁文件路径
        path: String,
        /// 已等待的毫秒数
        waited_ms: u64,
    },

    /// 仓库锁被其他进程持有
    #[error("仓库锁被占用: {0}")]
    LockUnavailable(String),

    // ==================== 配置错误 ====================
    /// 配置加载失败
    #[error("配置加载失败: {0}")]
    ConfigLoadFailed(String),

    /// 配置值无效
    #[error("配置值无效: '{key}' - {reason}")]
    InvalidConfigValue {
        /// 配置键
        key: String,
        /// 原因
        reason: String,
    },

    // ==================== IO 和序列化错误 ====================
    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化/反序列化错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML 序列化/反序列化错误
    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// 压缩包读写错误
    #[error("压缩包错误: {0}")]
    Zip(#[from] zip::result::ZipError),

    // ==================== 通用错误 ====================
    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),

    /// 初始化失败
    #[error("初始化失败: {0}")]
    InitFailed(String),

    /// 运行时状态不允许该操作
    #[error("运行时状态无效: {0}")]
    InvalidState(String),

    /// 其他错误
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// 运行时操作结果类型别名
pub type Result<T> = std::result::Result<T, CoreError>;

/// 状态码常量
pub mod status_code {
    /// 成功
    pub const OK: u16 = 200;

    /// 请求格式错误
    pub const BAD_REQUEST: u16 = 400;

    /// 权限不足
    pub const FORBIDDEN: u16 = 403;

    /// 未找到
    pub const NOT_FOUND: u16 = 404;

    /// 请求超时
    pub const TIMEOUT: u16 = 408;

    /// 冲突
    pub const CONFLICT: u16 = 409;

    /// 无法处理的内容
    pub const UNPROCESSABLE: u16 = 422;

    /// 内部错误
    pub const INTERNAL_ERROR: u16 = 500;

    /// 服务不可用
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

/// 错误码常量
pub mod error_code {
    // 模块错误 (MODULE-xxx)
    pub const MODULE_NOT_FOUND: &str = "MODULE-001";
    pub const MODULE_ALREADY_EXISTS: &str = "MODULE-002";
    pub const MODULE_INVALID_NAME: &str = "MODULE-003";
    pub const MODULE_LOAD_FAILED: &str = "MODULE-004";
    pub const MODULE_REVISION_NOT_FOUND: &str = "MODULE-005";
    pub const MODULE_INVALID_PACKAGE: &str = "MODULE-006";

    // Bean 错误 (BEAN-xxx)
    pub const BEAN_NOT_FOUND: &str = "BEAN-001";
    pub const BEAN_CAPABILITY_NOT_EXPOSED: &str = "BEAN-002";
    pub const BEAN_METHOD_NOT_ALLOWED: &str = "BEAN-003";

    // 仓库错误 (REPO-xxx)
    pub const REPO_LOCK_TIMEOUT: &str = "REPO-001";
    pub const REPO_LOCK_UNAVAILABLE: &str = "REPO-002";
    pub const REPO_IO_ERROR: &str = "REPO-003";

    // 配置错误 (CONFIG-xxx)
    pub const CONFIG_LOAD_FAILED: &str = "CONFIG-001";
    pub const CONFIG_INVALID_VALUE: &str = "CONFIG-002";

    // 核心错误 (CORE-xxx)
    pub const CORE_INIT_FAILED: &str = "CORE-001";
    pub const CORE_INVALID_STATE: &str = "CORE-002";
}

impl CoreError {
    /// 获取错误码
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::ModuleNotFound(_) => error_code::MODULE_NOT_FOUND,
            CoreError::ModuleAlreadyExists(_) => error_code::MODULE_ALREADY_EXISTS,
            CoreError::InvalidModuleName(_) => error_code::MODULE_INVALID_NAME,
            CoreError::LoadFailure { .. } => error_code::MODULE_LOAD_FAILED,
            CoreError::RevisionNotFound { .. } => error_code::MODULE_REVISION_NOT_FOUND,
            CoreError::InvalidPackage(_) | CoreError::InvalidManifest(_) | CoreError::Zip(_) => {
                error_code::MODULE_INVALID_PACKAGE
            }
            CoreError::BeanNotFound { .. } => error_code::BEAN_NOT_FOUND,
            CoreError::CapabilityNotExposed { .. } => error_code::BEAN_CAPABILITY_NOT_EXPOSED,
            CoreError::MethodNotAllowed { .. } => error_code::BEAN_METHOD_NOT_ALLOWED,
            CoreError::LockTimeout { .. } => error_code::REPO_LOCK_TIMEOUT,
            CoreError::LockUnavailable(_) => error_code::REPO_LOCK_UNAVAILABLE,
            CoreError::Io(_) => error_code::REPO_IO_ERROR,
            CoreError::ConfigLoadFailed(_) => error_code::CONFIG_LOAD_FAILED,
            CoreError::InvalidConfigValue { .. } => error_code::CONFIG_INVALID_VALUE,
            CoreError::InitFailed(_) => error_code::CORE_INIT_FAILED,
            CoreError::InvalidState(_) => error_code::CORE_INVALID_STATE,
            _ => "UNKNOWN",
        }
    }

    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::ModuleNotFound(_)
            | CoreError::BeanNotFound { .. }
            | CoreError::RevisionNotFound { .. } => status_code::NOT_FOUND,
            CoreError::InvalidModuleName(_)
            | CoreError::InvalidPackage(_)
            | CoreError::InvalidManifest(_)
            | CoreError::InvalidConfigValue { .. } => status_code::BAD_REQUEST,
            CoreError::ModuleAlreadyExists(_) => status_code::CONFLICT,
            CoreError::CapabilityNotExposed { .. } => status_code::UNPROCESSABLE,
            CoreError::MethodNotAllowed { .. } => status_code::FORBIDDEN,
            CoreError::LockTimeout { .. } => status_code::TIMEOUT,
            CoreError::LockUnavailable(_) | CoreError::InvalidState(_) => {
                status_code::SERVICE_UNAVAILABLE
            }
            _ => status_code::INTERNAL_ERROR,
        }
    }

    /// 是否为调用分派阶段的错误（模块或 Bean 不可用）
    pub fn is_dispatch_error(&self) -> bool {
        matches!(
            self,
            CoreError::ModuleNotFound(_)
                | CoreError::BeanNotFound { .. }
                | CoreError::CapabilityNotExposed { .. }
                | CoreError::MethodNotAllowed { .. }
        )
    }
}
