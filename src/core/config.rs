//! 运行时配置
//!
//! 定义热替换运行时的配置结构和加载逻辑。

use crate::utils::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// 排他锁重试的最大轮询间隔（毫秒）
pub const MAX_LOCK_POLL_INTERVAL_MS: u64 = 250;

/// 模块仓库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// 仓库根目录
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// 临时目录（默认 `<root>/temp`，启动时清空）
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// 巡检间隔（毫秒）
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    /// 启动后首次巡检延迟（毫秒）
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// 排他锁获取超时（毫秒）
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// 排他锁重试轮询间隔（毫秒，不超过 250）
    #[serde(default = "default_lock_poll_interval_ms")]
    pub lock_poll_interval_ms: u64,

    /// 是否启动周期巡检
    #[serde(default = "default_true")]
    pub scheduler_enabled: bool,
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("hotModules")
}

fn default_check_interval_ms() -> u64 {
    15_000
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

fn default_lock_poll_interval_ms() -> u64 {
    MAX_LOCK_POLL_INTERVAL_MS
}

fn default_true() -> bool {
    true
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            temp_dir: None,
            check_interval_ms: default_check_interval_ms(),
            initial_delay_ms: default_initial_delay_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_poll_interval_ms: default_lock_poll_interval_ms(),
            scheduler_enabled: true,
        }
    }
}

impl RepositoryConfig {
    /// 实际使用的临时目录
    pub fn effective_temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("temp"))
    }

    /// 巡检间隔
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// 首次巡检延迟
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// 排他锁获取超时
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// 排他锁轮询间隔（上限 250 ms）
    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms.min(MAX_LOCK_POLL_INTERVAL_MS))
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 是否输出到文件
    #[serde(default)]
    pub file_output: bool,

    /// 日志文件目录
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json_format: bool,

    /// 日志轮转策略
    #[serde(default = "default_rotation")]
    pub rotation: String,

    /// 附加过滤指令
    #[serde(default)]
    pub filter_directives: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotation() -> String {
    "daily".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: false,
            log_dir: None,
            json_format: false,
            rotation: default_rotation(),
            filter_directives: None,
        }
    }
}

/// 运行时配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// 配置文件路径
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    /// 模块仓库配置
    #[serde(default)]
    pub repository: RepositoryConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LogConfig,

    /// 是否为开发模式
    #[serde(default)]
    pub dev_mode: bool,
}

impl RuntimeConfig {
    /// 创建配置构建器
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// 从文件加载配置（`.json` 按 JSON 解析，其余按 YAML）
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            CoreError::ConfigLoadFailed(format!("{}: {}", path.display(), e))
        })?;

        let mut config: RuntimeConfig = if path.extension().map(|e| e == "json").unwrap_or(false) {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };

        config.config_path = Some(path);
        config.validate()?;
        Ok(config)
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        let repo = &self.repository;
        if repo.root_dir.as_os_str().is_empty() {
            return Err(invalid("repository.root_dir", "不能为空"));
        }
        if repo.check_interval_ms == 0 {
            return Err(invalid("repository.check_interval_ms", "必须大于 0"));
        }
        if repo.lock_poll_interval_ms == 0 || repo.lock_poll_interval_ms > MAX_LOCK_POLL_INTERVAL_MS {
            return Err(invalid(
                "repository.lock_poll_interval_ms",
                "取值范围为 1..=250",
            ));
        }
        if repo.lock_timeout_ms < repo.lock_poll_interval_ms {
            return Err(invalid(
                "repository.lock_timeout_ms",
                "不能小于轮询间隔",
            ));
        }
        Ok(())
    }

    /// 合并另一个配置（只覆盖非默认值）
    pub fn merge(&mut self, other: RuntimeConfig) {
        let defaults = RepositoryConfig::default();
        if other.repository.root_dir != defaults.root_dir {
            self.repository.root_dir = other.repository.root_dir;
        }
        if other.repository.temp_dir.is_some() {
            self.repository.temp_dir = other.repository.temp_dir;
        }
        if other.repository.check_interval_ms != defaults.check_interval_ms {
            self.repository.check_interval_ms = other.repository.check_interval_ms;
        }
        if other.repository.initial_delay_ms != defaults.initial_delay_ms {
            self.repository.initial_delay_ms = other.repository.initial_delay_ms;
        }
        if other.repository.lock_timeout_ms != defaults.lock_timeout_ms {
            self.repository.lock_timeout_ms = other.repository.lock_timeout_ms;
        }
        if !other.repository.scheduler_enabled {
            self.repository.scheduler_enabled = false;
        }
        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
        if other.logging.file_output {
            self.logging.file_output = true;
            self.logging.log_dir = other.logging.log_dir;
        }
        if other.logging.json_format {
            self.logging.json_format = true;
        }
        if other.dev_mode {
            self.dev_mode = true;
        }
    }
}

fn invalid(key: &str, reason: &str) -> CoreError {
    CoreError::InvalidConfigValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// 创建新的构建器
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置仓库根目录
    pub fn root_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.repository.root_dir = dir.into();
        self
    }

    /// 设置临时目录
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.repository.temp_dir = Some(dir.into());
        self
    }

    /// 设置巡检间隔（毫秒）
    pub fn check_interval_ms(mut self, ms: u64) -> Self {
        self.config.repository.check_interval_ms = ms;
        self
    }

    /// 设置首次巡检延迟（毫秒）
    pub fn initial_delay_ms(mut self, ms: u64) -> Self {
        self.config.repository.initial_delay_ms = ms;
        self
    }

    /// 设置排他锁超时（毫秒）
    pub fn lock_timeout_ms(mut self, ms: u64) -> Self {
        self.config.repository.lock_timeout_ms = ms;
        self
    }

    /// 设置排他锁轮询间隔（毫秒）
    pub fn lock_poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.repository.lock_poll_interval_ms = ms;
        self
    }

    /// 关闭周期巡检
    pub fn without_scheduler(mut self) -> Self {
        self.config.repository.scheduler_enabled = false;
        self
    }

    /// 设置日志级别
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// 启用文件日志
    pub fn file_logging(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.config.logging.file_output = true;
        self.config.logging.log_dir = Some(log_dir.into());
        self
    }

    /// 启用 JSON 格式日志
    pub fn json_logging(mut self) -> Self {
        self.config.logging.json_format = true;
        self
    }

    /// 启用开发模式
    pub fn dev_mode(mut self) -> Self {
        self.config.dev_mode = true;
        self
    }

    /// 构建配置
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}
