//! Chips HotSwap 命令行入口
//!
//! 热替换运行时的命令行工具，提供常驻运行与仓库管理功能。
//!
//! # 命令概览
//!
//! - `run` - 启动常驻运行时
//! - `add` / `update` / `revert` / `remove` - 部署类操作
//! - `list` / `history` - 查看仓库内容
//! - `check-config` - 验证配置文件
//! - `version` - 显示版本信息
//!
//! # 使用示例
//!
//! ```bash
//! # 启动常驻运行时
//! chips-hotswap -c hotswap.yaml run
//!
//! # 部署新模块
//! chips-hotswap add greeter.pkg
//!
//! # 部署新修订、回滚到修订 0
//! chips-hotswap update Greeter greeter-v2.pkg
//! chips-hotswap revert Greeter 0
//!
//! # 查看仓库
//! chips-hotswap list
//! chips-hotswap history Greeter
//! ```
//!
//! 部署类命令只写入共享仓库，常驻运行时在下一轮巡检中加载新修订。

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::info;

use chips_hotswap::store::FileStore;
use chips_hotswap::{HotSwapRuntime, Logger, LoggerConfig, RuntimeConfig};

/// Chips HotSwap - 薯片热替换运行时
#[derive(Parser)]
#[command(name = "chips-hotswap")]
#[command(version, about = "薯片生态的热替换模块运行时", long_about = None)]
#[command(author = "Chips Team")]
#[command(propagate_version = true)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "hotswap.yaml", global = true)]
    config: PathBuf,

    /// 仓库根目录（覆盖配置文件）
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// 日志级别 (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// 开发模式（启用更详细的日志）
    #[arg(long, global = true)]
    dev: bool,

    /// 子命令
    #[command(subcommand)]
    command: Option<Commands>,
}

/// 可用的子命令
#[derive(Subcommand)]
enum Commands {
    /// 启动常驻运行时
    ///
    /// 加载仓库中的模块并周期巡检，按 Ctrl+C 优雅关闭。
    Run,

    /// 添加新模块
    Add {
        /// 模块包路径
        package: PathBuf,
    },

    /// 部署模块的新修订
    Update {
        /// 模块名称
        name: String,
        /// 模块包路径
        package: PathBuf,
    },

    /// 以旧修订的内容部署新修订
    Revert {
        /// 模块名称
        name: String,
        /// 目标修订号
        revision: i64,
    },

    /// 删除模块
    Remove {
        /// 模块名称
        name: String,
    },

    /// 列出仓库中的模块
    List,

    /// 查看模块的修订历史
    History {
        /// 模块名称
        name: String,
    },

    /// 验证配置文件
    CheckConfig {
        /// 配置文件路径（不指定则使用全局 -c 选项）
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// 查看版本信息
    Version,
}

/// 启动常驻运行时
async fn run(config: RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut runtime = HotSwapRuntime::new(config).await?;
    runtime.start().await?;

    println!();
    println!("热替换运行时已启动 (Chips HotSwap {})", chips_hotswap::VERSION);
    println!("  仓库:   {}", runtime.config().repository.root_dir.display());
    println!("  模块:   {}", runtime.module_names().await.len());
    println!("  按 Ctrl+C 优雅关闭");
    println!();

    signal::ctrl_c().await?;

    println!();
    info!("收到关闭信号，正在优雅关闭...");
    runtime.shutdown().await?;
    Ok(())
}

/// 部署类命令使用的一次性运行时
///
/// 使用独立的临时目录，启动时不会清空常驻进程的解压目录。
async fn one_shot(mut config: RuntimeConfig) -> Result<HotSwapRuntime, Box<dyn std::error::Error>> {
    config.repository.scheduler_enabled = false;
    config.repository.temp_dir = Some(std::env::temp_dir().join("chips-hotswap-cli"));

    let mut runtime = HotSwapRuntime::new(config).await?;
    runtime.start().await?;
    Ok(runtime)
}

async fn deploy(
    config: RuntimeConfig,
    command: Commands,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut runtime = one_shot(config).await?;

    let result = match command {
        Commands::Add { package } => runtime.add_module_file(&package).await.map(Some),
        Commands::Update { name, package } => {
            runtime.update_module_file(&name, &package).await.map(Some)
        }
        Commands::Revert { name, revision } => {
            runtime.revert_module(&name, revision).await.map(Some)
        }
        Commands::Remove { name } => runtime.remove_module(&name).await.map(|_| {
            println!("✅ 已删除模块 {}", name);
            None
        }),
        _ => Ok(None),
    };

    runtime.shutdown().await?;

    if let Some(info) = result? {
        println!("✅ 已写入 {}#{}", info.name, info.revision);
        println!("   版本: {}", info.version);
        if let Some(ref reason) = info.error_reason {
            println!("   ⚠️  本进程加载失败: {}", reason);
        }
    }
    Ok(())
}

/// 列出仓库中的模块（直接读取磁盘，不加载模块）
async fn list(config: &RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileStore::new(&config.repository);
    let names = store.module_names_on_disk().await?;

    println!();
    println!("仓库: {}", store.root().display());
    println!("═══════════════════════════════════════");
    if names.is_empty() {
        println!("  (空)");
    }
    for name in names {
        let revisions = store.revisions_on_disk(&name).await?;
        match revisions.last() {
            Some(last) => println!("  {:<24} 当前修订 {:<4} 共 {} 个修订", name, last, revisions.len()),
            None => println!("  {:<24} (无修订)", name),
        }
    }
    println!("═══════════════════════════════════════");
    Ok(())
}

/// 查看模块的修订历史（直接读取磁盘，不加载模块）
async fn history(config: &RuntimeConfig, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileStore::new(&config.repository);
    let revisions = store.revisions_on_disk(name).await?;
    if revisions.is_empty() {
        return Err(format!("模块未找到: '{}'", name).into());
    }

    println!();
    println!("{} 的修订历史", name);
    println!("────────────────────────────────────────");
    for revision in revisions.iter().rev() {
        let path = store.package_path(name, *revision);
        let version = chips_hotswap::module::ManifestParser::parse_archive(&tokio::fs::read(&path).await?)
            .ok()
            .and_then(|m| m.version)
            .unwrap_or_else(|| chips_hotswap::module::UNKNOWN_VERSION.to_string());
        println!("  #{:<4} 版本 {:<12} {}", revision, version, path.display());
    }
    println!("────────────────────────────────────────");
    Ok(())
}

/// 检查配置文件
async fn check_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("检查配置文件: {}", path.display());
    println!();

    if !path.exists() {
        println!("⚠️  警告: 配置文件不存在，将使用默认配置");
        println!();
        print_config(&RuntimeConfig::default());
        return Ok(());
    }

    match RuntimeConfig::from_file(path).await {
        Ok(config) => {
            println!("✅ 配置文件有效！");
            println!();
            print_config(&config);
            Ok(())
        }
        Err(e) => {
            println!("❌ 配置文件无效: {}", e);
            Err(Box::new(e))
        }
    }
}

fn print_config(config: &RuntimeConfig) {
    let repo = &config.repository;
    println!("配置内容:");
    println!("────────────────────────────────────────");
    println!("  [仓库配置]");
    println!("    根目录:         {}", repo.root_dir.display());
    println!("    临时目录:       {}", repo.effective_temp_dir().display());
    println!("    巡检间隔:       {} ms", repo.check_interval_ms);
    println!("    首次巡检延迟:   {} ms", repo.initial_delay_ms);
    println!("    锁超时:         {} ms", repo.lock_timeout_ms);
    println!("    周期巡检:       {}", if repo.scheduler_enabled { "启用" } else { "禁用" });
    println!();
    println!("  [日志配置]");
    println!("    日志级别:       {}", config.logging.level);
    println!("    文件输出:       {}", if config.logging.file_output { "是" } else { "否" });
    println!("    JSON 格式:      {}", if config.logging.json_format { "是" } else { "否" });
    println!();
    println!("  [其他]");
    println!("    开发模式:       {}", if config.dev_mode { "是" } else { "否" });
    println!("────────────────────────────────────────");
}

/// 打印版本信息
fn print_version() {
    println!();
    println!("Chips HotSwap - 薯片热替换运行时");
    println!("═══════════════════════════════════════");
    println!("  版本:             {}", chips_hotswap::VERSION);
    println!("  目标平台:         {}", std::env::consts::ARCH);
    println!("  操作系统:         {}", std::env::consts::OS);
    println!("═══════════════════════════════════════");
    println!();
}

/// 加载配置文件，命令行参数优先
async fn load_config(cli: &Cli) -> Result<RuntimeConfig, Box<dyn std::error::Error>> {
    let mut config = if cli.config.exists() {
        RuntimeConfig::from_file(&cli.config).await?
    } else {
        RuntimeConfig::default()
    };

    if let Some(ref root) = cli.root {
        config.repository.root_dir = root.clone();
    }
    if cli.log_level != "info" {
        config.logging.level = cli.log_level.clone();
    }
    if cli.dev {
        config.dev_mode = true;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            print_version();
            return Ok(());
        }
        Some(Commands::CheckConfig { ref config }) => {
            let path = config.clone().unwrap_or_else(|| cli.config.clone());
            return check_config(&path).await;
        }
        _ => {}
    }

    let config = load_config(&cli).await?;

    let mut logger = LoggerConfig::from_log_config(&config.logging);
    if config.dev_mode {
        // 开发模式：显示更多信息
        logger.level = "debug".to_string();
        logger.show_thread_ids = true;
    }
    let _log_guard = Logger::init(logger)?;

    if config.config_path.is_some() {
        info!("已加载配置文件: {}", cli.config.display());
    }

    match cli.command {
        Some(Commands::Run) | None => run(config).await?,
        Some(Commands::List) => list(&config).await?,
        Some(Commands::History { ref name }) => history(&config, name).await?,
        Some(command) => deploy(config, command).await?,
    }

    Ok(())
}
