//! 模块加载器
//!
//! 负责把仓库中的模块包加载成可运行的修订：
//!
//! 1. 打开模块包并读取清单
//! 2. 由 [`ModuleLoader`] 把模块包加载为隔离的加载单元
//! 3. 由 [`BeanContextFactory`] 为加载单元创建 Bean 上下文
//! 4. 初始化 Bean 上下文
//!
//! 任何一步失败都不会向部署方抛出错误，而是得到一个 Error 状态的修订，
//! 已创建的部分会被立即清理。

use std::any::Any;
use std::fs;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::context::{BeanContext, BeanContextFactory};
use super::info::ModuleInfo;
use super::revision::ModuleRevision;
use crate::store::package::{modified_time, ModulePackage};
use crate::utils::{CoreError, Result};

/// 已加载的隔离单元
pub trait LoadedModule: Send + Sync {
    /// 加载单元在磁盘上的位置
    fn location(&self) -> Option<&Path>;

    /// 卸载，释放加载单元占用的全部资源
    fn teardown(&mut self) -> Result<()>;
}

/// 模块加载器
pub trait ModuleLoader: Send + Sync {
    /// 把模块包加载为隔离单元
    fn load(&self, package: &ModulePackage, scratch_dir: &Path) -> Result<Box<dyn LoadedModule>>;
}

/// 解压型加载器
///
/// 把模块包解压到 `<scratch>/<name>.<revision>/`，Bean 工厂可以从该目录读取资源。
#[derive(Debug, Clone, Default)]
pub struct ArchiveModuleLoader;

impl ArchiveModuleLoader {
    /// 创建加载器
    pub fn new() -> Self {
        Self
    }
}

impl ModuleLoader for ArchiveModuleLoader {
    fn load(&self, package: &ModulePackage, scratch_dir: &Path) -> Result<Box<dyn LoadedModule>> {
        let target = scratch_dir.join(format!("{}.{}", package.name, package.revision));
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::create_dir_all(&target)?;

        let entries = match extract(&package.path, &target) {
            Ok(entries) => entries,
            Err(e) => {
                let _ = fs::remove_dir_all(&target);
                return Err(e);
            }
        };

        debug!(
            module = %package.name,
            revision = package.revision,
            dir = %target.display(),
            entries,
            "模块包已解压"
        );
        let unit = ExtractedModule { dir: target };
        Ok(Box::new(unit))
    }
}

fn extract(package: &Path, target: &Path) -> Result<usize> {
    let file = fs::File::open(package)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| CoreError::InvalidPackage(format!("无法打开模块包: {}", e)))?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let relative = entry.enclosed_name().ok_or_else(|| {
            CoreError::InvalidPackage(format!("模块包条目路径越界: {}", entry.name()))
        })?;
        let out_path = target.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
    }

    Ok(archive.len())
}

/// 解压后的模块
#[derive(Debug)]
pub struct ExtractedModule {
    dir: PathBuf,
}

impl LoadedModule for ExtractedModule {
    fn location(&self) -> Option<&Path> {
        Some(&self.dir)
    }

    fn teardown(&mut self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 修订加载器
///
/// 组合模块加载器和上下文工厂，生成 [`ModuleRevision`]。所有方法都是同步的，
/// 异步调用方应放到阻塞线程池中执行。
#[derive(Clone)]
pub struct RevisionLoader {
    loader: Arc<dyn ModuleLoader>,
    contexts: Arc<dyn BeanContextFactory>,
    scratch_dir: PathBuf,
}

impl RevisionLoader {
    /// 创建修订加载器
    pub fn new(
        loader: Arc<dyn ModuleLoader>,
        contexts: Arc<dyn BeanContextFactory>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            loader,
            contexts,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// 临时目录
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// 加载修订
    ///
    /// 成功得到 Active 修订，失败得到记录了原因的 Error 修订。
    pub fn load(&self, name: &str, revision: i64, path: &Path) -> Arc<ModuleRevision> {
        let package = match ModulePackage::open(name, revision, path) {
            Ok(package) => package,
            Err(e) => return self.fail(placeholder_info(name, revision, path), &e),
        };
        let info = info_from(&package);

        let mut unit = match guarded("加载模块", || self.loader.load(&package, &self.scratch_dir)) {
            Ok(unit) => unit,
            Err(e) => return self.fail(info, &e),
        };

        let mut context = match guarded("创建 Bean 上下文", || {
            self.contexts.create_context(&package.manifest, unit.as_ref())
        }) {
            Ok(context) => context,
            Err(e) => {
                discard(unit.as_mut(), None);
                return self.fail(info, &e);
            }
        };

        if let Err(e) = guarded("初始化 Bean 上下文", || context.init()) {
            discard(unit.as_mut(), Some(context.as_mut()));
            return self.fail(info, &e);
        }

        info!(
            module = %name,
            revision,
            version = %info.version,
            beans = context.bean_names().len(),
            "修订已加载"
        );
        ModuleRevision::active(info, unit, context)
    }

    /// 生成历史记录（不加载代码）
    pub fn history(&self, name: &str, revision: i64, path: &Path) -> Arc<ModuleRevision> {
        let info = match ModulePackage::open(name, revision, path) {
            Ok(package) => info_from(&package),
            Err(e) => {
                debug!(module = %name, revision, error = %e, "历史修订清单不可读");
                placeholder_info(name, revision, path)
            }
        };
        ModuleRevision::unloaded(info)
    }

    fn fail(&self, info: ModuleInfo, error: &CoreError) -> Arc<ModuleRevision> {
        let failure = CoreError::LoadFailure {
            module: info.name.clone(),
            revision: info.revision,
            reason: error.to_string(),
        };
        warn!(error = %failure, "修订加载失败");
        ModuleRevision::failed(info, error.to_string())
    }
}

impl std::fmt::Debug for RevisionLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RevisionLoader")
            .field("scratch_dir", &self.scratch_dir)
            .finish_non_exhaustive()
    }
}

fn info_from(package: &ModulePackage) -> ModuleInfo {
    ModuleInfo::new(
        package.name.clone(),
        package.manifest.version.clone(),
        package.manifest.description.clone(),
        package.revision,
        package.modified,
    )
}

// 清单不可读时只能用文件本身的信息
fn placeholder_info(name: &str, revision: i64, path: &Path) -> ModuleInfo {
    let deployed_at = modified_time(path).unwrap_or_else(|_| chrono::Utc::now());
    ModuleInfo::new(name, None, None, revision, deployed_at)
}

fn discard(unit: &mut dyn LoadedModule, context: Option<&mut dyn BeanContext>) {
    if let Some(context) = context {
        if let Err(e) = guarded("销毁 Bean 上下文", || {
            context.destroy();
            Ok(())
        }) {
            warn!(error = %e, "清理未完成加载的上下文失败");
        }
    }
    if let Err(e) = guarded("卸载加载单元", || unit.teardown()) {
        warn!(error = %e, "清理未完成加载的模块失败");
    }
}

// 外部协作方的 panic 按普通失败处理
fn guarded<T>(step: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(CoreError::Internal(format!(
            "{}时发生 panic: {}",
            step,
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::bean::Bean;
    use crate::module::context::{BeanFactoryTable, FactoryInput, ManifestBeanContextFactory};
    use crate::module::info::RevisionState;
    use crate::module::manifest::{BeanDefinition, ModuleManifest};
    use crate::store::package::PackageBuilder;
    use tempfile::TempDir;

    struct Text(String);

    fn revision_loader(scratch: &Path) -> RevisionLoader {
        let table = Arc::new(BeanFactoryTable::new());
        table.register("text", |input: &FactoryInput<'_>| {
            let dir = input
                .location
                .ok_or_else(|| anyhow::anyhow!("module not extracted"))?;
            let text = std::fs::read_to_string(dir.join("text.txt"))?;
            Ok(Bean::builder(input.definition.name.clone(), Arc::new(Text(text))).build())
        });
        RevisionLoader::new(
            Arc::new(ArchiveModuleLoader::new()),
            Arc::new(ManifestBeanContextFactory::new(table)),
            scratch,
        )
    }

    fn write_package(dir: &Path, manifest: ModuleManifest, text: Option<&str>) -> PathBuf {
        let mut builder = PackageBuilder::new(manifest);
        if let Some(text) = text {
            builder = builder.file("text.txt", text.as_bytes().to_vec());
        }
        let path = dir.join("0.pkg");
        std::fs::write(&path, builder.build().unwrap()).unwrap();
        path
    }

    fn greeter() -> ModuleManifest {
        ModuleManifest::new("Greeter")
            .with_version("1.2.0")
            .with_description("greets people")
            .with_bean(BeanDefinition::new("svc", "text"))
    }

    #[test]
    fn test_load_active_revision() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("temp");
        let path = write_package(dir.path(), greeter(), Some("hello"));

        let revision = revision_loader(&scratch).load("Greeter", 0, &path);
        assert_eq!(revision.state(), RevisionState::Active);

        let info = revision.info();
        assert_eq!(info.version, "1.2.0");
        assert_eq!(info.description.as_deref(), Some("greets people"));

        let text = revision.get_bean("svc").unwrap().capability::<Text>().unwrap();
        assert_eq!(text.0, "hello");
        assert!(scratch.join("Greeter.0").join("text.txt").exists());

        revision.unload();
        assert_eq!(revision.state(), RevisionState::Unloaded);
        assert!(!scratch.join("Greeter.0").exists());
    }

    #[test]
    fn test_failing_bean_gives_error_revision() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("temp");
        let path = write_package(dir.path(), greeter(), None);

        let revision = revision_loader(&scratch).load("Greeter", 0, &path);
        assert_eq!(revision.state(), RevisionState::Error);
        assert!(revision.error_reason().is_some());
        assert!(revision.get_bean("svc").is_none());
        // 加载失败时已解压的内容被清理
        assert!(!scratch.join("Greeter.0").exists());
    }

    #[test]
    fn test_panicking_factory_gives_error_revision() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("temp");
        let table = Arc::new(BeanFactoryTable::new());
        table.register("boom", |_: &FactoryInput<'_>| -> anyhow::Result<Bean> {
            panic!("factory exploded")
        });
        let loader = RevisionLoader::new(
            Arc::new(ArchiveModuleLoader::new()),
            Arc::new(ManifestBeanContextFactory::new(table)),
            &scratch,
        );
        let manifest = ModuleManifest::new("Bad").with_bean(BeanDefinition::new("svc", "boom"));
        let path = write_package(dir.path(), manifest, None);

        let revision = loader.load("Bad", 0, &path);
        assert_eq!(revision.state(), RevisionState::Error);
        assert!(revision.error_reason().unwrap().contains("factory exploded"));
        assert!(!scratch.join("Bad.0").exists());
    }

    #[test]
    fn test_unreadable_package_gives_error_revision() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("0.pkg");
        std::fs::write(&path, b"not a zip").unwrap();

        let revision = revision_loader(&dir.path().join("temp")).load("Greeter", 0, &path);
        assert_eq!(revision.state(), RevisionState::Error);
        assert_eq!(revision.info().version, crate::module::info::UNKNOWN_VERSION);
    }

    #[test]
    fn test_history_entry() {
        let dir = TempDir::new().unwrap();
        let path = write_package(dir.path(), greeter(), Some("hello"));

        let revision = revision_loader(&dir.path().join("temp")).history("Greeter", 0, &path);
        assert_eq!(revision.state(), RevisionState::Unloaded);
        assert_eq!(revision.info().version, "1.2.0");
        assert!(revision.get_bean("svc").is_none());
    }
}
