//! 模块包
//!
//! 模块包是带 `module.yaml` 清单的 zip 压缩包。本模块提供磁盘上模块包的
//! 描述 [`ModulePackage`]，以及生成模块包的 [`PackageBuilder`]。

use chrono::{DateTime, Utc};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use crate::module::manifest::{ManifestParser, ModuleManifest, MANIFEST_FILE_NAME};
use crate::utils::{CoreError, Result};

/// 仓库中某个修订的模块包
#[derive(Debug, Clone)]
pub struct ModulePackage {
    /// 模块名称
    pub name: String,
    /// 修订号
    pub revision: i64,
    /// 包文件路径
    pub path: PathBuf,
    /// 清单
    pub manifest: ModuleManifest,
    /// 包文件修改时间（即部署时间）
    pub modified: DateTime<Utc>,
}

impl ModulePackage {
    /// 打开磁盘上的模块包并读取清单（同步）
    ///
    /// # Errors
    ///
    /// - 文件不可读或不是合法模块包时返回相应错误
    /// - 清单名称与所在模块目录不一致时返回 `InvalidModuleName`
    pub fn open(name: &str, revision: i64, path: &Path) -> Result<Self> {
        let manifest = ManifestParser::parse_file(path)?;
        if manifest.name != name {
            return Err(CoreError::InvalidModuleName(format!(
                "模块包 {} 声明的名称 '{}' 与模块 '{}' 不一致",
                path.display(),
                manifest.name,
                name
            )));
        }

        Ok(Self {
            name: name.to_string(),
            revision,
            path: path.to_path_buf(),
            manifest,
            modified: modified_time(path)?,
        })
    }
}

/// 读取文件修改时间
pub fn modified_time(path: &Path) -> Result<DateTime<Utc>> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(DateTime::<Utc>::from(modified))
}

/// 模块包构建器
///
/// ```rust
/// use chips_hotswap::module::manifest::{BeanDefinition, ModuleManifest};
/// use chips_hotswap::store::PackageBuilder;
///
/// let bytes = PackageBuilder::new(
///     ModuleManifest::new("Greeter").with_bean(BeanDefinition::new("svc", "greeter.english")),
/// )
/// .file("greeting.txt", b"hello".to_vec())
/// .build()
/// .unwrap();
/// assert!(!bytes.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    manifest: ModuleManifest,
    files: Vec<(String, Vec<u8>)>,
}

impl PackageBuilder {
    /// 以清单创建构建器
    pub fn new(manifest: ModuleManifest) -> Self {
        Self {
            manifest,
            files: Vec::new(),
        }
    }

    /// 添加附带文件
    pub fn file(mut self, name: impl Into<String>, content: Vec<u8>) -> Self {
        self.files.push((name.into(), content));
        self
    }

    /// 生成 zip 字节
    pub fn build(self) -> Result<Vec<u8>> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::FileOptions::<()>::default()
            .compression_method(zip::CompressionMethod::Deflated);

        zip.start_file(MANIFEST_FILE_NAME, options)?;
        zip.write_all(self.manifest.to_yaml()?.as_bytes())?;

        for (name, content) in &self.files {
            zip.start_file(name.as_str(), options)?;
            zip.write_all(content)?;
        }

        Ok(zip.finish()?.into_inner())
    }
}
