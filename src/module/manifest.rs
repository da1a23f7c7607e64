//! 模块清单解析器
//!
//! 模块包是一个 zip 压缩包，根目录下的 `module.yaml` 为清单：
//!
//! ```yaml
//! name: Greeter
//! version: 1.0.0
//! description: 问候服务
//! requires: ">=0.1"
//! beans:
//!   - name: svc
//!     factory: greeter.english
//!     properties:
//!       greeting: hello
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::OnceLock;

use crate::utils::{CoreError, Result};

/// 清单文件名
pub const MANIFEST_FILE_NAME: &str = "module.yaml";

/// 保留名称（与仓库内部目录冲突）
const RESERVED_NAMES: &[&str] = &["temp"];

/// Bean 声明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeanDefinition {
    /// Bean 名称
    pub name: String,

    /// 创建该 Bean 的工厂 ID
    pub factory: String,

    /// 传递给工厂的属性
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, serde_json::Value>,
}

impl BeanDefinition {
    /// 创建新的 Bean 声明
    pub fn new(name: impl Into<String>, factory: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            factory: factory.into(),
            properties: HashMap::new(),
        }
    }

    /// 添加属性
    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// 读取字符串属性
    pub fn string_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }
}

/// 模块清单
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// 模块名称（必填）
    #[serde(default)]
    pub name: String,

    /// 模块版本
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// 模块描述
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// 要求的运行时版本范围（semver）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<String>,

    /// Bean 声明
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub beans: Vec<BeanDefinition>,
}

impl ModuleManifest {
    /// 创建只有名称的清单
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// 设置版本
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// 设置描述
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// 添加 Bean 声明
    pub fn with_bean(mut self, bean: BeanDefinition) -> Self {
        self.beans.push(bean);
        self
    }

    /// 序列化为 YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// 模块清单解析器
#[derive(Debug, Clone, Default)]
pub struct ManifestParser;

impl ManifestParser {
    /// 从 YAML 字符串解析清单
    ///
    /// # Errors
    ///
    /// - YAML 解析失败时返回 `Yaml` 错误
    /// - 名称缺失或格式非法时返回 `InvalidModuleName`
    /// - 其他字段不合法时返回 `InvalidManifest`
    pub fn parse_str(content: &str) -> Result<ModuleManifest> {
        let manifest: ModuleManifest = serde_yaml::from_str(content)?;
        Self::validate(&manifest)?;
        Ok(manifest)
    }

    /// 从模块包字节解析清单
    pub fn parse_archive(bytes: &[u8]) -> Result<ModuleManifest> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| CoreError::InvalidPackage(format!("无法打开模块包: {}", e)))?;

        let mut entry = archive.by_name(MANIFEST_FILE_NAME).map_err(|_| {
            CoreError::InvalidPackage(format!("模块包中缺少 {}", MANIFEST_FILE_NAME))
        })?;

        let mut content = String::new();
        entry.read_to_string(&mut content)?;
        Self::parse_str(&content)
    }

    /// 从磁盘上的模块包解析清单（同步）
    pub fn parse_file(path: &Path) -> Result<ModuleManifest> {
        let bytes = std::fs::read(path)?;
        Self::parse_archive(&bytes)
    }

    /// 验证清单
    pub fn validate(manifest: &ModuleManifest) -> Result<()> {
        Self::validate_module_name(&manifest.name)?;

        let mut errors: Vec<String> = Vec::new();

        if let Some(ref requires) = manifest.requires {
            match semver::VersionReq::parse(requires) {
                Ok(req) => {
                    let current = semver::Version::parse(crate::VERSION)
                        .unwrap_or_else(|_| semver::Version::new(0, 0, 0));
                    if !req.matches(&current) {
                        errors.push(format!(
                            "模块要求运行时版本 '{}', 当前版本为 {}",
                            requires, current
                        ));
                    }
                }
                Err(_) => errors.push(format!("运行时版本要求格式无效: '{}'", requires)),
            }
        }

        let mut seen = HashSet::new();
        for (index, bean) in manifest.beans.iter().enumerate() {
            if bean.name.trim().is_empty() {
                errors.push(format!("第 {} 个 Bean 的名称不能为空", index + 1));
            } else if !seen.insert(bean.name.as_str()) {
                errors.push(format!("Bean 名称重复: '{}'", bean.name));
            }
            if bean.factory.trim().is_empty() {
                errors.push(format!("Bean '{}' 未声明工厂", bean.name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::InvalidManifest(errors.join("; ")))
        }
    }

    /// 验证模块名称
    ///
    /// 名称会作为仓库中的目录名，只允许字母数字开头，后接字母、数字、`.`、`_`、`-`。
    pub fn validate_module_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(CoreError::InvalidModuleName(
                "清单未声明模块名称".to_string(),
            ));
        }
        if !Self::is_valid_module_name(name) {
            return Err(CoreError::InvalidModuleName(format!(
                "'{}' 不是合法的模块名称",
                name
            )));
        }
        Ok(())
    }

    /// 检查模块名称格式
    pub fn is_valid_module_name(name: &str) -> bool {
        static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").ok());

        match pattern {
            Some(re) => re.is_match(name) && !RESERVED_NAMES.contains(&name),
            None => false,
        }
    }
}
