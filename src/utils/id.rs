//! 标识符生成
//!
//! - 代理句柄 ID：10 位 62 进制字符串（0-9, a-z, A-Z），用于日志关联
//! - 暂存文件名、运行时解压目录名：基于 UUID v4，保证多进程共享临时目录时不冲突

use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// 62 进制字符集
const BASE62_CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// 代理 ID 长度
const PROXY_ID_LENGTH: usize = 10;

/// 生成 10 位 62 进制代理 ID
///
/// 使用时间戳与随机数组合
///
/// # Example
///
/// ```
/// use chips_hotswap::utils::id::generate_proxy_id;
///
/// let id = generate_proxy_id();
/// assert_eq!(id.len(), 10);
/// ```
pub fn generate_proxy_id() -> String {
    let mut rng = rand::thread_rng();

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let random: u64 = rng.gen();

    let mut value = timestamp ^ random;
    let mut result = String::with_capacity(PROXY_ID_LENGTH);
    for _ in 0..PROXY_ID_LENGTH {
        result.insert(0, BASE62_CHARS[(value % 62) as usize] as char);
        value /= 62;
    }
    result
}

/// 校验代理 ID 格式
pub fn is_valid_proxy_id(id: &str) -> bool {
    id.len() == PROXY_ID_LENGTH && id.chars().all(|c| c.is_ascii_alphanumeric())
}

/// 生成暂存文件名
///
/// 上传的模块包在读取清单前先写入临时目录，文件名形如 `upload-<uuid>.pkg`
pub fn staging_file_name() -> String {
    format!("upload-{}.pkg", uuid::Uuid::new_v4())
}

/// 生成运行时实例独占的解压目录名，形如 `runtime-<uuid>`
pub fn scratch_dir_name() -> String {
    format!("runtime-{}", uuid::Uuid::new_v4().simple())
}
