use thiserror::Error;
use std::path::Path;

/// 自定义错误类型
///
/// 四种命名错误（Format / MissingMaster / MergeConflict /
/// UnsupportedCompression）都会中止整个补丁构建，没有部分成功模式。
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("格式错误 [{file} {signature} @0x{offset:X}]: {reason}")]
    Format {
        file: String,
        signature: String,
        offset: u64,
        reason: String,
    },

    #[error("主文件引用越界 [{file}]: 索引 0x{index:02X} 超出主文件列表长度 {master_count}")]
    MissingMaster {
        file: String,
        index: u8,
        master_count: usize,
    },

    #[error("合并标签冲突 [{tag}]: 补丁器 {first} 与 {second} 声明了同一标签")]
    MergeConflict {
        tag: String,
        first: String,
        second: String,
    },

    #[error("压缩数据无法处理 [{file} {signature}]: {reason}")]
    UnsupportedCompression {
        file: String,
        signature: String,
        reason: String,
    },

    #[error("加载顺序无效: {reason}")]
    InvalidLoadOrder { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PatchError {
    /// 构造格式错误（文件名由上层补充）
    pub fn format(signature: impl Into<String>, offset: u64, reason: impl Into<String>) -> Self {
        PatchError::Format {
            file: String::new(),
            signature: signature.into(),
            offset,
            reason: reason.into(),
        }
    }

    /// 补充出错文件名
    ///
    /// 解码层不知道文件名，由 Plugin / Pipeline 在传播时填入。
    pub fn with_file(mut self, name: &str) -> Self {
        match &mut self {
            PatchError::Format { file, .. }
            | PatchError::UnsupportedCompression { file, .. }
            | PatchError::MissingMaster { file, .. } => {
                if file.is_empty() {
                    *file = name.to_string();
                }
            }
            _ => {}
        }
        self
    }
}

/// 创建文件备份
///
/// 覆盖已有补丁文件之前调用，备份名带时间戳。
pub fn create_backup(file_path: &Path) -> Result<std::path::PathBuf, PatchError> {
    if !file_path.exists() {
        return Err(PatchError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "原文件不存在",
        )));
    }

    let timestamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S");
    let backup_path = file_path.with_extension(format!("{}.bak", timestamp));

    std::fs::copy(file_path, &backup_path).map_err(PatchError::Io)?;

    Ok(backup_path)
}
