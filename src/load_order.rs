use crate::utils::PatchError;
use crate::SUPPORTED_EXTENSIONS;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// 加载顺序中的一个条目
#[derive(Debug, Clone)]
pub struct LoadOrderEntry {
    /// 插件文件名（不含目录）
    pub name: String,
    /// 插件完整路径
    pub path: PathBuf,
}

/// 加载顺序
///
/// 外部提供的活动插件有序列表，越靠后合并优先级越高。
/// 不允许重复文件；主文件先于依赖者的约束在扫描阶段
/// （主文件列表已知时）由解析器校验。
#[derive(Debug, Clone)]
pub struct LoadOrder {
    entries: Vec<LoadOrderEntry>,
}

impl LoadOrder {
    /// 从路径列表构造加载顺序
    ///
    /// 校验：文件名不重复（大小写不敏感）、扩展名受支持、不超过255个。
    pub fn new(paths: Vec<PathBuf>) -> Result<Self, PatchError> {
        if paths.is_empty() {
            return Err(PatchError::InvalidLoadOrder {
                reason: "加载顺序为空".to_string(),
            });
        }
        if paths.len() > 255 {
            return Err(PatchError::InvalidLoadOrder {
                reason: format!("加载顺序最多255个插件，实际 {}", paths.len()),
            });
        }

        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(paths.len());

        for path in paths {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| PatchError::InvalidLoadOrder {
                    reason: format!("无法获取插件文件名: {:?}", path),
                })?
                .to_string();

            let extension = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.to_lowercase());
            if !SUPPORTED_EXTENSIONS
                .iter()
                .any(|&ext| Some(ext) == extension.as_deref())
            {
                return Err(PatchError::InvalidLoadOrder {
                    reason: format!("{} 不是ESP、ESM或ESL文件", name),
                });
            }

            if !seen.insert(name.to_lowercase()) {
                return Err(PatchError::InvalidLoadOrder {
                    reason: format!("插件 {} 在加载顺序中重复出现", name),
                });
            }

            entries.push(LoadOrderEntry { name, path });
        }

        Ok(LoadOrder { entries })
    }

    /// 从加载顺序文件构造
    ///
    /// 文件每行一个插件路径（相对路径基于该文件所在目录），
    /// 空行和以 # 开头的行被忽略。
    pub fn from_file(path: &Path) -> Result<Self, PatchError> {
        let content = std::fs::read_to_string(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        let paths: Vec<PathBuf> = content
            .lines()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| {
                let p = PathBuf::from(line);
                if p.is_absolute() {
                    p
                } else {
                    base_dir.join(p)
                }
            })
            .collect();

        Self::new(paths)
    }

    /// 条目迭代器（按加载顺序）
    pub fn iter(&self) -> impl Iterator<Item = &LoadOrderEntry> {
        self.entries.iter()
    }

    /// 插件名迭代器（按加载顺序）
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// 查找插件的加载顺序位置（大小写不敏感）
    pub fn index_of(&self, name: &str) -> Option<u8> {
        let lower = name.to_lowercase();
        self.entries
            .iter()
            .position(|e| e.name.to_lowercase() == lower)
            .map(|i| i as u8)
    }

    /// 按位置取条目
    pub fn get(&self, index: u8) -> Option<&LoadOrderEntry> {
        self.entries.get(index as usize)
    }

    /// 插件数量
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
