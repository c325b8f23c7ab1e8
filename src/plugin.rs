use crate::datatypes::{read_u32, RawString, RecordFlags};
use crate::group::Group;
use crate::record::Record;
use crate::subrecord::Subrecord;
use crate::utils::PatchError;
use memmap2::Mmap;
use rayon::prelude::*;
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;

/// ESP插件文件模型
///
/// 一个插件 = TES4头部记录（作者、描述、主文件列表）+ 顶级组树。
/// 主文件列表的顺序是本地FormID翻译的基础，未修改文件写回时
/// 必须逐字节保留。
#[derive(Debug)]
pub struct Plugin {
    /// 插件文件名
    pub name: String,
    /// 文件路径（合成插件为None）
    pub path: Option<PathBuf>,
    /// 头部记录
    pub header: Record,
    /// 顶级组列表
    pub groups: Vec<Group>,
    /// 主文件列表（顺序有意义）
    pub masters: Vec<String>,
    /// 内存映射文件（零拷贝访问文件数据）
    #[allow(dead_code)]
    mmap: Option<Arc<Mmap>>,
}

impl Plugin {
    /// 加载插件文件
    ///
    /// 流式解码：头部记录、主文件列表、组/记录树。
    /// 除构建内存树外没有副作用。
    pub fn load(path: PathBuf) -> Result<Self, PatchError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("<unknown>")
            .to_string();

        // 内存映射文件（零拷贝）
        let file = std::fs::File::open(&path).map_err(|e| PatchError::Io(e).with_file(&name))?;
        let mmap = unsafe { Mmap::map(&file).map_err(PatchError::Io)? };
        let mmap = Arc::new(mmap);

        let mut cursor = Cursor::new(&mmap[..]);

        let header = Record::parse(&mut cursor).map_err(|e| e.with_file(&name))?;
        Self::validate_header(&header, &name)?;

        let masters = Self::extract_masters(&header);
        let groups = Self::parse_groups(&mut cursor, &mmap[..]).map_err(|e| e.with_file(&name))?;

        Ok(Plugin {
            name,
            path: Some(path),
            header,
            groups,
            masters,
            mmap: Some(mmap),
        })
    }

    /// 合成新插件（用于补丁输出）
    ///
    /// 构造TES4头部（HEDR/CNAM/SNAM/MAST/DATA）+ 给定的组树。
    pub fn synthesize(
        name: &str,
        author: &str,
        description: &str,
        masters: Vec<String>,
        groups: Vec<Group>,
    ) -> Self {
        let record_count: u32 = groups.iter().map(|g| g.get_records().len() as u32).sum();

        let mut subrecords = Vec::new();

        // HEDR: 版本 + 记录数 + 下一个可用ObjectID
        let mut hedr = Vec::with_capacity(12);
        hedr.extend_from_slice(&1.71f32.to_le_bytes());
        hedr.extend_from_slice(&record_count.to_le_bytes());
        hedr.extend_from_slice(&0x0800u32.to_le_bytes());
        subrecords.push(Subrecord::new("HEDR", hedr));

        subrecords.push(Subrecord::new("CNAM", RawString::encode_zstring(author)));
        subrecords.push(Subrecord::new("SNAM", RawString::encode_zstring(description)));

        for master in &masters {
            subrecords.push(Subrecord::new("MAST", RawString::encode_zstring(master)));
            // DATA: 主文件大小占位（8字节，游戏忽略）
            subrecords.push(Subrecord::new("DATA", vec![0u8; 8]));
        }

        let header = Record::new("TES4", 0, subrecords);

        Plugin {
            name: name.to_string(),
            path: None,
            header,
            groups,
            masters,
            mmap: None,
        }
    }

    /// 验证头部记录
    fn validate_header(header: &Record, name: &str) -> Result<(), PatchError> {
        if !matches!(header.signature.as_str(), "TES4" | "TES3") {
            return Err(PatchError::Format {
                file: name.to_string(),
                signature: header.signature.clone(),
                offset: 0,
                reason: "插件头部不是TES4记录".to_string(),
            });
        }
        Ok(())
    }

    /// 解析所有顶级组（并行版本）
    fn parse_groups(cursor: &mut Cursor<&[u8]>, data: &[u8]) -> Result<Vec<Group>, PatchError> {
        // 第一遍：快速扫描获取所有顶级组边界
        let group_ranges = Self::scan_group_boundaries(cursor, data)?;

        if group_ranges.is_empty() {
            return Ok(Vec::new());
        }

        // 第二遍：并行解析每个组
        let groups: Result<Vec<Group>, PatchError> = group_ranges
            .par_iter()
            .map(|&(start, size)| -> Result<Group, PatchError> {
                let end = start + size as u64;
                if end > data.len() as u64 {
                    return Err(PatchError::format(
                        "GRUP",
                        start,
                        format!("组边界超出数据范围: {}..{} (数据长度: {})", start, end, data.len()),
                    ));
                }
                let group_data = &data[start as usize..end as usize];
                let mut group_cursor = Cursor::new(group_data);
                Group::parse(&mut group_cursor)
            })
            .collect();

        groups
    }

    /// 扫描顶级组边界（用于并行解析）
    fn scan_group_boundaries(
        cursor: &mut Cursor<&[u8]>,
        data: &[u8],
    ) -> Result<Vec<(u64, u32)>, PatchError> {
        let mut boundaries = Vec::new();
        let start_pos = cursor.position();

        while cursor.position() < data.len() as u64 {
            let pos = cursor.position();

            // 组头部至少8字节：类型4字节+大小4字节
            if pos + 8 > data.len() as u64 {
                break;
            }

            let mut type_bytes = [0u8; 4];
            if cursor.read_exact(&mut type_bytes).is_err() {
                break;
            }

            if &type_bytes != b"GRUP" {
                return Err(PatchError::format(
                    String::from_utf8_lossy(&type_bytes).into_owned(),
                    pos,
                    "顶级元素必须是GRUP",
                ));
            }

            let size = read_u32(cursor)?;

            if !(24..=200_000_000).contains(&size) {
                return Err(PatchError::format(
                    "GRUP",
                    pos,
                    format!("发现异常组大小: {} bytes", size),
                ));
            }

            boundaries.push((pos, size));
            cursor.set_position(pos + size as u64);
        }

        cursor.set_position(start_pos);
        Ok(boundaries)
    }

    /// 从头部记录提取主文件列表
    fn extract_masters(header: &Record) -> Vec<String> {
        header
            .subrecords
            .iter()
            .filter(|sr| sr.signature == "MAST")
            .map(|sr| RawString::parse_zstring(&sr.data).content)
            .collect()
    }

    /// 序列化为字节流
    ///
    /// 未被修改的记录逐字节透传（合并中绝大多数记录不被触碰，
    /// 这是关键不变量）。
    pub fn to_bytes(&self) -> Result<Vec<u8>, PatchError> {
        let mut output = Vec::new();
        self.header.encode(&mut output)?;
        for group in &self.groups {
            group.encode(&mut output)?;
        }
        Ok(output)
    }

    /// 写入文件
    pub fn write_to_file(&self, path: &std::path::Path) -> Result<(), PatchError> {
        let bytes = self.to_bytes()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// 获取插件名称
    pub fn get_name(&self) -> &str {
        &self.name
    }

    /// 获取作者（CNAM）
    pub fn get_author(&self) -> Option<String> {
        self.header
            .find_subrecord("CNAM")
            .map(|sr| RawString::parse_zstring(&sr.data).content)
    }

    /// 获取描述（SNAM）
    pub fn get_description(&self) -> Option<String> {
        self.header
            .find_subrecord("SNAM")
            .map(|sr| RawString::parse_zstring(&sr.data).content)
    }

    /// 是否为主文件
    pub fn is_master(&self) -> bool {
        self.header.flags & RecordFlags::MASTER_FILE.bits() != 0
            || self
                .path
                .as_ref()
                .and_then(|p| p.extension())
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.to_lowercase() == "esm")
                .unwrap_or(false)
    }

    /// 是否本地化
    pub fn is_localized(&self) -> bool {
        self.header.flags & RecordFlags::LOCALIZED.bits() != 0
    }

    /// 是否为轻量插件 (Light Plugin/ESL)
    pub fn is_light(&self) -> bool {
        if let Some(ext) = self.path.as_ref().and_then(|p| p.extension()) {
            if ext.to_string_lossy().to_lowercase() == "esl" {
                return true;
            }
        }
        self.header.flags & RecordFlags::LIGHT_MASTER.bits() != 0
    }

    /// 获取所有记录（递归，不含头部）
    pub fn all_records(&self) -> Vec<&Record> {
        self.groups.iter().flat_map(|g| g.get_records()).collect()
    }

    /// 获取统计信息
    pub fn get_stats(&self) -> PluginStats {
        PluginStats {
            name: self.get_name().to_string(),
            is_master: self.is_master(),
            is_light: self.is_light(),
            master_count: self.masters.len(),
            group_count: self.count_total_groups(),
            record_count: self.count_records(),
        }
    }

    /// 统计记录数量（含头部）
    fn count_records(&self) -> usize {
        1 + self.all_records().len()
    }

    /// 统计总组数
    fn count_total_groups(&self) -> usize {
        fn count_subgroups(group: &Group) -> usize {
            group
                .children
                .iter()
                .map(|child| match child {
                    crate::group::GroupChild::Group(subgroup) => 1 + count_subgroups(subgroup),
                    crate::group::GroupChild::Record(_) => 0,
                })
                .sum()
        }

        self.groups.len() + self.groups.iter().map(count_subgroups).sum::<usize>()
    }
}

/// 插件统计信息
pub struct PluginStats {
    pub name: String,
    pub is_master: bool,
    pub is_light: bool,
    pub master_count: usize,
    pub group_count: usize,
    pub record_count: usize,
}

impl std::fmt::Display for PluginStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== 插件统计信息 ===")?;
        writeln!(f, "名称: {}", self.name)?;
        writeln!(f, "主文件: {}", if self.is_master { "是" } else { "否" })?;
        writeln!(f, "轻量插件: {}", if self.is_light { "是" } else { "否" })?;
        writeln!(f, "依赖主文件数: {}", self.master_count)?;
        writeln!(f, "组数量: {}", self.group_count)?;
        writeln!(f, "记录数量: {}", self.record_count)?;
        Ok(())
    }
}
