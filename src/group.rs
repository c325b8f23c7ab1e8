use crate::datatypes::{read_i32, read_u16, read_u32};
use crate::record::Record;
use crate::utils::PatchError;
use std::io::{Cursor, Read};

/// 组头部固定大小
pub const GROUP_HEADER_SIZE: u64 = 24;

/// 组类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupType {
    /// 顶级组（按记录签名分组）
    Normal,
    /// 世界组
    World,
    /// 单元格组
    Cell,
    /// 未知类型
    Unknown(i32),
}

impl GroupType {
    /// 转换为i32值
    pub fn to_i32(&self) -> i32 {
        match self {
            GroupType::Normal => 0,
            GroupType::World => 1,
            GroupType::Cell => 6,
            GroupType::Unknown(value) => *value,
        }
    }
}

impl From<i32> for GroupType {
    fn from(value: i32) -> Self {
        match value {
            0 => GroupType::Normal,
            1 => GroupType::World,
            6 => GroupType::Cell,
            _ => GroupType::Unknown(value),
        }
    }
}

/// 组结构
#[derive(Debug, Clone)]
pub struct Group {
    /// 组大小(包含头部24字节)
    pub size: u32,
    /// 标签（顶级组为记录签名）
    pub label: [u8; 4],
    /// 组类型
    pub group_type: GroupType,
    /// 时间戳
    pub timestamp: u16,
    /// 版本控制信息
    pub version_control_info: u16,
    /// 未知字段
    pub unknown: u32,
    /// 子元素
    pub children: Vec<GroupChild>,
}

/// 组子元素
#[derive(Debug, Clone)]
pub enum GroupChild {
    /// 子组
    Group(Box<Group>),
    /// 记录
    Record(Record),
}

impl Group {
    /// 构造顶级组（用于合成补丁输出）
    pub fn new_top_level(signature: &str) -> Self {
        let mut label = [0u8; 4];
        let src = signature.as_bytes();
        label[..src.len().min(4)].copy_from_slice(&src[..src.len().min(4)]);

        Group {
            size: 0,
            label,
            group_type: GroupType::Normal,
            timestamp: 0,
            version_control_info: 0,
            unknown: 0,
            children: Vec::new(),
        }
    }

    /// 解析组
    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self, PatchError> {
        let start = cursor.position();

        // 检查是否有足够的数据读取头部
        if start + GROUP_HEADER_SIZE > cursor.get_ref().len() as u64 {
            return Err(PatchError::format(
                "GRUP",
                start,
                "Insufficient data for group header",
            ));
        }

        // 读取组头部(24字节)
        let mut type_bytes = [0u8; 4];
        cursor.read_exact(&mut type_bytes)?;

        if &type_bytes != b"GRUP" {
            return Err(PatchError::format(
                String::from_utf8_lossy(&type_bytes).into_owned(),
                start,
                "Expected GRUP",
            ));
        }

        let size = read_u32(cursor)?;

        if size > 200_000_000 {
            // 200MB限制
            return Err(PatchError::format(
                "GRUP",
                start,
                format!("组大小异常: {} bytes (可能数据损坏)", size),
            ));
        }
        if (size as u64) < GROUP_HEADER_SIZE {
            return Err(PatchError::format(
                "GRUP",
                start,
                format!("组大小太小: {} bytes (最小应为24字节)", size),
            ));
        }

        let mut label = [0u8; 4];
        cursor.read_exact(&mut label)?;
        let group_type = GroupType::from(read_i32(cursor)?);
        let timestamp = read_u16(cursor)?;
        let version_control_info = read_u16(cursor)?;
        let unknown = read_u32(cursor)?;

        // 计算数据大小(不包含头部)
        let data_size = size as u64 - GROUP_HEADER_SIZE;

        if cursor.position() + data_size > cursor.get_ref().len() as u64 {
            return Err(PatchError::format(
                "GRUP",
                start,
                format!("Insufficient data for group data: expected {} bytes", data_size),
            ));
        }

        let data_end = cursor.position() + data_size;

        // 解析子元素
        let mut children = Vec::new();
        while cursor.position() < data_end {
            // 预读取4字节判断类型
            let peek_pos = cursor.position();
            let mut peek_bytes = [0u8; 4];
            cursor.read_exact(&mut peek_bytes)?;
            cursor.set_position(peek_pos); // 恢复位置

            if &peek_bytes == b"GRUP" {
                let child_group = Group::parse(cursor)?;
                children.push(GroupChild::Group(Box::new(child_group)));
            } else {
                let record = Record::parse(cursor)?;
                children.push(GroupChild::Record(record));
            }
        }

        Ok(Group {
            size,
            label,
            group_type,
            timestamp,
            version_control_info,
            unknown,
            children,
        })
    }

    /// 编码组
    ///
    /// 组大小字段先写占位符，子元素写完后回填实际大小。
    pub fn encode(&self, output: &mut Vec<u8>) -> Result<(), PatchError> {
        output.extend_from_slice(b"GRUP");

        let size_pos = output.len();
        output.extend_from_slice(&[0u8; 4]);

        output.extend_from_slice(&self.label);
        output.extend_from_slice(&self.group_type.to_i32().to_le_bytes());
        output.extend_from_slice(&self.timestamp.to_le_bytes());
        output.extend_from_slice(&self.version_control_info.to_le_bytes());
        output.extend_from_slice(&self.unknown.to_le_bytes());

        for child in &self.children {
            match child {
                GroupChild::Group(subgroup) => subgroup.encode(output)?,
                GroupChild::Record(record) => record.encode(output)?,
            }
        }

        // 回填实际大小（包含"GRUP"的4字节）
        let actual_size = (output.len() - size_pos + 4) as u32;
        output[size_pos..size_pos + 4].copy_from_slice(&actual_size.to_le_bytes());

        Ok(())
    }

    /// 获取组标签
    pub fn get_label(&self) -> &[u8; 4] {
        &self.label
    }

    /// 获取组标签字符串
    pub fn get_label_string(&self) -> String {
        String::from_utf8_lossy(&self.label).into_owned()
    }

    /// 获取组类型
    pub fn get_type(&self) -> &GroupType {
        &self.group_type
    }

    /// 获取所有记录（递归）
    pub fn get_records(&self) -> Vec<&Record> {
        let mut records = Vec::new();
        self.collect_records(&mut records);
        records
    }

    /// 递归收集所有记录
    fn collect_records<'a>(&'a self, records: &mut Vec<&'a Record>) {
        for child in &self.children {
            match child {
                GroupChild::Group(group) => group.collect_records(records),
                GroupChild::Record(record) => records.push(record),
            }
        }
    }

    /// 追加记录
    pub fn push_record(&mut self, record: Record) {
        self.children.push(GroupChild::Record(record));
    }
}
