use crate::datatypes::read_u16;
use crate::utils::PatchError;
use std::io::{Cursor, Read};

/// 子记录结构
///
/// 未知类型的子记录以原始字节保留，解码时绝不丢弃。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subrecord {
    /// 4字符类型标签（原始字节）
    pub signature_bytes: [u8; 4],
    /// 4字符类型标签（字符串，用于比较）
    pub signature: String,
    /// 数据大小
    pub size: u16,
    /// 原始数据
    pub data: Vec<u8>,
}

impl Subrecord {
    /// 构造子记录
    pub fn new(signature: &str, data: Vec<u8>) -> Self {
        let mut signature_bytes = [0u8; 4];
        let src = signature.as_bytes();
        signature_bytes[..src.len().min(4)].copy_from_slice(&src[..src.len().min(4)]);

        Subrecord {
            signature_bytes,
            signature: signature.to_string(),
            size: data.len() as u16,
            data,
        }
    }

    /// 从u32数组构造子记录(FormID列表等)
    pub fn from_u32_list(signature: &str, values: &[u32]) -> Self {
        let mut data = Vec::with_capacity(values.len() * 4);
        for value in values {
            data.extend_from_slice(&value.to_le_bytes());
        }
        Self::new(signature, data)
    }

    /// 解析子记录
    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self, PatchError> {
        let start = cursor.position();

        // 检查是否有足够的数据读取头部
        if start + 6 > cursor.get_ref().len() as u64 {
            return Err(PatchError::format(
                "????",
                start,
                "Insufficient data for subrecord header",
            ));
        }

        // 读取类型标签 (4字节)
        let mut signature_bytes = [0u8; 4];
        cursor.read_exact(&mut signature_bytes)?;
        let signature = String::from_utf8_lossy(&signature_bytes).into_owned();

        // 读取数据大小 (2字节)
        let size = read_u16(cursor)?;

        // 检查声明长度是否超出剩余字节
        if cursor.position() + size as u64 > cursor.get_ref().len() as u64 {
            return Err(PatchError::format(
                signature,
                start,
                format!("子记录声明长度 {} 超出剩余数据", size),
            ));
        }

        // 读取数据
        let mut data = vec![0u8; size as usize];
        cursor.read_exact(&mut data)?;

        Ok(Subrecord {
            signature_bytes,
            signature,
            size,
            data,
        })
    }

    /// 编码子记录
    pub fn encode(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(&self.signature_bytes);
        output.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        output.extend_from_slice(&self.data);
    }

    /// 获取子记录类型
    pub fn get_signature(&self) -> &str {
        &self.signature
    }

    /// 获取数据
    pub fn get_data(&self) -> &[u8] {
        &self.data
    }

    /// 解释数据为u32数组(FormID列表)
    ///
    /// 数据长度不是4的整数倍时返回None。
    pub fn as_u32_list(&self) -> Option<Vec<u32>> {
        if self.data.len() % 4 != 0 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    /// 解释数据为单个u32(FormID引用)
    pub fn as_u32(&self) -> Option<u32> {
        if self.data.len() != 4 {
            return None;
        }
        Some(u32::from_le_bytes([
            self.data[0],
            self.data[1],
            self.data[2],
            self.data[3],
        ]))
    }

    /// 校验字符串字段的null终止符
    ///
    /// 游戏格式要求声明为字符串的子记录以null结尾，不匹配属于数据损坏。
    pub fn validate_zstring(&self) -> Result<(), PatchError> {
        if self.data.last() != Some(&0u8) {
            return Err(PatchError::format(
                self.signature.clone(),
                0,
                format!("字符串子记录缺少null终止符 (长度 {})", self.data.len()),
            ));
        }
        Ok(())
    }
}
