use crate::datatypes::{read_u16, read_u32, RecordFlags};
use crate::subrecord::Subrecord;
use crate::utils::PatchError;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::borrow::Cow;
use std::io::{Cursor, Read, Write};

/// 记录头部固定大小
pub const RECORD_HEADER_SIZE: u64 = 24;

/// 记录结构
#[derive(Debug, Clone)]
pub struct Record {
    /// 记录类型（原始4字节）
    pub signature_bytes: [u8; 4],
    /// 记录类型字符串（用于比较）
    pub signature: String,
    /// 数据大小
    pub data_size: u32,
    /// 标志位（原始32位数据）
    pub flags: u32,
    /// FormID（文件本地编码）
    pub form_id: u32,
    /// 时间戳
    pub timestamp: u16,
    /// 版本控制信息
    pub version_control_info: u16,
    /// 内部版本
    pub internal_version: u16,
    /// 未知字段
    pub unknown: u16,
    /// 原始压缩数据（如果记录是压缩的，保存原始压缩字节）
    pub original_compressed_data: Option<Vec<u8>>,
    /// 原始数据（用于未修改记录的透传写回）
    pub raw_data: Vec<u8>,
    /// 子记录列表（顺序必须保留）
    pub subrecords: Vec<Subrecord>,
    /// 是否已被修改（决定写回时透传还是重编码）
    pub is_modified: bool,
}

impl Record {
    /// 构造新记录（用于合成补丁输出）
    pub fn new(signature: &str, form_id: u32, subrecords: Vec<Subrecord>) -> Self {
        let mut signature_bytes = [0u8; 4];
        let src = signature.as_bytes();
        signature_bytes[..src.len().min(4)].copy_from_slice(&src[..src.len().min(4)]);

        Record {
            signature_bytes,
            signature: signature.to_string(),
            data_size: 0,
            flags: 0,
            form_id,
            timestamp: 0,
            version_control_info: 0,
            internal_version: 44,
            unknown: 0,
            original_compressed_data: None,
            raw_data: Vec::new(),
            subrecords,
            is_modified: true,
        }
    }

    /// 解析记录
    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self, PatchError> {
        let start = cursor.position();
        Self::validate_header_size(cursor)?;

        let mut signature_bytes = [0u8; 4];
        cursor.read_exact(&mut signature_bytes)?;
        let signature = String::from_utf8_lossy(&signature_bytes).into_owned();

        let data_size = read_u32(cursor)?;
        Self::validate_data_size(data_size, &signature, start)?;

        let flags = read_u32(cursor)?;
        let form_id = read_u32(cursor)?;
        let timestamp = read_u16(cursor)?;
        let version_control_info = read_u16(cursor)?;
        let internal_version = read_u16(cursor)?;
        let unknown = read_u16(cursor)?;

        Self::validate_data_availability(cursor, data_size, &signature, start)?;

        let mut data = vec![0u8; data_size as usize];
        cursor.read_exact(&mut data)?;

        let (final_data, original_compressed) = Self::handle_compression(&data, flags, &signature)?;

        let subrecords = Self::parse_subrecords(&final_data, &signature)?;

        Ok(Record {
            signature_bytes,
            signature,
            data_size,
            flags,
            form_id,
            timestamp,
            version_control_info,
            internal_version,
            unknown,
            original_compressed_data: original_compressed,
            raw_data: final_data,
            subrecords,
            is_modified: false,
        })
    }

    /// 验证头部大小
    fn validate_header_size(cursor: &Cursor<&[u8]>) -> Result<(), PatchError> {
        if cursor.position() + RECORD_HEADER_SIZE > cursor.get_ref().len() as u64 {
            return Err(PatchError::format(
                "????",
                cursor.position(),
                "Insufficient data for record header",
            ));
        }
        Ok(())
    }

    /// 验证数据大小
    fn validate_data_size(data_size: u32, signature: &str, offset: u64) -> Result<(), PatchError> {
        if data_size > 100_000_000 {
            // 100MB限制
            return Err(PatchError::format(
                signature,
                offset,
                format!("记录数据大小异常: {} bytes (可能数据损坏)", data_size),
            ));
        }
        Ok(())
    }

    /// 验证数据可用性
    fn validate_data_availability(
        cursor: &Cursor<&[u8]>,
        data_size: u32,
        signature: &str,
        offset: u64,
    ) -> Result<(), PatchError> {
        if cursor.position() + data_size as u64 > cursor.get_ref().len() as u64 {
            return Err(PatchError::format(
                signature,
                offset,
                format!("Insufficient data for record data: expected {} bytes", data_size),
            ));
        }
        Ok(())
    }

    /// 处理压缩数据
    ///
    /// 压缩标志置位但无法解压属于 UnsupportedCompression，整个补丁构建中止。
    fn handle_compression(
        data: &[u8],
        flags: u32,
        signature: &str,
    ) -> Result<(Vec<u8>, Option<Vec<u8>>), PatchError> {
        if flags & RecordFlags::COMPRESSED.bits() != 0 {
            let decompressed = Self::decompress_data(data).map_err(|reason| {
                PatchError::UnsupportedCompression {
                    file: String::new(),
                    signature: signature.to_string(),
                    reason,
                }
            })?;
            Ok((decompressed, Some(data.to_vec())))
        } else {
            Ok((data.to_vec(), None))
        }
    }

    /// 解压缩数据
    fn decompress_data(data: &[u8]) -> Result<Vec<u8>, String> {
        if data.len() < 4 {
            return Err("压缩数据太短，无法包含解压大小".to_string());
        }

        let decompressed_size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);

        if decompressed_size == 0 {
            return Err("解压大小为0".to_string());
        }
        if decompressed_size > 50_000_000 {
            // 50MB限制
            return Err(format!("解压大小过大: {} bytes (可能数据损坏)", decompressed_size));
        }

        let compressed_data = &data[4..];
        if compressed_data.is_empty() {
            return Err("没有压缩数据".to_string());
        }

        let mut decoder = ZlibDecoder::new(compressed_data);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| format!("zlib解压失败: {}", e))?;

        if decompressed.len() != decompressed_size as usize {
            return Err(format!(
                "解压大小不匹配: 期望 {} bytes，实际 {} bytes",
                decompressed_size,
                decompressed.len()
            ));
        }

        Ok(decompressed)
    }

    /// 解析子记录
    ///
    /// 声明的负载必须被子记录流精确消费；记录末尾允许少量 NULL 填充
    /// (游戏自身的输出会出现)，非 NULL 的尾部数据属于损坏。
    fn parse_subrecords(data: &[u8], signature: &str) -> Result<Vec<Subrecord>, PatchError> {
        let mut subrecords = Vec::new();
        let mut cursor = Cursor::new(data);

        while cursor.position() < data.len() as u64 {
            let remaining = data.len() as u64 - cursor.position();

            // 子记录最小头部为 6 字节 (4字节类型 + 2字节大小)
            if remaining < 6 {
                let remaining_bytes = &data[cursor.position() as usize..];

                if remaining_bytes.iter().all(|&b| b == 0) {
                    // NULL 填充，安全跳过
                    break;
                } else {
                    return Err(PatchError::format(
                        signature,
                        cursor.position(),
                        format!(
                            "记录末尾有 {} 字节非 NULL 数据，无法解析为子记录: {:02X?}",
                            remaining, remaining_bytes
                        ),
                    ));
                }
            }

            subrecords.push(Subrecord::parse(&mut cursor)?);
        }

        Ok(subrecords)
    }

    /// 编码记录
    ///
    /// 未修改的记录透传原始负载字节（压缩记录透传原始压缩数据），
    /// 保证逐字节一致的写回；已修改的记录重新序列化并按需重新压缩。
    pub fn encode(&self, output: &mut Vec<u8>) -> Result<(), PatchError> {
        output.extend_from_slice(&self.signature_bytes);

        let is_compressed = self.flags & RecordFlags::COMPRESSED.bits() != 0;

        let data_to_write: Cow<[u8]> = if self.is_modified {
            let subrecord_data = self.serialize_subrecords();

            if is_compressed {
                Cow::Owned(Self::compress_data(&subrecord_data)?)
            } else {
                Cow::Owned(subrecord_data)
            }
        } else if let Some(compressed_data) = &self.original_compressed_data {
            // 零拷贝借用原始压缩字节
            Cow::Borrowed(compressed_data.as_slice())
        } else {
            Cow::Borrowed(&self.raw_data)
        };

        let actual_size = data_to_write.len() as u32;
        output.extend_from_slice(&actual_size.to_le_bytes());
        output.extend_from_slice(&self.flags.to_le_bytes());
        output.extend_from_slice(&self.form_id.to_le_bytes());
        output.extend_from_slice(&self.timestamp.to_le_bytes());
        output.extend_from_slice(&self.version_control_info.to_le_bytes());
        output.extend_from_slice(&self.internal_version.to_le_bytes());
        output.extend_from_slice(&self.unknown.to_le_bytes());
        output.extend_from_slice(&data_to_write);

        Ok(())
    }

    /// 序列化所有子记录
    fn serialize_subrecords(&self) -> Vec<u8> {
        let mut subrecord_data = Vec::new();
        for subrecord in &self.subrecords {
            subrecord.encode(&mut subrecord_data);
        }
        subrecord_data
    }

    /// 压缩数据(4字节解压大小前缀 + zlib流)
    fn compress_data(data: &[u8]) -> Result<Vec<u8>, PatchError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;

        let mut result = Vec::with_capacity(compressed.len() + 4);
        result.extend_from_slice(&(data.len() as u32).to_le_bytes());
        result.extend_from_slice(&compressed);
        Ok(result)
    }

    /// 获取记录类型
    pub fn get_signature(&self) -> &str {
        &self.signature
    }

    /// 获取FormID（文件本地编码）
    pub fn get_form_id(&self) -> u32 {
        self.form_id
    }

    /// 获取标志位
    pub fn get_flags(&self) -> RecordFlags {
        RecordFlags::from_bits_truncate(self.flags)
    }

    /// 查找子记录
    pub fn find_subrecord(&self, signature: &str) -> Option<&Subrecord> {
        self.subrecords.iter().find(|sr| sr.signature == signature)
    }

    /// 查找所有匹配的子记录
    pub fn find_subrecords(&self, signature: &str) -> Vec<&Subrecord> {
        self.subrecords
            .iter()
            .filter(|sr| sr.signature == signature)
            .collect()
    }

    /// 获取编辑器ID
    pub fn get_editor_id(&self) -> Option<String> {
        self.find_subrecord("EDID")
            .map(|sr| String::from_utf8_lossy(&sr.data).trim_end_matches('\0').to_string())
    }

    /// 标记为已修改
    pub fn mark_modified(&mut self) {
        self.is_modified = true;
    }
}
