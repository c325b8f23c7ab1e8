/// IO 抽象层
///
/// 补丁输出的写入接口，支持依赖注入和测试 mock。
/// 流水线只负责生成字节流，落盘方式由实现决定。
use crate::utils::{create_backup, PatchError};
use std::cell::RefCell;
use std::path::Path;

/// 补丁写入接口
pub trait PatchWriter {
    /// 写入补丁字节流
    fn write(&self, bytes: &[u8], path: &Path) -> Result<(), PatchError>;
}

/// 默认的补丁写入器（基于 std::fs）
///
/// 自动创建父目录；目标文件已存在时先做带时间戳的备份。
#[derive(Debug, Clone, Default)]
pub struct DefaultPatchWriter;

impl PatchWriter for DefaultPatchWriter {
    fn write(&self, bytes: &[u8], path: &Path) -> Result<(), PatchError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            create_backup(path)?;
        }

        std::fs::write(path, bytes)?;
        Ok(())
    }
}

/// 内存补丁写入器（测试用）
#[derive(Debug, Default)]
pub struct MemoryPatchWriter {
    pub captured: RefCell<Vec<u8>>,
}

impl PatchWriter for MemoryPatchWriter {
    fn write(&self, bytes: &[u8], _path: &Path) -> Result<(), PatchError> {
        *self.captured.borrow_mut() = bytes.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_writer_creates_parent_dirs() {
        let dir = std::env::temp_dir().join("esp_patcher_io_test").join("nested");
        let path = dir.join("patch.esp");

        let writer = DefaultPatchWriter;
        writer.write(b"TES4", &path).unwrap();

        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"TES4");

        std::fs::remove_dir_all(std::env::temp_dir().join("esp_patcher_io_test")).unwrap();
    }

    #[test]
    fn test_default_writer_backs_up_existing() {
        let dir = std::env::temp_dir().join("esp_patcher_io_backup_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("patch.esp");
        std::fs::write(&path, b"OLD").unwrap();

        let writer = DefaultPatchWriter;
        writer.write(b"NEW", &path).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"NEW");
        let backups: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "bak").unwrap_or(false))
            .collect();
        assert_eq!(backups.len(), 1, "覆盖前应该生成一个备份文件");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_memory_writer_captures() {
        let writer = MemoryPatchWriter::default();
        writer.write(b"TES4", Path::new("ignored.esp")).unwrap();
        assert_eq!(&*writer.captured.borrow(), b"TES4");
    }
}
