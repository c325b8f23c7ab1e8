use crate::group::{Group, GroupChild};
use crate::plugin::Plugin;

/// 结构调试器
///
/// 打印插件的组/记录树并做字节级对比，主要用于验证
/// 解析-重建往返的一致性。
pub struct PatchDebugger;

impl PatchDebugger {
    /// 生成插件结构树文本
    pub fn dump_plugin(plugin: &Plugin) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "插件: {} (主文件数: {})\n",
            plugin.get_name(),
            plugin.masters.len()
        ));
        for master in &plugin.masters {
            out.push_str(&format!("  主文件: {}\n", master));
        }
        for group in &plugin.groups {
            Self::dump_group(group, 1, &mut out);
        }
        out
    }

    fn dump_group(group: &Group, depth: usize, out: &mut String) {
        let indent = "  ".repeat(depth);
        out.push_str(&format!(
            "{}GRUP {} ({} 子元素)\n",
            indent,
            group.get_label_string(),
            group.children.len()
        ));
        for child in &group.children {
            match child {
                GroupChild::Group(subgroup) => Self::dump_group(subgroup, depth + 1, out),
                GroupChild::Record(record) => {
                    out.push_str(&format!(
                        "{}  {} [{:08X}] ({} 子记录)\n",
                        indent,
                        record.signature,
                        record.form_id,
                        record.subrecords.len()
                    ));
                }
            }
        }
    }

    /// 对比两个字节流，返回第一处差异的偏移
    pub fn first_difference(a: &[u8], b: &[u8]) -> Option<usize> {
        let common = a.len().min(b.len());
        for i in 0..common {
            if a[i] != b[i] {
                return Some(i);
            }
        }
        if a.len() != b.len() {
            Some(common)
        } else {
            None
        }
    }

    /// 打印差异位置附近的字节（前后各16字节）
    pub fn describe_difference(a: &[u8], b: &[u8]) -> Option<String> {
        let offset = Self::first_difference(a, b)?;
        let start = offset.saturating_sub(16);

        let slice_a = &a[start..(offset + 16).min(a.len())];
        let slice_b = &b[start..(offset + 16).min(b.len())];

        Some(format!(
            "第一处差异 @0x{:X} (长度 {} vs {})\n  A: {:02X?}\n  B: {:02X?}",
            offset,
            a.len(),
            b.len(),
            slice_a,
            slice_b
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::subrecord::Subrecord;

    #[test]
    fn test_first_difference() {
        assert_eq!(PatchDebugger::first_difference(b"abc", b"abc"), None);
        assert_eq!(PatchDebugger::first_difference(b"abc", b"abd"), Some(2));
        assert_eq!(PatchDebugger::first_difference(b"abc", b"abcd"), Some(3), "长度差异也算差异");
    }

    #[test]
    fn test_dump_plugin() {
        let mut group = Group::new_top_level("WEAP");
        group.push_record(Record::new(
            "WEAP",
            0x800,
            vec![Subrecord::new("EDID", b"IronSword\0".to_vec())],
        ));
        let plugin = Plugin::synthesize(
            "Test.esp",
            "a",
            "d",
            vec!["Base.esm".to_string()],
            vec![group],
        );

        let dump = PatchDebugger::dump_plugin(&plugin);
        assert!(dump.contains("Test.esp"));
        assert!(dump.contains("GRUP WEAP"));
        assert!(dump.contains("[00000800]"));
    }
}
