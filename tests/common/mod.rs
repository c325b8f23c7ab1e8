//! 集成测试共用的合成插件构造器
//!
//! 通过库自身的合成/写盘路径生成测试插件，避免依赖真实游戏文件。

use esp_patcher::{Group, Plugin, Record, Subrecord};
use std::path::{Path, PathBuf};

/// null结尾字符串
pub fn zstr(text: &str) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

/// 构造一条WEAP记录（EDID/FULL/KSIZ/KWDA）
pub fn weap_record(form_id: u32, editor_id: &str, full: &str, keywords: &[u32]) -> Record {
    Record::new(
        "WEAP",
        form_id,
        vec![
            Subrecord::new("EDID", zstr(editor_id)),
            Subrecord::new("FULL", zstr(full)),
            Subrecord::new("KSIZ", (keywords.len() as u32).to_le_bytes().to_vec()),
            Subrecord::from_u32_list("KWDA", keywords),
        ],
    )
}

/// 把若干WEAP记录写成磁盘上的插件文件，返回路径
pub fn write_weap_plugin(
    dir: &Path,
    name: &str,
    masters: &[&str],
    records: Vec<Record>,
) -> PathBuf {
    let mut group = Group::new_top_level("WEAP");
    for record in records {
        group.push_record(record);
    }

    let plugin = Plugin::synthesize(
        name,
        "test",
        "集成测试插件",
        masters.iter().map(|s| s.to_string()).collect(),
        vec![group],
    );

    let path = dir.join(name);
    plugin.write_to_file(&path).expect("写入测试插件失败");
    path
}
