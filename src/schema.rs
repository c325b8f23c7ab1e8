use crate::utils::PatchError;
use serde::Deserialize;
use std::collections::HashMap;

/// 子记录字段类型
///
/// 每游戏、每签名的字段布局是数据而非行为：未在表中声明的
/// 子记录一律按 Opaque 处理（原样保留，不解释）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// null结尾字符串
    String,
    /// 单个FormID引用
    FormId,
    /// FormID数组
    FormIdList,
    /// 不解释的原始字节
    Opaque,
}

/// 合并策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// 跨插件取并集（保留首见顺序，按归一化FormID去重）
    Union,
    /// 最后显式修改者胜出
    Override,
}

/// 合并标签
///
/// 命名的字段组，其冲突解决策略区别于整记录覆盖。
#[derive(Debug, Clone, Deserialize)]
pub struct MergeTag {
    /// 该标签使用的合并策略
    pub strategy: MergeStrategy,
    /// 适用的记录签名
    pub records: Vec<String>,
    /// 构成字段组的子记录签名
    pub subrecords: Vec<String>,
    /// 伴随的计数子记录（如KWDA前的KSIZ），并集后需同步更新
    #[serde(default)]
    pub count_subrecord: Option<String>,
}

/// 游戏配置
///
/// 已知顶级签名集合 + 每签名字段表 + 合并标签表。
/// 默认配置内嵌自 data/merge_schemas.json，调用方也可以用
/// `from_json` 提供自己的表。
#[derive(Debug, Clone, Deserialize)]
pub struct GameProfile {
    /// 配置名（从JSON键填入）
    #[serde(default)]
    pub name: String,
    /// 已知的顶级记录签名
    pub signatures: Vec<String>,
    /// 记录签名 -> 子记录签名 -> 字段类型
    #[serde(default)]
    pub fields: HashMap<String, HashMap<String, FieldKind>>,
    /// 合并标签表
    #[serde(default)]
    pub merge_tags: HashMap<String, MergeTag>,
}

impl GameProfile {
    /// 加载内嵌的默认配置
    pub fn builtin(name: &str) -> Result<Self, PatchError> {
        use serde::de::Error as _;

        let json_data = include_str!("../data/merge_schemas.json");
        let mut profiles = Self::from_json(json_data)?;
        profiles.remove(name).ok_or_else(|| {
            PatchError::Json(serde_json::Error::custom(format!("未知的游戏配置: {}", name)))
        })
    }

    /// 从JSON文本解析配置表
    pub fn from_json(json_data: &str) -> Result<HashMap<String, GameProfile>, PatchError> {
        let mut profiles: HashMap<String, GameProfile> = serde_json::from_str(json_data)?;
        for (key, profile) in profiles.iter_mut() {
            profile.name = key.clone();
        }
        Ok(profiles)
    }

    /// 签名是否为该游戏已知的顶级签名
    pub fn is_known_signature(&self, signature: &str) -> bool {
        self.signatures.iter().any(|s| s == signature)
    }

    /// 查询字段类型（未声明的一律Opaque）
    pub fn field_kind(&self, record_signature: &str, subrecord_signature: &str) -> FieldKind {
        self.fields
            .get(record_signature)
            .and_then(|m| m.get(subrecord_signature))
            .copied()
            .unwrap_or(FieldKind::Opaque)
    }

    /// 查询合并标签
    pub fn merge_tag(&self, tag: &str) -> Option<&MergeTag> {
        self.merge_tags.get(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_skyrim_profile() {
        let profile = GameProfile::builtin("skyrim").unwrap();
        assert_eq!(profile.name, "skyrim");
        assert!(profile.is_known_signature("WEAP"));
        assert!(profile.is_known_signature("NPC_"));
        assert!(!profile.is_known_signature("XXXX"));
    }

    #[test]
    fn test_unknown_profile() {
        assert!(GameProfile::builtin("morrowind").is_err());
    }

    #[test]
    fn test_field_kinds() {
        let profile = GameProfile::builtin("skyrim").unwrap();
        assert_eq!(profile.field_kind("WEAP", "FULL"), FieldKind::String);
        assert_eq!(profile.field_kind("WEAP", "KWDA"), FieldKind::FormIdList);
        assert_eq!(profile.field_kind("WEAP", "ETYP"), FieldKind::FormId);
        // 未声明的子记录按Opaque处理
        assert_eq!(profile.field_kind("WEAP", "ZZZZ"), FieldKind::Opaque);
        assert_eq!(profile.field_kind("ZZZZ", "FULL"), FieldKind::Opaque);
    }

    #[test]
    fn test_keywords_merge_tag() {
        let profile = GameProfile::builtin("skyrim").unwrap();
        let tag = profile.merge_tag("Keywords").expect("应该有Keywords标签");
        assert_eq!(tag.strategy, MergeStrategy::Union);
        assert!(tag.records.contains(&"WEAP".to_string()));
        assert_eq!(tag.subrecords, vec!["KWDA".to_string()]);
        assert_eq!(tag.count_subrecord.as_deref(), Some("KSIZ"));
    }

    #[test]
    fn test_custom_profile_from_json() {
        let json = r#"{
            "testgame": {
                "signatures": ["AAAA"],
                "fields": {"AAAA": {"DATA": "form_id_list"}},
                "merge_tags": {
                    "Lists": {"strategy": "union", "records": ["AAAA"], "subrecords": ["DATA"]}
                }
            }
        }"#;

        let profiles = GameProfile::from_json(json).unwrap();
        let profile = &profiles["testgame"];
        assert_eq!(profile.name, "testgame");
        assert_eq!(profile.field_kind("AAAA", "DATA"), FieldKind::FormIdList);
        assert!(profile.merge_tag("Lists").is_some());
    }
}
