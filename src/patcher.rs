use crate::formid::FormIdResolver;
use crate::load_order::LoadOrder;
use crate::merge::{resolve_with_tags, MergedRecord};
use crate::record::Record;
use crate::schema::{GameProfile, MergeStrategy, MergeTag};
use crate::utils::PatchError;
use std::collections::HashSet;

/// 补丁器对一条合并记录的裁决
#[derive(Debug)]
pub enum PatchDecision {
    /// 未改动，不进入输出（保持补丁最小化）
    Unchanged,
    /// 已改动，替换后进入输出
    Modified(Record),
    /// 强制收录（即使未改动），受注册表的 ForcePolicy 约束
    ForceInclude(Record),
}

/// 合并上下文
///
/// 显式传入的不可变上下文，补丁器不依赖任何进程级全局状态。
pub struct MergeContext<'a> {
    pub profile: &'a GameProfile,
    pub resolver: &'a FormIdResolver,
    pub order: &'a LoadOrder,
}

/// 补丁器（Tweak）
///
/// 独立可插拔单元：声明关心的记录签名和认领的合并标签，
/// 提供纯变换函数。补丁器只会看到扫描完成后的快照，
/// 同一轮内互相不可见。
pub trait Patcher {
    /// 补丁器名称（用于冲突报告）
    fn name(&self) -> &str;

    /// 关心的记录签名集合
    fn signatures(&self) -> &[String];

    /// 认领的合并标签
    fn merge_tags(&self) -> &[String] {
        &[]
    }

    /// 变换一条合并记录
    fn apply(&self, merged: &MergedRecord, ctx: &MergeContext<'_>)
        -> Result<PatchDecision, PatchError>;
}

/// 强制收录策略
///
/// ForceInclude 遇到未改动记录时的处理是配置而非核心逻辑。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForcePolicy {
    /// 强制收录总是生效
    #[default]
    Always,
    /// 仅当某个补丁器实际改动了数据才收录
    OnlyIfChanged,
}

/// 补丁器注册表
///
/// 注册顺序即应用顺序（固定、确定）。
pub struct PatcherRegistry {
    patchers: Vec<Box<dyn Patcher>>,
    pub force_policy: ForcePolicy,
}

impl Default for PatcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PatcherRegistry {
    /// 创建空注册表
    pub fn new() -> Self {
        PatcherRegistry {
            patchers: Vec::new(),
            force_policy: ForcePolicy::default(),
        }
    }

    /// 指定强制收录策略
    pub fn with_force_policy(force_policy: ForcePolicy) -> Self {
        PatcherRegistry {
            patchers: Vec::new(),
            force_policy,
        }
    }

    /// 注册补丁器
    pub fn register(&mut self, patcher: Box<dyn Patcher>) {
        self.patchers.push(patcher);
    }

    /// 校验配置
    ///
    /// 两个补丁器在重叠的签名集合上认领同一个合并标签属于
    /// 配置错误，必须在合并开始前暴露，绝不静默解决。
    pub fn validate(&self) -> Result<(), PatchError> {
        for (i, first) in self.patchers.iter().enumerate() {
            for second in &self.patchers[i + 1..] {
                let shared_tag = first
                    .merge_tags()
                    .iter()
                    .find(|tag| second.merge_tags().contains(tag));

                if let Some(tag) = shared_tag {
                    let overlap = first
                        .signatures()
                        .iter()
                        .any(|sig| second.signatures().contains(sig));
                    if overlap {
                        return Err(PatchError::MergeConflict {
                            tag: tag.clone(),
                            first: first.name().to_string(),
                            second: second.name().to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// 所有补丁器关心的签名并集（扫描阶段的兴趣集）
    pub fn interest_set(&self) -> HashSet<String> {
        self.patchers
            .iter()
            .flat_map(|p| p.signatures().iter().cloned())
            .collect()
    }

    /// 按注册顺序迭代
    pub fn iter(&self) -> impl Iterator<Item = &dyn Patcher> {
        self.patchers.iter().map(|p| p.as_ref())
    }

    /// 补丁器数量
    pub fn len(&self) -> usize {
        self.patchers.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.patchers.is_empty()
    }
}

/// 列表合并补丁器
///
/// 经典的"合并列表"行为：把配置表中并集策略的合并标签
/// （关键字、FormList等）跨所有贡献插件取并集，其余字段
/// 按"最后显式修改者"解析。
pub struct ListMergePatcher {
    name: String,
    signatures: Vec<String>,
    tag_names: Vec<String>,
    tags: Vec<MergeTag>,
}

impl ListMergePatcher {
    /// 从游戏配置构造
    ///
    /// `tag_names` 为要启用的合并标签；签名集合取这些标签
    /// 适用记录签名的并集。标签未定义时报配置错误。
    pub fn from_profile(profile: &GameProfile, tag_names: &[&str]) -> Result<Self, PatchError> {
        let mut signatures = Vec::new();
        let mut tags = Vec::new();

        for &tag_name in tag_names {
            let tag = profile.merge_tag(tag_name).ok_or_else(|| {
                PatchError::InvalidLoadOrder {
                    reason: format!("游戏配置 {} 未定义合并标签 {}", profile.name, tag_name),
                }
            })?;

            for signature in &tag.records {
                if !signatures.contains(signature) {
                    signatures.push(signature.clone());
                }
            }
            tags.push(tag.clone());
        }

        Ok(ListMergePatcher {
            name: "ListMerge".to_string(),
            signatures,
            tag_names: tag_names.iter().map(|s| s.to_string()).collect(),
            tags,
        })
    }
}

impl Patcher for ListMergePatcher {
    fn name(&self) -> &str {
        &self.name
    }

    fn signatures(&self) -> &[String] {
        &self.signatures
    }

    fn merge_tags(&self) -> &[String] {
        &self.tag_names
    }

    fn apply(
        &self,
        merged: &MergedRecord,
        _ctx: &MergeContext<'_>,
    ) -> Result<PatchDecision, PatchError> {
        // 适用于该记录签名的并集标签
        let union_tags: Vec<&MergeTag> = self
            .tags
            .iter()
            .filter(|tag| {
                tag.strategy == MergeStrategy::Union && tag.records.contains(&merged.signature)
            })
            .collect();

        let applicable = self.tags.iter().any(|tag| tag.records.contains(&merged.signature));
        if !applicable {
            return Ok(PatchDecision::Unchanged);
        }

        let resolved = resolve_with_tags(merged, &union_tags);

        if resolved.subrecords == merged.winner().record.subrecords {
            Ok(PatchDecision::Unchanged)
        } else {
            Ok(PatchDecision::Modified(resolved))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formid::FormId;
    use crate::merge::MergedRecordSet;
    use crate::subrecord::Subrecord;

    struct DummyPatcher {
        name: String,
        signatures: Vec<String>,
        tags: Vec<String>,
    }

    impl DummyPatcher {
        fn new(name: &str, signatures: &[&str], tags: &[&str]) -> Self {
            DummyPatcher {
                name: name.to_string(),
                signatures: signatures.iter().map(|s| s.to_string()).collect(),
                tags: tags.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    impl Patcher for DummyPatcher {
        fn name(&self) -> &str {
            &self.name
        }
        fn signatures(&self) -> &[String] {
            &self.signatures
        }
        fn merge_tags(&self) -> &[String] {
            &self.tags
        }
        fn apply(
            &self,
            _merged: &MergedRecord,
            _ctx: &MergeContext<'_>,
        ) -> Result<PatchDecision, PatchError> {
            Ok(PatchDecision::Unchanged)
        }
    }

    #[test]
    fn test_conflicting_tag_claims_rejected() {
        let mut registry = PatcherRegistry::new();
        registry.register(Box::new(DummyPatcher::new("A", &["WEAP"], &["Keywords"])));
        registry.register(Box::new(DummyPatcher::new("B", &["WEAP", "ARMO"], &["Keywords"])));

        match registry.validate() {
            Err(PatchError::MergeConflict { tag, first, second }) => {
                assert_eq!(tag, "Keywords");
                assert_eq!(first, "A");
                assert_eq!(second, "B");
            }
            other => panic!("应该是 MergeConflict，实际: {:?}", other.err()),
        }
    }

    #[test]
    fn test_same_tag_disjoint_signatures_allowed() {
        let mut registry = PatcherRegistry::new();
        registry.register(Box::new(DummyPatcher::new("A", &["WEAP"], &["Keywords"])));
        registry.register(Box::new(DummyPatcher::new("B", &["ARMO"], &["Keywords"])));

        assert!(registry.validate().is_ok(), "签名集合不重叠时同一标签不冲突");
    }

    #[test]
    fn test_interest_set() {
        let mut registry = PatcherRegistry::new();
        registry.register(Box::new(DummyPatcher::new("A", &["WEAP"], &[])));
        registry.register(Box::new(DummyPatcher::new("B", &["WEAP", "FLST"], &[])));

        let interest = registry.interest_set();
        assert_eq!(interest.len(), 2);
        assert!(interest.contains("WEAP"));
        assert!(interest.contains("FLST"));
    }

    #[test]
    fn test_list_merge_patcher_from_profile() {
        let profile = GameProfile::builtin("skyrim").unwrap();
        let patcher = ListMergePatcher::from_profile(&profile, &["Keywords", "FormLists"]).unwrap();

        assert!(patcher.signatures().contains(&"WEAP".to_string()));
        assert!(patcher.signatures().contains(&"FLST".to_string()));
        assert_eq!(patcher.merge_tags(), &["Keywords".to_string(), "FormLists".to_string()]);

        assert!(
            ListMergePatcher::from_profile(&profile, &["Nope"]).is_err(),
            "未定义的合并标签应该报错"
        );
    }

    #[test]
    fn test_list_merge_patcher_unchanged_when_no_conflict() {
        let profile = GameProfile::builtin("skyrim").unwrap();
        let patcher = ListMergePatcher::from_profile(&profile, &["Keywords"]).unwrap();

        let mut set = MergedRecordSet::new();
        let record = Record::new(
            "WEAP",
            0x800,
            vec![
                Subrecord::new("KSIZ", 1u32.to_le_bytes().to_vec()),
                Subrecord::from_u32_list("KWDA", &[0x900]),
            ],
        );
        set.insert(FormId(0x800), "Base.esm", record).unwrap();

        let order = crate::LoadOrder::new(vec![std::path::PathBuf::from("Base.esm")]).unwrap();
        let resolver = FormIdResolver::new(&order);
        let ctx = MergeContext {
            profile: &profile,
            resolver: &resolver,
            order: &order,
        };

        let decision = patcher.apply(set.get(FormId(0x800)).unwrap(), &ctx).unwrap();
        assert!(
            matches!(decision, PatchDecision::Unchanged),
            "单一贡献无冲突时应该保持未改动"
        );
    }
}
