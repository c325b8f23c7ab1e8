//! 补丁流水线集成测试
//!
//! 覆盖合并引擎的关键性质：优先级、并集合并、主文件最小化、
//! 确定性、断裂主文件引用中止。

mod common;

use common::{weap_record, write_weap_plugin, zstr};
use esp_patcher::{
    ForcePolicy, FormId, GameProfile, Group, ListMergePatcher, LoadOrder, MergeContext,
    MergedRecord, PatchDecision, PatchError, PatchPipeline, Patcher, PatcherRegistry,
    PipelineState, Plugin, Record, Subrecord,
};
use tempfile::tempdir;

/// 构造经典冲突场景的三插件加载顺序
///
/// Base.esm 定义记录R（名字"Iron Sword"、关键字K1）；
/// ModA 把名字改成"Foo"；ModB 名字原样、关键字追加自己定义的K2。
fn scenario_order(dir: &std::path::Path) -> LoadOrder {
    let base = write_weap_plugin(
        dir,
        "Base.esm",
        &[],
        vec![weap_record(0x00000800, "IronSword", "Iron Sword", &[0x00000900])],
    );
    let mod_a = write_weap_plugin(
        dir,
        "ModA.esp",
        &["Base.esm"],
        vec![weap_record(0x00000800, "IronSword", "Foo", &[0x00000900])],
    );
    // 0x01xxxxxx: 主列表长度为1，索引1指向ModB自身
    let mod_b = write_weap_plugin(
        dir,
        "ModB.esp",
        &["Base.esm"],
        vec![weap_record(
            0x00000800,
            "IronSword",
            "Iron Sword",
            &[0x00000900, 0x01000777],
        )],
    );

    LoadOrder::new(vec![base, mod_a, mod_b]).unwrap()
}

fn keywords_pipeline() -> PatchPipeline {
    let profile = GameProfile::builtin("skyrim").unwrap();
    let patcher = ListMergePatcher::from_profile(&profile, &["Keywords"]).unwrap();
    let mut registry = PatcherRegistry::new();
    registry.register(Box::new(patcher));
    PatchPipeline::new(profile, registry)
}

#[test]
fn test_scenario_name_and_keyword_merge() {
    let dir = tempdir().unwrap();
    let order = scenario_order(dir.path());

    let mut pipeline = keywords_pipeline();
    let (patch, summary) = pipeline.build(&order, "BashedPatch.esp").unwrap();

    assert_eq!(pipeline.state(), PipelineState::Done);
    assert_eq!(summary.record_count, 1);
    assert_eq!(summary.touched, vec![FormId::new(0, 0x800)]);

    // 主文件最小化：ModA只贡献了字段值，不是任何保留FormID的来源
    assert_eq!(summary.masters, vec!["Base.esm", "ModB.esp"]);

    let records = patch.all_records();
    assert_eq!(records.len(), 1);
    let record = records[0];

    // 名字 = ModA的显式修改（ModB未触碰该字段）
    assert_eq!(record.find_subrecord("FULL").unwrap().data, zstr("Foo"));

    // 关键字 = Base ∪ ModA ∪ ModB，首见顺序，K2已重映射到输出主文件空间
    let kwda = record.find_subrecord("KWDA").unwrap();
    assert_eq!(kwda.as_u32_list(), Some(vec![0x00000900, 0x01000777]));
    assert_eq!(record.find_subrecord("KSIZ").unwrap().as_u32(), Some(2));

    // 记录自身的FormID重映射到输出空间：Base是第0个主文件
    assert_eq!(record.form_id, 0x00000800);
}

#[test]
fn test_determinism() {
    let dir = tempdir().unwrap();
    let order = scenario_order(dir.path());

    let (patch1, _) = keywords_pipeline().build(&order, "BashedPatch.esp").unwrap();
    let (patch2, _) = keywords_pipeline().build(&order, "BashedPatch.esp").unwrap();

    assert_eq!(
        patch1.to_bytes().unwrap(),
        patch2.to_bytes().unwrap(),
        "相同输入的两次构建必须逐字节一致"
    );
}

#[test]
fn test_output_loads_back() {
    let dir = tempdir().unwrap();
    let order = scenario_order(dir.path());

    let output = dir.path().join("BashedPatch.esp");
    let mut pipeline = keywords_pipeline();
    let summary = pipeline.build_to_file(&order, &output).unwrap();

    let patch = Plugin::load(output).unwrap();
    assert_eq!(patch.masters, summary.masters);
    assert_eq!(patch.all_records().len(), summary.record_count);
    assert_eq!(patch.get_author(), Some("esp_patcher".to_string()));
}

#[test]
fn test_last_loaded_precedence() {
    let dir = tempdir().unwrap();

    // 同一字段被两个插件显式修改：后加载者胜出
    let base = write_weap_plugin(
        dir.path(),
        "Base.esm",
        &[],
        vec![weap_record(0x00000810, "Dagger", "Old Name", &[0x00000901])],
    );
    let mod_a = write_weap_plugin(
        dir.path(),
        "ModA.esp",
        &["Base.esm"],
        vec![weap_record(0x00000810, "Dagger", "Name A", &[0x00000901])],
    );
    let mod_b = write_weap_plugin(
        dir.path(),
        "ModB.esp",
        &["Base.esm"],
        vec![weap_record(0x00000810, "Dagger", "Name B", &[0x00000901])],
    );

    let order = LoadOrder::new(vec![base, mod_a, mod_b]).unwrap();
    let (patch, _) = keywords_pipeline().build(&order, "BashedPatch.esp").unwrap();

    let record = patch.all_records()[0];
    assert_eq!(
        record.find_subrecord("FULL").unwrap().data,
        zstr("Name B"),
        "冲突的非合并字段应该取后加载插件的值"
    );
}

#[test]
fn test_unconflicted_records_excluded() {
    let dir = tempdir().unwrap();

    // 只有Base定义、无人覆盖的记录不进入补丁（保持补丁最小化）
    let base = write_weap_plugin(
        dir.path(),
        "Base.esm",
        &[],
        vec![
            weap_record(0x00000800, "IronSword", "Iron Sword", &[0x00000900]),
            weap_record(0x00000801, "Lonely", "Lonely Sword", &[0x00000900]),
        ],
    );
    let mod_a = write_weap_plugin(
        dir.path(),
        "ModA.esp",
        &["Base.esm"],
        vec![weap_record(0x00000800, "IronSword", "Foo", &[0x00000902])],
    );

    let order = LoadOrder::new(vec![base, mod_a]).unwrap();
    let (patch, summary) = keywords_pipeline().build(&order, "BashedPatch.esp").unwrap();

    assert_eq!(summary.record_count, 1, "未被触碰的记录不应该进入补丁");
    assert_eq!(patch.all_records()[0].get_editor_id(), Some("IronSword".to_string()));
}

#[test]
fn test_dangling_master_aborts_before_writing() {
    let dir = tempdir().unwrap();

    let base = write_weap_plugin(
        dir.path(),
        "Base.esm",
        &[],
        vec![weap_record(0x00000800, "IronSword", "Iron Sword", &[])],
    );
    // 主列表只有1个条目，索引5是断裂的依赖链
    let broken = write_weap_plugin(
        dir.path(),
        "Broken.esp",
        &["Base.esm"],
        vec![weap_record(0x05000800, "IronSword", "Bad", &[])],
    );

    let order = LoadOrder::new(vec![base, broken]).unwrap();
    let output = dir.path().join("BashedPatch.esp");

    let mut pipeline = keywords_pipeline();
    let result = pipeline.build_to_file(&order, &output);

    match result {
        Err(PatchError::MissingMaster { file, index, master_count }) => {
            assert_eq!(file, "Broken.esp");
            assert_eq!(index, 5);
            assert_eq!(master_count, 1);
        }
        other => panic!("应该是 MissingMaster，实际: {:?}", other.err()),
    }
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert!(!output.exists(), "中止的构建不应该写出任何文件");
}

#[test]
fn test_unknown_top_group_signature_rejected() {
    let dir = tempdir().unwrap();

    let mut group = Group::new_top_level("ZZZZ");
    group.push_record(Record::new(
        "ZZZZ",
        0x800,
        vec![Subrecord::new("EDID", zstr("Mystery"))],
    ));
    let plugin = Plugin::synthesize("Odd.esp", "test", "", vec![], vec![group]);
    let path = dir.path().join("Odd.esp");
    plugin.write_to_file(&path).unwrap();

    let order = LoadOrder::new(vec![path]).unwrap();
    let result = keywords_pipeline().build(&order, "BashedPatch.esp");

    match result {
        Err(PatchError::Format { file, signature, .. }) => {
            assert_eq!(file, "Odd.esp");
            assert_eq!(signature, "ZZZZ");
        }
        other => panic!("应该是 Format 错误，实际: {:?}", other.err()),
    }
}

/// 强制收录补丁器（测试 ForcePolicy）
struct ForceIncluder {
    signatures: Vec<String>,
}

impl ForceIncluder {
    fn new() -> Self {
        ForceIncluder {
            signatures: vec!["WEAP".to_string()],
        }
    }
}

impl Patcher for ForceIncluder {
    fn name(&self) -> &str {
        "ForceIncluder"
    }
    fn signatures(&self) -> &[String] {
        &self.signatures
    }
    fn apply(
        &self,
        merged: &MergedRecord,
        _ctx: &MergeContext<'_>,
    ) -> Result<PatchDecision, PatchError> {
        Ok(PatchDecision::ForceInclude(merged.winner().record.clone()))
    }
}

#[test]
fn test_force_policy_always() {
    let dir = tempdir().unwrap();
    let base = write_weap_plugin(
        dir.path(),
        "Base.esm",
        &[],
        vec![weap_record(0x00000800, "IronSword", "Iron Sword", &[0x00000900])],
    );
    let order = LoadOrder::new(vec![base]).unwrap();

    let profile = GameProfile::builtin("skyrim").unwrap();
    let mut registry = PatcherRegistry::with_force_policy(ForcePolicy::Always);
    registry.register(Box::new(ForceIncluder::new()));

    let (patch, summary) = PatchPipeline::new(profile, registry)
        .build(&order, "BashedPatch.esp")
        .unwrap();

    assert_eq!(summary.record_count, 1, "Always策略下强制收录生效");
    assert_eq!(
        patch.all_records()[0].find_subrecord("FULL").unwrap().data,
        zstr("Iron Sword")
    );
}

#[test]
fn test_force_policy_only_if_changed() {
    let dir = tempdir().unwrap();
    let base = write_weap_plugin(
        dir.path(),
        "Base.esm",
        &[],
        vec![weap_record(0x00000800, "IronSword", "Iron Sword", &[0x00000900])],
    );
    let order = LoadOrder::new(vec![base]).unwrap();

    let profile = GameProfile::builtin("skyrim").unwrap();
    let mut registry = PatcherRegistry::with_force_policy(ForcePolicy::OnlyIfChanged);
    registry.register(Box::new(ForceIncluder::new()));

    let (_, summary) = PatchPipeline::new(profile, registry)
        .build(&order, "BashedPatch.esp")
        .unwrap();

    assert_eq!(summary.record_count, 0, "OnlyIfChanged策略下未改动的强制收录被丢弃");
}
