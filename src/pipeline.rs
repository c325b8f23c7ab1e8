use crate::formid::{FormId, FormIdResolver};
use crate::group::Group;
use crate::io::{DefaultPatchWriter, PatchWriter};
use crate::load_order::LoadOrder;
use crate::merge::MergedRecordSet;
use crate::patcher::{MergeContext, PatchDecision, PatcherRegistry, ForcePolicy};
use crate::plugin::Plugin;
use crate::record::Record;
use crate::schema::{FieldKind, GameProfile};
use crate::utils::PatchError;
use crate::datatypes::RecordFlags;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// 流水线状态
///
/// Failed 可从任何非终止状态到达。没有部分成功模式：
/// 半合并的补丁在游戏内加载是不安全的。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Scanning,
    Merging,
    Writing,
    Done,
    Failed,
}

/// 补丁构建结果报告
#[derive(Debug)]
pub struct PatchSummary {
    /// 被触碰（进入输出）的归一化FormID，按首见顺序
    pub touched: Vec<FormId>,
    /// 输出补丁的主文件列表（按加载顺序相对位置）
    pub masters: Vec<String>,
    /// 输出的记录数
    pub record_count: usize,
    /// 扫描的插件数
    pub scanned_plugins: usize,
}

/// 合并阶段对单条记录的最终裁决
struct Decision {
    form_id: FormId,
    signature: String,
    record: Record,
}

/// 补丁流水线
///
/// 两遍处理：扫描遍按加载顺序构建合并记录集，构建遍应用
/// 已注册的补丁器并写出一个合成插件。
pub struct PatchPipeline {
    profile: GameProfile,
    registry: PatcherRegistry,
    state: PipelineState,
    /// 输出插件头部的作者字段
    pub author: String,
    /// 输出插件头部的描述字段
    pub description: String,
}

impl PatchPipeline {
    /// 创建流水线
    pub fn new(profile: GameProfile, registry: PatcherRegistry) -> Self {
        PatchPipeline {
            profile,
            registry,
            state: PipelineState::Idle,
            author: "esp_patcher".to_string(),
            description: "合并补丁 (Bashed Patch)".to_string(),
        }
    }

    /// 当前状态
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// 构建补丁（内存中）
    ///
    /// 任何 Format / MissingMaster / MergeConflict /
    /// UnsupportedCompression 错误都会中止整次构建并丢弃
    /// 部分合并状态。
    pub fn build(
        &mut self,
        order: &LoadOrder,
        patch_name: &str,
    ) -> Result<(Plugin, PatchSummary), PatchError> {
        self.state = PipelineState::Idle;
        match self.run(order, patch_name) {
            Ok(result) => {
                self.state = PipelineState::Done;
                Ok(result)
            }
            Err(e) => {
                self.state = PipelineState::Failed;
                Err(e)
            }
        }
    }

    /// 构建补丁并写入文件
    pub fn build_to_file(
        &mut self,
        order: &LoadOrder,
        output_path: &Path,
    ) -> Result<PatchSummary, PatchError> {
        self.build_to_file_with(order, output_path, &DefaultPatchWriter)
    }

    /// 构建补丁并通过指定写入器输出
    pub fn build_to_file_with(
        &mut self,
        order: &LoadOrder,
        output_path: &Path,
        writer: &dyn PatchWriter,
    ) -> Result<PatchSummary, PatchError> {
        let patch_name = output_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(crate::DEFAULT_PATCH_NAME)
            .to_string();

        let (plugin, summary) = self.build(order, &patch_name)?;

        let bytes = plugin.to_bytes()?;
        if let Err(e) = writer.write(&bytes, output_path) {
            self.state = PipelineState::Failed;
            return Err(e);
        }

        Ok(summary)
    }

    fn run(
        &mut self,
        order: &LoadOrder,
        patch_name: &str,
    ) -> Result<(Plugin, PatchSummary), PatchError> {
        // 配置错误必须在合并开始前暴露
        self.registry.validate()?;

        self.state = PipelineState::Scanning;
        let (set, resolver) = self.scan(order)?;

        self.state = PipelineState::Merging;
        let decisions = self.merge(&set, &resolver, order)?;

        self.state = PipelineState::Writing;
        let (plugin, summary) = self.write(decisions, &resolver, order, patch_name)?;

        Ok((plugin, summary))
    }

    /// 扫描遍
    ///
    /// 插件解码彼此独立，可以并行；但插入合并记录集必须
    /// 严格按加载顺序进行（优先级取决于加载位置而非解码
    /// 完成顺序），有序 collect 即为时序屏障。
    fn scan(&self, order: &LoadOrder) -> Result<(MergedRecordSet, FormIdResolver), PatchError> {
        let interest = self.registry.interest_set();

        let entries: Vec<_> = order.iter().collect();
        let plugins: Result<Vec<Plugin>, PatchError> = entries
            .par_iter()
            .map(|entry| Plugin::load(entry.path.clone()))
            .collect();
        let plugins = plugins?;

        let mut resolver = FormIdResolver::new(order);
        let mut set = MergedRecordSet::new();

        for plugin in &plugins {
            resolver.register_plugin(plugin.get_name(), plugin.masters.clone())?;

            // 顶级组签名必须是当前游戏配置已知的
            for group in &plugin.groups {
                let label = group.get_label_string();
                if !self.profile.is_known_signature(&label) {
                    return Err(PatchError::Format {
                        file: plugin.get_name().to_string(),
                        signature: label,
                        offset: 0,
                        reason: "当前游戏配置无法识别的顶级组签名".to_string(),
                    });
                }
            }

            for record in plugin.all_records() {
                if !interest.contains(&record.signature) {
                    continue;
                }
                // 已删除/已忽略的记录不参与合并
                let flags = record.get_flags();
                if flags.contains(RecordFlags::DELETED) || flags.contains(RecordFlags::IGNORED) {
                    continue;
                }

                let normalized = self
                    .normalize_record(record, plugin.get_name(), &resolver)
                    .map_err(|e| e.with_file(plugin.get_name()))?;
                let form_id = FormId(normalized.form_id);
                set.insert(form_id, plugin.get_name(), normalized)?;
            }
        }

        Ok((set, resolver))
    }

    /// 把记录的FormID字段全部转入归一化空间
    ///
    /// 每条记录只做一次（解析器内部有缓存）；字符串字段顺带
    /// 校验null终止符。未在配置表中声明的子记录原样保留。
    fn normalize_record(
        &self,
        record: &Record,
        origin: &str,
        resolver: &FormIdResolver,
    ) -> Result<Record, PatchError> {
        let mut normalized = record.clone();

        let own = resolver.resolve(origin, record.form_id)?;
        normalized.form_id = own.0;

        for subrecord in &mut normalized.subrecords {
            match self.profile.field_kind(&record.signature, &subrecord.signature) {
                FieldKind::FormId => {
                    let raw = subrecord.as_u32().ok_or_else(|| {
                        PatchError::format(
                            subrecord.signature.clone(),
                            0,
                            format!("FormID字段长度应为4字节，实际 {}", subrecord.data.len()),
                        )
                    })?;
                    let resolved = resolver.resolve(origin, raw)?;
                    subrecord.data = resolved.0.to_le_bytes().to_vec();
                    subrecord.size = 4;
                }
                FieldKind::FormIdList => {
                    let raw_list = subrecord.as_u32_list().ok_or_else(|| {
                        PatchError::format(
                            subrecord.signature.clone(),
                            0,
                            format!("FormID列表长度应为4的倍数，实际 {}", subrecord.data.len()),
                        )
                    })?;
                    let mut data = Vec::with_capacity(raw_list.len() * 4);
                    for raw in raw_list {
                        let resolved = resolver.resolve(origin, raw)?;
                        data.extend_from_slice(&resolved.0.to_le_bytes());
                    }
                    subrecord.data = data;
                }
                FieldKind::String => {
                    subrecord.validate_zstring()?;
                }
                FieldKind::Opaque => {}
            }
        }

        normalized.mark_modified();
        Ok(normalized)
    }

    /// 合并遍
    ///
    /// 每个补丁器都只看到扫描完成后的同一份快照，同一轮内
    /// 互相不可见；裁决按固定的注册顺序应用。
    fn merge(
        &self,
        set: &MergedRecordSet,
        resolver: &FormIdResolver,
        order: &LoadOrder,
    ) -> Result<Vec<Decision>, PatchError> {
        let ctx = MergeContext {
            profile: &self.profile,
            resolver,
            order,
        };

        let mut decisions = Vec::new();

        for merged in set.iter() {
            let mut working: Option<Record> = None;
            let mut changed = false;
            let mut forced = false;

            for patcher in self.registry.iter() {
                if !patcher.signatures().iter().any(|s| *s == merged.signature) {
                    continue;
                }

                match patcher.apply(merged, &ctx)? {
                    PatchDecision::Unchanged => {}
                    PatchDecision::Modified(record) => {
                        working = Some(record);
                        changed = true;
                    }
                    PatchDecision::ForceInclude(record) => {
                        working = Some(record);
                        forced = true;
                    }
                }
            }

            let retained = match self.registry.force_policy {
                ForcePolicy::Always => changed || forced,
                ForcePolicy::OnlyIfChanged => changed,
            };

            if retained {
                if let Some(record) = working {
                    decisions.push(Decision {
                        form_id: merged.form_id,
                        signature: merged.signature.clone(),
                        record,
                    });
                }
            }
        }

        Ok(decisions)
    }

    /// 写出遍
    ///
    /// 主文件列表 = 保留记录的归一化FormID来源文件（记录自身
    /// 及配置已知的引用字段），按加载顺序相对位置排列；所有
    /// 归一化FormID重映射到输出主文件空间。
    fn write(
        &self,
        mut decisions: Vec<Decision>,
        resolver: &FormIdResolver,
        _order: &LoadOrder,
        patch_name: &str,
    ) -> Result<(Plugin, PatchSummary), PatchError> {
        // 收集需要的来源文件（加载顺序索引，BTreeSet保证升序）
        let mut needed: BTreeSet<u8> = BTreeSet::new();
        for decision in &decisions {
            needed.insert(decision.form_id.load_index());
            for subrecord in &decision.record.subrecords {
                match self.profile.field_kind(&decision.signature, &subrecord.signature) {
                    FieldKind::FormId => {
                        if let Some(value) = subrecord.as_u32() {
                            needed.insert(FormId(value).load_index());
                        }
                    }
                    FieldKind::FormIdList => {
                        if let Some(values) = subrecord.as_u32_list() {
                            for value in values {
                                needed.insert(FormId(value).load_index());
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        let mut masters = Vec::with_capacity(needed.len());
        let mut remap: HashMap<u8, u8> = HashMap::new();
        for (output_index, load_index) in needed.iter().enumerate() {
            let name = resolver.name_of(*load_index).ok_or_else(|| {
                PatchError::InvalidLoadOrder {
                    reason: format!("加载顺序索引 {} 越界", load_index),
                }
            })?;
            masters.push(name.to_string());
            remap.insert(*load_index, output_index as u8);
        }

        // 触碰列表（首见顺序）
        let touched: Vec<FormId> = decisions.iter().map(|d| d.form_id).collect();

        // 重映射到输出主文件空间
        for decision in &mut decisions {
            decision.record.form_id =
                Self::remap_form_id(decision.record.form_id, &remap, patch_name)?;

            let signature = decision.signature.clone();
            for subrecord in &mut decision.record.subrecords {
                match self.profile.field_kind(&signature, &subrecord.signature) {
                    FieldKind::FormId => {
                        if let Some(value) = subrecord.as_u32() {
                            let mapped = Self::remap_form_id(value, &remap, patch_name)?;
                            subrecord.data = mapped.to_le_bytes().to_vec();
                        }
                    }
                    FieldKind::FormIdList => {
                        if let Some(values) = subrecord.as_u32_list() {
                            let mut data = Vec::with_capacity(values.len() * 4);
                            for value in values {
                                let mapped = Self::remap_form_id(value, &remap, patch_name)?;
                                data.extend_from_slice(&mapped.to_le_bytes());
                            }
                            subrecord.data = data;
                        }
                    }
                    _ => {}
                }
            }
            decision.record.mark_modified();
        }

        // 组内按归一化FormID排序，组按首见签名顺序
        let record_count = decisions.len();
        let mut group_order: Vec<String> = Vec::new();
        let mut grouped: HashMap<String, Vec<(FormId, Record)>> = HashMap::new();

        for decision in decisions {
            if !group_order.contains(&decision.signature) {
                group_order.push(decision.signature.clone());
            }
            grouped
                .entry(decision.signature)
                .or_default()
                .push((decision.form_id, decision.record));
        }

        let mut groups = Vec::with_capacity(group_order.len());
        for signature in &group_order {
            let mut records = grouped.remove(signature).unwrap_or_default();
            records.sort_by_key(|(form_id, _)| *form_id);

            let mut group = Group::new_top_level(signature);
            for (_, record) in records {
                group.push_record(record);
            }
            groups.push(group);
        }

        let plugin = Plugin::synthesize(
            patch_name,
            &self.author,
            &self.description,
            masters.clone(),
            groups,
        );

        let summary = PatchSummary {
            touched,
            masters,
            record_count,
            scanned_plugins: resolver_plugin_count(resolver),
        };

        Ok((plugin, summary))
    }

    /// 归一化FormID -> 输出文件本地编码
    fn remap_form_id(
        normalized: u32,
        remap: &HashMap<u8, u8>,
        patch_name: &str,
    ) -> Result<u32, PatchError> {
        let id = FormId(normalized);
        let output_index = remap.get(&id.load_index()).ok_or_else(|| {
            PatchError::MissingMaster {
                file: patch_name.to_string(),
                index: id.load_index(),
                master_count: remap.len(),
            }
        })?;
        Ok(((*output_index as u32) << 24) | id.local_id())
    }
}

/// 扫描过的插件数量
fn resolver_plugin_count(resolver: &FormIdResolver) -> usize {
    resolver.registered_count()
}
