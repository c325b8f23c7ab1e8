use crate::formid::FormId;
use crate::record::Record;
use crate::schema::MergeTag;
use crate::subrecord::Subrecord;
use crate::utils::PatchError;
use std::collections::{HashMap, HashSet};

/// 一个插件对某条记录的贡献
#[derive(Debug, Clone)]
pub struct Contribution {
    /// 来源插件名
    pub source: String,
    /// 记录快照（FormID字段已归一化）
    pub record: Record,
}

/// 合并后的记录
///
/// 同一个归一化FormID在多个插件中的全部贡献，按加载顺序排列。
/// 默认策略整记录后者胜出；带合并标签的字段组走并集/显式覆盖原语。
#[derive(Debug)]
pub struct MergedRecord {
    /// 归一化FormID
    pub form_id: FormId,
    /// 记录签名
    pub signature: String,
    /// 按加载顺序的全部贡献（至少一个）
    pub contributions: Vec<Contribution>,
    /// 字段组溯源：子记录签名 -> 最后修改它的插件
    pub provenance: HashMap<String, String>,
}

impl MergedRecord {
    /// 首个贡献（通常是定义该记录的主文件）
    pub fn base(&self) -> &Contribution {
        &self.contributions[0]
    }

    /// 最后加载的贡献（整记录默认胜者）
    pub fn winner(&self) -> &Contribution {
        self.contributions.last().expect("contributions非空")
    }

    /// 收集一条记录中某签名的全部负载（按出现顺序）
    fn payloads_of(record: &Record, signature: &str) -> Vec<Vec<u8>> {
        record
            .subrecords
            .iter()
            .filter(|sr| sr.signature == signature)
            .map(|sr| sr.data.clone())
            .collect()
    }

    /// 字段组的"最后显式修改者"值
    ///
    /// 以首个贡献为基准，后续贡献中与基准不同的视为显式修改，
    /// 取最后一个显式修改者的值；没有任何修改时保留基准值。
    /// 与基准相同的贡献不算触碰该字段，不会覆盖先前的显式修改。
    pub fn last_explicit_payloads(&self, signature: &str) -> Vec<Vec<u8>> {
        let base = Self::payloads_of(&self.base().record, signature);
        let mut current = base.clone();

        for contribution in &self.contributions[1..] {
            let payloads = Self::payloads_of(&contribution.record, signature);
            if payloads != base {
                current = payloads;
            }
        }

        current
    }

    /// 字段组的并集（FormID列表）
    ///
    /// 按贡献的加载顺序合并，保留首见顺序，按归一化FormID去重。
    pub fn union_form_ids(&self, signatures: &[String]) -> Vec<FormId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for contribution in &self.contributions {
            for subrecord in &contribution.record.subrecords {
                if !signatures.contains(&subrecord.signature) {
                    continue;
                }
                if let Some(values) = subrecord.as_u32_list() {
                    for value in values {
                        let id = FormId(value);
                        if seen.insert(id) {
                            out.push(id);
                        }
                    }
                }
            }
        }

        out
    }
}

/// 合并记录集
///
/// 归一化FormID -> 合并记录，保留首见插入顺序（决定输出的确定性）。
/// 每次补丁构建建一次，输出写完即丢弃。
#[derive(Debug, Default)]
pub struct MergedRecordSet {
    records: HashMap<FormId, MergedRecord>,
    order: Vec<FormId>,
}

impl MergedRecordSet {
    /// 创建空集合
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入一条贡献
    ///
    /// 必须严格按加载顺序调用：后插入的贡献拥有更高优先级。
    pub fn insert(
        &mut self,
        form_id: FormId,
        source: &str,
        record: Record,
    ) -> Result<(), PatchError> {
        match self.records.get_mut(&form_id) {
            Some(merged) => {
                if merged.signature != record.signature {
                    return Err(PatchError::Format {
                        file: source.to_string(),
                        signature: record.signature.clone(),
                        offset: 0,
                        reason: format!(
                            "FormID {} 的记录类型冲突: {} vs {}",
                            form_id, merged.signature, record.signature
                        ),
                    });
                }

                // 溯源：与基准不同的字段组记为该插件修改
                let base = merged.base().record.clone();
                for signature in Self::distinct_signatures(&record) {
                    if MergedRecord::payloads_of(&record, &signature)
                        != MergedRecord::payloads_of(&base, &signature)
                    {
                        merged.provenance.insert(signature, source.to_string());
                    }
                }

                merged.contributions.push(Contribution {
                    source: source.to_string(),
                    record,
                });
            }
            None => {
                let mut provenance = HashMap::new();
                for signature in Self::distinct_signatures(&record) {
                    provenance.insert(signature, source.to_string());
                }

                self.records.insert(
                    form_id,
                    MergedRecord {
                        form_id,
                        signature: record.signature.clone(),
                        contributions: vec![Contribution {
                            source: source.to_string(),
                            record,
                        }],
                        provenance,
                    },
                );
                self.order.push(form_id);
            }
        }
        Ok(())
    }

    /// 记录中出现的子记录签名（按出现顺序去重）
    fn distinct_signatures(record: &Record) -> Vec<String> {
        let mut seen = HashSet::new();
        record
            .subrecords
            .iter()
            .filter(|sr| seen.insert(sr.signature.clone()))
            .map(|sr| sr.signature.clone())
            .collect()
    }

    /// 查询合并记录
    pub fn get(&self, form_id: FormId) -> Option<&MergedRecord> {
        self.records.get(&form_id)
    }

    /// 按首见顺序迭代
    pub fn iter(&self) -> impl Iterator<Item = &MergedRecord> {
        self.order.iter().filter_map(move |id| self.records.get(id))
    }

    /// 记录数量
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// 应用字段组合并策略，生成解析后的记录
///
/// 以最后贡献为骨架：并集标签覆盖的字段组替换为跨插件并集
/// （伴随计数子记录同步更新），其余字段组取"最后显式修改者"值。
/// 所有FormID负载都处于归一化空间，写出前由流水线重映射。
pub fn resolve_with_tags(merged: &MergedRecord, union_tags: &[&MergeTag]) -> Record {
    let mut result = merged.winner().record.clone();

    // 并集标签预计算
    let mut union_sig_to_tag: HashMap<String, usize> = HashMap::new();
    let mut count_sig_to_tag: HashMap<String, usize> = HashMap::new();
    let mut union_payloads: Vec<Vec<u8>> = Vec::new();
    let mut union_counts: Vec<u32> = Vec::new();

    for (index, tag) in union_tags.iter().enumerate() {
        let ids = merged.union_form_ids(&tag.subrecords);
        let mut data = Vec::with_capacity(ids.len() * 4);
        for id in &ids {
            data.extend_from_slice(&id.0.to_le_bytes());
        }
        union_counts.push(ids.len() as u32);
        union_payloads.push(data);

        for signature in &tag.subrecords {
            union_sig_to_tag.insert(signature.clone(), index);
        }
        if let Some(count_signature) = &tag.count_subrecord {
            count_sig_to_tag.insert(count_signature.clone(), index);
        }
    }

    let mut new_subrecords = Vec::new();
    let mut emitted_unions = HashSet::new();
    let mut handled_signatures = HashSet::new();

    for subrecord in &result.subrecords {
        if let Some(&tag_index) = union_sig_to_tag.get(&subrecord.signature) {
            // 并集字段组只发射一次，位置取骨架中的首次出现
            if emitted_unions.insert(tag_index) {
                new_subrecords.push(Subrecord::new(
                    &subrecord.signature,
                    union_payloads[tag_index].clone(),
                ));
            }
            continue;
        }

        if let Some(&tag_index) = count_sig_to_tag.get(&subrecord.signature) {
            new_subrecords.push(Subrecord::new(
                &subrecord.signature,
                union_counts[tag_index].to_le_bytes().to_vec(),
            ));
            continue;
        }

        // 其余字段组：最后显式修改者，整组在首次出现处发射
        if handled_signatures.insert(subrecord.signature.clone()) {
            for payload in merged.last_explicit_payloads(&subrecord.signature) {
                new_subrecords.push(Subrecord::new(&subrecord.signature, payload));
            }
        }
    }

    // 骨架中没有、但其他贡献引入了的并集字段组追加到末尾
    for (tag_index, tag) in union_tags.iter().enumerate() {
        if emitted_unions.contains(&tag_index) || union_payloads[tag_index].is_empty() {
            continue;
        }
        if let Some(count_signature) = &tag.count_subrecord {
            new_subrecords.push(Subrecord::new(
                count_signature,
                union_counts[tag_index].to_le_bytes().to_vec(),
            ));
        }
        if let Some(first_signature) = tag.subrecords.first() {
            new_subrecords.push(Subrecord::new(
                first_signature,
                union_payloads[tag_index].clone(),
            ));
        }
    }

    result.subrecords = new_subrecords;
    result.mark_modified();
    result
}
