use crate::load_order::LoadOrder;
use crate::utils::PatchError;
use std::cell::RefCell;
use std::collections::HashMap;

/// 表示"定义于本文件"的主文件索引哨兵值
pub const SELF_INDEX_SENTINEL: u8 = 0xFF;

/// 归一化FormID
///
/// 高8位 = 来源插件在加载顺序中的索引，低24位 = 文件本地ID。
/// 同一个归一化ID在所有文件中指向同一个逻辑游戏对象。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FormId(pub u32);

impl FormId {
    /// 由加载顺序索引和本地ID构造
    pub fn new(load_index: u8, local_id: u32) -> Self {
        FormId(((load_index as u32) << 24) | (local_id & 0x00FFFFFF))
    }

    /// 来源插件的加载顺序索引
    pub fn load_index(self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// 文件本地24位ID
    pub fn local_id(self) -> u32 {
        self.0 & 0x00FFFFFF
    }
}

impl std::fmt::Display for FormId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}:{:06X}", self.load_index(), self.local_id())
    }
}

/// FormID解析器
///
/// 将文件本地编码的FormID（高字节为该文件主列表中的索引）转换为
/// 进程内统一的归一化FormID。解析结果按 (插件, 本地ID) 缓存，
/// 每条记录只解析一次。
#[derive(Debug)]
pub struct FormIdResolver {
    /// 加载顺序中的插件名（索引即加载位置）
    names: Vec<String>,
    /// 小写插件名 -> 加载顺序索引
    index: HashMap<String, u8>,
    /// 已注册插件的主文件列表（按加载顺序索引）
    masters: HashMap<u8, Vec<String>>,
    /// 解析缓存
    cache: RefCell<HashMap<(u8, u32), FormId>>,
}

impl FormIdResolver {
    /// 从加载顺序构造解析器
    pub fn new(order: &LoadOrder) -> Self {
        let names: Vec<String> = order.names().map(|n| n.to_string()).collect();
        let index = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.to_lowercase(), i as u8))
            .collect();

        FormIdResolver {
            names,
            index,
            masters: HashMap::new(),
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// 注册一个插件的主文件列表
    ///
    /// 校验每个主文件都在加载顺序中且位于该插件之前。
    pub fn register_plugin(&mut self, name: &str, masters: Vec<String>) -> Result<(), PatchError> {
        let plugin_index = self.index_of(name).ok_or_else(|| PatchError::InvalidLoadOrder {
            reason: format!("插件 {} 不在加载顺序中", name),
        })?;

        for master in &masters {
            match self.index_of(master) {
                Some(master_index) if master_index < plugin_index => {}
                Some(_) => {
                    return Err(PatchError::InvalidLoadOrder {
                        reason: format!("插件 {} 的主文件 {} 必须位于其之前", name, master),
                    });
                }
                None => {
                    return Err(PatchError::InvalidLoadOrder {
                        reason: format!("插件 {} 的主文件 {} 不在加载顺序中", name, master),
                    });
                }
            }
        }

        self.masters.insert(plugin_index, masters);
        Ok(())
    }

    /// 查找插件的加载顺序索引（大小写不敏感）
    pub fn index_of(&self, name: &str) -> Option<u8> {
        self.index.get(&name.to_lowercase()).copied()
    }

    /// 按加载顺序索引取插件名
    pub fn name_of(&self, load_index: u8) -> Option<&str> {
        self.names.get(load_index as usize).map(|s| s.as_str())
    }

    /// 已注册主文件列表的插件数量
    pub fn registered_count(&self) -> usize {
        self.masters.len()
    }

    /// 解析FormID
    ///
    /// 本地编码的高字节是来源文件主列表中的索引：
    /// - 小于主列表长度 -> 指向对应主文件
    /// - 等于主列表长度或为 0xFF 哨兵 -> 定义于来源文件本身
    /// - 其他值 -> 断裂的依赖链，必须报 MissingMaster，绝不静默截断
    pub fn resolve(&self, origin: &str, raw_form_id: u32) -> Result<FormId, PatchError> {
        let origin_index = self.index_of(origin).ok_or_else(|| PatchError::InvalidLoadOrder {
            reason: format!("插件 {} 不在加载顺序中", origin),
        })?;

        if let Some(cached) = self.cache.borrow().get(&(origin_index, raw_form_id)) {
            return Ok(*cached);
        }

        let masters = self.masters.get(&origin_index).ok_or_else(|| {
            PatchError::InvalidLoadOrder {
                reason: format!("插件 {} 尚未注册主文件列表", origin),
            }
        })?;

        let master_index = (raw_form_id >> 24) as u8;
        let target_load_index = if (master_index as usize) < masters.len() {
            let master_name = &masters[master_index as usize];
            self.index_of(master_name).ok_or_else(|| PatchError::MissingMaster {
                file: origin.to_string(),
                index: master_index,
                master_count: masters.len(),
            })?
        } else if master_index as usize == masters.len() || master_index == SELF_INDEX_SENTINEL {
            // 定义于本文件
            origin_index
        } else {
            return Err(PatchError::MissingMaster {
                file: origin.to_string(),
                index: master_index,
                master_count: masters.len(),
            });
        };

        let resolved = FormId::new(target_load_index, raw_form_id & 0x00FFFFFF);
        self.cache
            .borrow_mut()
            .insert((origin_index, raw_form_id), resolved);
        Ok(resolved)
    }
}
