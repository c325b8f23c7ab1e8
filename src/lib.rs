pub mod datatypes;
pub mod record;
pub mod group;
pub mod subrecord;
pub mod plugin;
pub mod formid;
pub mod load_order;
pub mod schema;
pub mod merge;
pub mod patcher;
pub mod pipeline;
pub mod io;
pub mod utils;
pub mod debug;

// 重新导出主要结构
pub use plugin::{Plugin, PluginStats};
pub use record::Record;
pub use group::Group;
pub use subrecord::Subrecord;
pub use formid::{FormId, FormIdResolver};
pub use load_order::LoadOrder;
pub use schema::{GameProfile, MergeStrategy};
pub use merge::{MergedRecord, MergedRecordSet};
pub use patcher::{
    ForcePolicy, ListMergePatcher, MergeContext, PatchDecision, Patcher, PatcherRegistry,
};
pub use pipeline::{PatchPipeline, PatchSummary, PipelineState};
pub use utils::PatchError;
pub use debug::PatchDebugger;

// 常量定义
pub const SUPPORTED_EXTENSIONS: &[&str] = &["esp", "esm", "esl"];
pub const DEFAULT_PATCH_NAME: &str = "BashedPatch.esp";
