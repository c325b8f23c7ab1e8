use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;

use esp_patcher::{
    ForcePolicy, GameProfile, ListMergePatcher, LoadOrder, PatchDebugger, PatchPipeline,
    PatcherRegistry, Plugin, DEFAULT_PATCH_NAME,
};

#[derive(Parser)]
#[command(name = "esp_patcher")]
#[command(about = "按加载顺序合并ESP/ESM/ESL插件记录，生成单个合并补丁")]
#[command(version = "0.3.0")]
struct Cli {
    /// 加载顺序文件路径（每行一个插件路径，#开头为注释）
    #[arg(short, long)]
    load_order: PathBuf,

    /// 输出补丁文件路径
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 游戏配置名称（内置: skyrim, fallout4），或JSON配置文件路径
    #[arg(short, long, default_value = "skyrim")]
    profile: String,

    /// 启用的合并标签（逗号分隔），默认启用配置中全部并集标签
    #[arg(long)]
    merge_tags: Option<String>,

    /// 强制收录策略仅在实际改动时生效
    #[arg(long)]
    only_if_changed: bool,

    /// 显示每个插件的统计信息
    #[arg(long)]
    stats: bool,

    /// 试运行：只报告会合并什么，不写输出文件
    #[arg(long)]
    dry_run: bool,

    /// 静默模式(仅输出错误)
    #[arg(long)]
    quiet: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let order = LoadOrder::from_file(&cli.load_order)
        .with_context(|| format!("无法读取加载顺序文件 {:?}", cli.load_order))?;

    let profile = load_profile(&cli.profile)?;

    if cli.stats {
        print_stats(&order)?;
    }

    let tag_names = resolve_tag_names(&cli, &profile);
    if tag_names.is_empty() {
        bail!("游戏配置 {} 没有可用的并集合并标签", profile.name);
    }

    let tag_refs: Vec<&str> = tag_names.iter().map(|s| s.as_str()).collect();
    let patcher = ListMergePatcher::from_profile(&profile, &tag_refs)
        .context("构造列表合并补丁器失败")?;

    let force_policy = if cli.only_if_changed {
        ForcePolicy::OnlyIfChanged
    } else {
        ForcePolicy::Always
    };

    let mut registry = PatcherRegistry::with_force_policy(force_policy);
    registry.register(Box::new(patcher));

    let mut pipeline = PatchPipeline::new(profile, registry);

    if cli.dry_run {
        let (plugin, summary) = pipeline
            .build(&order, DEFAULT_PATCH_NAME)
            .context("补丁构建失败")?;

        if !cli.quiet {
            println!("试运行：将合并 {} 条记录", summary.record_count);
            println!("主文件列表: {:?}", summary.masters);
            for form_id in &summary.touched {
                println!("  触碰: {}", form_id);
            }
            print!("{}", PatchDebugger::dump_plugin(&plugin));
        }
        return Ok(());
    }

    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PATCH_NAME));

    let summary = pipeline
        .build_to_file(&order, &output)
        .context("补丁构建失败")?;

    if !cli.quiet {
        println!(
            "补丁已写入 {:?}: {} 条记录, {} 个主文件",
            output,
            summary.record_count,
            summary.masters.len()
        );
    }

    Ok(())
}

/// 加载游戏配置（内置名称或JSON文件路径）
fn load_profile(name_or_path: &str) -> anyhow::Result<GameProfile> {
    let path = PathBuf::from(name_or_path);
    if path.exists() {
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("无法读取配置文件 {:?}", path))?;
        let mut profiles = GameProfile::from_json(&json).context("配置文件解析失败")?;

        // 单配置文件取第一个，多配置按文件名主干匹配
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
        if let Some(profile) = profiles.remove(stem) {
            return Ok(profile);
        }
        if profiles.len() == 1 {
            if let Some(profile) = profiles.into_values().next() {
                return Ok(profile);
            }
        }
        bail!("配置文件 {:?} 中找不到可用的游戏配置", path);
    }

    GameProfile::builtin(name_or_path)
        .with_context(|| format!("未知的内置游戏配置: {}", name_or_path))
}

/// 解析启用的合并标签
fn resolve_tag_names(cli: &Cli, profile: &GameProfile) -> Vec<String> {
    match &cli.merge_tags {
        Some(list) => list
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => {
            // 默认启用全部并集标签
            let mut names: Vec<String> = profile
                .merge_tags
                .iter()
                .filter(|(_, tag)| tag.strategy == esp_patcher::MergeStrategy::Union)
                .map(|(name, _)| name.clone())
                .collect();
            names.sort();
            names
        }
    }
}

/// 打印每个插件的统计信息
fn print_stats(order: &LoadOrder) -> anyhow::Result<()> {
    for entry in order.iter() {
        let plugin = Plugin::load(entry.path.clone())
            .with_context(|| format!("无法加载插件 {}", entry.name))?;
        println!("{}", plugin.get_stats());
    }
    Ok(())
}
