use std::path::PathBuf;

use crossbind::build_tasks::{self, Config};
use crossbind::config::TargetPlatform;
use crossbind::shaders::toolchain::ToolchainLoader;
use crossbind::util::relative_path;

fn env_flag(key: &str) -> bool {
    match std::env::var(key).ok() {
        None => false,
        Some(s) if s.is_empty() => false,
        Some(s) if s.to_lowercase() == "false" => false,
        _ => true,
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_dir<'a>(key: &str, default: impl IntoIterator<Item = &'a str>) -> PathBuf {
    env_var(key).map_or_else(|| relative_path(default), PathBuf::from)
}

/// Compiles every shader under shaders/source into shaders/compiled
/// requires dxc and/or glslang on the path (ie, from the vulkan sdk), or CROSSBIND_TOOLS_DIR
pub fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();

    let loader = ToolchainLoader::global();
    let toolchain = loader.get()?;

    let platform = if env_flag("CROSSBIND_ANDROID") {
        TargetPlatform::Android
    } else {
        loader.config().platform
    };

    let config = Config {
        shaders_source_dir: env_dir("CROSSBIND_SHADERS_DIR", ["shaders", "source"]),
        compiled_shaders_dir: env_dir("CROSSBIND_COMPILED_DIR", ["shaders", "compiled"]),
        entry_point: env_var("CROSSBIND_ENTRY_POINT").unwrap_or_else(|| "main".to_string()),
        backend: loader.config().backend,
        platform,
    };

    build_tasks::write_precompiled_shaders(config, toolchain.as_ref())
}
