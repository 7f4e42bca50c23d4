use std::path::{Path, PathBuf};

use log::*;
use serde::{Deserialize, Serialize};

/// the graphics api the compiled bytecode is destined for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    D3D12,
    #[default]
    Vulkan,
    Metal,
}

impl BackendKind {
    /// vulkan and metal both consume spirv (metal converts it later)
    pub fn wants_spirv(self) -> bool {
        matches!(self, Self::Vulkan | Self::Metal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetPlatform {
    #[default]
    Desktop,
    /// reflection-only spirv instructions are stripped for this target
    Android,
}

/// where to find the native shader toolchain
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolchainConfig {
    /// searched before PATH
    pub tools_dir: Option<PathBuf>,
    pub dxc: Option<PathBuf>,
    pub glslang: Option<PathBuf>,
    pub spirv_dis: Option<PathBuf>,
    pub spirv_cross: Option<PathBuf>,
    pub backend: BackendKind,
    pub platform: TargetPlatform,
}

pub const CONFIG_ENV: &str = "CROSSBIND_CONFIG";
pub const TOOLS_DIR_ENV: &str = "CROSSBIND_TOOLS_DIR";
pub const BACKEND_ENV: &str = "CROSSBIND_BACKEND";

impl ToolchainConfig {
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }

    /// reads the file named by CROSSBIND_CONFIG (if any), then applies env overrides
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => {
                debug!("loading toolchain config from {path:?}");
                Self::from_json_file(Path::new(&path))?
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;

        Ok(config)
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<()> {
        if let Some(dir) = lookup(TOOLS_DIR_ENV).filter(|s| !s.is_empty()) {
            self.tools_dir = Some(PathBuf::from(dir));
        }

        if let Some(backend) = lookup(BACKEND_ENV).filter(|s| !s.is_empty()) {
            self.backend = match backend.to_lowercase().as_str() {
                "d3d12" => BackendKind::D3D12,
                "vulkan" => BackendKind::Vulkan,
                "metal" => BackendKind::Metal,
                other => anyhow::bail!("unknown backend in {BACKEND_ENV}: {other}"),
            };
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_json() {
        let json = r#"{ "toolsDir": "/opt/vulkan/bin", "backend": "d3d12" }"#;
        let config: ToolchainConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.tools_dir, Some(PathBuf::from("/opt/vulkan/bin")));
        assert_eq!(config.backend, BackendKind::D3D12);
        assert_eq!(config.platform, TargetPlatform::Desktop);
        assert!(config.dxc.is_none());
    }

    #[test]
    fn env_overrides() {
        let mut config = ToolchainConfig::default();
        config
            .apply_overrides(|key| match key {
                TOOLS_DIR_ENV => Some("/tools".to_string()),
                BACKEND_ENV => Some("Metal".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.tools_dir, Some(PathBuf::from("/tools")));
        assert_eq!(config.backend, BackendKind::Metal);
        assert!(config.backend.wants_spirv());

        let err = config
            .apply_overrides(|key| (key == BACKEND_ENV).then(|| "opengl".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("opengl"));
    }
}
