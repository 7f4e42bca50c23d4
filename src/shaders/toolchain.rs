//! Discovery and invocation of the native shader tools.
//!
//! Every tool runs as a child process against files in a scratch directory, the same
//! way the offline build invokes glslc. The [`Toolchain`] found at discovery time is
//! handed to the adapters as capability traits.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use log::*;

use super::ShaderStage;
use crate::config::ToolchainConfig;
use crate::error::{Error, Result};

pub mod dxc;
pub mod khr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("tool unavailable")]
    Unavailable,
    /// the tool's own diagnostic, possibly empty
    #[error("{0}")]
    Failed(String),
}

impl From<std::io::Error> for ToolError {
    fn from(err: std::io::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

pub const TOOLCHAIN_UNAVAILABLE: &str = "Failed DXCompiler initialization";

pub type ToolResult<T> = std::result::Result<T, ToolError>;

pub trait HlslCompiler: Send + Sync {
    fn compile_hlsl(&self, source: &str, args: &[String]) -> ToolResult<Vec<u8>>;
}

pub trait GlslCompiler: Send + Sync {
    fn compile_glsl(&self, source: &str, stage: ShaderStage, entry_point: &str)
    -> ToolResult<Vec<u8>>;
}

pub trait SpirvTools: Send + Sync {
    fn disassemble_spirv(&self, spirv: &[u8]) -> ToolResult<String>;
    fn spirv_to_hlsl(&self, spirv: &[u8]) -> ToolResult<String>;
    fn spirv_to_glsl(&self, spirv: &[u8]) -> ToolResult<String>;
    fn spirv_to_msl(&self, spirv: &[u8]) -> ToolResult<String>;
}

pub trait DxilTools: Send + Sync {
    fn disassemble_dxil(&self, container: &[u8]) -> ToolResult<String>;
}

/// an executable resolved at discovery time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tool {
    path: PathBuf,
}

impl Tool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Looks for `name` in `tools_dir`, then on PATH. An explicitly configured path is
    /// taken as is.
    pub fn resolve(name: &str, configured: Option<&Path>, tools_dir: Option<&Path>) -> Option<Self> {
        if let Some(path) = configured {
            return Some(Self::new(path));
        }

        let in_tools_dir = tools_dir.and_then(|dir| {
            which::which_in(name, Some(dir), dir)
                .inspect_err(|err| trace!("{name} not in {}: {err}", dir.display()))
                .ok()
        });

        in_tools_dir
            .or_else(|| {
                which::which(name)
                    .inspect_err(|err| debug!("{name} not found: {err}"))
                    .ok()
            })
            .map(Self::new)
    }

    /// runs to completion; a non-zero exit yields the combined stderr/stdout as the diagnostic
    pub fn run(&self, args: &[OsString], working_dir: &Path) -> ToolResult<String> {
        debug!("running {} {:?}", self.path.display(), args);

        let output = Command::new(&self.path)
            .args(args)
            .current_dir(working_dir)
            .output()
            .map_err(|err| ToolError::Failed(format!("{}: {err}", self.path.display())))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let diagnostic = [stderr.trim(), stdout.trim()]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            return Err(ToolError::Failed(diagnostic));
        }

        Ok(stdout)
    }
}

/// a per-invocation temp directory, removed on drop
pub struct Scratch {
    dir: tempfile::TempDir,
}

impl Scratch {
    pub fn new() -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("crossbind-").tempdir()?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, file_name: &str) -> PathBuf {
        self.dir().join(file_name)
    }

    pub fn write(&self, file_name: &str, contents: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.path(file_name);
        std::fs::write(&path, contents)?;
        Ok(path)
    }
}

/// every tool found at discovery; missing tools report `ToolError::Unavailable`
#[derive(Debug, Clone)]
pub struct Toolchain {
    dxc: Option<dxc::Dxc>,
    glslang: Option<khr::Glslang>,
    spirv_dis: Option<khr::SpirvDis>,
    spirv_cross: Option<khr::SpirvCross>,
}

impl Toolchain {
    pub fn discover(config: &ToolchainConfig) -> Self {
        let tools_dir = config.tools_dir.as_deref();

        let toolchain = Self {
            dxc: Tool::resolve(dxc::Dxc::NAME, config.dxc.as_deref(), tools_dir).map(dxc::Dxc::new),
            glslang: Tool::resolve(khr::Glslang::NAME, config.glslang.as_deref(), tools_dir)
                .map(khr::Glslang::new),
            spirv_dis: Tool::resolve(khr::SpirvDis::NAME, config.spirv_dis.as_deref(), tools_dir)
                .map(khr::SpirvDis::new),
            spirv_cross: Tool::resolve(
                khr::SpirvCross::NAME,
                config.spirv_cross.as_deref(),
                tools_dir,
            )
            .map(khr::SpirvCross::new),
        };

        info!(
            "shader toolchain: dxc={} glslang={} spirv-dis={} spirv-cross={}",
            toolchain.dxc.is_some(),
            toolchain.glslang.is_some(),
            toolchain.spirv_dis.is_some(),
            toolchain.spirv_cross.is_some()
        );

        toolchain
    }

    /// a toolchain without any tools
    pub fn empty() -> Self {
        Self {
            dxc: None,
            glslang: None,
            spirv_dis: None,
            spirv_cross: None,
        }
    }
}

impl HlslCompiler for Toolchain {
    fn compile_hlsl(&self, source: &str, args: &[String]) -> ToolResult<Vec<u8>> {
        self.dxc
            .as_ref()
            .ok_or(ToolError::Unavailable)?
            .compile(source, args)
    }
}

impl DxilTools for Toolchain {
    fn disassemble_dxil(&self, container: &[u8]) -> ToolResult<String> {
        self.dxc
            .as_ref()
            .ok_or(ToolError::Unavailable)?
            .disassemble(container)
    }
}

impl GlslCompiler for Toolchain {
    fn compile_glsl(
        &self,
        source: &str,
        stage: ShaderStage,
        entry_point: &str,
    ) -> ToolResult<Vec<u8>> {
        self.glslang
            .as_ref()
            .ok_or(ToolError::Unavailable)?
            .compile(source, stage, entry_point)
    }
}

impl SpirvTools for Toolchain {
    fn disassemble_spirv(&self, spirv: &[u8]) -> ToolResult<String> {
        self.spirv_dis
            .as_ref()
            .ok_or(ToolError::Unavailable)?
            .disassemble(spirv)
    }

    fn spirv_to_hlsl(&self, spirv: &[u8]) -> ToolResult<String> {
        self.spirv_cross
            .as_ref()
            .ok_or(ToolError::Unavailable)?
            .convert(spirv, khr::CrossTarget::Hlsl)
    }

    fn spirv_to_glsl(&self, spirv: &[u8]) -> ToolResult<String> {
        self.spirv_cross
            .as_ref()
            .ok_or(ToolError::Unavailable)?
            .convert(spirv, khr::CrossTarget::Glsl)
    }

    fn spirv_to_msl(&self, spirv: &[u8]) -> ToolResult<String> {
        self.spirv_cross
            .as_ref()
            .ok_or(ToolError::Unavailable)?
            .convert(spirv, khr::CrossTarget::Msl)
    }
}

enum LoaderState {
    Pending,
    Ready(Arc<Toolchain>),
    TornDown,
}

/// Runs toolchain discovery at most once and caches the result.
pub struct ToolchainLoader {
    config: ToolchainConfig,
    state: Mutex<LoaderState>,
}

impl ToolchainLoader {
    pub fn new(config: ToolchainConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LoaderState::Pending),
        }
    }

    /// the process-wide loader, configured from the environment on first use
    pub fn global() -> &'static ToolchainLoader {
        static GLOBAL: OnceLock<ToolchainLoader> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let config = ToolchainConfig::from_env().unwrap_or_else(|err| {
                warn!("ignoring toolchain config: {err}");
                ToolchainConfig::default()
            });
            ToolchainLoader::new(config)
        })
    }

    pub fn config(&self) -> &ToolchainConfig {
        &self.config
    }

    pub fn get(&self) -> Result<Arc<Toolchain>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        match &*state {
            LoaderState::Ready(toolchain) => Ok(Arc::clone(toolchain)),
            LoaderState::TornDown => Err(Error::ToolchainUnavailable(
                TOOLCHAIN_UNAVAILABLE.to_string(),
            )),
            LoaderState::Pending => {
                let toolchain = Arc::new(Toolchain::discover(&self.config));
                *state = LoaderState::Ready(Arc::clone(&toolchain));
                Ok(toolchain)
            }
        }
    }

    /// releases the cached toolchain; returns false if there was nothing to release
    pub fn teardown(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        match std::mem::replace(&mut *state, LoaderState::TornDown) {
            LoaderState::Ready(_) => {
                debug!("shader toolchain released");
                true
            }
            LoaderState::Pending | LoaderState::TornDown => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_discovers_once() {
        let config = ToolchainConfig {
            tools_dir: Some(std::env::temp_dir().join("crossbind-missing-tools")),
            dxc: Some(PathBuf::from("/opt/dxc/bin/dxc")),
            ..Default::default()
        };
        let loader = ToolchainLoader::new(config);

        let first = loader.get().unwrap();
        let second = loader.get().unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // configured paths are taken without probing
        assert_eq!(
            first.dxc.as_ref().map(|dxc| dxc.tool().path().to_path_buf()),
            Some(PathBuf::from("/opt/dxc/bin/dxc"))
        );

        assert!(loader.teardown());
        assert!(!loader.teardown());
        assert!(loader.get().is_err());
    }

    #[test]
    fn teardown_before_use() {
        let loader = ToolchainLoader::new(ToolchainConfig::default());
        assert!(!loader.teardown());
    }

    #[cfg(unix)]
    #[test]
    fn resolves_from_tools_dir() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("spirv-dis");
        std::fs::write(&exe, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();

        let tool = Tool::resolve("spirv-dis", None, Some(dir.path())).unwrap();
        assert_eq!(tool.path(), exe);

        assert!(Tool::resolve("crossbind-no-such-tool", None, Some(dir.path())).is_none());
    }

    #[test]
    fn empty_toolchain_is_unavailable() {
        let toolchain = Toolchain::empty();
        assert_eq!(
            toolchain.compile_hlsl("void main() {}", &[]),
            Err(ToolError::Unavailable)
        );
        assert_eq!(
            toolchain.spirv_to_msl(&[]),
            Err(ToolError::Unavailable)
        );
    }

    #[test]
    fn scratch_is_removed() {
        let scratch = Scratch::new().unwrap();
        let path = scratch.write("input.hlsl", b"void main() {}").unwrap();
        assert!(path.is_file());

        let dir = scratch.dir().to_path_buf();
        assert!(dir.file_name().unwrap().to_string_lossy().starts_with("crossbind-"));

        // concurrent invocations never share a directory
        let other = Scratch::new().unwrap();
        assert_ne!(other.dir(), dir);

        drop(scratch);
        assert!(!dir.exists());
    }
}
