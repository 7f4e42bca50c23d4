//! Shader front end: source or bytecode in, fixed-up artifact out.
//!
//! The adapters here only validate their inputs and translate tool failures into
//! [`Error`]s; the tools themselves are injected as capability traits from
//! [`toolchain`], so nothing in this module reaches for global state.

use std::fmt;

use ash::vk;
use log::*;
use serde::{Deserialize, Serialize};

use crate::config::{BackendKind, TargetPlatform};
use crate::error::{Error, Result};

pub mod build_tasks;
pub mod descriptor_set_reflection;
pub mod fixup;
pub mod json;
pub mod reflection;
pub mod toolchain;

use fixup::FixedUpShader;
use reflection::ShaderResourceBindings;
use toolchain::{
    DxilTools, GlslCompiler, HlslCompiler, SpirvTools, TOOLCHAIN_UNAVAILABLE, ToolError, dxc,
};

/// the pipeline stage named by the prefix of a `<stage>_<major>_<minor>` profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShaderStage {
    Compute,
    Vertex,
    Pixel,
    Mesh,
    Amplification,
    Library,
}

impl ShaderStage {
    pub fn from_profile(target_profile: &str) -> Option<Self> {
        let (prefix, _) = target_profile.split_once('_')?;
        let stage = match prefix {
            "cs" => Self::Compute,
            "vs" => Self::Vertex,
            "ps" => Self::Pixel,
            "ms" => Self::Mesh,
            "as" => Self::Amplification,
            "lib" => Self::Library,
            _ => return None,
        };

        Some(stage)
    }

    /// the `-S` argument glslang expects; libraries have no glsl equivalent
    pub fn glslang_stage(self) -> Option<&'static str> {
        match self {
            Self::Compute => Some("comp"),
            Self::Vertex => Some("vert"),
            Self::Pixel => Some("frag"),
            Self::Mesh => Some("mesh"),
            Self::Amplification => Some("task"),
            Self::Library => None,
        }
    }

    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            Self::Compute => vk::ShaderStageFlags::COMPUTE,
            Self::Vertex => vk::ShaderStageFlags::VERTEX,
            Self::Pixel => vk::ShaderStageFlags::FRAGMENT,
            Self::Mesh => vk::ShaderStageFlags::MESH_EXT,
            Self::Amplification => vk::ShaderStageFlags::TASK_EXT,
            Self::Library => vk::ShaderStageFlags::ALL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BytecodeFormat {
    Spirv,
    Dxil,
}

/// what dxc should emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileTarget {
    Dxil,
    /// also used to force spirv output regardless of the active backend
    Spirv,
}

impl CompileTarget {
    pub fn for_backend(backend: BackendKind) -> Self {
        if backend.wants_spirv() {
            Self::Spirv
        } else {
            Self::Dxil
        }
    }

    pub fn format(self) -> BytecodeFormat {
        match self {
            Self::Dxil => BytecodeFormat::Dxil,
            Self::Spirv => BytecodeFormat::Spirv,
        }
    }
}

/// source code plus the entry point to compile from it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderSource<'a> {
    pub code: &'a str,
    pub entry_point: &'a str,
}

impl<'a> ShaderSource<'a> {
    pub fn new(code: &'a str, entry_point: &'a str) -> Self {
        Self { code, entry_point }
    }
}

/// everything a pipeline needs from a compiled shader
#[derive(Clone, PartialEq, Eq)]
pub struct CompiledShaderArtifact {
    /// backend header plus native bytecode
    pub bytecode: Vec<u8>,
    pub bindings: ShaderResourceBindings,
    pub thread_group_size: [u32; 3],
    pub format: BytecodeFormat,
    pub entry_point: String,
}

impl CompiledShaderArtifact {
    fn from_fixup(fixed: FixedUpShader, format: BytecodeFormat) -> Self {
        Self {
            bytecode: fixed.bytecode,
            bindings: fixed.bindings,
            thread_group_size: fixed.thread_group_size,
            format,
            entry_point: fixed.entry_point,
        }
    }
}

impl fmt::Debug for CompiledShaderArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledShaderArtifact")
            .field("bytecode_len", &self.bytecode.len())
            .field("bindings", &self.bindings)
            .field("thread_group_size", &self.thread_group_size)
            .field("format", &self.format)
            .field("entry_point", &self.entry_point)
            .finish()
    }
}

fn tool_error(err: ToolError, fallback: &str) -> Error {
    match err {
        ToolError::Unavailable => Error::ToolchainUnavailable(TOOLCHAIN_UNAVAILABLE.to_string()),
        ToolError::Failed(message) if message.trim().is_empty() => {
            Error::Compile(fallback.to_string())
        }
        ToolError::Failed(message) => Error::Compile(message),
    }
}

fn require(value: &str, message: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Compile(message.to_string()));
    }
    Ok(())
}

fn require_bytes(bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(Error::Compile("Empty ByteCode".to_string()));
    }
    Ok(())
}

fn has_include_directive(source: &str) -> bool {
    source.lines().any(|line| {
        line.trim_start()
            .strip_prefix('#')
            .is_some_and(|directive| directive.trim_start().starts_with("include"))
    })
}

/// Compiles HLSL to DXIL or SPIR-V. The result still needs fixup.
pub fn compile_hlsl<C: HlslCompiler + ?Sized>(
    compiler: &C,
    source: &str,
    entry_point: &str,
    target_profile: &str,
    target: CompileTarget,
) -> Result<Vec<u8>> {
    require(source, "Empty ShaderCode")?;
    require(entry_point, "Empty EntryPoint")?;
    require(target_profile, "Empty TargetProfile")?;

    // there is no include search path to resolve against
    if has_include_directive(source) {
        return Err(Error::Compile("#include directives are not allowed".to_string()));
    }

    let args = dxc::compile_arguments(entry_point, target_profile, target == CompileTarget::Spirv);
    debug!("dxc {}", args.join(" "));

    compiler
        .compile_hlsl(source, &args)
        .map_err(|err| tool_error(err, "Unable to compile code blob"))
}

/// Compiles GLSL to SPIR-V. The result still needs fixup.
pub fn compile_glsl<C: GlslCompiler + ?Sized>(
    compiler: &C,
    source: &str,
    entry_point: &str,
    target_profile: &str,
) -> Result<Vec<u8>> {
    require(source, "Empty ShaderCode")?;
    require(entry_point, "Empty EntryPoint")?;
    require(target_profile, "Empty TargetProfile")?;

    let stage = ShaderStage::from_profile(target_profile)
        .ok_or_else(|| Error::Compile(format!("Unsupported TargetProfile {target_profile}")))?;
    debug!("glslang {stage:?} {entry_point}");

    compiler
        .compile_glsl(source, stage, entry_point)
        .map_err(|err| tool_error(err, "Unable to compile GLSL sources"))
}

pub fn disassemble_spirv<T: SpirvTools + ?Sized>(tools: &T, spirv: &[u8]) -> Result<String> {
    require_bytes(spirv)?;
    tools
        .disassemble_spirv(spirv)
        .map_err(|err| tool_error(err, "Unable to disassemble SPIRV"))
}

pub fn disassemble_dxil<T: DxilTools + ?Sized>(tools: &T, container: &[u8]) -> Result<String> {
    require_bytes(container)?;
    tools
        .disassemble_dxil(container)
        .map_err(|err| tool_error(err, "Unable to disassemble code blob"))
}

pub fn spirv_to_hlsl<T: SpirvTools + ?Sized>(tools: &T, spirv: &[u8]) -> Result<String> {
    require_bytes(spirv)?;
    tools
        .spirv_to_hlsl(spirv)
        .map_err(|err| tool_error(err, "Unable to convert SPIRV to HLSL"))
}

pub fn spirv_to_glsl<T: SpirvTools + ?Sized>(tools: &T, spirv: &[u8]) -> Result<String> {
    require_bytes(spirv)?;
    tools
        .spirv_to_glsl(spirv)
        .map_err(|err| tool_error(err, "Unable to convert SPIRV to GLSL"))
}

pub fn spirv_to_msl<T: SpirvTools + ?Sized>(tools: &T, spirv: &[u8]) -> Result<String> {
    require_bytes(spirv)?;
    tools
        .spirv_to_msl(spirv)
        .map_err(|err| tool_error(err, "Unable to convert SPIRV to MSL"))
}

pub fn artifact_from_spirv(spirv: &[u8], platform: TargetPlatform) -> Result<CompiledShaderArtifact> {
    let fixed = fixup::fixup_spirv(spirv, platform)?;
    Ok(CompiledShaderArtifact::from_fixup(fixed, BytecodeFormat::Spirv))
}

/// `disassembly` supplies resource names; without it they are synthesized from registers
pub fn artifact_from_dxil(
    container: &[u8],
    entry_point: &str,
    disassembly: Option<&str>,
) -> Result<CompiledShaderArtifact> {
    let fixed = fixup::fixup_dxil(container, entry_point, disassembly)?;
    Ok(CompiledShaderArtifact::from_fixup(fixed, BytecodeFormat::Dxil))
}

/// Compiles HLSL and runs the fixup for the target format.
pub fn compile_hlsl_artifact<T: HlslCompiler + DxilTools + ?Sized>(
    tools: &T,
    source: &str,
    entry_point: &str,
    target_profile: &str,
    target: CompileTarget,
    platform: TargetPlatform,
) -> Result<CompiledShaderArtifact> {
    let bytecode = compile_hlsl(tools, source, entry_point, target_profile, target)?;

    match target {
        CompileTarget::Spirv => artifact_from_spirv(&bytecode, platform),
        CompileTarget::Dxil => {
            let disassembly = match disassemble_dxil(tools, &bytecode) {
                Ok(listing) => Some(listing),
                Err(err) => {
                    warn!("no resource names for {entry_point}: {err}");
                    None
                }
            };
            artifact_from_dxil(&bytecode, entry_point, disassembly.as_deref())
        }
    }
}

/// Compiles GLSL; the SPIR-V output always goes through fixup.
pub fn compile_glsl_artifact<C: GlslCompiler + ?Sized>(
    compiler: &C,
    source: &str,
    entry_point: &str,
    target_profile: &str,
    platform: TargetPlatform,
) -> Result<CompiledShaderArtifact> {
    let spirv = compile_glsl(compiler, source, entry_point, target_profile)?;
    artifact_from_spirv(&spirv, platform)
}
