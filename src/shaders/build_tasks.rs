use std::path::{Path, PathBuf};

use log::*;

use crate::config::{BackendKind, TargetPlatform};

use super::json::ShaderJson;
use super::toolchain::{DxilTools, GlslCompiler, HlslCompiler};
use super::{
    BytecodeFormat, CompileTarget, CompiledShaderArtifact, compile_glsl_artifact,
    compile_hlsl_artifact,
};

/// used when the file name carries no `<stage>_<major>_<minor>` segment
pub const DEFAULT_TARGET_PROFILE: &str = "cs_6_0";

pub struct Config {
    /// the directory to read .hlsl and .glsl files from
    pub shaders_source_dir: PathBuf,
    /// the directory to write fixed-up blobs & json to
    pub compiled_shaders_dir: PathBuf,
    /// the entry point compiled from every file
    pub entry_point: String,
    /// decides between dxil and spirv output for hlsl sources
    pub backend: BackendKind,
    pub platform: TargetPlatform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceLanguage {
    Hlsl,
    Glsl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ShaderSource {
    file_name: String,
    /// file name without the profile and extension
    name: String,
    target_profile: String,
    language: SourceLanguage,
}

impl ShaderSource {
    /// `blur.hlsl` or `blur.cs_6_5.hlsl`
    fn from_path(path: &Path) -> Option<Self> {
        let language = match path.extension()?.to_str()? {
            "hlsl" => SourceLanguage::Hlsl,
            "glsl" => SourceLanguage::Glsl,
            _ => return None,
        };
        let file_name = path.file_name()?.to_str()?.to_string();
        let stem = path.file_stem()?.to_str()?;

        let (name, target_profile) = match stem.rsplit_once('.') {
            Some((name, profile)) => (name, profile),
            None => (stem, DEFAULT_TARGET_PROFILE),
        };

        Some(Self {
            file_name,
            name: name.to_string(),
            target_profile: target_profile.to_string(),
            language,
        })
    }
}

fn blob_extension(format: BytecodeFormat) -> &'static str {
    match format {
        BytecodeFormat::Spirv => "spv",
        BytecodeFormat::Dxil => "dxil",
    }
}

/// Compiles every shader in the source dir and writes `<name>.<spv|dxil>` plus `<name>.json`.
pub fn write_precompiled_shaders<T>(config: Config, tools: &T) -> anyhow::Result<()>
where
    T: HlslCompiler + GlslCompiler + DxilTools + ?Sized,
{
    let mut sources: Vec<_> = std::fs::read_dir(&config.shaders_source_dir)?
        .filter_map(|entry_res| entry_res.ok())
        .map(|dir_entry| dir_entry.path())
        .filter_map(|path| ShaderSource::from_path(&path).map(|source| (path, source)))
        .collect();
    sources.sort_by(|(a, _), (b, _)| a.cmp(b));

    std::fs::create_dir_all(&config.compiled_shaders_dir)?;

    for (path, source) in &sources {
        let code = std::fs::read_to_string(path)?;

        let compiled = match source.language {
            SourceLanguage::Hlsl => compile_hlsl_artifact(
                tools,
                &code,
                &config.entry_point,
                &source.target_profile,
                CompileTarget::for_backend(config.backend),
                config.platform,
            ),
            SourceLanguage::Glsl => compile_glsl_artifact(
                tools,
                &code,
                &config.entry_point,
                &source.target_profile,
                config.platform,
            ),
        };
        let artifact = match compiled {
            Ok(artifact) => artifact,
            Err(err) => anyhow::bail!("failed to compile {}: {err}", source.file_name),
        };

        let shader_json = ShaderJson::new(&source.file_name, &source.target_profile, &artifact);
        let shader_json = serde_json::to_string_pretty(&shader_json)?;
        let json_path = config.compiled_shaders_dir.join(format!("{}.json", source.name));
        std::fs::write(json_path, shader_json)?;

        let blob_file_name = format!("{}.{}", source.name, blob_extension(artifact.format));
        let blob_path = config.compiled_shaders_dir.join(&blob_file_name);
        std::fs::write(blob_path, &artifact.bytecode)?;

        info!("wrote {blob_file_name} ({} bytes)", artifact.bytecode.len());
    }

    Ok(())
}

/// reads back a shader written by [`write_precompiled_shaders`]
pub fn load_precompiled_shader(
    compiled_shaders_dir: &Path,
    name: &str,
) -> anyhow::Result<CompiledShaderArtifact> {
    let json_path = compiled_shaders_dir.join(format!("{name}.json"));
    let json = std::fs::read_to_string(&json_path)?;
    let shader_json: ShaderJson = serde_json::from_str(&json)?;

    let blob_path =
        compiled_shaders_dir.join(format!("{name}.{}", blob_extension(shader_json.format)));
    let bytecode = std::fs::read(&blob_path)?;

    Ok(shader_json.into_artifact(bytecode))
}
