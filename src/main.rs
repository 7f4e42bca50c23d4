use std::path::{Path, PathBuf};

use log::*;

use crossbind::config::TargetPlatform;
use crossbind::shaders::json::ShaderJson;
use crossbind::shaders::toolchain::{Toolchain, ToolchainLoader};
use crossbind::shaders::{self, CompileTarget, CompiledShaderArtifact};

const USAGE: &str = "usage: crossbind <reflect|disasm|hlsl|glsl|msl> <shader.hlsl|.glsl|.spv|.dxil> [--entry <name>] [--profile <profile>] [--spirv] [--android]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// print the fixed-up binding table as json
    Reflect,
    Disassemble,
    ToHlsl,
    ToGlsl,
    ToMsl,
}

#[derive(Debug)]
struct Args {
    command: Command,
    path: PathBuf,
    entry_point: String,
    target_profile: String,
    force_spirv: bool,
    android: bool,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let command = match args.next().as_deref() {
        Some("reflect") => Command::Reflect,
        Some("disasm") => Command::Disassemble,
        Some("hlsl") => Command::ToHlsl,
        Some("glsl") => Command::ToGlsl,
        Some("msl") => Command::ToMsl,
        _ => anyhow::bail!(USAGE),
    };
    let Some(path) = args.next() else {
        anyhow::bail!(USAGE);
    };

    let mut parsed = Args {
        command,
        path: PathBuf::from(path),
        entry_point: "main".to_string(),
        target_profile: "cs_6_0".to_string(),
        force_spirv: false,
        android: false,
    };

    while let Some(flag) = args.next() {
        match flag.as_str() {
            "--entry" => parsed.entry_point = args.next().ok_or_else(|| anyhow::anyhow!(USAGE))?,
            "--profile" => {
                parsed.target_profile = args.next().ok_or_else(|| anyhow::anyhow!(USAGE))?
            }
            "--spirv" => parsed.force_spirv = true,
            "--android" => parsed.android = true,
            other => anyhow::bail!("unknown argument {other}\n{USAGE}"),
        }
    }

    Ok(parsed)
}

fn extension(path: &Path) -> &str {
    path.extension().and_then(|ext| ext.to_str()).unwrap_or_default()
}

/// compiles or loads the input and runs the matching fixup
fn load_artifact(args: &Args, toolchain: &Toolchain) -> anyhow::Result<CompiledShaderArtifact> {
    let loader = ToolchainLoader::global();
    let platform = if args.android {
        TargetPlatform::Android
    } else {
        loader.config().platform
    };
    let target = if args.force_spirv {
        CompileTarget::Spirv
    } else {
        CompileTarget::for_backend(loader.config().backend)
    };

    let artifact = match extension(&args.path) {
        "hlsl" => {
            let source = std::fs::read_to_string(&args.path)?;
            shaders::compile_hlsl_artifact(
                toolchain,
                &source,
                &args.entry_point,
                &args.target_profile,
                target,
                platform,
            )?
        }
        "glsl" => {
            let source = std::fs::read_to_string(&args.path)?;
            shaders::compile_glsl_artifact(
                toolchain,
                &source,
                &args.entry_point,
                &args.target_profile,
                platform,
            )?
        }
        "spv" => shaders::artifact_from_spirv(&std::fs::read(&args.path)?, platform)?,
        "dxil" | "dxbc" => {
            let container = std::fs::read(&args.path)?;
            let disassembly = shaders::disassemble_dxil(toolchain, &container)
                .inspect_err(|err| warn!("no resource names: {err}"))
                .ok();
            shaders::artifact_from_dxil(&container, &args.entry_point, disassembly.as_deref())?
        }
        other => anyhow::bail!("unsupported shader file extension {other:?}"),
    };

    Ok(artifact)
}

/// the raw spirv a conversion command works on, without the loader header
fn spirv_input(args: &Args, toolchain: &Toolchain) -> anyhow::Result<Vec<u8>> {
    match extension(&args.path) {
        "spv" => Ok(std::fs::read(&args.path)?),
        "glsl" => {
            let source = std::fs::read_to_string(&args.path)?;
            Ok(shaders::compile_glsl(
                toolchain,
                &source,
                &args.entry_point,
                &args.target_profile,
            )?)
        }
        "hlsl" => {
            let source = std::fs::read_to_string(&args.path)?;
            Ok(shaders::compile_hlsl(
                toolchain,
                &source,
                &args.entry_point,
                &args.target_profile,
                CompileTarget::Spirv,
            )?)
        }
        other => anyhow::bail!("cannot produce spirv from {other:?}"),
    }
}

fn run(args: &Args) -> anyhow::Result<String> {
    let toolchain = ToolchainLoader::global().get()?;

    let output = match args.command {
        Command::Reflect => {
            let artifact = load_artifact(args, &toolchain)?;
            let file_name = args
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let shader_json = ShaderJson::new(&file_name, &args.target_profile, &artifact);
            serde_json::to_string_pretty(&shader_json)?
        }
        Command::Disassemble if matches!(extension(&args.path), "dxil" | "dxbc") => {
            shaders::disassemble_dxil(toolchain.as_ref(), &std::fs::read(&args.path)?)?
        }
        Command::Disassemble => {
            shaders::disassemble_spirv(toolchain.as_ref(), &spirv_input(args, &toolchain)?)?
        }
        Command::ToHlsl => shaders::spirv_to_hlsl(toolchain.as_ref(), &spirv_input(args, &toolchain)?)?,
        Command::ToGlsl => shaders::spirv_to_glsl(toolchain.as_ref(), &spirv_input(args, &toolchain)?)?,
        Command::ToMsl => shaders::spirv_to_msl(toolchain.as_ref(), &spirv_input(args, &toolchain)?)?,
    };

    Ok(output)
}

fn main() -> Result<(), anyhow::Error> {
    pretty_env_logger::init();

    let args = parse_args(std::env::args().skip(1))?;
    debug!("{args:?}");

    let output = run(&args);
    ToolchainLoader::global().teardown();

    println!("{}", output?);

    Ok(())
}
