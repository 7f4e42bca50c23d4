//! Khronos tools: glslang, SPIRV-Tools and SPIRV-Cross.

use std::ffi::OsString;

use super::{Scratch, Tool, ToolError, ToolResult};
use crate::shaders::ShaderStage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Glslang {
    tool: Tool,
}

impl Glslang {
    pub const NAME: &str = "glslangValidator";

    pub fn new(tool: Tool) -> Self {
        Self { tool }
    }

    pub fn compile(
        &self,
        source: &str,
        stage: ShaderStage,
        entry_point: &str,
    ) -> ToolResult<Vec<u8>> {
        let Some(stage_name) = stage.glslang_stage() else {
            return Err(ToolError::Failed(format!(
                "unsupported GLSL shader stage: {stage:?}"
            )));
        };

        let scratch = Scratch::new()?;
        let input = scratch.write(&format!("input.{stage_name}"), source.as_bytes())?;
        let output = scratch.path("output.spv");

        let args: Vec<OsString> = [
            "-V",
            "-S",
            stage_name,
            "-e",
            entry_point,
            "--source-entrypoint",
            entry_point,
            "-o",
        ]
        .into_iter()
        .map(OsString::from)
        .chain([output.clone().into_os_string(), input.into_os_string()])
        .collect();

        self.tool.run(&args, scratch.dir())?;

        std::fs::read(&output).map_err(|_| ToolError::Failed(String::new()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpirvDis {
    tool: Tool,
}

impl SpirvDis {
    pub const NAME: &str = "spirv-dis";

    pub fn new(tool: Tool) -> Self {
        Self { tool }
    }

    pub fn disassemble(&self, spirv: &[u8]) -> ToolResult<String> {
        let scratch = Scratch::new()?;
        let input = scratch.write("input.spv", spirv)?;
        self.tool.run(&[input.into_os_string()], scratch.dir())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossTarget {
    Hlsl,
    Glsl,
    Msl,
}

impl CrossTarget {
    fn arguments(self) -> &'static [&'static str] {
        match self {
            Self::Hlsl => &["--hlsl", "--shader-model", "60"],
            Self::Glsl => &["--version", "450"],
            Self::Msl => &["--msl"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpirvCross {
    tool: Tool,
}

impl SpirvCross {
    pub const NAME: &str = "spirv-cross";

    pub fn new(tool: Tool) -> Self {
        Self { tool }
    }

    pub fn convert(&self, spirv: &[u8], target: CrossTarget) -> ToolResult<String> {
        let scratch = Scratch::new()?;
        let input = scratch.write("input.spv", spirv)?;

        let args: Vec<OsString> = std::iter::once(input.into_os_string())
            .chain(target.arguments().iter().map(OsString::from))
            .collect();
        self.tool.run(&args, scratch.dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glslang_rejects_library_stage() {
        let glslang = Glslang::new(Tool::new("glslangValidator"));
        let err = glslang
            .compile("void main() {}", ShaderStage::Library, "main")
            .unwrap_err();
        assert_eq!(err, ToolError::Failed("unsupported GLSL shader stage: Library".to_string()));
    }

    #[test]
    fn missing_executable_reports_failure() {
        let cross = SpirvCross::new(Tool::new("/nonexistent/crossbind/spirv-cross"));
        let err = cross.convert(&[0; 20], CrossTarget::Msl).unwrap_err();
        assert!(matches!(err, ToolError::Failed(message) if message.contains("spirv-cross")));
    }
}
