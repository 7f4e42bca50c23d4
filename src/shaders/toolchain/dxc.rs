use std::ffi::OsString;

use super::{Scratch, Tool, ToolError, ToolResult};
use crate::shaders::reflection::spirv::CANONICAL_ENTRY_POINT;

/// the DirectX shader compiler, for HLSL to DXIL/SPIR-V and DXIL disassembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dxc {
    tool: Tool,
}

/// Register shifts and layout rules for SPIR-V output.
///
/// The shifts put `t`, `u` and `s` registers at 1024, 2048 and 3072 in descriptor
/// set 0, which is where fixup expects each resource class.
pub fn spirv_arguments() -> Vec<String> {
    let entry_point_name = format!("-fspv-entrypoint-name={CANONICAL_ENTRY_POINT}");
    [
        "-spirv",
        "-fvk-t-shift",
        "1024",
        "0",
        "-fvk-u-shift",
        "2048",
        "0",
        "-fvk-s-shift",
        "3072",
        "0",
        "-fvk-use-dx-layout",
        "-fvk-use-scalar-layout",
        entry_point_name.as_str(),
        "-fspv-reflect",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

pub fn compile_arguments(entry_point: &str, target_profile: &str, spirv: bool) -> Vec<String> {
    let mut args = vec![
        "-T".to_string(),
        target_profile.to_string(),
        "-E".to_string(),
        entry_point.to_string(),
    ];
    if spirv {
        args.extend(spirv_arguments());
    }
    args
}

impl Dxc {
    pub const NAME: &str = "dxc";

    pub fn new(tool: Tool) -> Self {
        Self { tool }
    }

    pub fn tool(&self) -> &Tool {
        &self.tool
    }

    pub fn compile(&self, source: &str, args: &[String]) -> ToolResult<Vec<u8>> {
        let scratch = Scratch::new()?;
        let input = scratch.write("input.hlsl", source.as_bytes())?;
        let output = scratch.path("output.bin");

        let mut full_args: Vec<OsString> = args.iter().map(OsString::from).collect();
        full_args.push("-Fo".into());
        full_args.push(output.clone().into_os_string());
        full_args.push(input.into_os_string());

        self.tool.run(&full_args, scratch.dir())?;

        std::fs::read(&output).map_err(|_| ToolError::Failed(String::new()))
    }

    pub fn disassemble(&self, container: &[u8]) -> ToolResult<String> {
        let scratch = Scratch::new()?;
        let input = scratch.write("input.bin", container)?;

        let args = [OsString::from("-dumpbin"), input.into_os_string()];
        self.tool.run(&args, scratch.dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_compile_arguments() {
        let args = compile_arguments("CSMain", "cs_6_0", true);
        insta::assert_json_snapshot!(args, @r#"
        [
          "-T",
          "cs_6_0",
          "-E",
          "CSMain",
          "-spirv",
          "-fvk-t-shift",
          "1024",
          "0",
          "-fvk-u-shift",
          "2048",
          "0",
          "-fvk-s-shift",
          "3072",
          "0",
          "-fvk-use-dx-layout",
          "-fvk-use-scalar-layout",
          "-fspv-entrypoint-name=main_00000000_00000000",
          "-fspv-reflect"
        ]
        "#);
    }

    #[test]
    fn dxil_compile_arguments() {
        let args = compile_arguments("main", "cs_6_5", false);
        assert_eq!(args, ["-T", "cs_6_5", "-E", "main"]);
    }
}
