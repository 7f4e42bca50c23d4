use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub mod dxil;
pub mod spirv;

/// the four binding buckets a shader interface is split into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceClass {
    Cbv,
    Srv,
    Uav,
    Sampler,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 4] = [Self::Cbv, Self::Srv, Self::Uav, Self::Sampler];

    pub fn article(self) -> &'static str {
        match self {
            Self::Uav => "an",
            _ => "a",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cbv => "CBV",
            Self::Srv => "SRV",
            Self::Uav => "UAV",
            Self::Sampler => "Sampler",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShaderResourceType {
    UniformBuffer,
    Buffer,
    StructuredBuffer,
    ByteAddressBuffer,
    Texture,
    Sampler,
    AccelerationStructure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShaderResourceBinding {
    /// the register/binding number declared in the shader
    pub binding_index: u32,
    /// dense index assigned during fixup
    pub slot_index: u32,
    pub name: String,
    pub resource_type: ShaderResourceType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShaderSemantic {
    pub name: String,
    pub index: u32,
    pub register_num: u32,
    pub mask: u8,
}

/// the full interface of a compiled shader, each bucket ordered by binding_index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShaderResourceBindings {
    pub cbvs: Vec<ShaderResourceBinding>,
    pub srvs: Vec<ShaderResourceBinding>,
    pub uavs: Vec<ShaderResourceBinding>,
    pub samplers: Vec<ShaderResourceBinding>,
    pub input_semantics: Vec<ShaderSemantic>,
    pub output_semantics: Vec<ShaderSemantic>,
}

impl ShaderResourceBindings {
    pub fn bucket(&self, class: ResourceClass) -> &[ShaderResourceBinding] {
        match class {
            ResourceClass::Cbv => &self.cbvs,
            ResourceClass::Srv => &self.srvs,
            ResourceClass::Uav => &self.uavs,
            ResourceClass::Sampler => &self.samplers,
        }
    }

    pub fn bucket_mut(&mut self, class: ResourceClass) -> &mut Vec<ShaderResourceBinding> {
        match class {
            ResourceClass::Cbv => &mut self.cbvs,
            ResourceClass::Srv => &mut self.srvs,
            ResourceClass::Uav => &mut self.uavs,
            ResourceClass::Sampler => &mut self.samplers,
        }
    }
}

/// Binding numbers of spirv shaders encode the resource class.
///
/// HLSL is compiled with `-fvk-t-shift 1024 0 -fvk-u-shift 2048 0 -fvk-s-shift 3072 0`,
/// so `register(b3)` lands on binding 3, `register(t3)` on 1027 and `register(u3)` on 2051.
/// Hand-written GLSL or SPIR-V has to follow the same numbering:
///
/// | binding       | class | relative index   |
/// |---------------|-------|------------------|
/// | 0..1024       | CBV   | binding          |
/// | 1024..2048    | SRV   | binding - 1024   |
/// | 2048..3072    | UAV   | binding - 2048   |
///
/// anything from 3072 up is rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingRange {
    pub class: ResourceClass,
    pub relative_index: u32,
}

pub const SRV_BINDING_SHIFT: u32 = 1024;
pub const UAV_BINDING_SHIFT: u32 = 2048;
pub const SAMPLER_BINDING_SHIFT: u32 = 3072;

impl BindingRange {
    pub fn classify(binding: u32) -> Result<Self> {
        let range = match binding {
            b if b < SRV_BINDING_SHIFT => Self {
                class: ResourceClass::Cbv,
                relative_index: b,
            },
            b if b < UAV_BINDING_SHIFT => Self {
                class: ResourceClass::Srv,
                relative_index: b - SRV_BINDING_SHIFT,
            },
            b if b < SAMPLER_BINDING_SHIFT => Self {
                class: ResourceClass::Uav,
                relative_index: b - UAV_BINDING_SHIFT,
            },
            _ => return Err(Error::Fixup("invalid shader binding".to_string())),
        };

        Ok(range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_range_boundaries() {
        let cases = [
            (0, ResourceClass::Cbv, 0),
            (1023, ResourceClass::Cbv, 1023),
            (1024, ResourceClass::Srv, 0),
            (2047, ResourceClass::Srv, 1023),
            (2048, ResourceClass::Uav, 0),
            (3071, ResourceClass::Uav, 1023),
        ];

        for (binding, class, relative_index) in cases {
            let range = BindingRange::classify(binding).unwrap();
            assert_eq!(range.class, class, "binding {binding}");
            assert_eq!(range.relative_index, relative_index, "binding {binding}");
        }

        let err = BindingRange::classify(3072).unwrap_err();
        assert_eq!(err.to_string(), "invalid shader binding");
    }

    #[test]
    fn class_display() {
        let names: Vec<String> = ResourceClass::ALL.iter().map(|c| c.to_string()).collect();
        assert_eq!(names, ["CBV", "SRV", "UAV", "Sampler"]);
        assert_eq!(ResourceClass::Uav.article(), "an");
        assert_eq!(ResourceClass::Srv.article(), "a");
    }
}
