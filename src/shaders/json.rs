use serde::{Deserialize, Serialize};

use super::descriptor_set_reflection::ReflectedDescriptorSetLayout;
use super::reflection::ShaderResourceBindings;
use super::{BytecodeFormat, CompiledShaderArtifact};

/// the sidecar written next to each precompiled shader blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShaderJson {
    pub source_file_name: String,
    pub entry_point: String,
    pub target_profile: String,
    pub format: BytecodeFormat,
    pub thread_group_size: [u32; 3],
    pub bindings: ShaderResourceBindings,
    /// only present for spirv blobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor_set_layout: Option<ReflectedDescriptorSetLayout>,
}

impl ShaderJson {
    pub fn new(
        source_file_name: &str,
        target_profile: &str,
        artifact: &CompiledShaderArtifact,
    ) -> Self {
        let descriptor_set_layout = (artifact.format == BytecodeFormat::Spirv)
            .then(|| ReflectedDescriptorSetLayout::from_bindings(&artifact.bindings));

        Self {
            source_file_name: source_file_name.to_string(),
            entry_point: artifact.entry_point.clone(),
            target_profile: target_profile.to_string(),
            format: artifact.format,
            thread_group_size: artifact.thread_group_size,
            bindings: artifact.bindings.clone(),
            descriptor_set_layout,
        }
    }

    /// rebuilds the artifact from a blob written next to this sidecar
    pub fn into_artifact(self, bytecode: Vec<u8>) -> CompiledShaderArtifact {
        CompiledShaderArtifact {
            bytecode,
            bindings: self.bindings,
            thread_group_size: self.thread_group_size,
            format: self.format,
            entry_point: self.entry_point,
        }
    }
}
