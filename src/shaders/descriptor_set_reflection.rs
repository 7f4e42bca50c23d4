use ash::vk;
use serde::{Deserialize, Serialize};

use crate::shaders::reflection::{
    ResourceClass, ShaderResourceBinding, ShaderResourceBindings, ShaderResourceType,
};

// descriptor set 0 layouts for vulkan hosts that create their own pipelines
// from a fixed-up binding table

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReflectedDescriptorType {
    UniformBuffer,
    SampledImage,
    UniformTexelBuffer,
    StorageImage,
    StorageTexelBuffer,
    StorageBuffer,
    Sampler,
    AccelerationStructure,
}

impl ReflectedDescriptorType {
    pub fn from_binding(class: ResourceClass, resource_type: ShaderResourceType) -> Self {
        use ShaderResourceType as T;

        match (class, resource_type) {
            (ResourceClass::Cbv, _) => Self::UniformBuffer,
            (ResourceClass::Sampler, _) => Self::Sampler,
            (_, T::AccelerationStructure) => Self::AccelerationStructure,
            (ResourceClass::Srv, T::Texture) => Self::SampledImage,
            (ResourceClass::Srv, T::Buffer) => Self::UniformTexelBuffer,
            (ResourceClass::Uav, T::Texture) => Self::StorageImage,
            (ResourceClass::Uav, T::Buffer) => Self::StorageTexelBuffer,
            _ => Self::StorageBuffer,
        }
    }

    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            Self::UniformTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            Self::StorageTexelBuffer => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            Self::Sampler => vk::DescriptorType::SAMPLER,
            Self::AccelerationStructure => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectedBinding {
    pub name: String,
    pub binding: u32,
    pub descriptor_type: ReflectedDescriptorType,
}

/// One descriptor set holding every binding of the table.
///
/// Binding numbers are taken as is: tables produced by spirv fixup already carry
/// the shifted numbers the module was compiled with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectedDescriptorSetLayout {
    pub bindings: Vec<ReflectedBinding>,
}

impl ReflectedDescriptorSetLayout {
    pub fn from_bindings(table: &ShaderResourceBindings) -> Self {
        let mut bindings = vec![];
        for class in ResourceClass::ALL {
            for ShaderResourceBinding {
                name,
                binding_index,
                resource_type,
                ..
            } in table.bucket(class)
            {
                bindings.push(ReflectedBinding {
                    name: name.clone(),
                    binding: *binding_index,
                    descriptor_type: ReflectedDescriptorType::from_binding(class, *resource_type),
                });
            }
        }

        Self { bindings }
    }

    pub fn layout_bindings(
        &self,
        stage_flags: vk::ShaderStageFlags,
    ) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        self.bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_count(1)
                    .stage_flags(stage_flags)
                    .descriptor_type(b.descriptor_type.to_vk())
            })
            .collect()
    }

    /// # Safety
    /// `device` must be a valid logical device; the caller owns the returned layout
    pub unsafe fn vk_create(
        &self,
        device: &ash::Device,
        stage_flags: vk::ShaderStageFlags,
    ) -> anyhow::Result<vk::DescriptorSetLayout> {
        let layout_bindings = self.layout_bindings(stage_flags);
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&layout_bindings);
        let layout = unsafe { device.create_descriptor_set_layout(&create_info, None)? };

        Ok(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(name: &str, binding_index: u32, resource_type: ShaderResourceType) -> ShaderResourceBinding {
        ShaderResourceBinding {
            binding_index,
            slot_index: 0,
            name: name.to_string(),
            resource_type,
        }
    }

    #[test]
    fn descriptor_types_by_class() {
        let table = ShaderResourceBindings {
            cbvs: vec![binding("Params", 0, ShaderResourceType::UniformBuffer)],
            srvs: vec![
                binding("Input", 1024, ShaderResourceType::Texture),
                binding("Lut", 1025, ShaderResourceType::Buffer),
            ],
            uavs: vec![
                binding("Output", 2048, ShaderResourceType::Texture),
                binding("Particles", 2049, ShaderResourceType::StructuredBuffer),
            ],
            ..Default::default()
        };

        let layout = ReflectedDescriptorSetLayout::from_bindings(&table);
        insta::assert_json_snapshot!(layout, @r#"
        {
          "bindings": [
            {
              "name": "Params",
              "binding": 0,
              "descriptorType": "uniformBuffer"
            },
            {
              "name": "Input",
              "binding": 1024,
              "descriptorType": "sampledImage"
            },
            {
              "name": "Lut",
              "binding": 1025,
              "descriptorType": "uniformTexelBuffer"
            },
            {
              "name": "Output",
              "binding": 2048,
              "descriptorType": "storageImage"
            },
            {
              "name": "Particles",
              "binding": 2049,
              "descriptorType": "storageBuffer"
            }
          ]
        }
        "#);

        let vk_bindings = layout.layout_bindings(vk::ShaderStageFlags::COMPUTE);
        assert_eq!(vk_bindings.len(), 5);
        assert_eq!(vk_bindings[3].binding, 2048);
        assert_eq!(vk_bindings[3].descriptor_type, vk::DescriptorType::STORAGE_IMAGE);
        assert_eq!(vk_bindings[3].stage_flags, vk::ShaderStageFlags::COMPUTE);
    }
}
