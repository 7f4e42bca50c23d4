use ash::vk;
use bytemuck::{Pod, Zeroable};

use super::{HeaderWrite, write_array, write_value};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct SpirvInfo {
    /// word offset of the Binding decoration literal
    pub binding_index_offset: u32,
    /// word offset of the DescriptorSet decoration literal
    pub descriptor_set_offset: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct UniformBufferInfo {
    pub original_binding_index: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GlobalInfo {
    pub original_binding_index: u16,
    pub combined_sampler_state_alias_index: u16,
    /// index into `VulkanShaderHeader::global_descriptor_types`
    pub type_index: u8,
    pub _pad: [u8; 1],
}

impl HeaderWrite for SpirvInfo {}
impl HeaderWrite for UniformBufferInfo {}
impl HeaderWrite for GlobalInfo {}

impl GlobalInfo {
    pub fn new(original_binding_index: u32, descriptor: GlobalDescriptor) -> Self {
        Self {
            original_binding_index: original_binding_index as u16,
            combined_sampler_state_alias_index: u16::MAX,
            type_index: descriptor as u8,
            _pad: [0],
        }
    }
}

/// positions in `global_descriptor_types`; the order is fixed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalDescriptor {
    UniformBuffer = 0,
    Image = 1,
    UniformTexelBuffer = 2,
    StorageImage = 3,
    StorageTexelBuffer = 4,
    StorageBuffer = 5,
}

impl GlobalDescriptor {
    pub const ALL: [GlobalDescriptor; 6] = [
        Self::UniformBuffer,
        Self::Image,
        Self::UniformTexelBuffer,
        Self::StorageImage,
        Self::StorageTexelBuffer,
        Self::StorageBuffer,
    ];

    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            Self::Image => vk::DescriptorType::SAMPLED_IMAGE,
            Self::UniformTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
            Self::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            Self::StorageTexelBuffer => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
            Self::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        }
    }
}

/// the descriptor metadata the vulkan loader expects ahead of the spirv words
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VulkanShaderHeader {
    pub spirv_crc: u32,
    pub in_out_mask: u32,
    pub uniform_buffers: Vec<UniformBufferInfo>,
    pub uniform_buffer_spirv_infos: Vec<SpirvInfo>,
    pub globals: Vec<GlobalInfo>,
    pub global_spirv_infos: Vec<SpirvInfo>,
    pub global_descriptor_types: Vec<vk::DescriptorType>,
}

impl Default for VulkanShaderHeader {
    fn default() -> Self {
        Self {
            spirv_crc: 0,
            in_out_mask: 0xffff_ffff,
            uniform_buffers: vec![],
            uniform_buffer_spirv_infos: vec![],
            globals: vec![],
            global_spirv_infos: vec![],
            global_descriptor_types: GlobalDescriptor::ALL.iter().map(|d| d.to_vk()).collect(),
        }
    }
}

impl VulkanShaderHeader {
    pub fn add_uniform_buffer(&mut self, binding: u32, spirv_info: SpirvInfo) {
        self.uniform_buffers.push(UniformBufferInfo {
            original_binding_index: binding,
        });
        self.uniform_buffer_spirv_infos.push(spirv_info);
    }

    pub fn add_global(&mut self, binding: u32, descriptor: GlobalDescriptor, spirv_info: SpirvInfo) {
        self.globals.push(GlobalInfo::new(binding, descriptor));
        self.global_spirv_infos.push(spirv_info);
    }

    fn write(&self, out: &mut Vec<u8>) {
        write_value(out, &self.spirv_crc);
        write_value(out, &self.in_out_mask);
        write_array(out, &self.uniform_buffers);
        write_array(out, &self.uniform_buffer_spirv_infos);
        write_array(out, &self.globals);
        write_array(out, &self.global_spirv_infos);

        let descriptor_types: Vec<u32> = self
            .global_descriptor_types
            .iter()
            .map(|ty| ty.as_raw() as u32)
            .collect();
        write_array(out, &descriptor_types);
    }
}

/// resource table bits plus four empty tables; compute shaders never populate it
const EMPTY_RESOURCE_TABLE: [u32; 5] = [0; 5];

/// header, empty resource table, spirv size, spirv bytes, -1
pub fn serialize(header: &VulkanShaderHeader, spirv: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(spirv.len() + 256);

    header.write(&mut out);
    out.extend_from_slice(bytemuck::cast_slice(&EMPTY_RESOURCE_TABLE));
    out.extend_from_slice(&(spirv.len() as i32).to_le_bytes());
    out.extend_from_slice(spirv);
    out.extend_from_slice(&(-1i32).to_le_bytes());

    out
}

/// the spirv bytes embedded in a serialized blob
pub fn embedded_spirv(blob: &[u8]) -> Option<&[u8]> {
    let read_u32 = |offset: usize| -> Option<u32> {
        Some(u32::from_le_bytes(blob.get(offset..offset + 4)?.try_into().ok()?))
    };

    // crc and in/out mask
    let mut offset = 8;
    let element_sizes = [
        size_of::<UniformBufferInfo>(),
        size_of::<SpirvInfo>(),
        size_of::<GlobalInfo>(),
        size_of::<SpirvInfo>(),
        size_of::<u32>(),
    ];
    for element_size in element_sizes {
        let count = read_u32(offset)? as usize;
        offset += 4 + count * element_size;
    }
    offset += size_of_val(&EMPTY_RESOURCE_TABLE);

    let size = read_u32(offset)? as usize;
    let start = offset + 4;
    blob.get(start..start + size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_info_layout() {
        assert_eq!(std::mem::size_of::<GlobalInfo>(), 6);
        let info = GlobalInfo::new(2048, GlobalDescriptor::StorageImage);
        assert_eq!(bytemuck::bytes_of(&info), &[0x00, 0x08, 0xff, 0xff, 3, 0]);
    }

    #[test]
    fn descriptor_types_in_order() {
        let header = VulkanShaderHeader::default();
        let raw: Vec<i32> = header
            .global_descriptor_types
            .iter()
            .map(|ty| ty.as_raw())
            .collect();
        insta::assert_json_snapshot!(raw, @r"
        [
          6,
          2,
          4,
          3,
          5,
          7
        ]
        ");
    }

    #[test]
    fn blob_layout() {
        let mut header = VulkanShaderHeader {
            spirv_crc: 0xdead_beef,
            ..Default::default()
        };
        header.add_uniform_buffer(
            0,
            SpirvInfo {
                binding_index_offset: 10,
                descriptor_set_offset: 7,
            },
        );

        let spirv = [0x03, 0x02, 0x23, 0x07, 0, 0, 0, 0];
        let blob = serialize(&header, &spirv);

        assert_eq!(&blob[0..4], &0xdead_beefu32.to_le_bytes());
        assert_eq!(&blob[4..8], &[0xff; 4]);
        // one uniform buffer
        assert_eq!(&blob[8..12], &1u32.to_le_bytes());
        assert_eq!(&blob[12..16], &0u32.to_le_bytes());

        let tail = &blob[blob.len() - 16..];
        assert_eq!(&tail[0..4], &8i32.to_le_bytes());
        assert_eq!(&tail[4..12], &spirv);
        assert_eq!(&tail[12..16], &(-1i32).to_le_bytes());

        assert_eq!(embedded_spirv(&blob), Some(&spirv[..]));
    }
}
