use bytemuck::{Pod, Zeroable};

use super::{HeaderWrite, write_value};
use crate::shaders::reflection::ShaderResourceBindings;

/// resource counts the d3d12 loader reads ahead of the DXBC container
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DxilShaderHeader {
    pub resource_table_bits: u32,
    pub num_cbvs: u32,
    pub num_srvs: u32,
    pub num_uavs: u32,
    pub num_samplers: u32,
}

impl HeaderWrite for DxilShaderHeader {}

pub const DXIL_HEADER_LEN: usize = size_of::<DxilShaderHeader>();

impl DxilShaderHeader {
    pub fn from_bindings(bindings: &ShaderResourceBindings) -> Self {
        Self {
            resource_table_bits: 0,
            num_cbvs: bindings.cbvs.len() as u32,
            num_srvs: bindings.srvs.len() as u32,
            num_uavs: bindings.uavs.len() as u32,
            num_samplers: bindings.samplers.len() as u32,
        }
    }

    pub fn read(blob: &[u8]) -> Option<Self> {
        let header = blob.get(..DXIL_HEADER_LEN)?;
        Some(bytemuck::pod_read_unaligned(header))
    }
}

pub fn serialize(header: &DxilShaderHeader, container: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DXIL_HEADER_LEN + container.len());
    write_value(&mut out, header);
    out.extend_from_slice(container);
    out
}

/// the DXBC container behind the header
pub fn embedded_container(blob: &[u8]) -> Option<&[u8]> {
    blob.get(DXIL_HEADER_LEN..)
}
