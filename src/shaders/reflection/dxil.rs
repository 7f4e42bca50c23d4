//! Reflection of DXIL containers.
//!
//! Bound resources and the thread-group size come from the pipeline state validation
//! part (`PSV0`), semantics from the signature parts. PSV0 carries no names, so those
//! are taken from the `Resource Bindings` table of a DXC disassembly when one is
//! available and synthesized from the register otherwise.

use std::collections::HashMap;
use std::fmt;

use log::*;

use super::{ResourceClass, ShaderResourceType, ShaderSemantic};
use crate::error::{Error, Result};

const DXBC_MAGIC: &[u8; 4] = b"DXBC";
const DXBC_HEADER_LEN: usize = 4 + 16 + 4 + 4 + 4;

const SIGNATURE_ENTRY_LEN_V0: usize = 24;
const SIGNATURE_ENTRY_LEN_V1: usize = 32;

const RUNTIME_INFO_V2_LEN: usize = 48;
const NUM_THREADS_OFFSET: usize = 36;

const BIND_INFO_V0_LEN: usize = 16;
const BIND_INFO_V1_LEN: usize = 24;

fn reflection_error(context: impl fmt::Display) -> Error {
    debug!("dxil reflection failed: {context}");
    Error::Reflection("Unable to create reflection".to_string())
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| reflection_error(format!("need 4 bytes at {offset}, have {}", bytes.len())))
}

/// a parsed DXBC container; parts borrow from the input
#[derive(Debug, Clone)]
pub struct DxbcContainer<'a> {
    parts: Vec<(&'a [u8; 4], &'a [u8])>,
}

impl<'a> DxbcContainer<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < DXBC_HEADER_LEN || &bytes[0..4] != DXBC_MAGIC {
            return Err(reflection_error("missing DXBC header"));
        }

        let total_size = read_u32(bytes, 24)? as usize;
        let part_count = read_u32(bytes, 28)? as usize;
        if total_size > bytes.len() || total_size < DXBC_HEADER_LEN {
            return Err(reflection_error(format!(
                "total_size {total_size} outside buffer of {}",
                bytes.len()
            )));
        }
        let bytes = &bytes[..total_size];

        let table_end = part_count
            .checked_mul(4)
            .and_then(|len| len.checked_add(DXBC_HEADER_LEN))
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| reflection_error(format!("part table of {part_count} entries")))?;

        let mut parts = Vec::with_capacity(part_count);
        for i in 0..part_count {
            let offset = read_u32(bytes, DXBC_HEADER_LEN + i * 4)? as usize;
            if offset < table_end {
                return Err(reflection_error(format!("part {i} points into the header")));
            }

            let fourcc: &[u8; 4] = bytes
                .get(offset..offset + 4)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| reflection_error(format!("part {i} header out of bounds")))?;
            let size = read_u32(bytes, offset + 4)? as usize;
            let data = bytes
                .get(offset + 8..offset + 8 + size)
                .ok_or_else(|| reflection_error(format!("part {i} data out of bounds")))?;

            parts.push((fourcc, data));
        }

        Ok(Self { parts })
    }

    pub fn part(&self, fourcc: &[u8; 4]) -> Option<&'a [u8]> {
        self.parts
            .iter()
            .find(|(f, _)| *f == fourcc)
            .map(|(_, data)| *data)
    }
}

/// bound resource kinds, mirroring D3D shader input types plus the buffer/texture split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DxilResourceKind {
    CBuffer,
    TBuffer,
    Texture { buffer: bool },
    Sampler,
    UavRwTyped { buffer: bool },
    Structured,
    UavRwStructured,
    ByteAddress,
    UavRwByteAddress,
    UavAppendStructured,
    UavConsumeStructured,
    UavRwStructuredWithCounter,
    RtAccelerationStructure,
    UavFeedbackTexture,
}

mod psv_type {
    pub const SAMPLER: u32 = 1;
    pub const CBV: u32 = 2;
    pub const SRV_TYPED: u32 = 3;
    pub const SRV_RAW: u32 = 4;
    pub const SRV_STRUCTURED: u32 = 5;
    pub const UAV_TYPED: u32 = 6;
    pub const UAV_RAW: u32 = 7;
    pub const UAV_STRUCTURED: u32 = 8;
    pub const UAV_STRUCTURED_WITH_COUNTER: u32 = 9;
}

mod psv_kind {
    pub const TYPED_BUFFER: u32 = 10;
    pub const TBUFFER: u32 = 15;
    pub const RT_ACCELERATION_STRUCTURE: u32 = 16;
    pub const FEEDBACK_TEXTURE_2D: u32 = 17;
    pub const FEEDBACK_TEXTURE_2D_ARRAY: u32 = 18;
}

impl DxilResourceKind {
    /// `kind` is 0 for v0 bind infos, which only carry the type
    fn from_psv(res_type: u32, kind: u32) -> Option<Self> {
        use DxilResourceKind::*;

        let resource_kind = match res_type {
            psv_type::SAMPLER => Sampler,
            psv_type::CBV if kind == psv_kind::TBUFFER => TBuffer,
            psv_type::CBV => CBuffer,
            psv_type::SRV_TYPED => match kind {
                psv_kind::TBUFFER => TBuffer,
                psv_kind::RT_ACCELERATION_STRUCTURE => RtAccelerationStructure,
                _ => Texture {
                    buffer: kind == psv_kind::TYPED_BUFFER,
                },
            },
            psv_type::SRV_RAW if kind == psv_kind::RT_ACCELERATION_STRUCTURE => {
                RtAccelerationStructure
            }
            psv_type::SRV_RAW => ByteAddress,
            psv_type::SRV_STRUCTURED => Structured,
            psv_type::UAV_TYPED => match kind {
                psv_kind::FEEDBACK_TEXTURE_2D | psv_kind::FEEDBACK_TEXTURE_2D_ARRAY => {
                    UavFeedbackTexture
                }
                _ => UavRwTyped {
                    buffer: kind == psv_kind::TYPED_BUFFER,
                },
            },
            psv_type::UAV_RAW => UavRwByteAddress,
            psv_type::UAV_STRUCTURED => UavRwStructured,
            // PSV0 does not tell append/consume buffers apart from counted ones
            psv_type::UAV_STRUCTURED_WITH_COUNTER => UavRwStructuredWithCounter,
            _ => return None,
        };

        Some(resource_kind)
    }

    pub fn classify(self) -> (ResourceClass, ShaderResourceType) {
        use DxilResourceKind::*;
        use ResourceClass as C;
        use ShaderResourceType as T;

        match self {
            CBuffer => (C::Cbv, T::UniformBuffer),
            Texture { buffer: true } => (C::Srv, T::Buffer),
            Texture { buffer: false } => (C::Srv, T::Texture),
            ByteAddress => (C::Srv, T::ByteAddressBuffer),
            Structured => (C::Srv, T::StructuredBuffer),
            TBuffer => (C::Srv, T::Buffer),
            RtAccelerationStructure => (C::Srv, T::AccelerationStructure),
            UavRwTyped { buffer: true } => (C::Uav, T::Buffer),
            UavRwTyped { buffer: false } => (C::Uav, T::Texture),
            UavFeedbackTexture => (C::Uav, T::Texture),
            UavRwStructured
            | UavAppendStructured
            | UavConsumeStructured
            | UavRwStructuredWithCounter => (C::Uav, T::StructuredBuffer),
            UavRwByteAddress => (C::Uav, T::ByteAddressBuffer),
            Sampler => (C::Sampler, T::Sampler),
        }
    }

    /// register prefix in HLSL bind syntax
    fn register_prefix(self) -> &'static str {
        match self.classify().0 {
            ResourceClass::Cbv => "cb",
            ResourceClass::Srv => "t",
            ResourceClass::Uav => "u",
            ResourceClass::Sampler => "s",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DxilResource {
    pub name: String,
    pub kind: DxilResourceKind,
    pub space: u32,
    pub bind_point: u32,
    pub bind_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DxilReflection {
    pub resources: Vec<DxilResource>,
    pub input_semantics: Vec<ShaderSemantic>,
    pub output_semantics: Vec<ShaderSemantic>,
    pub thread_group_size: [u32; 3],
}

/// `disassembly`, when given, supplies resource names
pub fn reflect(container: &[u8], disassembly: Option<&str>) -> Result<DxilReflection> {
    let container = DxbcContainer::parse(container)?;

    let psv0 = container
        .part(b"PSV0")
        .ok_or_else(|| reflection_error("missing PSV0 part"))?;
    let (thread_group_size, raw_bindings) = parse_psv0(psv0)?;

    let names = disassembly.map(parse_resource_names).unwrap_or_default();

    let mut resources = Vec::with_capacity(raw_bindings.len());
    for raw in raw_bindings {
        let Some(kind) = DxilResourceKind::from_psv(raw.res_type, raw.res_kind) else {
            let name = register_name("?", raw.lower_bound, raw.space);
            return Err(Error::Fixup(format!("Unsupported resource type for {name}")));
        };

        let prefix = kind.register_prefix();
        let name = names
            .get(&(prefix, raw.lower_bound, raw.space))
            .cloned()
            .unwrap_or_else(|| register_name(prefix, raw.lower_bound, raw.space));

        resources.push(DxilResource {
            name,
            kind,
            space: raw.space,
            bind_point: raw.lower_bound,
            bind_count: raw.upper_bound.wrapping_sub(raw.lower_bound).wrapping_add(1),
        });
    }

    let input_semantics = signature(&container, [b"ISG1", b"ISGN"])?;
    let output_semantics = signature(&container, [b"OSG1", b"OSGN"])?;

    Ok(DxilReflection {
        resources,
        input_semantics,
        output_semantics,
        thread_group_size,
    })
}

fn register_name(prefix: &str, register: u32, space: u32) -> String {
    if space == 0 {
        format!("{prefix}{register}")
    } else {
        format!("{prefix}{register},space{space}")
    }
}

struct RawBinding {
    res_type: u32,
    res_kind: u32,
    space: u32,
    lower_bound: u32,
    upper_bound: u32,
}

fn parse_psv0(psv0: &[u8]) -> Result<([u32; 3], Vec<RawBinding>)> {
    let runtime_info_size = read_u32(psv0, 0)? as usize;
    let runtime_info = psv0
        .get(4..4 + runtime_info_size)
        .ok_or_else(|| reflection_error("runtime info out of bounds"))?;

    let thread_group_size = if runtime_info_size >= RUNTIME_INFO_V2_LEN {
        [
            read_u32(runtime_info, NUM_THREADS_OFFSET)?,
            read_u32(runtime_info, NUM_THREADS_OFFSET + 4)?,
            read_u32(runtime_info, NUM_THREADS_OFFSET + 8)?,
        ]
    } else {
        warn!("PSV0 runtime info predates thread counts, assuming 1x1x1");
        [1, 1, 1]
    };

    let mut offset = 4 + runtime_info_size;
    let resource_count = read_u32(psv0, offset)? as usize;
    offset += 4;

    let mut bindings = Vec::new();
    if resource_count > 0 {
        let bind_info_size = read_u32(psv0, offset)? as usize;
        offset += 4;
        if bind_info_size < BIND_INFO_V0_LEN {
            return Err(reflection_error(format!("bind info size {bind_info_size}")));
        }

        for i in 0..resource_count {
            let record = offset + i * bind_info_size;
            let res_kind = if bind_info_size >= BIND_INFO_V1_LEN {
                read_u32(psv0, record + 16)?
            } else {
                0
            };

            bindings.push(RawBinding {
                res_type: read_u32(psv0, record)?,
                space: read_u32(psv0, record + 4)?,
                lower_bound: read_u32(psv0, record + 8)?,
                upper_bound: read_u32(psv0, record + 12)?,
                res_kind,
            });
        }
    }

    Ok((thread_group_size, bindings))
}

fn signature(container: &DxbcContainer, fourccs: [&[u8; 4]; 2]) -> Result<Vec<ShaderSemantic>> {
    let [v1, v0] = fourccs;
    if let Some(part) = container.part(v1) {
        parse_signature(part, SIGNATURE_ENTRY_LEN_V1)
    } else if let Some(part) = container.part(v0) {
        parse_signature(part, SIGNATURE_ENTRY_LEN_V0)
    } else {
        Ok(Vec::new())
    }
}

/// system values are dropped, only user semantics are reported
fn parse_signature(part: &[u8], entry_size: usize) -> Result<Vec<ShaderSemantic>> {
    let count = read_u32(part, 0)? as usize;
    let table = read_u32(part, 4)? as usize;

    // v1 entries lead with the stream index
    let base = if entry_size == SIGNATURE_ENTRY_LEN_V1 { 4 } else { 0 };

    let mut semantics = Vec::new();
    for i in 0..count {
        let entry = table + i * entry_size + base;
        let name_offset = read_u32(part, entry)? as usize;
        let index = read_u32(part, entry + 4)?;
        let system_value = read_u32(part, entry + 8)?;
        let register_num = read_u32(part, entry + 16)?;
        let mask = *part
            .get(entry + 20)
            .ok_or_else(|| reflection_error(format!("signature entry {i} truncated")))?;

        if system_value != 0 {
            continue;
        }

        let name_bytes = part
            .get(name_offset..)
            .ok_or_else(|| reflection_error(format!("signature name {i} out of bounds")))?;
        let end = name_bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| reflection_error(format!("signature name {i} unterminated")))?;

        semantics.push(ShaderSemantic {
            name: String::from_utf8_lossy(&name_bytes[..end]).into_owned(),
            index,
            register_num,
            mask,
        });
    }

    Ok(semantics)
}

/// (register prefix, register, space) -> name, from a DXC disassembly listing
fn parse_resource_names(disassembly: &str) -> HashMap<(&'static str, u32, u32), String> {
    let mut names = HashMap::new();

    let lines = disassembly
        .lines()
        .map(str::trim)
        .skip_while(|line| !line.starts_with("; Resource Bindings:"))
        .skip(1)
        .skip_while(|line| !line.starts_with("; ---"))
        .skip(1);

    for line in lines {
        let Some(row) = line.strip_prefix(';') else {
            break;
        };
        let columns: Vec<&str> = row.split_whitespace().collect();
        if columns.len() < 3 {
            break;
        }

        let name = columns[0];
        let bind = columns[columns.len() - 2];
        if let Some(key) = parse_hlsl_bind(bind) {
            names.insert(key, name.to_string());
        }
    }

    names
}

fn parse_hlsl_bind(bind: &str) -> Option<(&'static str, u32, u32)> {
    let (register, space) = match bind.split_once(",space") {
        Some((register, space)) => (register, space.parse().ok()?),
        None => (bind, 0),
    };

    let (prefix, number) = ["cb", "t", "u", "s"]
        .into_iter()
        .find_map(|prefix| Some((prefix, register.strip_prefix(prefix)?)))?;

    Some((prefix, number.parse().ok()?, space))
}
