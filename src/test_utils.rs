//! Assemblers for synthetic SPIR-V modules and DXBC containers used across unit tests.

use crate::shaders::reflection::spirv::{MAGIC, op};
use crate::util::{string_to_words, words_to_bytes};

const OP_CAPABILITY: u16 = 17;
const OP_MEMORY_MODEL: u16 = 14;
const OP_TYPE_VOID: u16 = 19;
const OP_TYPE_INT: u16 = 21;
const OP_TYPE_FUNCTION: u16 = 33;
const OP_FUNCTION: u16 = 54;
const OP_FUNCTION_END: u16 = 56;
const OP_LABEL: u16 = 248;
const OP_RETURN: u16 = 253;

const STORAGE_UNIFORM_CONSTANT: u32 = 0;
const STORAGE_UNIFORM: u32 = 2;

fn inst(out: &mut Vec<u32>, opcode: u16, operands: &[u32]) {
    out.push(((operands.len() as u32 + 1) << 16) | opcode as u32);
    out.extend_from_slice(operands);
}

#[derive(Debug, Clone, Copy)]
pub enum TestShape {
    Block,
    Image { dim: u32, sampled: u32 },
    SampledImage { dim: u32 },
    /// a pointer to a plain integer; not a resource shape
    Opaque,
}

impl TestShape {
    pub fn texture() -> Self {
        Self::Image { dim: 1, sampled: 1 }
    }

    pub fn storage_texture() -> Self {
        Self::Image { dim: 1, sampled: 2 }
    }

    pub fn buffer() -> Self {
        Self::Image { dim: 5, sampled: 1 }
    }

    pub fn storage_buffer() -> Self {
        Self::Image { dim: 5, sampled: 2 }
    }
}

pub struct SpirvBuilder {
    preamble: Vec<u32>,
    modes: Vec<u32>,
    debug: Vec<u32>,
    annotations: Vec<u32>,
    types: Vec<u32>,
    next_id: u32,
    uint_type: u32,
    main: Option<u32>,
}

impl SpirvBuilder {
    /// a module without any entry point
    pub fn library() -> Self {
        let mut builder = Self {
            preamble: Vec::new(),
            modes: Vec::new(),
            debug: Vec::new(),
            annotations: Vec::new(),
            types: Vec::new(),
            next_id: 1,
            uint_type: 0,
            main: None,
        };

        inst(&mut builder.preamble, OP_CAPABILITY, &[1]);
        builder.uint_type = builder.id();
        inst(&mut builder.types, OP_TYPE_INT, &[builder.uint_type, 32, 0]);

        builder
    }

    pub fn compute(entry_point: &str, local_size: [u32; 3]) -> Self {
        let mut builder = Self::library();
        let main = builder.id();
        builder.main = Some(main);

        let mut operands = vec![5, main];
        operands.extend(string_to_words(entry_point));
        inst(&mut builder.modes, op::ENTRY_POINT, &operands);
        inst(
            &mut builder.modes,
            op::EXECUTION_MODE,
            &[main, 17, local_size[0], local_size[1], local_size[2]],
        );

        builder
    }

    fn id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn extension(&mut self, name: &str) -> &mut Self {
        inst(&mut self.preamble, op::EXTENSION, &string_to_words(name));
        self
    }

    /// declares a bound variable in descriptor set 0 and returns its id
    pub fn resource(
        &mut self,
        name: &str,
        binding: u32,
        user_type: Option<&str>,
        shape: TestShape,
    ) -> u32 {
        let var = self.id();

        let mut name_operands = vec![var];
        name_operands.extend(string_to_words(name));
        inst(&mut self.debug, op::NAME, &name_operands);

        inst(&mut self.annotations, op::DECORATE, &[var, 34, 0]);
        inst(&mut self.annotations, op::DECORATE, &[var, 33, binding]);
        if let Some(user_type) = user_type {
            let mut operands = vec![var, 5636];
            operands.extend(string_to_words(user_type));
            inst(&mut self.annotations, op::DECORATE_STRING, &operands);
        }

        let (pointee, storage_class) = match shape {
            TestShape::Block => {
                let id = self.id();
                inst(&mut self.types, op::TYPE_STRUCT, &[id, self.uint_type]);
                inst(&mut self.annotations, op::DECORATE, &[id, 2]);
                (id, STORAGE_UNIFORM)
            }
            TestShape::Image { dim, sampled } => {
                let id = self.image(dim, sampled);
                (id, STORAGE_UNIFORM_CONSTANT)
            }
            TestShape::SampledImage { dim } => {
                let image = self.image(dim, 1);
                let id = self.id();
                inst(&mut self.types, op::TYPE_SAMPLED_IMAGE, &[id, image]);
                (id, STORAGE_UNIFORM_CONSTANT)
            }
            TestShape::Opaque => (self.uint_type, STORAGE_UNIFORM_CONSTANT),
        };

        let pointer = self.id();
        inst(&mut self.types, op::TYPE_POINTER, &[pointer, storage_class, pointee]);
        inst(&mut self.types, op::VARIABLE, &[pointer, var, storage_class]);

        var
    }

    fn image(&mut self, dim: u32, sampled: u32) -> u32 {
        let id = self.id();
        inst(
            &mut self.types,
            op::TYPE_IMAGE,
            &[id, self.uint_type, dim, 0, 0, 0, sampled, 0],
        );
        id
    }

    pub fn build(mut self) -> Vec<u32> {
        let mut function = Vec::new();
        if let Some(main) = self.main {
            let void = self.id();
            let function_type = self.id();
            let label = self.id();
            inst(&mut self.types, OP_TYPE_VOID, &[void]);
            inst(&mut self.types, OP_TYPE_FUNCTION, &[function_type, void]);
            inst(&mut function, OP_FUNCTION, &[void, main, 0, function_type]);
            inst(&mut function, OP_LABEL, &[label]);
            inst(&mut function, OP_RETURN, &[]);
            inst(&mut function, OP_FUNCTION_END, &[]);
        }

        let mut words = vec![MAGIC, 0x0001_0000, 0, self.next_id, 0];
        words.extend(self.preamble);
        inst(&mut words, OP_MEMORY_MODEL, &[0, 1]);
        words.extend(self.modes);
        words.extend(self.debug);
        words.extend(self.annotations);
        words.extend(self.types);
        words.extend(function);
        words
    }

    pub fn build_bytes(self) -> Vec<u8> {
        words_to_bytes(&self.build())
    }
}

/// a minimal DXBC container; the checksum is left zeroed
pub fn build_container(parts: &[(&[u8; 4], &[u8])]) -> Vec<u8> {
    let header_size = 4 + 16 + 4 + 4 + 4 + 4 * parts.len();

    let mut out = Vec::new();
    out.extend_from_slice(b"DXBC");
    out.extend_from_slice(&[0u8; 16]);
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&(parts.len() as u32).to_le_bytes());
    out.resize(header_size, 0);

    for (i, (fourcc, data)) in parts.iter().enumerate() {
        let offset = out.len() as u32;
        let pos = 32 + i * 4;
        out[pos..pos + 4].copy_from_slice(&offset.to_le_bytes());

        out.extend_from_slice(*fourcc);
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
    }

    let total_size = out.len() as u32;
    out[24..28].copy_from_slice(&total_size.to_le_bytes());

    out
}

#[derive(Debug, Clone, Copy)]
pub struct PsvBinding {
    pub res_type: u32,
    pub res_kind: u32,
    pub space: u32,
    pub lower_bound: u32,
    pub upper_bound: u32,
}

impl PsvBinding {
    pub fn new(res_type: u32, res_kind: u32, lower_bound: u32) -> Self {
        Self {
            res_type,
            res_kind,
            space: 0,
            lower_bound,
            upper_bound: lower_bound,
        }
    }
}

/// v2 runtime info (with thread counts) when `num_threads` is set, v0 otherwise;
/// bind infos carry kinds only together with v2
pub fn build_psv0(num_threads: Option<[u32; 3]>, bindings: &[PsvBinding]) -> Vec<u8> {
    let mut out = Vec::new();

    let runtime_info_size: u32 = if num_threads.is_some() { 48 } else { 24 };
    out.extend_from_slice(&runtime_info_size.to_le_bytes());

    let mut runtime_info = vec![0u8; runtime_info_size as usize];
    if let Some([x, y, z]) = num_threads {
        // compute stage
        runtime_info[24] = 5;
        runtime_info[36..40].copy_from_slice(&x.to_le_bytes());
        runtime_info[40..44].copy_from_slice(&y.to_le_bytes());
        runtime_info[44..48].copy_from_slice(&z.to_le_bytes());
    }
    out.extend_from_slice(&runtime_info);

    out.extend_from_slice(&(bindings.len() as u32).to_le_bytes());
    if !bindings.is_empty() {
        let with_kinds = num_threads.is_some();
        let bind_info_size: u32 = if with_kinds { 24 } else { 16 };
        out.extend_from_slice(&bind_info_size.to_le_bytes());

        for binding in bindings {
            out.extend_from_slice(&binding.res_type.to_le_bytes());
            out.extend_from_slice(&binding.space.to_le_bytes());
            out.extend_from_slice(&binding.lower_bound.to_le_bytes());
            out.extend_from_slice(&binding.upper_bound.to_le_bytes());
            if with_kinds {
                out.extend_from_slice(&binding.res_kind.to_le_bytes());
                out.extend_from_slice(&0u32.to_le_bytes());
            }
        }
    }

    out
}

#[derive(Debug, Clone, Copy)]
pub struct TestSignatureElement<'a> {
    pub name: &'a str,
    pub index: u32,
    pub system_value: u32,
    pub register: u32,
    pub mask: u8,
}

/// ISG1/OSG1 layout when `v1`, ISGN/OSGN otherwise
pub fn build_signature(elements: &[TestSignatureElement], v1: bool) -> Vec<u8> {
    let entry_size = if v1 { 32 } else { 24 };
    let table_end = 8 + elements.len() * entry_size;

    let mut names = Vec::new();
    let mut name_offsets = Vec::new();
    for element in elements {
        name_offsets.push((table_end + names.len()) as u32);
        names.extend_from_slice(element.name.as_bytes());
        names.push(0);
    }

    let mut out = Vec::new();
    out.extend_from_slice(&(elements.len() as u32).to_le_bytes());
    out.extend_from_slice(&8u32.to_le_bytes());

    for (element, name_offset) in elements.iter().zip(name_offsets) {
        if v1 {
            // stream
            out.extend_from_slice(&0u32.to_le_bytes());
        }
        out.extend_from_slice(&name_offset.to_le_bytes());
        out.extend_from_slice(&element.index.to_le_bytes());
        out.extend_from_slice(&element.system_value.to_le_bytes());
        // component type: float32
        out.extend_from_slice(&3u32.to_le_bytes());
        out.extend_from_slice(&element.register.to_le_bytes());
        out.extend_from_slice(&[element.mask, element.mask, 0, 0]);
        if v1 {
            // min precision
            out.extend_from_slice(&0u32.to_le_bytes());
        }
    }

    out.extend_from_slice(&names);
    out
}

/// a compute shader container with a PSV0 part and empty v1 signatures
pub fn compute_container(num_threads: [u32; 3], bindings: &[PsvBinding]) -> Vec<u8> {
    shader_container(num_threads, &[], &[], bindings)
}

/// a container for any stage, with v1 input and output signatures
pub fn shader_container(
    num_threads: [u32; 3],
    inputs: &[TestSignatureElement],
    outputs: &[TestSignatureElement],
    bindings: &[PsvBinding],
) -> Vec<u8> {
    let psv0 = build_psv0(Some(num_threads), bindings);
    let input_signature = build_signature(inputs, true);
    let output_signature = build_signature(outputs, true);
    build_container(&[
        (b"ISG1", &input_signature),
        (b"OSG1", &output_signature),
        (b"PSV0", &psv0),
        (b"DXIL", &[0u8; 16]),
    ])
}
