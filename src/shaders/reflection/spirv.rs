//! A word-level SPIR-V reader.
//!
//! Only the handful of instructions needed to recover resource bindings are decoded:
//! names, decorations, pointer/image/struct types, variables, the entry point and
//! its LocalSize execution mode. Everything else is skipped by word count.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::*;

use crate::error::{Error, Result};
use crate::util::{bytes_to_words, crc32, literal_string, string_to_words, words_to_bytes};

pub const MAGIC: u32 = 0x0723_0203;
pub const HEADER_WORDS: usize = 5;

/// the name DXC is told to emit; replaced by a size/crc derived name during fixup
pub const CANONICAL_ENTRY_POINT: &str = "main_00000000_00000000";
/// "main_xxxxxxxx_xxxxxxxx" plus its terminator
const ENTRY_POINT_NAME_WORDS: usize = 6;

pub const NOP_WORD: u32 = 0x0001_0000;

pub mod op {
    pub const NAME: u16 = 5;
    pub const EXTENSION: u16 = 10;
    pub const ENTRY_POINT: u16 = 15;
    pub const EXECUTION_MODE: u16 = 16;
    pub const TYPE_IMAGE: u16 = 25;
    pub const TYPE_SAMPLED_IMAGE: u16 = 27;
    pub const TYPE_STRUCT: u16 = 30;
    pub const TYPE_POINTER: u16 = 32;
    pub const VARIABLE: u16 = 59;
    pub const DECORATE: u16 = 71;
    pub const DECORATE_STRING: u16 = 5632;
    pub const MEMBER_DECORATE_STRING: u16 = 5633;
}

pub mod decoration {
    pub const BLOCK: u32 = 2;
    pub const BINDING: u32 = 33;
    pub const DESCRIPTOR_SET: u32 = 34;
    pub const HLSL_SEMANTIC_GOOGLE: u32 = 5635;
    pub const USER_TYPE_GOOGLE: u32 = 5636;
}

const EXECUTION_MODE_LOCAL_SIZE: u32 = 17;

const REFLECTION_EXTENSIONS: [&str; 2] = ["SPV_GOOGLE_hlsl_functionality1", "SPV_GOOGLE_user_type"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub offset: usize,
    pub opcode: u16,
    pub word_count: usize,
}

/// walks instructions after the module header; stops at a zero word count or a truncated instruction
pub struct Instructions<'a> {
    words: &'a [u32],
    offset: usize,
}

impl Iterator for Instructions<'_> {
    type Item = Instruction;

    fn next(&mut self) -> Option<Self::Item> {
        let word = *self.words.get(self.offset)?;
        let opcode = (word & 0xffff) as u16;
        let word_count = (word >> 16) as usize;

        if word_count == 0 || self.offset + word_count > self.words.len() {
            return None;
        }

        let instruction = Instruction {
            offset: self.offset,
            opcode,
            word_count,
        };
        self.offset += word_count;

        Some(instruction)
    }
}

pub fn instructions(words: &[u32]) -> Instructions<'_> {
    Instructions {
        words,
        offset: HEADER_WORDS,
    }
}

/// what a bound variable's pointee turned out to be, for shaders without reflection strings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointeeShape {
    /// a Block-decorated struct
    Block,
    Image { dim: u32, sampled: u32 },
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpirvResource {
    pub id: u32,
    pub name: String,
    pub binding: u32,
    /// word offsets of the Binding/DescriptorSet literals, for in-place rebinding by the loader
    pub binding_word_offset: u32,
    pub descriptor_set_word_offset: u32,
    /// the UserTypeGOOGLE string emitted by `-fspv-reflect`
    pub reflection_type: Option<String>,
    pub shape: PointeeShape,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpirvReflection {
    /// sorted by binding
    pub resources: Vec<SpirvResource>,
    pub thread_group_size: [u32; 3],
}

#[derive(Debug, Default)]
struct IdDecorations {
    binding: Option<u32>,
    binding_word_offset: u32,
    descriptor_set_word_offset: u32,
    type_id: u32,
    name: String,
    reflection_type: Option<String>,
}

/// an owned, mutable spirv module; never aliases the caller's bytecode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpirvModule {
    words: Vec<u32>,
}

impl SpirvModule {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::Reflection("Empty ByteCode".to_string()));
        }

        let words = bytes_to_words(bytes)
            .map_err(|err| Error::Reflection(format!("Invalid SPIRV blob: {err}")))?;

        Self::from_words(words)
    }

    pub fn from_words(words: Vec<u32>) -> Result<Self> {
        if words.len() < HEADER_WORDS || words[0] != MAGIC {
            return Err(Error::Reflection("Invalid SPIRV blob".to_string()));
        }

        Ok(Self { words })
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        words_to_bytes(&self.words)
    }

    pub fn byte_len(&self) -> usize {
        self.words.len() * 4
    }

    fn find_entry_point(&self) -> Option<Instruction> {
        instructions(&self.words).find(|i| i.opcode == op::ENTRY_POINT && i.word_count > 3)
    }

    /// Renames the first entry point to `main_<size>_<crc>`. Returns the crc.
    pub fn patch_entry_point(&mut self) -> Result<u32> {
        self.resize_entry_point_name()?;
        self.stamp_entry_point()
    }

    /// Resizes the first entry point name to exactly six words and fixes up the
    /// instruction word count. Later word offsets shift, so this has to run
    /// before any offsets are recorded.
    pub fn resize_entry_point_name(&mut self) -> Result<()> {
        let Some(entry_point) = self.find_entry_point() else {
            return Err(Error::Fixup("Unable to find SPIRV EntryPoint".to_string()));
        };

        let name_start = entry_point.offset + 3;
        let name_end = entry_point.offset + entry_point.word_count;
        let name_words = self.words[name_start..name_end]
            .iter()
            .position(|word| word.to_le_bytes().contains(&0))
            .map(|index| index + 1)
            .unwrap_or(name_end - name_start);

        let word_count = if name_words < ENTRY_POINT_NAME_WORDS {
            let missing = ENTRY_POINT_NAME_WORDS - name_words;
            let insert_at = name_start + name_words;
            self.words
                .splice(insert_at..insert_at, std::iter::repeat_n(0, missing));
            entry_point.word_count + missing
        } else if name_words > ENTRY_POINT_NAME_WORDS {
            let extra = name_words - ENTRY_POINT_NAME_WORDS;
            self.words
                .drain(name_start + ENTRY_POINT_NAME_WORDS..name_start + name_words);
            entry_point.word_count - extra
        } else {
            entry_point.word_count
        };

        self.words[entry_point.offset] = ((word_count as u32) << 16) | op::ENTRY_POINT as u32;
        self.write_entry_point_name(name_start, CANONICAL_ENTRY_POINT);

        Ok(())
    }

    /// Computes the crc with the canonical placeholder name in place, then writes
    /// the final name into every resized entry point.
    pub fn stamp_entry_point(&mut self) -> Result<u32> {
        let entry_points: Vec<Instruction> = instructions(&self.words)
            .filter(|i| i.opcode == op::ENTRY_POINT && i.word_count > 3 + ENTRY_POINT_NAME_WORDS - 1)
            .collect();
        if entry_points.is_empty() {
            return Err(Error::Fixup("Unable to find SPIRV EntryPoint".to_string()));
        }

        for entry_point in &entry_points {
            self.write_entry_point_name(entry_point.offset + 3, CANONICAL_ENTRY_POINT);
        }

        let bytes = self.to_bytes();
        let crc = crc32(&bytes);
        let name = format!("main_{:08x}_{:08x}", bytes.len(), crc);
        for entry_point in &entry_points {
            self.write_entry_point_name(entry_point.offset + 3, &name);
        }

        debug!("patched spirv entry point to {name}");

        Ok(crc)
    }

    fn write_entry_point_name(&mut self, name_start: usize, name: &str) {
        let mut name_words = string_to_words(name);
        name_words.resize(ENTRY_POINT_NAME_WORDS, 0);
        self.words[name_start..name_start + ENTRY_POINT_NAME_WORDS].copy_from_slice(&name_words);
    }

    pub fn entry_point_name(&self) -> Option<String> {
        let entry_point = self.find_entry_point()?;
        let name_start = entry_point.offset + 3;
        let name_end = entry_point.offset + entry_point.word_count;
        Some(literal_string(&self.words[name_start..name_end]))
    }

    /// collects every bound variable plus the LocalSize execution mode
    pub fn reflect(&self) -> SpirvReflection {
        let words = &self.words;

        let mut decorations: BTreeMap<u32, IdDecorations> = BTreeMap::new();
        let mut pointers: HashMap<u32, u32> = HashMap::new();
        let mut images: HashMap<u32, (u32, u32)> = HashMap::new();
        let mut sampled_images: HashMap<u32, u32> = HashMap::new();
        let mut structs: HashSet<u32> = HashSet::new();
        let mut blocks: HashSet<u32> = HashSet::new();
        let mut thread_group_size = [0; 3];

        for Instruction {
            offset,
            opcode,
            word_count,
        } in instructions(words)
        {
            let operands = &words[offset + 1..offset + word_count];
            match opcode {
                op::DECORATE if operands.len() >= 3 => match operands[1] {
                    decoration::BINDING => {
                        let entry = decorations.entry(operands[0]).or_default();
                        entry.binding = Some(operands[2]);
                        entry.binding_word_offset = (offset + 3) as u32;
                    }
                    decoration::DESCRIPTOR_SET => {
                        let entry = decorations.entry(operands[0]).or_default();
                        entry.descriptor_set_word_offset = (offset + 3) as u32;
                    }
                    _ => {}
                },
                op::DECORATE if operands.len() == 2 && operands[1] == decoration::BLOCK => {
                    blocks.insert(operands[0]);
                }
                op::NAME if operands.len() >= 2 => {
                    decorations.entry(operands[0]).or_default().name = literal_string(&operands[1..]);
                }
                op::DECORATE_STRING
                    if operands.len() >= 3 && operands[1] == decoration::USER_TYPE_GOOGLE =>
                {
                    decorations.entry(operands[0]).or_default().reflection_type =
                        Some(literal_string(&operands[2..]));
                }
                op::VARIABLE if operands.len() >= 3 => {
                    decorations.entry(operands[1]).or_default().type_id = operands[0];
                }
                op::TYPE_POINTER if operands.len() >= 3 => {
                    pointers.insert(operands[0], operands[2]);
                }
                op::TYPE_IMAGE if operands.len() >= 8 => {
                    images.insert(operands[0], (operands[2], operands[6]));
                }
                op::TYPE_SAMPLED_IMAGE if operands.len() >= 2 => {
                    sampled_images.insert(operands[0], operands[1]);
                }
                op::TYPE_STRUCT if !operands.is_empty() => {
                    structs.insert(operands[0]);
                }
                op::EXECUTION_MODE
                    if operands.len() >= 5 && operands[1] == EXECUTION_MODE_LOCAL_SIZE =>
                {
                    thread_group_size = [operands[2], operands[3], operands[4]];
                }
                _ => {}
            }
        }

        let shape_of = |pointer_type: u32| -> PointeeShape {
            let Some(&pointee) = pointers.get(&pointer_type) else {
                return PointeeShape::Unknown;
            };
            let pointee = sampled_images.get(&pointee).copied().unwrap_or(pointee);

            if blocks.contains(&pointee) && structs.contains(&pointee) {
                PointeeShape::Block
            } else if let Some(&(dim, sampled)) = images.get(&pointee) {
                PointeeShape::Image { dim, sampled }
            } else {
                PointeeShape::Unknown
            }
        };

        let mut resources: Vec<SpirvResource> = decorations
            .into_iter()
            .filter_map(|(id, decorations)| {
                let binding = decorations.binding?;
                Some(SpirvResource {
                    id,
                    binding,
                    binding_word_offset: decorations.binding_word_offset,
                    descriptor_set_word_offset: decorations.descriptor_set_word_offset,
                    shape: shape_of(decorations.type_id),
                    name: decorations.name,
                    reflection_type: decorations.reflection_type,
                })
            })
            .collect();
        resources.sort_by_key(|resource| resource.binding);

        SpirvReflection {
            resources,
            thread_group_size,
        }
    }

    /// Overwrites reflection-only instructions with OpNop.
    ///
    /// Covers the GOOGLE string decorations (user type and hlsl semantic) and the
    /// extensions declaring them. Returns the number of instructions stripped.
    pub fn strip_reflection(&mut self) -> usize {
        let to_strip: Vec<Instruction> = instructions(&self.words)
            .filter(|i| {
                let operands = &self.words[i.offset + 1..i.offset + i.word_count];
                let is_reflection_decoration =
                    |d: u32| d == decoration::USER_TYPE_GOOGLE || d == decoration::HLSL_SEMANTIC_GOOGLE;
                match i.opcode {
                    op::DECORATE_STRING => operands.len() >= 2 && is_reflection_decoration(operands[1]),
                    op::MEMBER_DECORATE_STRING => {
                        operands.len() >= 3 && is_reflection_decoration(operands[2])
                    }
                    op::EXTENSION => {
                        let name = literal_string(operands);
                        REFLECTION_EXTENSIONS.contains(&name.as_str())
                    }
                    _ => false,
                }
            })
            .collect();

        for instruction in &to_strip {
            self.words[instruction.offset..instruction.offset + instruction.word_count]
                .fill(NOP_WORD);
        }

        to_strip.len()
    }
}

/// re-reads the entry point name of a (possibly fixed-up) spirv blob
pub fn read_entry_point_name(bytes: &[u8]) -> Result<String> {
    let module = SpirvModule::from_bytes(bytes)?;
    module
        .entry_point_name()
        .ok_or_else(|| Error::Fixup("Unable to find SPIRV EntryPoint".to_string()))
}
