//! Turns compiler output into the blobs the backends load.
//!
//! Both formats go through the same steps: bucket the reflected bindings by class,
//! sort each bucket by binding number, hand out dense slots in that order and
//! serialize the backend header around the bytecode.

use bytemuck::Pod;
use log::*;

use crate::config::TargetPlatform;
use crate::error::{Error, Result};
use crate::shaders::reflection::dxil;
use crate::shaders::reflection::spirv::{PointeeShape, SpirvModule, SpirvResource};
use crate::shaders::reflection::{
    BindingRange, ResourceClass, ShaderResourceBinding, ShaderResourceBindings, ShaderResourceType,
};

pub mod dxil_header;
pub mod spirv_header;

use dxil_header::DxilShaderHeader;
use spirv_header::{GlobalDescriptor, SpirvInfo, VulkanShaderHeader};

/// A marker for header records that are written to the blob as raw bytes
///
/// An implementing struct must be repr(C) with explicit padding fields
pub trait HeaderWrite: Pod {}

impl HeaderWrite for u32 {}

fn write_value<T: HeaderWrite>(out: &mut Vec<u8>, value: &T) {
    out.extend_from_slice(bytemuck::bytes_of(value));
}

/// u32 element count followed by the elements
fn write_array<T: HeaderWrite>(out: &mut Vec<u8>, elements: &[T]) {
    write_value(out, &(elements.len() as u32));
    out.extend_from_slice(bytemuck::cast_slice(elements));
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedUpShader {
    /// header plus bytecode, ready for the backend loader
    pub bytecode: Vec<u8>,
    pub bindings: ShaderResourceBindings,
    pub thread_group_size: [u32; 3],
    pub entry_point: String,
}

/// sorts every bucket by binding number and assigns dense slots in that order
pub fn assign_slots(bindings: &mut ShaderResourceBindings) {
    for class in ResourceClass::ALL {
        let bucket = bindings.bucket_mut(class);
        bucket.sort_by_key(|binding| binding.binding_index);
        for (slot, binding) in bucket.iter_mut().enumerate() {
            binding.slot_index = slot as u32;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpirvBindingKind {
    pub class: ResourceClass,
    pub resource_type: ShaderResourceType,
    pub descriptor: GlobalDescriptor,
}

impl SpirvBindingKind {
    fn new(
        class: ResourceClass,
        resource_type: ShaderResourceType,
        descriptor: GlobalDescriptor,
    ) -> Self {
        Self {
            class,
            resource_type,
            descriptor,
        }
    }
}

/// Classifies a spirv variable by its `UserTypeGOOGLE` string, falling back to the
/// shape of its pointee when the module carries no reflection strings.
pub fn classify_spirv(resource: &SpirvResource) -> Result<SpirvBindingKind> {
    use GlobalDescriptor as D;
    use ResourceClass::*;
    use ShaderResourceType as T;

    let name = &resource.name;
    let binding = resource.binding;

    let reflection_type = resource
        .reflection_type
        .as_deref()
        .filter(|t| !t.is_empty());

    if reflection_type.is_none() && name != "$Globals" {
        let kind = match resource.shape {
            PointeeShape::Block => SpirvBindingKind::new(Cbv, T::UniformBuffer, D::UniformBuffer),
            PointeeShape::Image { dim, sampled } => match (dim < 5, sampled < 2) {
                (true, true) => SpirvBindingKind::new(Srv, T::Texture, D::Image),
                (true, false) => SpirvBindingKind::new(Uav, T::Texture, D::StorageImage),
                (false, true) => SpirvBindingKind::new(Srv, T::Buffer, D::UniformTexelBuffer),
                (false, false) => SpirvBindingKind::new(Uav, T::Buffer, D::StorageTexelBuffer),
            },
            PointeeShape::Unknown => {
                return Err(Error::Fixup(format!(
                    "Reflection data unavailable for {name} (binding:{binding})"
                )));
            }
        };
        return Ok(kind);
    }

    let t = reflection_type.unwrap_or_default();
    let kind = if t == "cbuffer" || name == "$Globals" {
        SpirvBindingKind::new(Cbv, T::UniformBuffer, D::UniformBuffer)
    } else if t.starts_with("buffer:") {
        SpirvBindingKind::new(Srv, T::Buffer, D::UniformTexelBuffer)
    } else if t.starts_with("rwbuffer:") {
        SpirvBindingKind::new(Uav, T::Buffer, D::StorageTexelBuffer)
    } else if t.starts_with("structuredbuffer:") {
        SpirvBindingKind::new(Srv, T::StructuredBuffer, D::StorageBuffer)
    } else if t == "byteaddressbuffer" {
        SpirvBindingKind::new(Srv, T::ByteAddressBuffer, D::StorageBuffer)
    } else if t.starts_with("rwstructuredbuffer:") {
        SpirvBindingKind::new(Uav, T::StructuredBuffer, D::StorageBuffer)
    } else if t == "rwbyteaddressbuffer" {
        SpirvBindingKind::new(Uav, T::ByteAddressBuffer, D::StorageBuffer)
    } else if t.starts_with("texture") {
        SpirvBindingKind::new(Srv, T::Texture, D::Image)
    } else if t.starts_with("rwtexture") {
        SpirvBindingKind::new(Uav, T::Texture, D::StorageImage)
    } else {
        return Err(Error::Fixup(format!(
            "Unsupported shader resource type \"{t}\" for {name} (binding: {binding})"
        )));
    };

    Ok(kind)
}

/// Reflects, renames and wraps a spirv module for the vulkan loader.
///
/// On android the reflection-only instructions are stripped before the crc is taken.
pub fn fixup_spirv(spirv: &[u8], platform: TargetPlatform) -> Result<FixedUpShader> {
    let mut module = SpirvModule::from_bytes(spirv)?;

    // resizing shifts every later word, so it has to happen before offsets are recorded
    module.resize_entry_point_name()?;
    let reflection = module.reflect();

    let mut classified = Vec::with_capacity(reflection.resources.len());
    for resource in &reflection.resources {
        let range = BindingRange::classify(resource.binding)?;
        let kind = classify_spirv(resource)?;
        if range.class != kind.class {
            warn!(
                "{} is bound as {} but binding {} is in the {} range",
                resource.name, kind.class, resource.binding, range.class
            );
        }
        classified.push((resource, kind));
    }

    let mut bindings = ShaderResourceBindings::default();
    let mut header = VulkanShaderHeader::default();

    for class in [ResourceClass::Cbv, ResourceClass::Srv, ResourceClass::Uav] {
        let mut bucket: Vec<_> = classified.iter().filter(|(_, k)| k.class == class).collect();
        bucket.sort_by_key(|(resource, _)| resource.binding);

        for (slot, (resource, kind)) in bucket.into_iter().enumerate() {
            let spirv_info = SpirvInfo {
                binding_index_offset: resource.binding_word_offset,
                descriptor_set_offset: resource.descriptor_set_word_offset,
            };
            match class {
                ResourceClass::Cbv => header.add_uniform_buffer(resource.binding, spirv_info),
                _ => header.add_global(resource.binding, kind.descriptor, spirv_info),
            }

            bindings.bucket_mut(class).push(ShaderResourceBinding {
                binding_index: resource.binding,
                slot_index: slot as u32,
                name: resource.name.clone(),
                resource_type: kind.resource_type,
            });
        }
    }

    if platform == TargetPlatform::Android {
        let stripped = module.strip_reflection();
        debug!("stripped {stripped} reflection instructions");
    }

    header.spirv_crc = module.stamp_entry_point()?;
    let entry_point = module
        .entry_point_name()
        .ok_or_else(|| Error::Fixup("Unable to find SPIRV EntryPoint".to_string()))?;

    let bytecode = spirv_header::serialize(&header, &module.to_bytes());

    info!(
        "fixed up spirv {entry_point}: {} cbvs, {} srvs, {} uavs, threads {:?}",
        bindings.cbvs.len(),
        bindings.srvs.len(),
        bindings.uavs.len(),
        reflection.thread_group_size
    );

    Ok(FixedUpShader {
        bytecode,
        bindings,
        thread_group_size: reflection.thread_group_size,
        entry_point,
    })
}

/// Reflects a DXBC container and prepends the resource-count header.
///
/// `disassembly` is the DXC listing of the same container, used for resource names.
pub fn fixup_dxil(
    container: &[u8],
    entry_point: &str,
    disassembly: Option<&str>,
) -> Result<FixedUpShader> {
    let reflection = dxil::reflect(container, disassembly)?;

    let mut bindings = ShaderResourceBindings {
        input_semantics: reflection.input_semantics,
        output_semantics: reflection.output_semantics,
        ..Default::default()
    };

    for resource in reflection.resources {
        let (class, resource_type) = resource.kind.classify();
        bindings.bucket_mut(class).push(ShaderResourceBinding {
            binding_index: resource.bind_point,
            slot_index: 0,
            name: resource.name,
            resource_type,
        });
    }
    assign_slots(&mut bindings);

    let header = DxilShaderHeader::from_bindings(&bindings);
    let bytecode = dxil_header::serialize(&header, container);

    info!(
        "fixed up dxil {entry_point}: {} cbvs, {} srvs, {} uavs, {} samplers, threads {:?}",
        header.num_cbvs,
        header.num_srvs,
        header.num_uavs,
        header.num_samplers,
        reflection.thread_group_size
    );

    Ok(FixedUpShader {
        bytecode,
        bindings,
        thread_group_size: reflection.thread_group_size,
        entry_point: entry_point.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shaders::reflection::spirv::{instructions, op, read_entry_point_name};
    use crate::test_utils::*;
    use crate::util::{bytes_to_words, crc32};

    fn resource(name: &str, reflection_type: Option<&str>, shape: PointeeShape) -> SpirvResource {
        SpirvResource {
            id: 1,
            name: name.to_string(),
            binding: 7,
            binding_word_offset: 0,
            descriptor_set_word_offset: 0,
            reflection_type: reflection_type.map(str::to_string),
            shape,
        }
    }

    fn summary(bindings: &[ShaderResourceBinding]) -> Vec<(String, u32, u32)> {
        bindings
            .iter()
            .map(|b| (b.name.clone(), b.binding_index, b.slot_index))
            .collect()
    }

    #[test]
    fn reflection_strings() {
        use ResourceClass::*;
        use ShaderResourceType as T;

        let cases = [
            ("cbuffer", Cbv, T::UniformBuffer),
            ("buffer:<float>", Srv, T::Buffer),
            ("rwbuffer:<uint>", Uav, T::Buffer),
            ("structuredbuffer:<Particle>", Srv, T::StructuredBuffer),
            ("byteaddressbuffer", Srv, T::ByteAddressBuffer),
            ("rwstructuredbuffer:<Particle>", Uav, T::StructuredBuffer),
            ("rwbyteaddressbuffer", Uav, T::ByteAddressBuffer),
            ("texture2d:<float4>", Srv, T::Texture),
            ("texture3d:<float>", Srv, T::Texture),
            ("rwtexture2d:<uint>", Uav, T::Texture),
            ("rwtexture2darray:<float4>", Uav, T::Texture),
        ];

        for (reflection_type, class, resource_type) in cases {
            let kind = classify_spirv(&resource("r", Some(reflection_type), PointeeShape::Unknown))
                .unwrap();
            assert_eq!(kind.class, class, "{reflection_type}");
            assert_eq!(kind.resource_type, resource_type, "{reflection_type}");
        }

        let globals = classify_spirv(&resource("$Globals", None, PointeeShape::Unknown)).unwrap();
        assert_eq!(globals.class, Cbv);
    }

    #[test]
    fn shape_fallback() {
        use ResourceClass::*;
        use ShaderResourceType as T;

        let cases = [
            (PointeeShape::Block, Cbv, T::UniformBuffer),
            (PointeeShape::Image { dim: 1, sampled: 1 }, Srv, T::Texture),
            (PointeeShape::Image { dim: 1, sampled: 2 }, Uav, T::Texture),
            (PointeeShape::Image { dim: 5, sampled: 1 }, Srv, T::Buffer),
            (PointeeShape::Image { dim: 5, sampled: 2 }, Uav, T::Buffer),
        ];

        for (shape, class, resource_type) in cases {
            let kind = classify_spirv(&resource("r", None, shape)).unwrap();
            assert_eq!((kind.class, kind.resource_type), (class, resource_type), "{shape:?}");
        }
    }

    #[test]
    fn classification_errors() {
        let err = classify_spirv(&resource("Accel", Some("raytracingaccelerationstructure"), PointeeShape::Unknown))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unsupported shader resource type \"raytracingaccelerationstructure\" for Accel (binding: 7)"
        );

        let err = classify_spirv(&resource("Counter", None, PointeeShape::Unknown)).unwrap_err();
        assert_eq!(err.to_string(), "Reflection data unavailable for Counter (binding:7)");
    }

    #[test]
    fn dense_slots_in_binding_order() {
        let mut builder = SpirvBuilder::compute("main", [8, 8, 1]);
        builder.resource("Third", 2050, Some("rwtexture2d:<float4>"), TestShape::storage_texture());
        builder.resource("Params", 0, Some("cbuffer"), TestShape::Block);
        builder.resource("First", 2048, Some("rwbuffer:<uint>"), TestShape::storage_buffer());
        builder.resource("Input", 1030, Some("texture2d:<float4>"), TestShape::texture());
        builder.resource("More", 4, Some("cbuffer"), TestShape::Block);

        let fixed = fixup_spirv(&builder.build_bytes(), TargetPlatform::Desktop).unwrap();

        assert_eq!(
            summary(&fixed.bindings.cbvs),
            [("Params".to_string(), 0, 0), ("More".to_string(), 4, 1)]
        );
        assert_eq!(summary(&fixed.bindings.srvs), [("Input".to_string(), 1030, 0)]);
        assert_eq!(
            summary(&fixed.bindings.uavs),
            [("First".to_string(), 2048, 0), ("Third".to_string(), 2050, 1)]
        );
        assert_eq!(fixed.thread_group_size, [8, 8, 1]);
    }

    #[test]
    fn declaration_order_does_not_matter() {
        let declarations = [
            ("A", 2048, "rwbuffer:<uint>", TestShape::storage_buffer()),
            ("B", 2049, "rwtexture2d:<uint>", TestShape::storage_texture()),
            ("C", 2053, "rwbyteaddressbuffer", TestShape::Opaque),
            ("D", 1024, "texture2d:<float4>", TestShape::texture()),
        ];

        let build = |order: &[usize]| {
            let mut builder = SpirvBuilder::compute("main", [1, 1, 1]);
            for &i in order {
                let (name, binding, user_type, shape) = declarations[i];
                builder.resource(name, binding, Some(user_type), shape);
            }
            fixup_spirv(&builder.build_bytes(), TargetPlatform::Desktop)
                .unwrap()
                .bindings
        };

        let forward = build(&[0, 1, 2, 3]);
        let shuffled = build(&[2, 3, 0, 1]);
        assert_eq!(forward, shuffled);
    }

    #[test]
    fn header_and_entry_point() {
        let mut builder = SpirvBuilder::compute("main", [1, 1, 1]);
        builder.resource("Output", 2048, Some("rwtexture2d:<uint>"), TestShape::storage_texture());
        let fixed = fixup_spirv(&builder.build_bytes(), TargetPlatform::Desktop).unwrap();

        let spirv = spirv_header::embedded_spirv(&fixed.bytecode).unwrap();
        let crc = u32::from_le_bytes(fixed.bytecode[0..4].try_into().unwrap());
        assert_eq!(fixed.entry_point, format!("main_{:08x}_{crc:08x}", spirv.len()));
        assert_eq!(read_entry_point_name(spirv).unwrap(), fixed.entry_point);

        // the crc covers the module with the placeholder name
        let placeholder = spirv.to_vec();
        let mut module = SpirvModule::from_bytes(&placeholder).unwrap();
        module.resize_entry_point_name().unwrap();
        assert_eq!(crc32(&module.to_bytes()), crc);

        // spirv infos point at the binding literal of the final module
        let words = bytes_to_words(spirv).unwrap();
        // crc, mask, two empty uniform buffer arrays, one global, then the global spirv infos
        let infos = 8 + 4 + 4 + (4 + 6) + 4;
        let binding_offset =
            u32::from_le_bytes(fixed.bytecode[infos..infos + 4].try_into().unwrap());
        assert_eq!(words[binding_offset as usize], 2048);
    }

    #[test]
    fn android_strips_reflection() {
        let mut builder = SpirvBuilder::compute("main", [1, 1, 1]);
        builder.extension("SPV_GOOGLE_user_type");
        builder.resource("Output", 2048, Some("rwtexture2d:<uint>"), TestShape::storage_texture());
        let bytes = builder.build_bytes();

        let desktop = fixup_spirv(&bytes, TargetPlatform::Desktop).unwrap();
        let android = fixup_spirv(&bytes, TargetPlatform::Android).unwrap();
        assert_eq!(desktop.bindings, android.bindings);

        let spirv = spirv_header::embedded_spirv(&android.bytecode).unwrap();
        let words = bytes_to_words(spirv).unwrap();
        assert!(instructions(&words).all(|i| i.opcode != op::DECORATE_STRING && i.opcode != op::EXTENSION));

        let crc = u32::from_le_bytes(android.bytecode[0..4].try_into().unwrap());
        assert_eq!(android.entry_point, format!("main_{:08x}_{crc:08x}", spirv.len()));
    }

    #[test]
    fn out_of_range_binding() {
        let mut builder = SpirvBuilder::compute("main", [1, 1, 1]);
        builder.resource("Sampler", 3072, Some("texture2d:<float4>"), TestShape::texture());

        let err = fixup_spirv(&builder.build_bytes(), TargetPlatform::Desktop).unwrap_err();
        assert_eq!(err.to_string(), "invalid shader binding");
    }

    #[test]
    fn dxil_bindings_and_header() {
        let bindings = [
            PsvBinding::new(8, 12, 3),
            PsvBinding::new(2, 13, 1),
            PsvBinding::new(6, 2, 0),
            PsvBinding::new(1, 14, 0),
        ];
        let container = compute_container([32, 1, 1], &bindings);

        let fixed = fixup_dxil(&container, "main", None).unwrap();

        insta::assert_json_snapshot!(fixed.bindings, @r#"
        {
          "cbvs": [
            {
              "bindingIndex": 1,
              "slotIndex": 0,
              "name": "cb1",
              "resourceType": "UniformBuffer"
            }
          ],
          "srvs": [],
          "uavs": [
            {
              "bindingIndex": 0,
              "slotIndex": 0,
              "name": "u0",
              "resourceType": "Texture"
            },
            {
              "bindingIndex": 3,
              "slotIndex": 1,
              "name": "u3",
              "resourceType": "StructuredBuffer"
            }
          ],
          "samplers": [
            {
              "bindingIndex": 0,
              "slotIndex": 0,
              "name": "s0",
              "resourceType": "Sampler"
            }
          ],
          "inputSemantics": [],
          "outputSemantics": []
        }
        "#);

        let header = DxilShaderHeader::read(&fixed.bytecode).unwrap();
        assert_eq!(
            (header.num_cbvs, header.num_srvs, header.num_uavs, header.num_samplers),
            (1, 0, 2, 1)
        );
        assert_eq!(dxil_header::embedded_container(&fixed.bytecode), Some(&container[..]));
        assert_eq!(fixed.thread_group_size, [32, 1, 1]);
    }
}
