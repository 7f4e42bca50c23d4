//! A cpu reference backend.
//!
//! Work runs on one worker thread fed by a channel, so completions arrive on a
//! different thread than the caller's, the same as with a real gpu queue.
//! Shaders of every stage are host closures registered by entry point name; the
//! bytecode is only checked for the header the real loaders expect.

use std::any::Any;
use std::collections::HashMap;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Instant;

use log::*;

use super::backend::{
    Backend, BufferDesc, CommandList, GpuWork, LoadAction, NativeHandle, OnComplete,
    ParameterBinder, RayShaderKind, ResourceState, SamplerDesc, TextureDesc, WorkReport,
};
use crate::config::BackendKind;
use crate::error::{Error, Result};
use crate::shaders::fixup::dxil_header::{self, DxilShaderHeader};
use crate::shaders::fixup::spirv_header;
use crate::shaders::reflection::ResourceClass;
use crate::shaders::reflection::spirv::read_entry_point_name;
use crate::shaders::{BytecodeFormat, CompiledShaderArtifact, ShaderStage};

mod raster;
mod rays;

use raster::{GraphicsKernel, RenderPass, SoftGraphicsShader};
pub use raster::{
    MeshInvocation, MeshKernel, MeshOutput, PixelInvocation, PixelKernel, VertexInvocation,
    VertexKernel, VertexOutput,
};
use rays::{RayShaderKernel, SoftRayShader};
pub use rays::{RayGenInvocation, RayGenKernel, RayKernel, RayPayload};

/// the body of a compute shader, run once per thread
pub type Kernel = Arc<dyn Fn(&KernelInvocation<'_>) + Send + Sync>;

/// patched spirv entry points all start with this; their kernels are registered as "main"
const PATCHED_ENTRY_POINT_PREFIX: &str = "main_";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SoftBuffer {
    bytes: Mutex<Vec<u8>>,
}

struct SoftTexture {
    desc: TextureDesc,
    bytes: Mutex<Vec<u8>>,
}

struct SoftSampler {
    desc: SamplerDesc,
}

struct SoftShader {
    entry_point: String,
    thread_group_size: [u32; 3],
    kernel: Kernel,
}

/// buffers and textures are both plain byte arrays here
fn memory(handle: &NativeHandle) -> Option<&Mutex<Vec<u8>>> {
    if let Some(buffer) = handle.downcast_ref::<SoftBuffer>() {
        return Some(&buffer.bytes);
    }
    handle.downcast_ref::<SoftTexture>().map(|texture| &texture.bytes)
}

fn require_memory(handle: &NativeHandle) -> Result<&Mutex<Vec<u8>>> {
    memory(handle).ok_or_else(|| Error::Backend("Invalid software resource".to_string()))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// runs host shader code, failing the submission if it panics
fn guard_kernels<T>(entry_point: &str, body: impl FnOnce() -> T) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(body)).map_err(|payload| {
        Error::Backend(format!(
            "Kernel {entry_point} panicked: {}",
            panic_message(payload.as_ref())
        ))
    })
}

fn out_of_bounds(what: &str, offset: u64, size: u64, len: usize) -> Error {
    Error::Backend(format!(
        "{what} out of bounds ({size} bytes at {offset}, resource is {len} bytes)"
    ))
}

fn byte_range(offset: u64, size: u64, len: usize) -> Option<std::ops::Range<usize>> {
    let end = offset.checked_add(size)?;
    (end <= len as u64).then_some(offset as usize..end as usize)
}

#[derive(Default)]
struct BoundResources {
    cbvs: Vec<Option<NativeHandle>>,
    srvs: Vec<Option<NativeHandle>>,
    uavs: Vec<Option<NativeHandle>>,
    samplers: Vec<Option<NativeHandle>>,
}

static NOTHING_BOUND: BoundResources = BoundResources {
    cbvs: Vec::new(),
    srvs: Vec::new(),
    uavs: Vec::new(),
    samplers: Vec::new(),
};

impl BoundResources {
    fn bind(slots: &mut Vec<Option<NativeHandle>>, slot: u32, handle: &NativeHandle) {
        let slot = slot as usize;
        if slots.len() <= slot {
            slots.resize(slot + 1, None);
        }
        slots[slot] = Some(Arc::clone(handle));
    }

    fn get(&self, class: ResourceClass, slot: u32) -> Option<&NativeHandle> {
        let slots = match class {
            ResourceClass::Cbv => &self.cbvs,
            ResourceClass::Srv => &self.srvs,
            ResourceClass::Uav => &self.uavs,
            ResourceClass::Sampler => &self.samplers,
        };
        slots.get(slot as usize)?.as_ref()
    }
}

/// What one stage sees of the bound resources.
///
/// Out of bounds loads return zero and out of bounds stores are dropped, as with
/// robust buffer access on a gpu.
#[derive(Clone, Copy)]
pub struct StageResources<'a> {
    bound: &'a BoundResources,
}

/// one thread of a compute dispatch
pub struct KernelInvocation<'a> {
    pub thread_id: [u32; 3],
    pub group_id: [u32; 3],
    pub group_thread_id: [u32; 3],
    resources: StageResources<'a>,
}

impl<'a> Deref for KernelInvocation<'a> {
    type Target = StageResources<'a>;

    fn deref(&self) -> &Self::Target {
        &self.resources
    }
}

impl StageResources<'_> {
    fn element(&self, class: ResourceClass, slot: u32, byte_offset: usize) -> Option<[u8; 4]> {
        let bytes = lock(memory(self.bound.get(class, slot)?)?);
        bytes.get(byte_offset..byte_offset + 4)?.try_into().ok()
    }

    fn write_element(&self, slot: u32, byte_offset: usize, value: [u8; 4]) {
        let Some(memory) = self.bound.get(ResourceClass::Uav, slot).and_then(memory) else {
            return;
        };
        if let Some(target) = lock(memory).get_mut(byte_offset..byte_offset + 4) {
            target.copy_from_slice(&value);
        }
    }

    /// the byte offset of a texel, or None outside the texture
    fn texel_offset(&self, class: ResourceClass, slot: u32, [x, y, z]: [u32; 3]) -> Option<usize> {
        let desc = self.bound.get(class, slot)?.downcast_ref::<SoftTexture>()?.desc;
        if x >= desc.width || y >= desc.height || z >= desc.depth {
            return None;
        }
        let index = (z as u64 * desc.height as u64 + y as u64) * desc.width as u64 + x as u64;
        Some((index * desc.format.bytes_per_pixel() as u64) as usize)
    }

    /// u32 element `index` of any bound buffer
    pub fn load_u32(&self, class: ResourceClass, slot: u32, index: usize) -> u32 {
        self.element(class, slot, index * 4)
            .map(u32::from_le_bytes)
            .unwrap_or_default()
    }

    pub fn load_f32(&self, class: ResourceClass, slot: u32, index: usize) -> f32 {
        f32::from_bits(self.load_u32(class, slot, index))
    }

    pub fn store_u32(&self, uav_slot: u32, index: usize, value: u32) {
        self.write_element(uav_slot, index * 4, value.to_le_bytes());
    }

    pub fn store_f32(&self, uav_slot: u32, index: usize, value: f32) {
        self.store_u32(uav_slot, index, value.to_bits());
    }

    /// first channel of a texel
    pub fn load_texel_u32(&self, class: ResourceClass, slot: u32, coords: [u32; 3]) -> u32 {
        self.texel_offset(class, slot, coords)
            .and_then(|offset| self.element(class, slot, offset))
            .map(u32::from_le_bytes)
            .unwrap_or_default()
    }

    pub fn store_texel_u32(&self, uav_slot: u32, coords: [u32; 3], value: u32) {
        if let Some(offset) = self.texel_offset(ResourceClass::Uav, uav_slot, coords) {
            self.write_element(uav_slot, offset, value.to_le_bytes());
        }
    }

    pub fn sampler(&self, slot: u32) -> Option<SamplerDesc> {
        let sampler = self.bound.get(ResourceClass::Sampler, slot)?;
        sampler.downcast_ref::<SoftSampler>().map(|sampler| sampler.desc)
    }

    pub fn store_texel_f32(&self, uav_slot: u32, coords: [u32; 3], value: f32) {
        self.store_texel_u32(uav_slot, coords, value.to_bits());
    }
}

struct SoftCommandList {
    epoch: Instant,
    bound: HashMap<ShaderStage, BoundResources>,
    binding_stage: ShaderStage,
    shader: Option<NativeHandle>,
    graphics: Option<(NativeHandle, NativeHandle)>,
    render_pass: Option<RenderPass>,
    /// ray gen, miss, hit group
    rays: Option<[NativeHandle; 3]>,
    report: WorkReport,
}

impl SoftCommandList {
    fn new(epoch: Instant) -> Self {
        Self {
            epoch,
            bound: HashMap::new(),
            binding_stage: ShaderStage::Compute,
            shader: None,
            graphics: None,
            render_pass: None,
            rays: None,
            report: WorkReport::default(),
        }
    }

    fn stage_resources(&self, stage: ShaderStage) -> StageResources<'_> {
        StageResources {
            bound: self.bound.get(&stage).unwrap_or(&NOTHING_BOUND),
        }
    }

    fn binding_slots(&mut self) -> &mut BoundResources {
        self.bound.entry(self.binding_stage).or_default()
    }

    fn graphics_state(&self) -> Result<(&RenderPass, &SoftGraphicsShader, &SoftGraphicsShader)> {
        let pass = self
            .render_pass
            .as_ref()
            .ok_or_else(|| Error::Backend("No render pass begun".to_string()))?;
        let (geometry, pixel) = self
            .graphics
            .as_ref()
            .ok_or_else(|| Error::Backend("No graphics shaders set".to_string()))?;
        fn graphics_shader(shader: &NativeHandle) -> Result<&SoftGraphicsShader> {
            shader
                .downcast_ref::<SoftGraphicsShader>()
                .ok_or_else(|| Error::Backend("Invalid graphics shader".to_string()))
        }
        Ok((pass, graphics_shader(geometry)?, graphics_shader(pixel)?))
    }

    /// A panic inside the work fails the submission instead of the queue.
    fn run(epoch: Instant, work: GpuWork) -> Result<WorkReport> {
        let mut commands = Self::new(epoch);
        match panic::catch_unwind(AssertUnwindSafe(|| work(&mut commands))) {
            Ok(result) => result.map(|()| commands.report),
            Err(payload) => Err(Error::Backend(format!(
                "Software queue work panicked: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }
}

impl ParameterBinder for SoftCommandList {
    fn transition(&mut self, _resource: &NativeHandle, state: ResourceState) {
        trace!("transition to {state:?}");
    }

    fn update_buffer(&mut self, buffer: &NativeHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mut bytes = lock(require_memory(buffer)?);
        let len = bytes.len();
        let range = byte_range(offset, data.len() as u64, len)
            .ok_or_else(|| out_of_bounds("Buffer update", offset, data.len() as u64, len))?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn bind_uniform_buffer(&mut self, slot: u32, buffer: &NativeHandle) {
        BoundResources::bind(&mut self.binding_slots().cbvs, slot, buffer);
    }

    fn bind_srv(&mut self, slot: u32, resource: &NativeHandle) {
        BoundResources::bind(&mut self.binding_slots().srvs, slot, resource);
    }

    fn bind_uav(&mut self, slot: u32, resource: &NativeHandle) {
        BoundResources::bind(&mut self.binding_slots().uavs, slot, resource);
    }

    fn bind_sampler(&mut self, slot: u32, sampler: &NativeHandle) {
        BoundResources::bind(&mut self.binding_slots().samplers, slot, sampler);
    }
}

impl CommandList for SoftCommandList {
    fn set_compute_shader(&mut self, shader: &NativeHandle) -> Result<()> {
        if shader.downcast_ref::<SoftShader>().is_none() {
            return Err(Error::Backend("Invalid compute shader".to_string()));
        }
        self.shader = Some(Arc::clone(shader));
        Ok(())
    }

    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        let shader = self
            .shader
            .as_ref()
            .and_then(|shader| shader.downcast_ref::<SoftShader>())
            .ok_or_else(|| Error::Backend("No compute shader set".to_string()))?;

        let [size_x, size_y, size_z] = shader.thread_group_size.map(|size| size.max(1));
        trace!("{}: {x}x{y}x{z} groups of {size_x}x{size_y}x{size_z}", shader.entry_point);

        // the largest thread id is one below the grid size
        let grid = [x.checked_mul(size_x), y.checked_mul(size_y), z.checked_mul(size_z)];
        if grid.iter().any(Option::is_none) {
            return Err(Error::Backend(format!(
                "Dispatch of {x}x{y}x{z} groups overflows the thread id range"
            )));
        }

        let resources = self.stage_resources(ShaderStage::Compute);
        let kernel = &shader.kernel;
        guard_kernels(&shader.entry_point, || {
            for group_z in 0..z {
                for group_y in 0..y {
                    for group_x in 0..x {
                        for local_z in 0..size_z {
                            for local_y in 0..size_y {
                                for local_x in 0..size_x {
                                    kernel(&KernelInvocation {
                                        thread_id: [
                                            group_x * size_x + local_x,
                                            group_y * size_y + local_y,
                                            group_z * size_z + local_z,
                                        ],
                                        group_id: [group_x, group_y, group_z],
                                        group_thread_id: [local_x, local_y, local_z],
                                        resources,
                                    });
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    fn dispatch_indirect(&mut self, args: &NativeHandle, offset: u64) -> Result<()> {
        let counts: [u32; 3] = {
            let bytes = lock(require_memory(args)?);
            let range = byte_range(offset, 12, bytes.len())
                .ok_or_else(|| out_of_bounds("Indirect arguments", offset, 12, bytes.len()))?;
            let words: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes[range]);
            [words[0], words[1], words[2]]
        };
        self.dispatch(counts[0], counts[1], counts[2])
    }

    fn copy_buffer(
        &mut self,
        src: &NativeHandle,
        dst: &NativeHandle,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        let source: Vec<u8> = {
            let bytes = lock(require_memory(src)?);
            let range = byte_range(src_offset, size, bytes.len())
                .ok_or_else(|| out_of_bounds("Copy source", src_offset, size, bytes.len()))?;
            bytes[range].to_vec()
        };

        let mut bytes = lock(require_memory(dst)?);
        let len = bytes.len();
        let range = byte_range(dst_offset, size, len)
            .ok_or_else(|| out_of_bounds("Copy destination", dst_offset, size, len))?;
        bytes[range].copy_from_slice(&source);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: &NativeHandle, offset: u64, size: u64) -> Result<()> {
        let bytes = lock(require_memory(buffer)?);
        let range = byte_range(offset, size, bytes.len())
            .ok_or_else(|| out_of_bounds("Readback", offset, size, bytes.len()))?;
        self.report.readbacks.push(bytes[range].to_vec());
        Ok(())
    }

    fn read_texture_slice(&mut self, texture: &NativeHandle, slice: u32) -> Result<()> {
        let texture = texture
            .downcast_ref::<SoftTexture>()
            .ok_or_else(|| Error::Backend("Invalid software texture".to_string()))?;
        let pitch = texture.desc.slice_pitch();
        let bytes = lock(&texture.bytes);
        let range = byte_range(slice as u64 * pitch, pitch, bytes.len())
            .ok_or_else(|| out_of_bounds("Slice readback", slice as u64 * pitch, pitch, bytes.len()))?;
        self.report.readbacks.push(bytes[range].to_vec());
        Ok(())
    }

    fn write_timestamp(&mut self) {
        self.report
            .timestamps
            .push(self.epoch.elapsed().as_nanos() as u64);
    }

    fn set_binding_stage(&mut self, stage: ShaderStage) {
        self.binding_stage = stage;
    }

    fn begin_render_pass(&mut self, targets: &[NativeHandle], load: LoadAction) -> Result<()> {
        if self.render_pass.is_some() {
            return Err(Error::Backend("A render pass is already begun".to_string()));
        }
        self.render_pass = Some(RenderPass::begin(targets, load == LoadAction::Clear)?);
        Ok(())
    }

    fn end_render_pass(&mut self) -> Result<()> {
        self.render_pass
            .take()
            .map(|_| ())
            .ok_or_else(|| Error::Backend("No render pass begun".to_string()))
    }

    fn set_graphics_shaders(&mut self, geometry: &NativeHandle, pixel: &NativeHandle) -> Result<()> {
        if [geometry, pixel]
            .iter()
            .any(|shader| shader.downcast_ref::<SoftGraphicsShader>().is_none())
        {
            return Err(Error::Backend("Invalid graphics shader".to_string()));
        }
        self.graphics = Some((Arc::clone(geometry), Arc::clone(pixel)));
        Ok(())
    }

    fn draw(&mut self, num_vertices: u32, num_instances: u32) -> Result<()> {
        let (pass, geometry, pixel) = self.graphics_state()?;
        let GraphicsKernel::Vertex(vertex) = &geometry.kernel else {
            return Err(Error::Backend(format!("{} is not a vertex shader", geometry.entry_point)));
        };
        let pixel_kernel = pixel.pixel_kernel()?;
        let resources = [
            self.stage_resources(ShaderStage::Vertex),
            self.stage_resources(ShaderStage::Pixel),
        ];

        trace!("{}: {num_vertices} vertices, {num_instances} instances", geometry.entry_point);
        guard_kernels(&geometry.entry_point, || {
            raster::draw(pass, vertex, pixel_kernel, resources, num_vertices, num_instances)
        })
    }

    fn dispatch_mesh(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        let (pass, geometry, pixel) = self.graphics_state()?;
        let GraphicsKernel::Mesh(mesh) = &geometry.kernel else {
            return Err(Error::Backend(format!("{} is not a mesh shader", geometry.entry_point)));
        };
        let pixel_kernel = pixel.pixel_kernel()?;
        let resources = [
            self.stage_resources(ShaderStage::Mesh),
            self.stage_resources(ShaderStage::Pixel),
        ];

        trace!("{}: {x}x{y}x{z} mesh groups", geometry.entry_point);
        guard_kernels(&geometry.entry_point, || {
            raster::dispatch_mesh(pass, mesh, pixel_kernel, resources, [x, y, z])
        })?
    }

    fn set_ray_tracing_shaders(
        &mut self,
        ray_gen: &NativeHandle,
        miss: &NativeHandle,
        hit_group: &NativeHandle,
    ) -> Result<()> {
        let expected = [
            (ray_gen, RayShaderKind::RayGen),
            (miss, RayShaderKind::Miss),
            (hit_group, RayShaderKind::HitGroup),
        ];
        for (shader, kind) in expected {
            let matches = shader
                .downcast_ref::<SoftRayShader>()
                .is_some_and(|shader| shader.kind() == kind);
            if !matches {
                return Err(Error::Backend(format!("Invalid {kind:?} shader")));
            }
        }
        self.rays = Some([Arc::clone(ray_gen), Arc::clone(miss), Arc::clone(hit_group)]);
        Ok(())
    }

    fn dispatch_rays(&mut self, width: u32, height: u32, depth: u32) -> Result<()> {
        let [ray_gen, miss, _] = self
            .rays
            .as_ref()
            .ok_or_else(|| Error::Backend("No ray tracing shaders set".to_string()))?;
        let (Some(ray_gen), Some(miss)) = (
            ray_gen.downcast_ref::<SoftRayShader>(),
            miss.downcast_ref::<SoftRayShader>(),
        ) else {
            return Err(Error::Backend("Invalid ray tracing shaders".to_string()));
        };
        let (RayShaderKernel::RayGen(ray_gen_kernel), RayShaderKernel::Miss(miss_kernel)) =
            (&ray_gen.kernel, &miss.kernel)
        else {
            return Err(Error::Backend("Invalid ray tracing shaders".to_string()));
        };

        // ray tracing shares the compute bindings
        let resources = self.stage_resources(ShaderStage::Compute);
        trace!("{}: {width}x{height}x{depth} rays", ray_gen.entry_point);
        guard_kernels(&ray_gen.entry_point, || {
            rays::dispatch_rays(ray_gen_kernel, miss_kernel, resources, [width, height, depth])
        })
    }
}

enum Job {
    Enqueue { work: GpuWork, on_complete: OnComplete },
    Block {
        work: GpuWork,
        reply: Sender<Result<WorkReport>>,
    },
}

/// host closures standing in for one stage's bytecode, by entry point name
struct KernelRegistry<K> {
    stage: &'static str,
    kernels: RwLock<HashMap<String, K>>,
}

impl<K: Clone> KernelRegistry<K> {
    fn new(stage: &'static str) -> Self {
        Self {
            stage,
            kernels: RwLock::default(),
        }
    }

    fn register(&self, entry_point: &str, kernel: K) {
        let mut kernels = self.kernels.write().unwrap_or_else(PoisonError::into_inner);
        kernels.insert(entry_point.to_string(), kernel);
    }

    fn find(&self, entry_point: &str, format: BytecodeFormat) -> Result<K> {
        let kernels = self.kernels.read().unwrap_or_else(PoisonError::into_inner);
        let fallback = match format {
            BytecodeFormat::Spirv if entry_point.starts_with(PATCHED_ENTRY_POINT_PREFIX) => {
                kernels.get("main")
            }
            _ => None,
        };

        kernels.get(entry_point).or(fallback).cloned().ok_or_else(|| {
            Error::Backend(format!("No {} kernel registered for {entry_point}", self.stage))
        })
    }
}

pub struct SoftwareBackend {
    kind: BackendKind,
    epoch: Instant,
    compute: KernelRegistry<Kernel>,
    vertex: KernelRegistry<VertexKernel>,
    pixel: KernelRegistry<PixelKernel>,
    mesh: KernelRegistry<MeshKernel>,
    ray_gen: KernelRegistry<RayGenKernel>,
    miss: KernelRegistry<RayKernel>,
    hit_group: KernelRegistry<RayKernel>,
    jobs: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl SoftwareBackend {
    /// accepts spirv, like vulkan
    pub fn new() -> Self {
        Self::with_kind(BackendKind::Vulkan)
    }

    /// `kind` decides which bytecode format the backend accepts
    pub fn with_kind(kind: BackendKind) -> Self {
        let epoch = Instant::now();
        let (jobs, receiver) = mpsc::channel::<Job>();

        let worker = std::thread::Builder::new()
            .name("crossbind-software-queue".to_string())
            .spawn(move || {
                for job in receiver {
                    match job {
                        Job::Enqueue { work, on_complete } => {
                            on_complete(SoftCommandList::run(epoch, work));
                        }
                        Job::Block { work, reply } => {
                            // the caller may have given up waiting
                            let _ = reply.send(SoftCommandList::run(epoch, work));
                        }
                    }
                }
                debug!("software queue drained");
            });

        let worker = match worker {
            Ok(worker) => Some(worker),
            Err(err) => {
                error!("failed to spawn the software queue: {err}");
                None
            }
        };

        Self {
            kind,
            epoch,
            compute: KernelRegistry::new("compute"),
            vertex: KernelRegistry::new("vertex"),
            pixel: KernelRegistry::new("pixel"),
            mesh: KernelRegistry::new("mesh"),
            ray_gen: KernelRegistry::new("ray gen"),
            miss: KernelRegistry::new("miss"),
            hit_group: KernelRegistry::new("hit group"),
            jobs: worker.is_some().then_some(jobs),
            worker,
        }
    }

    /// Makes `kernel` the body of every compute shader whose entry point is `entry_point`.
    pub fn register_kernel(
        &self,
        entry_point: &str,
        kernel: impl Fn(&KernelInvocation<'_>) + Send + Sync + 'static,
    ) {
        self.compute.register(entry_point, Arc::new(kernel));
    }

    pub fn register_vertex_kernel(
        &self,
        entry_point: &str,
        kernel: impl Fn(&VertexInvocation<'_>) -> VertexOutput + Send + Sync + 'static,
    ) {
        self.vertex.register(entry_point, Arc::new(kernel));
    }

    pub fn register_pixel_kernel(
        &self,
        entry_point: &str,
        kernel: impl Fn(&PixelInvocation<'_>) -> Vec<[f32; 4]> + Send + Sync + 'static,
    ) {
        self.pixel.register(entry_point, Arc::new(kernel));
    }

    pub fn register_mesh_kernel(
        &self,
        entry_point: &str,
        kernel: impl Fn(&MeshInvocation<'_>) -> MeshOutput + Send + Sync + 'static,
    ) {
        self.mesh.register(entry_point, Arc::new(kernel));
    }

    pub fn register_ray_gen_kernel(
        &self,
        entry_point: &str,
        kernel: impl Fn(&RayGenInvocation<'_>) + Send + Sync + 'static,
    ) {
        self.ray_gen.register(entry_point, Arc::new(kernel));
    }

    pub fn register_miss_kernel(
        &self,
        entry_point: &str,
        kernel: impl Fn(&mut RayPayload) + Send + Sync + 'static,
    ) {
        self.miss.register(entry_point, Arc::new(kernel));
    }

    /// Hit groups only run when a ray hits something, which never happens here.
    pub fn register_hit_group_kernel(
        &self,
        entry_point: &str,
        kernel: impl Fn(&mut RayPayload) + Send + Sync + 'static,
    ) {
        self.hit_group.register(entry_point, Arc::new(kernel));
    }

    fn validate_bytecode(&self, artifact: &CompiledShaderArtifact) -> Result<String> {
        let expected = if self.kind.wants_spirv() {
            BytecodeFormat::Spirv
        } else {
            BytecodeFormat::Dxil
        };
        if artifact.format != expected {
            return Err(Error::Backend(format!(
                "{:?} bytecode cannot be loaded by a {:?} backend",
                artifact.format, self.kind
            )));
        }

        match artifact.format {
            BytecodeFormat::Spirv => {
                let spirv = spirv_header::embedded_spirv(&artifact.bytecode)
                    .ok_or_else(|| Error::Backend("Invalid SPIRV shader header".to_string()))?;
                read_entry_point_name(spirv)
            }
            BytecodeFormat::Dxil => {
                let header = DxilShaderHeader::read(&artifact.bytecode)
                    .filter(|header| *header == DxilShaderHeader::from_bindings(&artifact.bindings))
                    .ok_or_else(|| Error::Backend("Invalid DXIL shader header".to_string()))?;
                if dxil_header::embedded_container(&artifact.bytecode).is_none_or(<[u8]>::is_empty) {
                    return Err(Error::Backend("Empty DXIL container".to_string()));
                }
                trace!("dxil header {header:?}");
                Ok(artifact.entry_point.clone())
            }
        }
    }

    fn send(&self, job: Job) -> std::result::Result<(), Job> {
        match &self.jobs {
            Some(jobs) => jobs.send(job).map_err(|mpsc::SendError(job)| job),
            None => Err(job),
        }
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SoftwareBackend {
    fn drop(&mut self) {
        // closing the channel lets the worker finish what is queued and exit
        self.jobs = None;
        // the last reference can be released by work running on the worker itself
        let Some(worker) = self.worker.take() else {
            return;
        };
        if worker.thread().id() != std::thread::current().id() && worker.join().is_err() {
            error!("software queue panicked");
        }
    }
}

fn queue_gone() -> Error {
    Error::Backend("The software queue is not running".to_string())
}

impl Backend for SoftwareBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<NativeHandle> {
        if desc.size == 0 {
            return Err(Error::Backend("Invalid buffer size 0".to_string()));
        }
        let buffer: Arc<dyn Any + Send + Sync> = Arc::new(SoftBuffer {
            bytes: Mutex::new(vec![0; desc.size as usize]),
        });
        trace!("created buffer {:?}", desc);
        Ok(buffer)
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<NativeHandle> {
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 {
            return Err(Error::Backend(format!(
                "Invalid texture size {}x{}x{}",
                desc.width, desc.height, desc.depth
            )));
        }
        Ok(Arc::new(SoftTexture {
            desc: *desc,
            bytes: Mutex::new(vec![0; desc.byte_size() as usize]),
        }))
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<NativeHandle> {
        Ok(Arc::new(SoftSampler { desc: *desc }))
    }

    fn create_compute_shader(&self, artifact: &CompiledShaderArtifact) -> Result<NativeHandle> {
        let entry_point = self.validate_bytecode(artifact)?;
        let kernel = self.compute.find(&entry_point, artifact.format)?;
        debug!("created software compute shader {entry_point}");

        Ok(Arc::new(SoftShader {
            entry_point,
            thread_group_size: artifact.thread_group_size,
            kernel,
        }))
    }

    fn create_graphics_shader(
        &self,
        stage: ShaderStage,
        artifact: &CompiledShaderArtifact,
    ) -> Result<NativeHandle> {
        let entry_point = self.validate_bytecode(artifact)?;
        let format = artifact.format;
        let kernel = match stage {
            ShaderStage::Vertex => GraphicsKernel::Vertex(self.vertex.find(&entry_point, format)?),
            ShaderStage::Pixel => GraphicsKernel::Pixel(self.pixel.find(&entry_point, format)?),
            ShaderStage::Mesh => GraphicsKernel::Mesh(self.mesh.find(&entry_point, format)?),
            other => {
                return Err(Error::Backend(format!("{other:?} is not a graphics stage")));
            }
        };
        debug!("created software {stage:?} shader {entry_point}");

        Ok(Arc::new(SoftGraphicsShader { entry_point, kernel }))
    }

    fn create_ray_tracing_shader(
        &self,
        kind: RayShaderKind,
        artifact: &CompiledShaderArtifact,
    ) -> Result<NativeHandle> {
        let entry_point = self.validate_bytecode(artifact)?;
        let format = artifact.format;
        let kernel = match kind {
            RayShaderKind::RayGen => RayShaderKernel::RayGen(self.ray_gen.find(&entry_point, format)?),
            RayShaderKind::Miss => RayShaderKernel::Miss(self.miss.find(&entry_point, format)?),
            RayShaderKind::HitGroup => {
                RayShaderKernel::HitGroup(self.hit_group.find(&entry_point, format)?)
            }
        };
        debug!("created software {kind:?} shader {entry_point}");

        Ok(Arc::new(SoftRayShader { entry_point, kernel }))
    }

    fn enqueue(&self, work: GpuWork, on_complete: OnComplete) {
        if let Err(Job::Enqueue { on_complete, .. }) = self.send(Job::Enqueue { work, on_complete }) {
            on_complete(Err(queue_gone()));
        }
    }

    fn submit_and_block(&self, work: GpuWork) -> Result<WorkReport> {
        let (reply, receiver) = mpsc::channel();
        self.send(Job::Block { work, reply })
            .map_err(|_| queue_gone())?;
        receiver.recv().map_err(|_| queue_gone())?
    }
}

impl std::fmt::Debug for SoftwareBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareBackend")
            .field("kind", &self.kind)
            .field("uptime", &self.epoch.elapsed())
            .finish()
    }
}
