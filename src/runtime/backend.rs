//! The graphics api the runtime drives, seen as two collaborator traits.
//!
//! Native objects cross the boundary as [`NativeHandle`]s; only the backend that
//! created one knows its concrete type.

use std::any::Any;
use std::sync::Arc;

use ash::vk;

use crate::config::BackendKind;
use crate::error::Result;
use crate::shaders::{CompiledShaderArtifact, ShaderStage};

pub type NativeHandle = Arc<dyn Any + Send + Sync>;

/// recorded on the caller's thread, executed wherever the backend runs its queue
pub type GpuWork = Box<dyn FnOnce(&mut dyn CommandList) -> Result<()> + Send>;

/// invoked by the backend once the work's fence resolves
pub type OnComplete = Box<dyn FnOnce(Result<WorkReport>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    R32Uint,
    R32Float,
    Rgba8Unorm,
    Rgba32Float,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::R32Uint | Self::R32Float | Self::Rgba8Unorm => 4,
            Self::Rgba32Float => 16,
        }
    }

    pub fn to_vk(self) -> vk::Format {
        match self {
            Self::R32Uint => vk::Format::R32_UINT,
            Self::R32Float => vk::Format::R32_SFLOAT,
            Self::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
            Self::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    /// element size for structured buffers, 0 otherwise
    pub stride: u32,
    /// element format for typed buffers
    pub format: Option<PixelFormat>,
}

impl BufferDesc {
    pub fn raw(size: u64) -> Self {
        Self {
            size,
            stride: 0,
            format: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureDimension {
    D1,
    D2,
    D2Array,
    D3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    /// depth for 3d textures, slice count for arrays
    pub depth: u32,
    pub dimension: TextureDimension,
    pub format: PixelFormat,
}

impl TextureDesc {
    pub fn d2(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            depth: 1,
            dimension: TextureDimension::D2,
            format,
        }
    }

    pub fn row_pitch(&self) -> u64 {
        self.width as u64 * self.format.bytes_per_pixel() as u64
    }

    pub fn slice_pitch(&self) -> u64 {
        self.row_pitch() * self.height as u64
    }

    pub fn byte_size(&self) -> u64 {
        self.slice_pitch() * self.depth as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplerFilter {
    Point,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplerAddressMode {
    Wrap,
    Mirror,
    #[default]
    Clamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SamplerDesc {
    pub filter: SamplerFilter,
    pub address_mode: SamplerAddressMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    ShaderRead,
    UnorderedAccess,
    IndirectArgs,
    RenderTarget,
    CopySource,
    CopyDest,
}

/// what happens to render target contents when a pass begins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadAction {
    Clear,
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RayShaderKind {
    RayGen,
    Miss,
    HitGroup,
}

/// what the backend hands back once submitted work has completed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkReport {
    /// one entry per `read_buffer`/`read_texture_slice` call, in recording order
    pub readbacks: Vec<Vec<u8>>,
    /// nanoseconds, one entry per `write_timestamp` call
    pub timestamps: Vec<u64>,
}

impl WorkReport {
    /// milliseconds between the first and last timestamp
    pub fn gpu_millis(&self) -> f64 {
        match (self.timestamps.first(), self.timestamps.last()) {
            (Some(begin), Some(end)) => end.saturating_sub(*begin) as f64 / 1_000_000.0,
            _ => 0.0,
        }
    }
}

/// the subset of a command list a pipeline stage needs to bind its parameters
pub trait ParameterBinder {
    fn transition(&mut self, resource: &NativeHandle, state: ResourceState);
    fn update_buffer(&mut self, buffer: &NativeHandle, offset: u64, data: &[u8]) -> Result<()>;

    fn bind_uniform_buffer(&mut self, slot: u32, buffer: &NativeHandle);
    fn bind_srv(&mut self, slot: u32, resource: &NativeHandle);
    fn bind_uav(&mut self, slot: u32, resource: &NativeHandle);
    fn bind_sampler(&mut self, slot: u32, sampler: &NativeHandle);
}

pub trait CommandList: ParameterBinder {
    fn set_compute_shader(&mut self, shader: &NativeHandle) -> Result<()>;
    fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()>;
    /// reads three u32 group counts from `args` at `offset`
    fn dispatch_indirect(&mut self, args: &NativeHandle, offset: u64) -> Result<()>;
    fn copy_buffer(
        &mut self,
        src: &NativeHandle,
        dst: &NativeHandle,
        src_offset: u64,
        dst_offset: u64,
        size: u64,
    ) -> Result<()>;
    /// queues a readback that shows up in [`WorkReport::readbacks`]
    fn read_buffer(&mut self, buffer: &NativeHandle, offset: u64, size: u64) -> Result<()>;
    /// queues a tightly packed readback of one slice
    fn read_texture_slice(&mut self, texture: &NativeHandle, slice: u32) -> Result<()>;
    fn write_timestamp(&mut self);

    /// Routes the following [`ParameterBinder`] calls to one stage's bindings.
    /// Compute and ray tracing share [`ShaderStage::Compute`].
    fn set_binding_stage(&mut self, stage: ShaderStage);

    /// every target is a texture; the first one sets the viewport
    fn begin_render_pass(&mut self, targets: &[NativeHandle], load: LoadAction) -> Result<()>;
    fn end_render_pass(&mut self) -> Result<()>;
    /// `geometry` is a vertex or a mesh shader
    fn set_graphics_shaders(&mut self, geometry: &NativeHandle, pixel: &NativeHandle) -> Result<()>;
    /// non-indexed triangle list
    fn draw(&mut self, num_vertices: u32, num_instances: u32) -> Result<()>;
    fn dispatch_mesh(&mut self, x: u32, y: u32, z: u32) -> Result<()>;

    fn set_ray_tracing_shaders(
        &mut self,
        ray_gen: &NativeHandle,
        miss: &NativeHandle,
        hit_group: &NativeHandle,
    ) -> Result<()>;
    fn dispatch_rays(&mut self, width: u32, height: u32, depth: u32) -> Result<()>;
}

pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<NativeHandle>;
    fn create_texture(&self, desc: &TextureDesc) -> Result<NativeHandle>;
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<NativeHandle>;
    fn create_compute_shader(&self, artifact: &CompiledShaderArtifact) -> Result<NativeHandle>;
    /// `stage` is one of vertex, pixel or mesh
    fn create_graphics_shader(
        &self,
        stage: ShaderStage,
        artifact: &CompiledShaderArtifact,
    ) -> Result<NativeHandle>;
    fn create_ray_tracing_shader(
        &self,
        kind: RayShaderKind,
        artifact: &CompiledShaderArtifact,
    ) -> Result<NativeHandle>;

    /// Queues the work and returns immediately. `on_complete` runs on the backend's
    /// own context, never on the caller's.
    fn enqueue(&self, work: GpuWork, on_complete: OnComplete);

    /// submits the work and waits until the gpu is idle
    fn submit_and_block(&self, work: GpuWork) -> Result<WorkReport>;
}
