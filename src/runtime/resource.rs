use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use log::*;

use super::backend::{
    BufferDesc, GpuWork, NativeHandle, ParameterBinder, ResourceState, SamplerDesc, TextureDesc,
    TextureDimension, WorkReport,
};
use super::{Context, Finish, RunningFlag, signal_failure};
use crate::error::{Error, RESOURCE_ALREADY_RUNNING, Result, Signal};
use crate::shaders::reflection::ResourceClass;
use crate::util::div_round_up;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStorage {
    Buffer(BufferDesc),
    Texture(TextureDesc),
    Sampler(SamplerDesc),
}

#[derive(Debug, Default)]
struct ConstantData {
    bytes: Vec<u8>,
    dirty: bool,
}

/// A native gpu object seen through one view (CBV, SRV, UAV or sampler).
///
/// Copies, readbacks and clears run through the same idle/running state as
/// pipelines, so only one of them can be in flight per resource.
pub struct Resource {
    class: ResourceClass,
    storage: ResourceStorage,
    native: NativeHandle,
    context: Arc<Context>,
    running: Arc<RunningFlag>,
    /// host copy of a constant buffer, synced before binding when dirty
    constant: Option<Mutex<ConstantData>>,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("class", &self.class)
            .field("storage", &self.storage)
            .field("running", &self.running.is_running())
            .finish()
    }
}

fn first_readback(report: WorkReport) -> Result<Vec<u8>> {
    report
        .readbacks
        .into_iter()
        .next()
        .ok_or_else(|| Error::Backend("missing readback data".to_string()))
}

fn to_floats(bytes: &[u8]) -> Vec<f32> {
    bytemuck::pod_collect_to_vec(bytes)
}

impl Resource {
    pub(crate) fn new(
        context: Arc<Context>,
        class: ResourceClass,
        storage: ResourceStorage,
    ) -> Result<Arc<Self>> {
        let native = match &storage {
            ResourceStorage::Buffer(desc) => context.backend().create_buffer(desc)?,
            ResourceStorage::Texture(desc) => context.backend().create_texture(desc)?,
            ResourceStorage::Sampler(desc) => context.backend().create_sampler(desc)?,
        };

        Ok(Arc::new(Self::view(context, class, storage, native, Arc::default())))
    }

    fn view(
        context: Arc<Context>,
        class: ResourceClass,
        storage: ResourceStorage,
        native: NativeHandle,
        running: Arc<RunningFlag>,
    ) -> Self {
        let constant = match (class, storage) {
            (ResourceClass::Cbv, ResourceStorage::Buffer(desc)) => Some(Mutex::new(ConstantData {
                bytes: vec![0; desc.size as usize],
                dirty: false,
            })),
            _ => None,
        };

        Self {
            class,
            storage,
            native,
            context,
            running,
            constant,
        }
    }

    /// The same native object seen through another view, e.g. a UAV buffer read as an SRV.
    /// Both views share one running state.
    pub fn view_as(&self, class: ResourceClass) -> Result<Arc<Self>> {
        let compatible = match (self.storage, class) {
            (ResourceStorage::Sampler(_), ResourceClass::Sampler) => true,
            (ResourceStorage::Sampler(_), _) | (_, ResourceClass::Sampler) => false,
            (ResourceStorage::Texture(_), ResourceClass::Cbv) => false,
            _ => true,
        };
        if !compatible {
            return Err(Error::Backend(format!(
                "Unable to view {:?} as {} {class}",
                self.storage,
                class.article()
            )));
        }

        Ok(Arc::new(Self::view(
            Arc::clone(&self.context),
            class,
            self.storage,
            Arc::clone(&self.native),
            Arc::clone(&self.running),
        )))
    }

    pub fn class(&self) -> ResourceClass {
        self.class
    }

    pub fn storage(&self) -> &ResourceStorage {
        &self.storage
    }

    pub fn native(&self) -> &NativeHandle {
        &self.native
    }

    pub fn buffer_desc(&self) -> Option<&BufferDesc> {
        match &self.storage {
            ResourceStorage::Buffer(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn texture_desc(&self) -> Option<&TextureDesc> {
        match &self.storage {
            ResourceStorage::Texture(desc) => Some(desc),
            _ => None,
        }
    }

    pub fn is_buffer(&self) -> bool {
        self.buffer_desc().is_some()
    }

    /// buffer size or full texture size in bytes
    pub fn size(&self) -> u64 {
        match &self.storage {
            ResourceStorage::Buffer(desc) => desc.size,
            ResourceStorage::Texture(desc) => desc.byte_size(),
            ResourceStorage::Sampler(_) => 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_running()
    }

    /// Stores constant data on the host; it reaches the gpu the next time the CBV is bound.
    pub fn set_data(&self, data: &[u8]) -> Result<()> {
        let Some(constant) = &self.constant else {
            return Err(Error::Backend("Only CBVs hold constant data".to_string()));
        };

        let mut constant = constant.lock().unwrap_or_else(PoisonError::into_inner);
        if data.len() > constant.bytes.len() {
            return Err(Error::Backend(format!(
                "Invalid CBV data size {} (max {})",
                data.len(),
                constant.bytes.len()
            )));
        }
        constant.bytes[..data.len()].copy_from_slice(data);
        constant.dirty = true;

        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.constant.as_ref().is_some_and(|constant| {
            constant.lock().unwrap_or_else(PoisonError::into_inner).dirty
        })
    }

    pub(crate) fn sync_constant_data<B: ParameterBinder + ?Sized>(&self, binder: &mut B) -> Result<()> {
        let Some(constant) = &self.constant else {
            return Ok(());
        };

        let mut constant = constant.lock().unwrap_or_else(PoisonError::into_inner);
        if constant.dirty {
            binder.update_buffer(&self.native, 0, &constant.bytes)?;
            constant.dirty = false;
        }

        Ok(())
    }

    /// Group counts that cover the whole texture with groups of `thread_group_size`.
    ///
    /// Non-textures return `thread_group_size` unchanged.
    pub fn thread_groups_for_texture(
        &self,
        thread_group_size: [i32; 3],
        use_slices_for_z: bool,
    ) -> [i32; 3] {
        let Some(desc) = self.texture_desc() else {
            return thread_group_size;
        };
        if thread_group_size.iter().any(|&size| size <= 0) {
            return [1, 1, 1];
        }

        let (size_z, slices) = match desc.dimension {
            TextureDimension::D3 => (desc.depth, 1),
            TextureDimension::D2Array => (1, desc.depth),
            TextureDimension::D1 | TextureDimension::D2 => (1, 1),
        };
        let z = if use_slices_for_z { slices } else { size_z };

        [
            div_round_up(desc.width, thread_group_size[0] as u32) as i32,
            div_round_up(desc.height, thread_group_size[1] as u32) as i32,
            div_round_up(z, thread_group_size[2] as u32) as i32,
        ]
    }

    fn require_buffer(&self, what: &str) -> Result<&BufferDesc> {
        self.buffer_desc()
            .ok_or_else(|| Error::Backend(format!("{what} is supported only for buffers")))
    }

    fn validate_copy(
        &self,
        destination: &Resource,
        size: u64,
        destination_offset: u64,
        source_offset: u64,
    ) -> Result<()> {
        let source_size = self.require_buffer("Copy")?.size;
        let destination_size = destination.require_buffer("Copy")?.size;

        let fits = |offset: u64, total: u64| offset.checked_add(size).is_some_and(|end| end <= total);
        if size == 0 || !fits(source_offset, source_size) || !fits(destination_offset, destination_size)
        {
            return Err(Error::Backend("Invalid copy size".to_string()));
        }

        Ok(())
    }

    fn copy_work(
        &self,
        destination: &Resource,
        size: u64,
        destination_offset: u64,
        source_offset: u64,
    ) -> GpuWork {
        let source = Arc::clone(&self.native);
        let destination = Arc::clone(&destination.native);
        Box::new(move |commands| {
            commands.transition(&source, ResourceState::CopySource);
            commands.transition(&destination, ResourceState::CopyDest);
            commands.copy_buffer(&source, &destination, source_offset, destination_offset, size)
        })
    }

    /// Starts an async operation: marks the resource running and keeps `tracked` alive
    /// until `on_done` has run from `poll_signals`.
    fn enqueue(
        &self,
        tracked: Vec<Arc<Resource>>,
        work: GpuWork,
        on_done: impl FnOnce(Result<WorkReport>) + Send + 'static,
    ) -> Result<()> {
        self.running.start(RESOURCE_ALREADY_RUNNING)?;
        let handle = self.context.track(tracked);

        let context = Arc::clone(&self.context);
        let running = Arc::clone(&self.running);
        let finish: Finish = Box::new(move |result| {
            context.untrack(handle);
            running.finish();
            on_done(result);
        });
        self.context.enqueue(work, finish);

        Ok(())
    }

    fn run_sync(&self, work: GpuWork) -> Result<WorkReport> {
        self.running.start(RESOURCE_ALREADY_RUNNING)?;
        let result = self.context.submit_and_block(work);
        self.running.finish();
        result
    }

    pub fn copy_to_buffer(
        self: &Arc<Self>,
        destination: &Arc<Resource>,
        size: u64,
        destination_offset: u64,
        source_offset: u64,
        on_signaled: impl FnOnce(Signal) + Send + 'static,
    ) -> Result<()> {
        if let Err(err) = self
            .running
            .check_idle(RESOURCE_ALREADY_RUNNING)
            .and_then(|()| self.validate_copy(destination, size, destination_offset, source_offset))
        {
            return signal_failure(err, on_signaled);
        }

        let work = self.copy_work(destination, size, destination_offset, source_offset);
        let tracked = vec![Arc::clone(self), Arc::clone(destination)];
        debug!("copying {size} bytes between buffers");
        self.enqueue(tracked, work, move |result| {
            on_signaled(Signal::from(result.map(|_| ())));
        })
    }

    pub fn copy_to_buffer_sync(
        &self,
        destination: &Resource,
        size: u64,
        destination_offset: u64,
        source_offset: u64,
    ) -> Result<()> {
        self.validate_copy(destination, size, destination_offset, source_offset)?;
        let work = self.copy_work(destination, size, destination_offset, source_offset);
        self.run_sync(work).map(|_| ())
    }

    /// fills the whole buffer with `value`
    pub fn clear_buffer_with_float_sync(&self, value: f32) -> Result<()> {
        let size = self.require_buffer("Clear")?.size as usize;
        let mut bytes = Vec::with_capacity(size);
        while bytes.len() + 4 <= size {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes.resize(size, 0);

        let native = Arc::clone(&self.native);
        self.run_sync(Box::new(move |commands| {
            commands.transition(&native, ResourceState::CopyDest);
            commands.update_buffer(&native, 0, &bytes)
        }))
        .map(|_| ())
    }

    /// writes raw bytes at `offset`; works for buffers and textures
    pub fn update_buffer_sync(&self, offset: u64, data: &[u8]) -> Result<()> {
        if matches!(self.storage, ResourceStorage::Sampler(_)) {
            return Err(Error::Backend("Samplers have no contents".to_string()));
        }
        if offset.checked_add(data.len() as u64).is_none_or(|end| end > self.size()) {
            return Err(Error::Backend(format!(
                "Invalid update size {} at {offset} (resource is {} bytes)",
                data.len(),
                self.size()
            )));
        }

        let native = Arc::clone(&self.native);
        let bytes = data.to_vec();
        self.run_sync(Box::new(move |commands| {
            commands.transition(&native, ResourceState::CopyDest);
            commands.update_buffer(&native, offset, &bytes)
        }))
        .map(|_| ())
    }

    fn float_range_work(&self, offset: usize, elements: usize) -> Result<GpuWork> {
        let size = self.require_buffer("Readback")?.size;
        let (start, len) = ((offset * 4) as u64, (elements * 4) as u64);
        if start + len > size {
            return Err(Error::Backend(format!(
                "Invalid readback range ({elements} floats at {offset})"
            )));
        }

        let native = Arc::clone(&self.native);
        Ok(Box::new(move |commands| {
            commands.transition(&native, ResourceState::CopySource);
            commands.read_buffer(&native, start, len)
        }))
    }

    /// reads `elements` floats starting at float index `offset`
    pub fn readback_to_float_array(
        self: &Arc<Self>,
        offset: usize,
        elements: usize,
        on_signaled: impl FnOnce(Signal, Vec<f32>) + Send + 'static,
    ) -> Result<()> {
        let work = match self
            .running
            .check_idle(RESOURCE_ALREADY_RUNNING)
            .and_then(|()| self.float_range_work(offset, elements))
        {
            Ok(work) => work,
            Err(err) => return signal_failure(err, |signal| on_signaled(signal, vec![])),
        };

        self.enqueue(vec![Arc::clone(self)], work, move |result| {
            match result.and_then(first_readback) {
                Ok(bytes) => on_signaled(Signal::success(), to_floats(&bytes)),
                Err(err) => on_signaled(err.to_signal(), vec![]),
            }
        })
    }

    pub fn readback_to_float_array_sync(&self, offset: usize, elements: usize) -> Result<Vec<f32>> {
        let work = self.float_range_work(offset, elements)?;
        let bytes = first_readback(self.run_sync(work)?)?;
        Ok(to_floats(&bytes))
    }

    pub fn readback_bytes_sync(&self) -> Result<Vec<u8>> {
        let size = self.require_buffer("Readback")?.size;
        let native = Arc::clone(&self.native);
        let report = self.run_sync(Box::new(move |commands| {
            commands.transition(&native, ResourceState::CopySource);
            commands.read_buffer(&native, 0, size)
        }))?;
        first_readback(report)
    }

    /// Copies one slice of a texture back to the host, rows tightly packed.
    pub fn map_texture_slice_sync(&self, slice: u32) -> Result<Vec<u8>> {
        let Some(desc) = self.texture_desc() else {
            return Err(Error::Backend(
                "Slice mapping is supported only for textures".to_string(),
            ));
        };
        let slices = match desc.dimension {
            TextureDimension::D2Array | TextureDimension::D3 => desc.depth,
            TextureDimension::D1 | TextureDimension::D2 => 1,
        };
        if slice >= slices {
            return Err(Error::Backend(format!("Invalid Texture Slice Index ({slice})")));
        }

        let native = Arc::clone(&self.native);
        let report = self.run_sync(Box::new(move |commands| {
            commands.transition(&native, ResourceState::CopySource);
            commands.read_texture_slice(&native, slice)
        }))?;
        first_readback(report)
    }
}
