//! Compute pipelines: compile or load a shader, then dispatch it against a resource array.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::*;

use super::backend::{GpuWork, NativeHandle, ResourceState, WorkReport};
use super::parameters::setup_parameters;
use super::resource::Resource;
use super::{Context, RunningFlag, Runtime, glsl_artifact, hlsl_artifact, signal_failure};
use crate::bindings::{
    ResourceArray, ResourceBindings, resource_array_from_map, validate_resource_array,
};
use crate::config::BackendKind;
use crate::error::{COMPUTE_ALREADY_RUNNING, Error, Result, Signal};
use crate::shaders::toolchain::{DxilTools, GlslCompiler, HlslCompiler, SpirvTools};
use crate::shaders::{self, CompiledShaderArtifact, ShaderSource};

pub const COMPUTE_TARGET_PROFILE: &str = "cs_6_0";

const INDIRECT_ARGS_SIZE: u64 = 4 * 3;

pub struct ComputePipeline {
    context: Arc<Context>,
    artifact: CompiledShaderArtifact,
    bindings: ResourceBindings,
    shader: NativeHandle,
    running: Arc<RunningFlag>,
}

impl fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputePipeline")
            .field("entry_point", &self.artifact.entry_point)
            .field("thread_group_size", &self.artifact.thread_group_size)
            .field("bindings", &self.bindings)
            .field("running", &self.running.is_running())
            .finish()
    }
}

enum Submission {
    Now,
    NextFrame,
}

impl ComputePipeline {
    /// Wraps an already fixed-up artifact: builds the binding table and loads the shader.
    pub fn from_artifact(runtime: &Runtime, artifact: CompiledShaderArtifact) -> Result<Self> {
        let bindings = ResourceBindings::create(&artifact.bindings)?;
        let context = Arc::clone(runtime.context());
        let shader = context.backend().create_compute_shader(&artifact)?;

        info!(
            "compute pipeline {} ready, thread group {:?}",
            artifact.entry_point, artifact.thread_group_size
        );

        Ok(Self {
            context,
            artifact,
            bindings,
            shader,
            running: Arc::default(),
        })
    }

    pub fn init_from_hlsl<T: HlslCompiler + DxilTools + ?Sized>(
        runtime: &Runtime,
        tools: &T,
        source: &str,
        entry_point: &str,
    ) -> Result<Self> {
        let source = ShaderSource::new(source, entry_point);
        let artifact = hlsl_artifact(runtime, tools, source, COMPUTE_TARGET_PROFILE)?;
        Self::from_artifact(runtime, artifact)
    }

    /// On Direct3D12 the SPIR-V goes back to HLSL and through dxc.
    pub fn init_from_glsl<T: GlslCompiler + SpirvTools + HlslCompiler + DxilTools + ?Sized>(
        runtime: &Runtime,
        tools: &T,
        source: &str,
        entry_point: &str,
    ) -> Result<Self> {
        let source = ShaderSource::new(source, entry_point);
        let artifact = glsl_artifact(runtime, tools, source, COMPUTE_TARGET_PROFILE)?;
        Self::from_artifact(runtime, artifact)
    }

    pub fn init_from_spirv(runtime: &Runtime, spirv: &[u8]) -> Result<Self> {
        if !runtime.backend_kind().wants_spirv() {
            return Err(Error::Backend(
                "SPIRV shaders are currently supported only on Vulkan".to_string(),
            ));
        }
        let artifact = shaders::artifact_from_spirv(spirv, runtime.platform())?;
        Self::from_artifact(runtime, artifact)
    }

    /// Raw DXIL has no usable names unless a disassembly is supplied through
    /// [`ComputePipeline::init_from_dxil_with_tools`].
    pub fn init_from_dxil(runtime: &Runtime, container: &[u8], entry_point: &str) -> Result<Self> {
        Self::load_dxil(runtime, container, entry_point, None)
    }

    pub fn init_from_dxil_with_tools<T: DxilTools + ?Sized>(
        runtime: &Runtime,
        tools: &T,
        container: &[u8],
        entry_point: &str,
    ) -> Result<Self> {
        let disassembly = shaders::disassemble_dxil(tools, container)?;
        Self::load_dxil(runtime, container, entry_point, Some(&disassembly))
    }

    fn load_dxil(
        runtime: &Runtime,
        container: &[u8],
        entry_point: &str,
        disassembly: Option<&str>,
    ) -> Result<Self> {
        if runtime.backend_kind() != BackendKind::D3D12 {
            return Err(Error::Backend(
                "DXIL shaders are currently supported only on Direct3D12".to_string(),
            ));
        }
        let artifact = shaders::artifact_from_dxil(container, entry_point, disassembly)?;
        Self::from_artifact(runtime, artifact)
    }

    pub fn artifact(&self) -> &CompiledShaderArtifact {
        &self.artifact
    }

    pub fn bindings(&self) -> &ResourceBindings {
        &self.bindings
    }

    pub fn thread_group_size(&self) -> [u32; 3] {
        self.artifact.thread_group_size
    }

    pub fn is_running(&self) -> bool {
        self.running.is_running()
    }

    pub(crate) fn running(&self) -> &Arc<RunningFlag> {
        &self.running
    }

    /// Validates a dispatch and flips the pipeline to running.
    ///
    /// `xyz` is None for indirect dispatches, whose counts live on the gpu.
    pub(crate) fn begin(&self, resources: &ResourceArray, xyz: Option<[i32; 3]>) -> Result<()> {
        self.running.check_idle(COMPUTE_ALREADY_RUNNING)?;

        if let Some([x, y, z]) = xyz {
            if x <= 0 || y <= 0 || z <= 0 {
                return Err(Error::InvalidDispatchDimension(x, y, z));
            }
        }

        validate_resource_array(resources, &self.bindings)?;
        self.running.start(COMPUTE_ALREADY_RUNNING)
    }

    fn record(&self, resources: ResourceArray, dispatch: GpuWork) -> GpuWork {
        let shader = Arc::clone(&self.shader);
        Box::new(move |commands| {
            commands.set_compute_shader(&shader)?;
            setup_parameters(commands, &resources)?;
            dispatch(commands)
        })
    }

    pub(crate) fn record_dispatch(&self, resources: ResourceArray, [x, y, z]: [i32; 3]) -> GpuWork {
        self.record(
            resources,
            Box::new(move |commands| commands.dispatch(x as u32, y as u32, z as u32)),
        )
    }

    /// Tracks the resources, then hands the work to the backend. The pipeline goes
    /// back to idle when the completion is polled.
    fn submit(
        &self,
        tracked: Vec<Arc<Resource>>,
        work: GpuWork,
        submission: Submission,
        on_done: impl FnOnce(Result<WorkReport>) + Send + 'static,
    ) {
        let label = self.artifact.entry_point.clone();
        let finish = self.context.finish_tracked(tracked, &self.running, label, on_done);

        match submission {
            Submission::Now => self.context.enqueue(work, finish),
            Submission::NextFrame => self.context.enqueue_next_frame(work, finish),
        }
    }

    fn dispatch_with(
        &self,
        resources: &ResourceArray,
        xyz: [i32; 3],
        submission: Submission,
        on_signaled: impl FnOnce(Signal) + Send + 'static,
    ) -> Result<()> {
        if let Err(err) = self.begin(resources, Some(xyz)) {
            return signal_failure(err, on_signaled);
        }

        debug!("dispatching {} {xyz:?}", self.artifact.entry_point);
        let work = self.record_dispatch(resources.clone(), xyz);
        self.submit(resources.to_tracked(), work, submission, move |result| {
            on_signaled(Signal::from(result.map(|_| ())));
        });

        Ok(())
    }

    /// Queues a dispatch; `on_signaled` runs from [`Runtime::poll_signals`].
    pub fn dispatch(
        &self,
        resources: &ResourceArray,
        xyz: [i32; 3],
        on_signaled: impl FnOnce(Signal) + Send + 'static,
    ) -> Result<()> {
        self.dispatch_with(resources, xyz, Submission::Now, on_signaled)
    }

    pub fn dispatch_by_map(
        &self,
        resources: &HashMap<String, Arc<Resource>>,
        xyz: [i32; 3],
        on_signaled: impl FnOnce(Signal) + Send + 'static,
    ) -> Result<()> {
        match resource_array_from_map(resources, &self.bindings) {
            Ok(array) => self.dispatch(&array, xyz, on_signaled),
            Err(err) => signal_failure(err, on_signaled),
        }
    }

    /// held back until the next [`Runtime::tick_frame`]
    pub fn dispatch_next_frame(
        &self,
        resources: &ResourceArray,
        xyz: [i32; 3],
        on_signaled: impl FnOnce(Signal) + Send + 'static,
    ) -> Result<()> {
        self.dispatch_with(resources, xyz, Submission::NextFrame, on_signaled)
    }

    fn validate_indirect_buffer(buffer: Option<&Arc<Resource>>, offset: u64) -> Result<&Arc<Resource>> {
        let buffer = buffer.ok_or(Error::InvalidIndirectBuffer("Buffer is NULL"))?;
        let desc = buffer
            .buffer_desc()
            .ok_or(Error::InvalidIndirectBuffer("Invalid Indirect Buffer"))?;

        if desc.size.saturating_sub(offset) < INDIRECT_ARGS_SIZE {
            return Err(Error::InvalidIndirectBuffer(
                "Invalid Indirect Buffer size (expected sizeof(uint32) * 3)",
            ));
        }

        Ok(buffer)
    }

    /// Reads the group counts from three u32s at `offset` in `buffer`.
    pub fn dispatch_indirect(
        &self,
        resources: &ResourceArray,
        buffer: Option<&Arc<Resource>>,
        offset: u64,
        on_signaled: impl FnOnce(Signal) + Send + 'static,
    ) -> Result<()> {
        let buffer = match Self::validate_indirect_buffer(buffer, offset)
            .and_then(|buffer| self.begin(resources, None).map(|()| buffer))
        {
            Ok(buffer) => Arc::clone(buffer),
            Err(err) => return signal_failure(err, on_signaled),
        };

        let args = Arc::clone(buffer.native());
        let work = self.record(
            resources.clone(),
            Box::new(move |commands| {
                commands.transition(&args, ResourceState::IndirectArgs);
                commands.dispatch_indirect(&args, offset)
            }),
        );

        let mut tracked = resources.to_tracked();
        tracked.push(buffer);
        debug!("dispatching {} indirect at {offset}", self.artifact.entry_point);
        self.submit(tracked, work, Submission::Now, move |result| {
            on_signaled(Signal::from(result.map(|_| ())));
        });

        Ok(())
    }

    /// Dispatches and waits for the gpu.
    pub fn dispatch_sync(&self, resources: &ResourceArray, xyz: [i32; 3]) -> Result<()> {
        self.begin(resources, Some(xyz))?;

        let work = self.record_dispatch(resources.clone(), xyz);
        let result = self.context.submit_and_block(work);
        self.running.finish();

        result.map(|_| ())
    }

    pub fn dispatch_by_map_sync(
        &self,
        resources: &HashMap<String, Arc<Resource>>,
        xyz: [i32; 3],
    ) -> Result<()> {
        let array = resource_array_from_map(resources, &self.bindings)?;
        self.dispatch_sync(&array, xyz)
    }

    /// Like [`ComputePipeline::dispatch`], also reporting the gpu time in milliseconds.
    pub fn dispatch_and_profile(
        &self,
        resources: &ResourceArray,
        xyz: [i32; 3],
        on_signaled: impl FnOnce(Signal, f64) + Send + 'static,
    ) -> Result<()> {
        if let Err(err) = self.begin(resources, Some(xyz)) {
            return signal_failure(err, |signal| on_signaled(signal, 0.0));
        }

        let dispatch = self.record_dispatch(resources.clone(), xyz);
        let work: GpuWork = Box::new(move |commands| {
            commands.write_timestamp();
            dispatch(commands)?;
            commands.write_timestamp();
            Ok(())
        });

        self.submit(resources.to_tracked(), work, Submission::Now, move |result| {
            match result {
                Ok(report) => on_signaled(Signal::success(), report.gpu_millis()),
                Err(err) => on_signaled(err.to_signal(), 0.0),
            }
        });

        Ok(())
    }
}
