//! Ray tracing pipelines: a ray generation shader plus its miss and hit group shaders.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::*;

use super::backend::{GpuWork, NativeHandle, RayShaderKind};
use super::parameters::setup_parameters;
use super::resource::Resource;
use super::{Context, RunningFlag, Runtime, hlsl_artifact, signal_failure};
use crate::bindings::{
    ResourceArray, ResourceBindings, resource_array_from_map, validate_resource_array,
};
use crate::error::{Error, RAY_TRACER_ALREADY_RUNNING, Result, Signal};
use crate::shaders::toolchain::{DxilTools, HlslCompiler};
use crate::shaders::{CompiledShaderArtifact, ShaderSource, ShaderStage};

pub const RAY_TRACING_TARGET_PROFILE: &str = "lib_6_3";

struct RayStage {
    artifact: CompiledShaderArtifact,
    shader: NativeHandle,
}

impl RayStage {
    fn load(context: &Context, kind: RayShaderKind, artifact: CompiledShaderArtifact) -> Result<Self> {
        let shader = context.backend().create_ray_tracing_shader(kind, &artifact)?;
        Ok(Self { artifact, shader })
    }
}

pub struct RayTracerPipeline {
    context: Arc<Context>,
    ray_gen: RayStage,
    miss: RayStage,
    hit_group: RayStage,
    /// resources are bound for the ray generation shader only
    bindings: ResourceBindings,
    running: Arc<RunningFlag>,
}

impl fmt::Debug for RayTracerPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RayTracerPipeline")
            .field("ray_gen", &self.ray_gen.artifact.entry_point)
            .field("miss", &self.miss.artifact.entry_point)
            .field("hit_group", &self.hit_group.artifact.entry_point)
            .field("bindings", &self.bindings)
            .field("running", &self.running.is_running())
            .finish()
    }
}

impl RayTracerPipeline {
    pub fn from_artifacts(
        runtime: &Runtime,
        ray_gen: CompiledShaderArtifact,
        miss: CompiledShaderArtifact,
        hit_group: CompiledShaderArtifact,
    ) -> Result<Self> {
        let bindings = ResourceBindings::create(&ray_gen.bindings)?;
        let context = Arc::clone(runtime.context());
        let ray_gen = RayStage::load(&context, RayShaderKind::RayGen, ray_gen)?;
        let miss = RayStage::load(&context, RayShaderKind::Miss, miss)?;
        let hit_group = RayStage::load(&context, RayShaderKind::HitGroup, hit_group)?;

        info!(
            "ray tracer pipeline {} ready (miss {}, hit group {})",
            ray_gen.artifact.entry_point, miss.artifact.entry_point, hit_group.artifact.entry_point
        );

        Ok(Self {
            context,
            ray_gen,
            miss,
            hit_group,
            bindings,
            running: Arc::default(),
        })
    }

    /// All three entry points may live in the same library source.
    pub fn init_from_hlsl<T: HlslCompiler + DxilTools + ?Sized>(
        runtime: &Runtime,
        tools: &T,
        ray_gen: ShaderSource<'_>,
        miss: ShaderSource<'_>,
        hit_group: ShaderSource<'_>,
    ) -> Result<Self> {
        let ray_gen = hlsl_artifact(runtime, tools, ray_gen, RAY_TRACING_TARGET_PROFILE)?;
        let miss = hlsl_artifact(runtime, tools, miss, RAY_TRACING_TARGET_PROFILE)?;
        let hit_group = hlsl_artifact(runtime, tools, hit_group, RAY_TRACING_TARGET_PROFILE)?;
        Self::from_artifacts(runtime, ray_gen, miss, hit_group)
    }

    pub fn bindings(&self) -> &ResourceBindings {
        &self.bindings
    }

    pub fn is_running(&self) -> bool {
        self.running.is_running()
    }

    fn begin(&self, resources: &ResourceArray, [x, y, z]: [i32; 3]) -> Result<()> {
        self.running.check_idle(RAY_TRACER_ALREADY_RUNNING)?;
        if x <= 0 || y <= 0 || z <= 0 {
            return Err(Error::InvalidThreadGroupSize(x, y, z));
        }
        validate_resource_array(resources, &self.bindings)?;
        self.running.start(RAY_TRACER_ALREADY_RUNNING)
    }

    /// Launches `xyz` rays; `on_signaled` runs from [`Runtime::poll_signals`].
    pub fn dispatch_rays(
        &self,
        resources: &ResourceArray,
        xyz: [i32; 3],
        on_signaled: impl FnOnce(Signal) + Send + 'static,
    ) -> Result<()> {
        if let Err(err) = self.begin(resources, xyz) {
            return signal_failure(err, on_signaled);
        }

        let [x, y, z] = xyz;
        let shaders = [&self.ray_gen, &self.miss, &self.hit_group].map(|stage| Arc::clone(&stage.shader));
        let array = resources.clone();
        let work: GpuWork = Box::new(move |commands| {
            let [ray_gen, miss, hit_group] = &shaders;
            commands.set_ray_tracing_shaders(ray_gen, miss, hit_group)?;
            commands.set_binding_stage(ShaderStage::Compute);
            setup_parameters(commands, &array)?;
            commands.dispatch_rays(x as u32, y as u32, z as u32)
        });

        debug!("dispatching {} rays {xyz:?}", self.ray_gen.artifact.entry_point);
        let label = self.ray_gen.artifact.entry_point.clone();
        let finish = self
            .context
            .finish_tracked(resources.to_tracked(), &self.running, label, move |result| {
                on_signaled(Signal::from(result.map(|_| ())));
            });
        self.context.enqueue(work, finish);

        Ok(())
    }

    pub fn dispatch_rays_by_map(
        &self,
        resources: &HashMap<String, Arc<Resource>>,
        xyz: [i32; 3],
        on_signaled: impl FnOnce(Signal) + Send + 'static,
    ) -> Result<()> {
        match resource_array_from_map(resources, &self.bindings) {
            Ok(array) => self.dispatch_rays(&array, xyz, on_signaled),
            Err(err) => signal_failure(err, on_signaled),
        }
    }
}
