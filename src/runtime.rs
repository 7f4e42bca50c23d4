//! Dispatch layer: resources, pipelines and completion plumbing over a [`Backend`].
//!
//! Completion is a two-hop handoff. The backend resolves the fence on its own
//! context and posts the result onto the runtime's channel; the caller drains that
//! channel with [`Runtime::poll_signals`], which is where tracked resources are
//! released, pipelines go back to idle and callbacks run.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::*;

use crate::bindings::ResourceArray;
use crate::config::{BackendKind, TargetPlatform};
use crate::error::{Error, Result, Signal};
use crate::shaders::reflection::ResourceClass;
use crate::shaders::toolchain::{DxilTools, GlslCompiler, HlslCompiler, SpirvTools};
use crate::shaders::{self, CompileTarget, CompiledShaderArtifact, ShaderSource};

pub mod backend;
pub mod compute;
pub mod parameters;
pub mod rasterizer;
pub mod ray_tracer;
pub mod resource;
pub mod software;
pub mod tracking;

use backend::{Backend, BufferDesc, GpuWork, PixelFormat, SamplerDesc, TextureDesc, WorkReport};
use compute::ComputePipeline;
use resource::{Resource, ResourceStorage};
use tracking::{ResourceTracker, TrackingHandle};

/// runs on the caller's context once the backend reports completion
pub(crate) type Finish = Box<dyn FnOnce(Result<WorkReport>) + Send>;

/// Idle/Running state shared by pipelines and resources.
#[derive(Debug, Default)]
pub struct RunningFlag(AtomicBool);

impl RunningFlag {
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn check_idle(&self, message: &'static str) -> Result<()> {
        if self.is_running() {
            return Err(Error::AlreadyRunning(message));
        }
        Ok(())
    }

    pub fn start(&self, message: &'static str) -> Result<()> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::AlreadyRunning(message))
    }

    pub fn finish(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Reports a rejected async call both ways: through the callback, then as the return value.
pub(crate) fn signal_failure<T>(err: Error, on_signaled: impl FnOnce(Signal)) -> Result<T> {
    warn!("{err}");
    on_signaled(err.to_signal());
    Err(err)
}

struct Completed {
    result: Result<WorkReport>,
    finish: Finish,
}

struct PendingWork {
    work: GpuWork,
    finish: Finish,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// state shared by the runtime and every object created from it
pub(crate) struct Context {
    backend: Arc<dyn Backend>,
    platform: TargetPlatform,
    completions: Sender<Completed>,
    tracker: Mutex<ResourceTracker>,
    next_frame: Mutex<Vec<PendingWork>>,
}

impl Context {
    pub(crate) fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub(crate) fn platform(&self) -> TargetPlatform {
        self.platform
    }

    pub(crate) fn track(&self, resources: Vec<Arc<Resource>>) -> TrackingHandle {
        lock(&self.tracker).track(resources)
    }

    pub(crate) fn untrack(&self, handle: TrackingHandle) {
        let released = lock(&self.tracker).untrack(handle);
        trace!("released {} tracked resources", released.len());
    }

    /// Tracks `resources` until the work completes. The returned completion
    /// releases them and puts `running` back to idle before `on_done` runs.
    pub(crate) fn finish_tracked(
        self: &Arc<Self>,
        resources: Vec<Arc<Resource>>,
        running: &Arc<RunningFlag>,
        label: String,
        on_done: impl FnOnce(Result<WorkReport>) + Send + 'static,
    ) -> Finish {
        let handle = self.track(resources);
        let context = Arc::clone(self);
        let running = Arc::clone(running);

        Box::new(move |result| {
            context.untrack(handle);
            running.finish();
            match &result {
                Ok(_) => debug!("{label} completed"),
                Err(err) => error!("{label} failed: {err}"),
            }
            on_done(result);
        })
    }

    /// hands the work to the backend; `finish` runs from `poll_signals`
    pub(crate) fn enqueue(&self, work: GpuWork, finish: Finish) {
        let completions = self.completions.clone();
        self.backend.enqueue(
            work,
            Box::new(move |result| {
                if completions.send(Completed { result, finish }).is_err() {
                    warn!("completion dropped, the runtime is gone");
                }
            }),
        );
    }

    pub(crate) fn enqueue_next_frame(&self, work: GpuWork, finish: Finish) {
        lock(&self.next_frame).push(PendingWork { work, finish });
    }

    pub(crate) fn submit_and_block(&self, work: GpuWork) -> Result<WorkReport> {
        self.backend.submit_and_block(work)
    }
}

pub struct Runtime {
    context: Arc<Context>,
    completions: Receiver<Completed>,
    frame: AtomicU64,
}

impl Runtime {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_platform(backend, TargetPlatform::Desktop)
    }

    pub fn with_platform(backend: Arc<dyn Backend>, platform: TargetPlatform) -> Self {
        let (sender, receiver) = mpsc::channel();
        let context = Context {
            backend,
            platform,
            completions: sender,
            tracker: Mutex::new(ResourceTracker::new()),
            next_frame: Mutex::new(vec![]),
        };

        Self {
            context: Arc::new(context),
            completions: receiver,
            frame: AtomicU64::new(0),
        }
    }

    pub(crate) fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.context.backend.kind()
    }

    pub fn platform(&self) -> TargetPlatform {
        self.context.platform
    }

    /// Runs every completion that has arrived so far; returns how many ran.
    pub fn poll_signals(&self) -> usize {
        let mut count = 0;
        while let Ok(completed) = self.completions.try_recv() {
            (completed.finish)(completed.result);
            count += 1;
        }
        count
    }

    /// waits up to `timeout` for the first completion, then drains the rest
    pub fn wait_signals(&self, timeout: Duration) -> usize {
        match self.completions.recv_timeout(timeout) {
            Ok(completed) => {
                (completed.finish)(completed.result);
                1 + self.poll_signals()
            }
            Err(RecvTimeoutError::Timeout) => 0,
            Err(RecvTimeoutError::Disconnected) => {
                error!("completion channel disconnected");
                0
            }
        }
    }

    /// Frame boundary: submits the work deferred with `dispatch_next_frame`.
    pub fn tick_frame(&self) -> usize {
        let pending = std::mem::take(&mut *lock(&self.context.next_frame));
        let count = pending.len();
        for PendingWork { work, finish } in pending {
            self.context.enqueue(work, finish);
        }

        let frame = self.frame.fetch_add(1, Ordering::AcqRel) + 1;
        if count > 0 {
            debug!("frame {frame}: submitted {count} deferred dispatches");
        }
        count
    }

    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    /// dispatches still holding tracked resources
    pub fn in_flight(&self) -> usize {
        lock(&self.context.tracker).in_flight()
    }

    fn create(&self, class: ResourceClass, storage: ResourceStorage) -> Result<Arc<Resource>> {
        Resource::new(Arc::clone(&self.context), class, storage)
    }

    /// a constant buffer with host-side data; the size is rounded up to 16 bytes
    pub fn create_cbv(&self, size: u64) -> Result<Arc<Resource>> {
        let size = size.div_ceil(16) * 16;
        self.create(ResourceClass::Cbv, ResourceStorage::Buffer(BufferDesc::raw(size)))
    }

    pub fn create_srv_buffer(&self, size: u64) -> Result<Arc<Resource>> {
        self.create_srv_buffer_with(BufferDesc::raw(size))
    }

    pub fn create_srv_buffer_with(&self, desc: BufferDesc) -> Result<Arc<Resource>> {
        self.create(ResourceClass::Srv, ResourceStorage::Buffer(desc))
    }

    pub fn create_uav_buffer(&self, size: u64) -> Result<Arc<Resource>> {
        self.create_uav_buffer_with(BufferDesc::raw(size))
    }

    pub fn create_uav_buffer_with(&self, desc: BufferDesc) -> Result<Arc<Resource>> {
        self.create(ResourceClass::Uav, ResourceStorage::Buffer(desc))
    }

    pub fn create_srv_texture(&self, desc: TextureDesc) -> Result<Arc<Resource>> {
        self.create(ResourceClass::Srv, ResourceStorage::Texture(desc))
    }

    pub fn create_uav_texture(&self, desc: TextureDesc) -> Result<Arc<Resource>> {
        self.create(ResourceClass::Uav, ResourceStorage::Texture(desc))
    }

    pub fn create_uav_texture_2d(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Arc<Resource>> {
        self.create_uav_texture(TextureDesc::d2(width, height, format))
    }

    pub fn create_sampler(&self, desc: SamplerDesc) -> Result<Arc<Resource>> {
        self.create(ResourceClass::Sampler, ResourceStorage::Sampler(desc))
    }
}

/// HLSL compiled to whatever bytecode the runtime's backend loads
pub(crate) fn hlsl_artifact<T: HlslCompiler + DxilTools + ?Sized>(
    runtime: &Runtime,
    tools: &T,
    source: ShaderSource<'_>,
    target_profile: &str,
) -> Result<CompiledShaderArtifact> {
    shaders::compile_hlsl_artifact(
        tools,
        source.code,
        source.entry_point,
        target_profile,
        CompileTarget::for_backend(runtime.backend_kind()),
        runtime.platform(),
    )
}

/// On Direct3D12 the SPIR-V goes back to HLSL and through dxc.
pub(crate) fn glsl_artifact<T: GlslCompiler + SpirvTools + HlslCompiler + DxilTools + ?Sized>(
    runtime: &Runtime,
    tools: &T,
    source: ShaderSource<'_>,
    target_profile: &str,
) -> Result<CompiledShaderArtifact> {
    if runtime.backend_kind().wants_spirv() {
        return shaders::compile_glsl_artifact(
            tools,
            source.code,
            source.entry_point,
            target_profile,
            runtime.platform(),
        );
    }

    let spirv = shaders::compile_glsl(tools, source.code, source.entry_point, target_profile)?;
    let hlsl = shaders::spirv_to_hlsl(tools, &spirv)?;
    debug!("glsl {} converted to {} bytes of hlsl", source.entry_point, hlsl.len());
    hlsl_artifact(runtime, tools, ShaderSource::new(&hlsl, source.entry_point), target_profile)
}

/// one pipeline's share of a [`dispatch_passes`] batch
pub struct DispatchPass<'a> {
    pub pipeline: &'a ComputePipeline,
    pub resources: &'a ResourceArray,
    pub xyz: [i32; 3],
}

/// Submits several pipelines as one batch.
///
/// Each pipeline is validated, marked running and tracked on its own; a rejected
/// pass leaves every pipeline of the batch idle.
pub fn dispatch_passes(
    runtime: &Runtime,
    passes: &[DispatchPass<'_>],
    on_signaled: impl FnOnce(Signal) + Send + 'static,
) -> Result<()> {
    let mut started: Vec<&ComputePipeline> = Vec::with_capacity(passes.len());
    for pass in passes {
        if let Err(err) = pass.pipeline.begin(pass.resources, Some(pass.xyz)) {
            for pipeline in &started {
                pipeline.running().finish();
            }
            return signal_failure(err, on_signaled);
        }
        started.push(pass.pipeline);
    }

    let mut works = Vec::with_capacity(passes.len());
    let mut releases = Vec::with_capacity(passes.len());
    for pass in passes {
        let handle = runtime.context.track(pass.resources.to_tracked());
        works.push(pass.pipeline.record_dispatch(pass.resources.clone(), pass.xyz));
        releases.push((handle, Arc::clone(pass.pipeline.running())));
    }

    let work: GpuWork = Box::new(move |commands| {
        for work in works {
            work(commands)?;
        }
        Ok(())
    });

    let context = Arc::clone(&runtime.context);
    let finish: Finish = Box::new(move |result| {
        for (handle, running) in releases {
            context.untrack(handle);
            running.finish();
        }
        on_signaled(Signal::from(result.map(|_| ())));
    });

    info!("dispatching {} passes", passes.len());
    runtime.context.enqueue(work, finish);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_flag() {
        let flag = RunningFlag::default();
        flag.check_idle("busy").unwrap();
        flag.start("busy").unwrap();

        assert_eq!(flag.start("busy"), Err(Error::AlreadyRunning("busy")));
        assert_eq!(flag.check_idle("busy"), Err(Error::AlreadyRunning("busy")));

        flag.finish();
        assert!(!flag.is_running());
    }

    #[test]
    fn failures_reach_the_callback() {
        let (sender, receiver) = mpsc::channel();
        let result: Result<()> = signal_failure(Error::Backend("lost device".to_string()), |signal| {
            sender.send(signal).unwrap();
        });

        assert_eq!(result, Err(Error::Backend("lost device".to_string())));
        assert_eq!(receiver.recv().unwrap(), Signal::failure("lost device"));
    }
}
