//! Rasterizer pipelines: a vertex or mesh shader feeding a pixel shader that
//! writes up to eight render targets.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::*;

use super::backend::{GpuWork, LoadAction, NativeHandle, ResourceState};
use super::parameters::setup_parameters;
use super::resource::Resource;
use super::{Context, RunningFlag, Runtime, glsl_artifact, hlsl_artifact, signal_failure};
use crate::bindings::{
    ResourceArray, ResourceBindings, resource_array_from_map, validate_resource_array,
};
use crate::error::{Error, RASTERIZER_ALREADY_RUNNING, Result, Signal};
use crate::shaders::reflection::ShaderResourceBindings;
use crate::shaders::toolchain::{DxilTools, GlslCompiler, HlslCompiler, SpirvTools};
use crate::shaders::{CompiledShaderArtifact, ShaderSource, ShaderStage};

pub const VERTEX_TARGET_PROFILE: &str = "vs_6_0";
pub const PIXEL_TARGET_PROFILE: &str = "ps_6_0";
pub const MESH_TARGET_PROFILE: &str = "ms_6_5";

pub const MAX_RENDER_TARGETS: usize = 8;

fn stage_name(stage: ShaderStage) -> &'static str {
    match stage {
        ShaderStage::Mesh => "mesh",
        _ => "vertex",
    }
}

/// Neither first stage reads vertex inputs, and every pixel input has to be
/// written by the first stage with the same register and mask.
fn check_semantics(
    geometry_stage: ShaderStage,
    geometry: &ShaderResourceBindings,
    pixel: &ShaderResourceBindings,
) -> Result<()> {
    if let Some(semantic) = geometry.input_semantics.first() {
        return Err(Error::UnsupportedInputSemantic {
            stage: stage_name(geometry_stage),
            name: semantic.name.clone(),
            index: semantic.index,
        });
    }

    let unmatched = pixel
        .input_semantics
        .iter()
        .find(|semantic| !geometry.output_semantics.contains(semantic));
    match unmatched {
        Some(semantic) => Err(Error::UnmatchedSemantic {
            name: semantic.name.clone(),
            index: semantic.index,
            register: semantic.register_num,
            mask: semantic.mask,
        }),
        None => Ok(()),
    }
}

struct GraphicsStage {
    stage: ShaderStage,
    artifact: CompiledShaderArtifact,
    bindings: ResourceBindings,
    shader: NativeHandle,
}

impl GraphicsStage {
    fn load(context: &Context, stage: ShaderStage, artifact: CompiledShaderArtifact) -> Result<Self> {
        let bindings = ResourceBindings::create(&artifact.bindings)?;
        let shader = context.backend().create_graphics_shader(stage, &artifact)?;
        Ok(Self {
            stage,
            artifact,
            bindings,
            shader,
        })
    }
}

pub struct RasterizerPipeline {
    context: Arc<Context>,
    /// vertex or mesh
    geometry: GraphicsStage,
    pixel: GraphicsStage,
    running: Arc<RunningFlag>,
}

impl fmt::Debug for RasterizerPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RasterizerPipeline")
            .field("geometry_stage", &self.geometry.stage)
            .field("geometry_entry_point", &self.geometry.artifact.entry_point)
            .field("pixel_entry_point", &self.pixel.artifact.entry_point)
            .field("running", &self.running.is_running())
            .finish()
    }
}

impl RasterizerPipeline {
    /// `geometry_stage` is [`ShaderStage::Vertex`] or [`ShaderStage::Mesh`].
    pub fn from_artifacts(
        runtime: &Runtime,
        geometry_stage: ShaderStage,
        geometry: CompiledShaderArtifact,
        pixel: CompiledShaderArtifact,
    ) -> Result<Self> {
        if !matches!(geometry_stage, ShaderStage::Vertex | ShaderStage::Mesh) {
            return Err(Error::Backend(format!(
                "{geometry_stage:?} shaders cannot feed a pixel shader"
            )));
        }
        check_semantics(geometry_stage, &geometry.bindings, &pixel.bindings)?;

        let context = Arc::clone(runtime.context());
        let geometry = GraphicsStage::load(&context, geometry_stage, geometry)?;
        let pixel = GraphicsStage::load(&context, ShaderStage::Pixel, pixel)?;

        info!(
            "rasterizer pipeline {} + {} ready",
            geometry.artifact.entry_point, pixel.artifact.entry_point
        );

        Ok(Self {
            context,
            geometry,
            pixel,
            running: Arc::default(),
        })
    }

    pub fn init_vs_ps_from_hlsl<T: HlslCompiler + DxilTools + ?Sized>(
        runtime: &Runtime,
        tools: &T,
        vertex: ShaderSource<'_>,
        pixel: ShaderSource<'_>,
    ) -> Result<Self> {
        let vertex = hlsl_artifact(runtime, tools, vertex, VERTEX_TARGET_PROFILE)?;
        let pixel = hlsl_artifact(runtime, tools, pixel, PIXEL_TARGET_PROFILE)?;
        Self::from_artifacts(runtime, ShaderStage::Vertex, vertex, pixel)
    }

    pub fn init_ms_ps_from_hlsl<T: HlslCompiler + DxilTools + ?Sized>(
        runtime: &Runtime,
        tools: &T,
        mesh: ShaderSource<'_>,
        pixel: ShaderSource<'_>,
    ) -> Result<Self> {
        let mesh = hlsl_artifact(runtime, tools, mesh, MESH_TARGET_PROFILE)?;
        let pixel = hlsl_artifact(runtime, tools, pixel, PIXEL_TARGET_PROFILE)?;
        Self::from_artifacts(runtime, ShaderStage::Mesh, mesh, pixel)
    }

    pub fn init_vs_ps_from_glsl<T: GlslCompiler + SpirvTools + HlslCompiler + DxilTools + ?Sized>(
        runtime: &Runtime,
        tools: &T,
        vertex: ShaderSource<'_>,
        pixel: ShaderSource<'_>,
    ) -> Result<Self> {
        let vertex = glsl_artifact(runtime, tools, vertex, VERTEX_TARGET_PROFILE)?;
        let pixel = glsl_artifact(runtime, tools, pixel, PIXEL_TARGET_PROFILE)?;
        Self::from_artifacts(runtime, ShaderStage::Vertex, vertex, pixel)
    }

    pub fn geometry_stage(&self) -> ShaderStage {
        self.geometry.stage
    }

    pub fn geometry_bindings(&self) -> &ResourceBindings {
        &self.geometry.bindings
    }

    pub fn pixel_bindings(&self) -> &ResourceBindings {
        &self.pixel.bindings
    }

    pub fn is_running(&self) -> bool {
        self.running.is_running()
    }

    fn check_call(&self, stage: ShaderStage) -> Result<()> {
        self.running.check_idle(RASTERIZER_ALREADY_RUNNING)?;
        if self.geometry.stage != stage {
            return Err(Error::Backend(format!(
                "The Rasterizer has no {} shader",
                stage_name(stage)
            )));
        }
        Ok(())
    }

    /// Validates targets and both resource arrays, then flips the pipeline to running.
    fn begin(
        &self,
        geometry_resources: &ResourceArray,
        pixel_resources: &ResourceArray,
        targets: &[Arc<Resource>],
    ) -> Result<()> {
        if targets.is_empty() || targets.len() > MAX_RENDER_TARGETS {
            return Err(Error::InvalidRenderTargetCount(targets.len()));
        }
        if let Some(index) = targets.iter().position(|target| target.texture_desc().is_none()) {
            return Err(Error::InvalidRenderTarget(index));
        }

        validate_resource_array(geometry_resources, &self.geometry.bindings)?;
        validate_resource_array(pixel_resources, &self.pixel.bindings)?;
        self.running.start(RASTERIZER_ALREADY_RUNNING)
    }

    /// Records the render pass around `call`: each stage binds its own resources.
    fn submit(
        &self,
        geometry_resources: &ResourceArray,
        pixel_resources: &ResourceArray,
        targets: &[Arc<Resource>],
        load: LoadAction,
        call: GpuWork,
        on_signaled: impl FnOnce(Signal) + Send + 'static,
    ) {
        let geometry_stage = self.geometry.stage;
        let geometry_shader = Arc::clone(&self.geometry.shader);
        let pixel_shader = Arc::clone(&self.pixel.shader);
        let target_handles: Vec<NativeHandle> =
            targets.iter().map(|target| Arc::clone(target.native())).collect();

        let geometry_array = geometry_resources.clone();
        let pixel_array = pixel_resources.clone();
        let work: GpuWork = Box::new(move |commands| {
            for target in &target_handles {
                commands.transition(target, ResourceState::RenderTarget);
            }
            commands.begin_render_pass(&target_handles, load)?;
            commands.set_graphics_shaders(&geometry_shader, &pixel_shader)?;

            commands.set_binding_stage(geometry_stage);
            setup_parameters(commands, &geometry_array)?;
            commands.set_binding_stage(ShaderStage::Pixel);
            setup_parameters(commands, &pixel_array)?;

            call(&mut *commands)?;
            commands.end_render_pass()
        });

        let mut tracked = geometry_resources.to_tracked();
        tracked.extend(pixel_resources.to_tracked());
        tracked.extend(targets.iter().cloned());

        let label = format!(
            "{} + {}",
            self.geometry.artifact.entry_point, self.pixel.artifact.entry_point
        );
        let finish = self.context.finish_tracked(tracked, &self.running, label, move |result| {
            on_signaled(Signal::from(result.map(|_| ())));
        });
        self.context.enqueue(work, finish);
    }

    /// Clears the targets, then draws `num_vertices` vertices as a triangle list.
    pub fn draw(
        &self,
        vertex_resources: &ResourceArray,
        pixel_resources: &ResourceArray,
        targets: &[Arc<Resource>],
        num_vertices: i32,
        on_signaled: impl FnOnce(Signal) + Send + 'static,
    ) -> Result<()> {
        let checked = self.check_call(ShaderStage::Vertex).and_then(|()| {
            if num_vertices <= 0 {
                return Err(Error::InvalidVertexCount(num_vertices));
            }
            self.begin(vertex_resources, pixel_resources, targets)
        });
        if let Err(err) = checked {
            return signal_failure(err, on_signaled);
        }

        debug!("drawing {num_vertices} vertices into {} targets", targets.len());
        let call: GpuWork = Box::new(move |commands| commands.draw(num_vertices as u32, 1));
        self.submit(
            vertex_resources,
            pixel_resources,
            targets,
            LoadAction::Clear,
            call,
            on_signaled,
        );

        Ok(())
    }

    pub fn draw_by_map(
        &self,
        vertex_resources: &HashMap<String, Arc<Resource>>,
        pixel_resources: &HashMap<String, Arc<Resource>>,
        targets: &[Arc<Resource>],
        num_vertices: i32,
        on_signaled: impl FnOnce(Signal) + Send + 'static,
    ) -> Result<()> {
        let arrays = resource_array_from_map(vertex_resources, &self.geometry.bindings).and_then(
            |vertex| Ok((vertex, resource_array_from_map(pixel_resources, &self.pixel.bindings)?)),
        );
        match arrays {
            Ok((vertex, pixel)) => self.draw(&vertex, &pixel, targets, num_vertices, on_signaled),
            Err(err) => signal_failure(err, on_signaled),
        }
    }

    /// Runs `xyz` mesh groups over the current target contents.
    pub fn dispatch_mesh(
        &self,
        mesh_resources: &ResourceArray,
        pixel_resources: &ResourceArray,
        targets: &[Arc<Resource>],
        xyz: [i32; 3],
        on_signaled: impl FnOnce(Signal) + Send + 'static,
    ) -> Result<()> {
        let [x, y, z] = xyz;
        let checked = self.check_call(ShaderStage::Mesh).and_then(|()| {
            if x <= 0 || y <= 0 || z <= 0 {
                return Err(Error::InvalidThreadGroupSize(x, y, z));
            }
            self.begin(mesh_resources, pixel_resources, targets)
        });
        if let Err(err) = checked {
            return signal_failure(err, on_signaled);
        }

        debug!("dispatching {xyz:?} mesh groups into {} targets", targets.len());
        let call: GpuWork =
            Box::new(move |commands| commands.dispatch_mesh(x as u32, y as u32, z as u32));
        self.submit(
            mesh_resources,
            pixel_resources,
            targets,
            LoadAction::Load,
            call,
            on_signaled,
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::mpsc::{self, Receiver};
    use std::time::Duration;

    use super::*;
    use crate::config::BackendKind;
    use crate::runtime::backend::PixelFormat;
    use crate::runtime::software::{MeshOutput, SoftwareBackend, VertexOutput};
    use crate::shaders::artifact_from_dxil;
    use crate::shaders::reflection::ResourceClass;
    use crate::shaders::toolchain::{ToolError, ToolResult};
    use crate::test_utils::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    const SRV_RAW_BUFFER: PsvBinding = PsvBinding {
        res_type: 4,
        res_kind: 11,
        space: 0,
        lower_bound: 0,
        upper_bound: 0,
    };
    const CBUFFER: PsvBinding = PsvBinding {
        res_type: 2,
        res_kind: 13,
        space: 0,
        lower_bound: 0,
        upper_bound: 0,
    };

    fn position() -> TestSignatureElement<'static> {
        TestSignatureElement {
            name: "SV_Position",
            index: 0,
            system_value: 1,
            register: 0,
            mask: 0xf,
        }
    }

    fn color(mask: u8) -> TestSignatureElement<'static> {
        TestSignatureElement {
            name: "COLOR",
            index: 0,
            system_value: 0,
            register: 1,
            mask,
        }
    }

    fn target() -> TestSignatureElement<'static> {
        TestSignatureElement {
            name: "SV_Target",
            index: 0,
            system_value: 64,
            register: 0,
            mask: 0xf,
        }
    }

    fn artifact(container: &[u8], entry_point: &str) -> CompiledShaderArtifact {
        artifact_from_dxil(container, entry_point, None).unwrap()
    }

    fn pixel_shader(bindings: &[PsvBinding]) -> CompiledShaderArtifact {
        let container = shader_container([1, 1, 1], &[position(), color(0x1)], &[target()], bindings);
        artifact(&container, "psmain")
    }

    fn signal_channel() -> (impl FnOnce(Signal) + Send + 'static, Receiver<Signal>) {
        let (sender, receiver) = mpsc::channel();
        (move |signal| sender.send(signal).unwrap(), receiver)
    }

    fn texels(texture: &Resource) -> Vec<u32> {
        bytemuck::pod_collect_to_vec(&texture.map_texture_slice_sync(0).unwrap())
    }

    /// positions come from a vertex stage SRV, the color scale from a pixel stage CBV
    fn triangle_pipeline() -> (Runtime, RasterizerPipeline) {
        let backend = Arc::new(SoftwareBackend::with_kind(BackendKind::D3D12));
        backend.register_vertex_kernel("vsmain", |vertex| {
            let base = vertex.vertex_id as usize * 2;
            VertexOutput {
                position: [
                    vertex.load_f32(ResourceClass::Srv, 0, base),
                    vertex.load_f32(ResourceClass::Srv, 0, base + 1),
                    0.0,
                    1.0,
                ],
                varyings: vec![2.0],
            }
        });
        backend.register_pixel_kernel("psmain", |pixel| {
            let scale = pixel.load_u32(ResourceClass::Cbv, 0, 0) as f32;
            vec![[pixel.varyings[0] * scale, 0.0, 0.0, 0.0]]
        });
        let runtime = Runtime::new(backend);

        let vertex = shader_container(
            [1, 1, 1],
            &[],
            &[position(), color(0x1)],
            &[SRV_RAW_BUFFER],
        );
        let pipeline = RasterizerPipeline::from_artifacts(
            &runtime,
            ShaderStage::Vertex,
            artifact(&vertex, "vsmain"),
            pixel_shader(&[CBUFFER]),
        )
        .unwrap();
        (runtime, pipeline)
    }

    fn triangle_resources(runtime: &Runtime) -> (ResourceArray, ResourceArray) {
        // the lower left half of the viewport
        let positions = runtime.create_srv_buffer(24).unwrap();
        positions
            .update_buffer_sync(0, bytemuck::cast_slice(&[-1.0f32, -1.0, 1.0, -1.0, -1.0, 1.0]))
            .unwrap();
        let scale = runtime.create_cbv(4).unwrap();
        scale.set_data(&3u32.to_le_bytes()).unwrap();

        let vertex = ResourceArray {
            srvs: vec![Some(positions)],
            ..Default::default()
        };
        let pixel = ResourceArray {
            cbvs: vec![Some(scale)],
            ..Default::default()
        };
        (vertex, pixel)
    }

    #[test]
    fn draw_fills_covered_pixels() {
        let (runtime, pipeline) = triangle_pipeline();
        assert_eq!(pipeline.geometry_bindings().num_srvs(), 1);
        assert_eq!(pipeline.pixel_bindings().num_cbvs(), 1);

        let (vertex, pixel) = triangle_resources(&runtime);
        let target = runtime.create_uav_texture_2d(4, 4, PixelFormat::R32Uint).unwrap();

        let (on_signaled, signals) = signal_channel();
        pipeline
            .draw(&vertex, &pixel, &[Arc::clone(&target)], 3, on_signaled)
            .unwrap();
        assert!(pipeline.is_running());

        assert_eq!(runtime.wait_signals(TIMEOUT), 1);
        assert_eq!(signals.recv().unwrap(), Signal::success());
        assert!(!pipeline.is_running());
        assert_eq!(runtime.in_flight(), 0);

        let expected: Vec<u32> = (0..4)
            .flat_map(|y| (0..4).map(move |x| if y >= x { 6 } else { 0 }))
            .collect();
        assert_eq!(texels(&target), expected);
    }

    #[test]
    fn draw_by_name() {
        let (runtime, pipeline) = triangle_pipeline();
        let (vertex, pixel) = triangle_resources(&runtime);
        let target = runtime.create_uav_texture_2d(4, 4, PixelFormat::R32Uint).unwrap();

        let mut vertex_map = HashMap::new();
        let pixel_map = HashMap::from([("cb0".to_string(), pixel.cbvs[0].clone().unwrap())]);

        let (on_signaled, signals) = signal_channel();
        let err = pipeline
            .draw_by_map(&vertex_map, &pixel_map, &[Arc::clone(&target)], 3, on_signaled)
            .unwrap_err();
        assert_eq!(err.to_string(), "Resource \"t0\" not found in supplied map");
        assert!(!signals.recv().unwrap().success);

        vertex_map.insert("t0".to_string(), vertex.srvs[0].clone().unwrap());
        let (on_signaled, signals) = signal_channel();
        pipeline
            .draw_by_map(&vertex_map, &pixel_map, &[Arc::clone(&target)], 3, on_signaled)
            .unwrap();
        runtime.wait_signals(TIMEOUT);
        assert!(signals.recv().unwrap().success);
        assert_eq!(texels(&target)[12], 6);
    }

    #[test]
    fn mesh_groups_draw_their_own_geometry() {
        let backend = Arc::new(SoftwareBackend::with_kind(BackendKind::D3D12));
        // group n covers column n of the target
        backend.register_mesh_kernel("msmain", |mesh| {
            let left = mesh.group_id[0] as f32 - 1.0;
            let value = mesh.group_id[0] as f32 + 1.0;
            let corner = |x: f32, y: f32| VertexOutput {
                position: [x, y, 0.0, 1.0],
                varyings: vec![value],
            };
            MeshOutput {
                vertices: vec![
                    corner(left, -1.0),
                    corner(left + 1.0, -1.0),
                    corner(left, 1.0),
                    corner(left + 1.0, 1.0),
                ],
                triangles: vec![[0, 1, 2], [1, 3, 2]],
            }
        });
        backend.register_pixel_kernel("psmain", |pixel| vec![[pixel.varyings[0], 0.0, 0.0, 0.0]]);
        let runtime = Runtime::new(backend);

        let mesh = shader_container([32, 1, 1], &[], &[position(), color(0x1)], &[]);
        let pipeline = RasterizerPipeline::from_artifacts(
            &runtime,
            ShaderStage::Mesh,
            artifact(&mesh, "msmain"),
            pixel_shader(&[]),
        )
        .unwrap();
        assert_eq!(pipeline.geometry_stage(), ShaderStage::Mesh);

        let target = runtime.create_uav_texture_2d(2, 1, PixelFormat::R32Uint).unwrap();
        let empty = ResourceArray::default();

        let (on_signaled, signals) = signal_channel();
        let err = pipeline
            .dispatch_mesh(&empty, &empty, &[Arc::clone(&target)], [0, 1, 1], on_signaled)
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid Thread Group Size X=0 Y=1 Z=1");
        assert!(!signals.recv().unwrap().success);

        let (on_signaled, _signals) = signal_channel();
        let err = pipeline
            .draw(&empty, &empty, &[Arc::clone(&target)], 3, on_signaled)
            .unwrap_err();
        assert_eq!(err.to_string(), "The Rasterizer has no vertex shader");

        let (on_signaled, signals) = signal_channel();
        pipeline
            .dispatch_mesh(&empty, &empty, &[Arc::clone(&target)], [2, 1, 1], on_signaled)
            .unwrap();
        runtime.wait_signals(TIMEOUT);
        assert_eq!(signals.recv().unwrap(), Signal::success());
        assert_eq!(texels(&target), [1, 2]);
    }

    #[test]
    fn semantics_must_line_up() {
        let runtime = Runtime::new(Arc::new(SoftwareBackend::with_kind(BackendKind::D3D12)));
        let pixel = pixel_shader(&[]);

        let reads_vertices = shader_container(
            [1, 1, 1],
            &[TestSignatureElement {
                name: "POSITION",
                ..color(0xf)
            }],
            &[position(), color(0x1)],
            &[],
        );
        let err = RasterizerPipeline::from_artifacts(
            &runtime,
            ShaderStage::Vertex,
            artifact(&reads_vertices, "vsmain"),
            pixel.clone(),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unsupported input semantic in vertex shader: POSITION/0"
        );

        let err = RasterizerPipeline::from_artifacts(
            &runtime,
            ShaderStage::Mesh,
            artifact(&reads_vertices, "msmain"),
            pixel.clone(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Unsupported input semantic in mesh shader: POSITION/0");

        // same semantic, wider mask
        let misaligned = shader_container([1, 1, 1], &[], &[position(), color(0x3)], &[]);
        let err = RasterizerPipeline::from_artifacts(
            &runtime,
            ShaderStage::Vertex,
            artifact(&misaligned, "vsmain"),
            pixel.clone(),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Unknown/Unaligned input semantic in pixel shader: COLOR/0 (register: 1 mask: 0x1)"
        );

        let err = RasterizerPipeline::from_artifacts(
            &runtime,
            ShaderStage::Compute,
            artifact(&misaligned, "csmain"),
            pixel,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Compute shaders cannot feed a pixel shader");
    }

    #[test]
    fn draw_validation() {
        let (runtime, pipeline) = triangle_pipeline();
        let (vertex, pixel) = triangle_resources(&runtime);
        let target = runtime.create_uav_texture_2d(4, 4, PixelFormat::R32Uint).unwrap();
        let targets = [Arc::clone(&target)];

        let draw = |targets: &[Arc<Resource>], num_vertices: i32| {
            let (on_signaled, signals) = signal_channel();
            let err = pipeline
                .draw(&vertex, &pixel, targets, num_vertices, on_signaled)
                .unwrap_err();
            assert_eq!(signals.recv().unwrap(), err.to_signal());
            err.to_string()
        };

        assert_eq!(draw(&targets, 0), "Invalid number of vertices 0");
        assert_eq!(draw(&[], 3), "Invalid number of RTVs 0");
        assert_eq!(draw(&vec![Arc::clone(&target); 9], 3), "Invalid number of RTVs 9");

        let buffer = runtime.create_uav_buffer(16).unwrap();
        assert_eq!(draw(&[Arc::clone(&target), buffer], 3), "RTV 1 is not a texture");

        let (on_signaled, _signals) = signal_channel();
        let err = pipeline
            .draw(&ResourceArray::default(), &pixel, &targets, 3, on_signaled)
            .unwrap_err();
        assert_eq!(err.to_string(), "Expected 1 SRVs got 0");
        assert!(!pipeline.is_running());

        let (on_signaled, first) = signal_channel();
        pipeline.draw(&vertex, &pixel, &targets, 3, on_signaled).unwrap();
        assert_eq!(draw(&targets, 3), RASTERIZER_ALREADY_RUNNING);

        runtime.wait_signals(TIMEOUT);
        assert!(first.recv().unwrap().success);
        assert!(!pipeline.is_running());
    }

    /// hands out the pixel container for ps profiles and the geometry one otherwise
    struct FakeDxc {
        geometry: Vec<u8>,
        pixel: Vec<u8>,
        calls: Mutex<Vec<String>>,
    }

    impl HlslCompiler for FakeDxc {
        fn compile_hlsl(&self, _source: &str, args: &[String]) -> ToolResult<Vec<u8>> {
            let (profile, entry_point) = (&args[1], &args[3]);
            self.calls.lock().unwrap().push(format!("{profile} {entry_point}"));
            Ok(if profile.starts_with("ps") {
                self.pixel.clone()
            } else {
                self.geometry.clone()
            })
        }
    }

    impl DxilTools for FakeDxc {
        fn disassemble_dxil(&self, _container: &[u8]) -> ToolResult<String> {
            Err(ToolError::Unavailable)
        }
    }

    #[test]
    fn hlsl_stages_compile_with_their_profiles() {
        let backend = Arc::new(SoftwareBackend::with_kind(BackendKind::D3D12));
        backend.register_vertex_kernel("vsmain", |_| VertexOutput::default());
        backend.register_mesh_kernel("msmain", |_| MeshOutput::default());
        backend.register_pixel_kernel("psmain", |_| Vec::new());
        let runtime = Runtime::new(backend);

        let tools = FakeDxc {
            geometry: shader_container([1, 1, 1], &[], &[position(), color(0x1)], &[]),
            pixel: shader_container([1, 1, 1], &[position(), color(0x1)], &[target()], &[CBUFFER]),
            calls: Mutex::default(),
        };
        let pixel = ShaderSource::new("float4 psmain() : SV_Target { return 0; }", "psmain");

        let pipeline = RasterizerPipeline::init_vs_ps_from_hlsl(
            &runtime,
            &tools,
            ShaderSource::new("float4 vsmain() : SV_Position { return 0; }", "vsmain"),
            pixel,
        )
        .unwrap();
        assert_eq!(pipeline.geometry_stage(), ShaderStage::Vertex);
        assert_eq!(pipeline.pixel_bindings().num_cbvs(), 1);

        let pipeline = RasterizerPipeline::init_ms_ps_from_hlsl(
            &runtime,
            &tools,
            ShaderSource::new("[outputtopology(\"triangle\")] void msmain() {}", "msmain"),
            pixel,
        )
        .unwrap();
        assert_eq!(pipeline.geometry_stage(), ShaderStage::Mesh);

        assert_eq!(
            *tools.calls.lock().unwrap(),
            ["vs_6_0 vsmain", "ps_6_0 psmain", "ms_6_5 msmain", "ps_6_0 psmain"]
        );
    }
}
