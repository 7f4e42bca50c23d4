//! Graphics stages for the cpu backend: vertex, mesh and pixel kernels plus a
//! scan converter that runs pixel kernels at covered pixel centers.

use std::ops::Deref;
use std::sync::Arc;

use log::*;

use super::{SoftTexture, StageResources, lock};
use crate::error::{Error, Result};
use crate::runtime::backend::{NativeHandle, PixelFormat};

/// runs once per vertex of a draw
pub type VertexKernel = Arc<dyn Fn(&VertexInvocation<'_>) -> VertexOutput + Send + Sync>;

/// returns one color per render target; an empty result discards the pixel
pub type PixelKernel = Arc<dyn Fn(&PixelInvocation<'_>) -> Vec<[f32; 4]> + Send + Sync>;

/// runs once per thread group and emits the whole group's geometry
pub type MeshKernel = Arc<dyn Fn(&MeshInvocation<'_>) -> MeshOutput + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VertexOutput {
    /// clip space
    pub position: [f32; 4],
    /// interpolated across the triangle before reaching the pixel kernel
    pub varyings: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshOutput {
    pub vertices: Vec<VertexOutput>,
    /// indices into `vertices`
    pub triangles: Vec<[u32; 3]>,
}

pub struct VertexInvocation<'a> {
    pub vertex_id: u32,
    pub instance_id: u32,
    pub(super) resources: StageResources<'a>,
}

impl<'a> Deref for VertexInvocation<'a> {
    type Target = StageResources<'a>;

    fn deref(&self) -> &Self::Target {
        &self.resources
    }
}

pub struct MeshInvocation<'a> {
    pub group_id: [u32; 3],
    pub(super) resources: StageResources<'a>,
}

impl<'a> Deref for MeshInvocation<'a> {
    type Target = StageResources<'a>;

    fn deref(&self) -> &Self::Target {
        &self.resources
    }
}

pub struct PixelInvocation<'a> {
    /// pixel center in render target coordinates
    pub position: [f32; 2],
    pub varyings: &'a [f32],
    pub(super) resources: StageResources<'a>,
}

impl<'a> Deref for PixelInvocation<'a> {
    type Target = StageResources<'a>;

    fn deref(&self) -> &Self::Target {
        &self.resources
    }
}

pub(super) enum GraphicsKernel {
    Vertex(VertexKernel),
    Pixel(PixelKernel),
    Mesh(MeshKernel),
}

pub(super) struct SoftGraphicsShader {
    pub entry_point: String,
    pub kernel: GraphicsKernel,
}

impl SoftGraphicsShader {
    pub fn pixel_kernel(&self) -> Result<&PixelKernel> {
        match &self.kernel {
            GraphicsKernel::Pixel(kernel) => Ok(kernel),
            _ => Err(Error::Backend(format!("{} is not a pixel shader", self.entry_point))),
        }
    }
}

pub(super) struct RenderPass {
    targets: Vec<NativeHandle>,
    width: u32,
    height: u32,
}

impl RenderPass {
    pub fn begin(targets: &[NativeHandle], clear: bool) -> Result<Self> {
        let mut viewport = None;
        for (index, target) in targets.iter().enumerate() {
            let texture = target
                .downcast_ref::<SoftTexture>()
                .ok_or_else(|| Error::Backend(format!("Render target {index} is not a texture")))?;
            if clear {
                lock(&texture.bytes).fill(0);
            }
            viewport.get_or_insert((texture.desc.width, texture.desc.height));
        }

        let (width, height) = viewport
            .ok_or_else(|| Error::Backend("A render pass needs at least one target".to_string()))?;
        trace!("render pass {width}x{height}, {} targets", targets.len());

        Ok(Self {
            targets: targets.to_vec(),
            width,
            height,
        })
    }

    /// clip space to [x, y, 1/w] in pixels, y pointing down
    fn to_screen(&self, [x, y, _, w]: [f32; 4]) -> [f32; 3] {
        let inv_w = 1.0 / w;
        [
            (x * inv_w + 1.0) * 0.5 * self.width as f32,
            (1.0 - y * inv_w) * 0.5 * self.height as f32,
            inv_w,
        ]
    }

    /// Runs `pixel` at every pixel center inside the triangle, edges included.
    /// Both windings are drawn.
    fn rasterize(
        &self,
        triangle: [&VertexOutput; 3],
        pixel: &PixelKernel,
        resources: StageResources<'_>,
    ) {
        let screen = triangle.map(|vertex| self.to_screen(vertex.position));
        let area = edge(screen[0], screen[1], screen[2]);
        if area == 0.0 || !area.is_finite() {
            return;
        }

        let xs = screen.map(|p| p[0]);
        let ys = screen.map(|p| p[1]);
        let min_x = xs.iter().copied().fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
        let max_x = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max).ceil().min(self.width as f32) as u32;
        let min_y = ys.iter().copied().fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
        let max_y = ys.iter().copied().fold(f32::NEG_INFINITY, f32::max).ceil().min(self.height as f32) as u32;

        let num_varyings = triangle.iter().map(|v| v.varyings.len()).min().unwrap_or(0);
        let mut varyings = vec![0.0; num_varyings];

        for y in min_y..max_y {
            for x in min_x..max_x {
                let center = [x as f32 + 0.5, y as f32 + 0.5, 0.0];
                let weights = [
                    edge(screen[1], screen[2], center) / area,
                    edge(screen[2], screen[0], center) / area,
                    edge(screen[0], screen[1], center) / area,
                ];
                if weights.iter().any(|weight| *weight < 0.0) {
                    continue;
                }

                // perspective correct
                let corrected = [0, 1, 2].map(|v| weights[v] * screen[v][2]);
                let total: f32 = corrected.iter().sum();
                for (index, varying) in varyings.iter_mut().enumerate() {
                    *varying = (0..3)
                        .map(|v| corrected[v] * triangle[v].varyings[index])
                        .sum::<f32>()
                        / total;
                }

                let invocation = PixelInvocation {
                    position: [center[0], center[1]],
                    varyings: &varyings,
                    resources,
                };
                for (target, color) in self.targets.iter().zip(pixel(&invocation)) {
                    write_pixel(target, x, y, color);
                }
            }
        }
    }
}

fn edge(a: [f32; 3], b: [f32; 3], p: [f32; 3]) -> f32 {
    (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0])
}

/// a shader color as texel bytes of `format`
pub(super) fn encode_color(format: PixelFormat, color: [f32; 4]) -> Vec<u8> {
    match format {
        PixelFormat::R32Uint => (color[0] as u32).to_le_bytes().to_vec(),
        PixelFormat::R32Float => color[0].to_le_bytes().to_vec(),
        PixelFormat::Rgba8Unorm => color
            .iter()
            .map(|channel| (channel.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect(),
        PixelFormat::Rgba32Float => bytemuck::cast_slice(&color).to_vec(),
    }
}

fn write_pixel(target: &NativeHandle, x: u32, y: u32, color: [f32; 4]) {
    let Some(texture) = target.downcast_ref::<SoftTexture>() else {
        return;
    };
    let desc = texture.desc;
    if x >= desc.width || y >= desc.height {
        return;
    }

    let texel = encode_color(desc.format, color);
    let offset = ((y as u64 * desc.width as u64 + x as u64) * desc.format.bytes_per_pixel() as u64) as usize;
    if let Some(destination) = lock(&texture.bytes).get_mut(offset..offset + texel.len()) {
        destination.copy_from_slice(&texel);
    }
}

/// Non-indexed triangle list; trailing vertices that do not make a triangle are dropped.
pub(super) fn draw(
    pass: &RenderPass,
    vertex: &VertexKernel,
    pixel: &PixelKernel,
    [vertex_resources, pixel_resources]: [StageResources<'_>; 2],
    num_vertices: u32,
    num_instances: u32,
) {
    for instance_id in 0..num_instances {
        let vertices: Vec<VertexOutput> = (0..num_vertices)
            .map(|vertex_id| {
                vertex(&VertexInvocation {
                    vertex_id,
                    instance_id,
                    resources: vertex_resources,
                })
            })
            .collect();

        for triangle in vertices.chunks_exact(3) {
            pass.rasterize([&triangle[0], &triangle[1], &triangle[2]], pixel, pixel_resources);
        }
    }
}

pub(super) fn dispatch_mesh(
    pass: &RenderPass,
    mesh: &MeshKernel,
    pixel: &PixelKernel,
    [mesh_resources, pixel_resources]: [StageResources<'_>; 2],
    [x, y, z]: [u32; 3],
) -> Result<()> {
    for group_z in 0..z {
        for group_y in 0..y {
            for group_x in 0..x {
                let group_id = [group_x, group_y, group_z];
                let output = mesh(&MeshInvocation {
                    group_id,
                    resources: mesh_resources,
                });

                let vertex = |index: u32| {
                    output.vertices.get(index as usize).ok_or_else(|| {
                        Error::Backend(format!(
                            "Mesh group {group_id:?} indexes vertex {index} of {}",
                            output.vertices.len()
                        ))
                    })
                };
                for &[a, b, c] in &output.triangles {
                    pass.rasterize([vertex(a)?, vertex(b)?, vertex(c)?], pixel, pixel_resources);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_encoding() {
        assert_eq!(encode_color(PixelFormat::R32Uint, [7.9, 0.0, 0.0, 0.0]), 7u32.to_le_bytes());
        assert_eq!(
            encode_color(PixelFormat::Rgba8Unorm, [1.0, 0.5, -1.0, 2.0]),
            [255, 128, 0, 255]
        );
        assert_eq!(encode_color(PixelFormat::Rgba32Float, [1.0; 4]).len(), 16);
    }

    #[test]
    fn edge_function_sign_follows_the_side() {
        let a = [0.0, 0.0, 1.0];
        let b = [4.0, 0.0, 1.0];
        assert!(edge(a, b, [2.0, 1.0, 0.0]) > 0.0);
        assert!(edge(a, b, [2.0, -1.0, 0.0]) < 0.0);
        assert_eq!(edge(a, b, [2.0, 0.0, 0.0]), 0.0);
    }
}
