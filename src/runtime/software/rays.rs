//! Ray tracing stages for the cpu backend.
//!
//! There are no acceleration structures, so every traced ray misses.

use std::ops::Deref;
use std::sync::Arc;

use super::StageResources;
use crate::runtime::backend::RayShaderKind;

pub type RayPayload = [f32; 4];

/// runs once per launch index
pub type RayGenKernel = Arc<dyn Fn(&RayGenInvocation<'_>) + Send + Sync>;

/// miss and hit group shaders only see the payload of the ray
pub type RayKernel = Arc<dyn Fn(&mut RayPayload) + Send + Sync>;

pub struct RayGenInvocation<'a> {
    pub launch_id: [u32; 3],
    pub launch_size: [u32; 3],
    miss: &'a RayKernel,
    resources: StageResources<'a>,
}

impl RayGenInvocation<'_> {
    /// runs the miss shader on `payload`
    pub fn trace(&self, payload: &mut RayPayload) {
        (self.miss)(payload);
    }
}

impl<'a> Deref for RayGenInvocation<'a> {
    type Target = StageResources<'a>;

    fn deref(&self) -> &Self::Target {
        &self.resources
    }
}

pub(super) enum RayShaderKernel {
    RayGen(RayGenKernel),
    Miss(RayKernel),
    HitGroup(RayKernel),
}

pub(super) struct SoftRayShader {
    pub entry_point: String,
    pub kernel: RayShaderKernel,
}

impl SoftRayShader {
    pub fn kind(&self) -> RayShaderKind {
        match self.kernel {
            RayShaderKernel::RayGen(_) => RayShaderKind::RayGen,
            RayShaderKernel::Miss(_) => RayShaderKind::Miss,
            RayShaderKernel::HitGroup(_) => RayShaderKind::HitGroup,
        }
    }
}

pub(super) fn dispatch_rays(
    ray_gen: &RayGenKernel,
    miss: &RayKernel,
    resources: StageResources<'_>,
    launch_size: [u32; 3],
) {
    let [width, height, depth] = launch_size;
    for z in 0..depth {
        for y in 0..height {
            for x in 0..width {
                ray_gen(&RayGenInvocation {
                    launch_id: [x, y, z],
                    launch_size,
                    miss,
                    resources,
                });
            }
        }
    }
}
