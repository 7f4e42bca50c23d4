pub mod bindings;
pub mod config;
pub mod error;
pub mod runtime;
pub mod shaders;
pub mod util;

#[cfg(test)]
pub mod test_utils;

pub use bindings::{ResourceArray, ResourceBindings};
pub use error::{Error, Result, Signal};
pub use runtime::compute::ComputePipeline;
pub use runtime::rasterizer::RasterizerPipeline;
pub use runtime::ray_tracer::RayTracerPipeline;
pub use runtime::resource::Resource;
pub use runtime::{DispatchPass, Runtime, dispatch_passes};
pub use shaders::{ShaderSource, build_tasks};
