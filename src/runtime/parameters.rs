use log::*;

use super::backend::{ParameterBinder, ResourceState};
use crate::bindings::ResourceArray;
use crate::error::Result;

/// Binds a validated resource array, slot by slot, through any stage's binder.
///
/// Dirty constant data is uploaded before its CBV is bound.
pub fn setup_parameters<B: ParameterBinder + ?Sized>(
    binder: &mut B,
    resources: &ResourceArray,
) -> Result<()> {
    for (slot, cbv) in resources.cbvs.iter().enumerate() {
        let Some(cbv) = cbv else { continue };
        cbv.sync_constant_data(binder)?;
        binder.bind_uniform_buffer(slot as u32, cbv.native());
    }

    for (slot, srv) in resources.srvs.iter().enumerate() {
        let Some(srv) = srv else { continue };
        binder.transition(srv.native(), ResourceState::ShaderRead);
        binder.bind_srv(slot as u32, srv.native());
    }

    for (slot, uav) in resources.uavs.iter().enumerate() {
        let Some(uav) = uav else { continue };
        binder.transition(uav.native(), ResourceState::UnorderedAccess);
        binder.bind_uav(slot as u32, uav.native());
    }

    for (slot, sampler) in resources.samplers.iter().enumerate() {
        let Some(sampler) = sampler else { continue };
        binder.bind_sampler(slot as u32, sampler.native());
    }

    trace!(
        "bound {} cbvs, {} srvs, {} uavs, {} samplers",
        resources.cbvs.len(),
        resources.srvs.len(),
        resources.uavs.len(),
        resources.samplers.len()
    );

    Ok(())
}
