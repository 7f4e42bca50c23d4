//! The binding table callers dispatch against, and validation of what they supply.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::*;

use crate::error::{Error, Result};
use crate::runtime::resource::Resource;
use crate::shaders::reflection::{
    ResourceClass, SRV_BINDING_SHIFT, ShaderResourceBinding, ShaderResourceBindings,
};

pub type ResourceBinding = ShaderResourceBinding;

/// one class of bindings, indexed three ways
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingCategory {
    /// in slot order
    pub bindings: Vec<ResourceBinding>,
    pub by_name: HashMap<String, ResourceBinding>,
    pub by_slot: BTreeMap<u32, ResourceBinding>,
    /// highest slot + 1
    pub count: u32,
}

/// every class spans one 1024-wide binding range, so no slot can reach past it
pub const MAX_SLOTS: u32 = SRV_BINDING_SHIFT;

impl BindingCategory {
    fn new(class: ResourceClass, raw: &[ShaderResourceBinding]) -> Result<Self> {
        let mut category = Self::default();
        for binding in raw {
            if binding.slot_index >= MAX_SLOTS {
                return Err(Error::InvalidSlot {
                    class,
                    slot: binding.slot_index,
                    name: binding.name.clone(),
                });
            }
            category.count = category.count.max(binding.slot_index + 1);
            category.bindings.push(binding.clone());
            category.by_name.insert(binding.name.clone(), binding.clone());
            category.by_slot.insert(binding.slot_index, binding.clone());
        }
        category.bindings.sort_by_key(|binding| binding.slot_index);

        Ok(category)
    }

    fn has_holes(&self) -> bool {
        (0..self.count).any(|slot| !self.by_slot.contains_key(&slot))
    }

    pub fn get(&self, name: &str) -> Option<&ResourceBinding> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceBindings {
    pub cbvs: BindingCategory,
    pub srvs: BindingCategory,
    pub uavs: BindingCategory,
    pub samplers: BindingCategory,
}

impl ResourceBindings {
    /// Builds the table. Only the CBV slots have to be contiguous.
    pub fn create(raw: &ShaderResourceBindings) -> Result<Self> {
        Self::build(raw, &[ResourceClass::Cbv])
    }

    /// like [`ResourceBindings::create`], but every class has to be contiguous
    pub fn create_strict(raw: &ShaderResourceBindings) -> Result<Self> {
        Self::build(raw, &ResourceClass::ALL)
    }

    fn build(raw: &ShaderResourceBindings, contiguous: &[ResourceClass]) -> Result<Self> {
        let table = Self {
            cbvs: BindingCategory::new(ResourceClass::Cbv, &raw.cbvs)?,
            srvs: BindingCategory::new(ResourceClass::Srv, &raw.srvs)?,
            uavs: BindingCategory::new(ResourceClass::Uav, &raw.uavs)?,
            samplers: BindingCategory::new(ResourceClass::Sampler, &raw.samplers)?,
        };

        for &class in contiguous {
            if table.category(class).has_holes() {
                return Err(Error::BindingHole(class));
            }
        }

        debug!(
            "binding table: {} cbvs, {} srvs, {} uavs, {} samplers",
            table.cbvs.count, table.srvs.count, table.uavs.count, table.samplers.count
        );

        Ok(table)
    }

    pub fn category(&self, class: ResourceClass) -> &BindingCategory {
        match class {
            ResourceClass::Cbv => &self.cbvs,
            ResourceClass::Srv => &self.srvs,
            ResourceClass::Uav => &self.uavs,
            ResourceClass::Sampler => &self.samplers,
        }
    }

    pub fn num_cbvs(&self) -> u32 {
        self.cbvs.count
    }

    pub fn num_srvs(&self) -> u32 {
        self.srvs.count
    }

    pub fn num_uavs(&self) -> u32 {
        self.uavs.count
    }

    pub fn num_samplers(&self) -> u32 {
        self.samplers.count
    }
}

/// caller resources, positionally aligned with the binding table; `None` is a null handle
#[derive(Debug, Clone, Default)]
pub struct ResourceArray {
    pub cbvs: Vec<Option<Arc<Resource>>>,
    pub srvs: Vec<Option<Arc<Resource>>>,
    pub uavs: Vec<Option<Arc<Resource>>>,
    pub samplers: Vec<Option<Arc<Resource>>>,
}

impl ResourceArray {
    pub fn slots(&self, class: ResourceClass) -> &[Option<Arc<Resource>>] {
        match class {
            ResourceClass::Cbv => &self.cbvs,
            ResourceClass::Srv => &self.srvs,
            ResourceClass::Uav => &self.uavs,
            ResourceClass::Sampler => &self.samplers,
        }
    }

    fn slots_mut(&mut self, class: ResourceClass) -> &mut Vec<Option<Arc<Resource>>> {
        match class {
            ResourceClass::Cbv => &mut self.cbvs,
            ResourceClass::Srv => &mut self.srvs,
            ResourceClass::Uav => &mut self.uavs,
            ResourceClass::Sampler => &mut self.samplers,
        }
    }

    /// strong references to every non-null entry
    pub fn to_tracked(&self) -> Vec<Arc<Resource>> {
        ResourceClass::ALL
            .iter()
            .flat_map(|&class| self.slots(class).iter().flatten())
            .cloned()
            .collect()
    }
}

/// Checks counts, then nulls, one class at a time.
///
/// Slots the table leaves unassigned (holes outside the CBVs) may stay null.
pub fn validate_resource_array(array: &ResourceArray, table: &ResourceBindings) -> Result<()> {
    for class in ResourceClass::ALL {
        let category = table.category(class);
        let slots = array.slots(class);

        if slots.len() != category.count as usize {
            return Err(Error::BindingCountMismatch {
                class,
                expected: category.count,
                actual: slots.len(),
            });
        }

        let null = slots.iter().enumerate().find_map(|(index, slot)| match slot {
            None => category.by_slot.get(&(index as u32)).map(|binding| (index, binding)),
            Some(_) => None,
        });
        if let Some((index, binding)) = null {
            return Err(Error::NullBinding {
                class,
                index,
                name: binding.name.clone(),
            });
        }
    }

    Ok(())
}

/// Looks up every binding of the table by name and lays the resources out by slot.
pub fn resource_array_from_map(
    map: &HashMap<String, Arc<Resource>>,
    table: &ResourceBindings,
) -> Result<ResourceArray> {
    let mut array = ResourceArray::default();

    for class in ResourceClass::ALL {
        let category = table.category(class);
        let slots = array.slots_mut(class);
        slots.resize(category.count as usize, None);

        for binding in &category.bindings {
            let resource = map
                .get(&binding.name)
                .ok_or_else(|| Error::MissingNamedResource(binding.name.clone()))?;
            if resource.class() != class {
                return Err(Error::WrongResourceKind {
                    name: binding.name.clone(),
                    expected: class,
                });
            }
            slots[binding.slot_index as usize] = Some(Arc::clone(resource));
        }
    }

    Ok(array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::runtime::software::SoftwareBackend;
    use crate::shaders::reflection::ShaderResourceType;

    fn binding(name: &str, binding_index: u32, slot_index: u32) -> ShaderResourceBinding {
        ShaderResourceBinding {
            binding_index,
            slot_index,
            name: name.to_string(),
            resource_type: ShaderResourceType::Buffer,
        }
    }

    fn table() -> ResourceBindings {
        let raw = ShaderResourceBindings {
            cbvs: vec![binding("Params", 0, 0)],
            srvs: vec![binding("Input", 1024, 0), binding("Lut", 1027, 1)],
            uavs: vec![binding("Output", 2048, 0)],
            ..Default::default()
        };
        ResourceBindings::create(&raw).unwrap()
    }

    #[test]
    fn counts_and_lookups() {
        let table = table();
        assert_eq!(
            (table.num_cbvs(), table.num_srvs(), table.num_uavs(), table.num_samplers()),
            (1, 2, 1, 0)
        );
        assert_eq!(table.srvs.get("Lut").map(|b| b.slot_index), Some(1));
        assert_eq!(table.srvs.by_slot[&0].name, "Input");
        assert!(table.samplers.is_empty());
    }

    #[test]
    fn cbv_holes() {
        let raw = ShaderResourceBindings {
            cbvs: vec![binding("A", 0, 0), binding("C", 2, 2)],
            ..Default::default()
        };
        let err = ResourceBindings::create(&raw).unwrap_err();
        assert_eq!(err.to_string(), "Binding holes not allowed in CBVs");
    }

    #[test]
    fn holes_outside_cbvs() {
        let raw = ShaderResourceBindings {
            uavs: vec![binding("A", 2048, 0), binding("C", 2050, 2)],
            ..Default::default()
        };
        let table = ResourceBindings::create(&raw).unwrap();
        assert_eq!(table.num_uavs(), 3);

        let err = ResourceBindings::create_strict(&raw).unwrap_err();
        assert_eq!(err.to_string(), "Binding holes not allowed in UAVs");
    }

    #[test]
    fn unassigned_slots_may_stay_null() {
        let runtime = Runtime::new(Arc::new(SoftwareBackend::new()));
        let raw = ShaderResourceBindings {
            srvs: vec![binding("First", 1024, 0), binding("Third", 1026, 2)],
            ..Default::default()
        };
        let table = ResourceBindings::create(&raw).unwrap();

        let mut map = HashMap::new();
        map.insert("First".to_string(), runtime.create_srv_buffer(16).unwrap());
        map.insert("Third".to_string(), runtime.create_srv_buffer(16).unwrap());
        let array = resource_array_from_map(&map, &table).unwrap();
        assert_eq!(array.srvs.len(), 3);
        assert!(array.srvs[1].is_none());
        validate_resource_array(&array, &table).unwrap();

        // declared slots still have to be bound
        let array = ResourceArray {
            srvs: vec![array.srvs[0].clone(), None, None],
            ..Default::default()
        };
        let err = validate_resource_array(&array, &table).unwrap_err();
        assert_eq!(err.to_string(), "SRV 2 (Third) cannot be null");
    }

    #[test]
    fn slots_past_the_binding_range() {
        let raw = ShaderResourceBindings {
            srvs: vec![binding("Broken", 1024, u32::MAX)],
            ..Default::default()
        };
        let err = ResourceBindings::create(&raw).unwrap_err();
        assert_eq!(err.to_string(), "Invalid SRV slot 4294967295 for Broken");

        let raw = ShaderResourceBindings {
            uavs: vec![binding("Last", 3071, MAX_SLOTS - 1)],
            ..Default::default()
        };
        assert_eq!(ResourceBindings::create(&raw).unwrap().num_uavs(), MAX_SLOTS);
    }

    #[test]
    fn array_validation() {
        let runtime = Runtime::new(Arc::new(SoftwareBackend::new()));
        let table = table();
        let cbv = runtime.create_cbv(16).unwrap();
        let srv = runtime.create_srv_buffer(16).unwrap();
        let uav = runtime.create_uav_buffer(16).unwrap();

        let mut array = ResourceArray {
            cbvs: vec![Some(cbv)],
            srvs: vec![Some(srv.clone())],
            uavs: vec![None],
            samplers: vec![],
        };
        let err = validate_resource_array(&array, &table).unwrap_err();
        assert_eq!(err.to_string(), "Expected 2 SRVs got 1");

        array.srvs.push(Some(srv));
        let err = validate_resource_array(&array, &table).unwrap_err();
        assert_eq!(err.to_string(), "UAV 0 (Output) cannot be null");

        array.uavs[0] = Some(uav);
        validate_resource_array(&array, &table).unwrap();
        assert_eq!(array.to_tracked().len(), 4);
    }

    #[test]
    fn array_from_map() {
        let runtime = Runtime::new(Arc::new(SoftwareBackend::new()));
        let table = table();

        let mut map = HashMap::new();
        map.insert("Params".to_string(), runtime.create_cbv(16).unwrap());
        map.insert("Input".to_string(), runtime.create_srv_buffer(16).unwrap());

        let err = resource_array_from_map(&map, &table).unwrap_err();
        assert_eq!(err.to_string(), "Resource \"Lut\" not found in supplied map");

        map.insert("Lut".to_string(), runtime.create_srv_buffer(16).unwrap());
        map.insert("Output".to_string(), runtime.create_srv_buffer(16).unwrap());
        let err = resource_array_from_map(&map, &table).unwrap_err();
        assert_eq!(err.to_string(), "Expected \"Output\" to be an UAV");

        let output = runtime.create_uav_buffer(16).unwrap();
        map.insert("Output".to_string(), Arc::clone(&output));
        let array = resource_array_from_map(&map, &table).unwrap();
        validate_resource_array(&array, &table).unwrap();
        assert!(Arc::ptr_eq(array.uavs[0].as_ref().unwrap(), &output));
        assert!(Arc::ptr_eq(array.srvs[1].as_ref().unwrap(), &map["Lut"]));
    }
}
