use std::sync::Arc;

use super::resource::Resource;

/// a slot in the [`ResourceTracker`]; consumed by `untrack`
#[derive(Debug, PartialEq, Eq)]
pub struct TrackingHandle {
    index: usize,
}

/// Keeps caller resources alive while gpu work that uses them is in flight.
///
/// Every accepted dispatch owns one slot until its completion is processed.
/// Freed slots are reused, so a handle is only meaningful until it is untracked.
#[derive(Default)]
pub struct ResourceTracker {
    slots: Vec<Option<Vec<Arc<Resource>>>>,
    free: Vec<usize>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, resources: Vec<Arc<Resource>>) -> TrackingHandle {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(resources);
                TrackingHandle { index }
            }
            None => {
                let handle = TrackingHandle {
                    index: self.slots.len(),
                };
                self.slots.push(Some(resources));
                handle
            }
        }
    }

    /// releases the slot and hands back the strong references it held
    pub fn untrack(&mut self, handle: TrackingHandle) -> Vec<Arc<Resource>> {
        let Some(resources) = self.slots.get_mut(handle.index).and_then(Option::take) else {
            return vec![];
        };
        self.free.push(handle.index);
        resources
    }

    /// number of dispatches currently holding resources
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}
