//! Component type registry: which ECS components are mirrored, and where.
//!
//! Built once from explicit registrations. Each entry maps a bevy
//! [`ComponentId`] to a GPU SoA slot with a fixed element size and alignment.
//! Entries also get a dense ordinal (registration order) used as a bit in the
//! per-entity dirty masks, which caps the registry at [`MAX_COMPONENT_TYPES`].

use bevy::ecs::component::ComponentId;
use bevy::prelude::*;
use hashbrown::HashMap;

use crate::error::GpuSceneError;

pub const MAX_COMPONENT_TYPES: usize = 64;
/// Largest alignment a segment may request. Matches the upload alignment.
pub const MAX_ELEMENT_ALIGN: u32 = 256;

/// Layout descriptor for one mirrored component type.
///
/// Every described component is plain data: its bytes are all initialized,
/// so the upload scan may view a live value as `&[u8]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentTypeInfo {
    component_id: ComponentId,
    soa_index: u32,
    element_size: u32,
    element_align: u32,
    name: String,
}

impl ComponentTypeInfo {
    /// Describe a component by id.
    ///
    /// # Safety
    ///
    /// The component behind `component_id` must have no padding or other
    /// uninitialized bytes, as with any [`bytemuck::NoUninit`] type. The scan
    /// reads its values as raw bytes.
    pub unsafe fn new(
        component_id: ComponentId,
        soa_index: u32,
        element_size: u32,
        element_align: u32,
        name: impl Into<String>,
    ) -> Self {
        Self { component_id, soa_index, element_size, element_align, name: name.into() }
    }

    /// Registers `T` with `world` and describes it with its Rust layout.
    ///
    /// `T` must be padding-free:
    ///
    /// ```compile_fail
    /// use bevy::prelude::*;
    /// use gpu_scene::registry::ComponentTypeInfo;
    ///
    /// #[derive(Component, Clone, Copy)]
    /// #[repr(C)]
    /// struct Padded {
    ///     flag: u8,
    ///     value: u32,
    /// }
    ///
    /// let mut world = World::new();
    /// ComponentTypeInfo::of::<Padded>(&mut world, 0, "Padded");
    /// ```
    pub fn of<T: Component + bytemuck::NoUninit>(
        world: &mut World,
        soa_index: u32,
        name: impl Into<String>,
    ) -> Self {
        let component_id = world.register_component::<T>();
        // SAFETY: `T: NoUninit` has no padding or uninitialized bytes.
        unsafe {
            Self::new(
                component_id,
                soa_index,
                std::mem::size_of::<T>() as u32,
                std::mem::align_of::<T>() as u32,
                name,
            )
        }
    }

    pub fn component_id(&self) -> ComponentId {
        self.component_id
    }

    pub fn soa_index(&self) -> u32 {
        self.soa_index
    }

    pub fn element_size(&self) -> u32 {
        self.element_size
    }

    pub fn element_align(&self) -> u32 {
        self.element_align
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self) -> Result<(), GpuSceneError> {
        let invalid = |reason: &str| GpuSceneError::InvalidComponent {
            name: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.element_size == 0 {
            return Err(invalid("zero-sized components carry no GPU data"));
        }
        // The scatter shader moves whole 32-bit words.
        if self.element_size % 4 != 0 {
            return Err(invalid("element size must be a multiple of 4 bytes"));
        }
        if !self.element_align.is_power_of_two() || self.element_align > MAX_ELEMENT_ALIGN {
            return Err(invalid("element alignment must be a power of two no larger than 256"));
        }
        Ok(())
    }
}

#[derive(Default, Debug)]
pub struct ComponentRegistry {
    infos: Vec<ComponentTypeInfo>,
    by_component: HashMap<ComponentId, usize>,
    by_slot: HashMap<u32, usize>,
    transform: Option<usize>,
}

impl ComponentRegistry {
    pub fn new(infos: Vec<ComponentTypeInfo>) -> Result<Self, GpuSceneError> {
        if infos.len() > MAX_COMPONENT_TYPES {
            return Err(GpuSceneError::Config(format!(
                "{} component types registered, at most {} are supported",
                infos.len(),
                MAX_COMPONENT_TYPES
            )));
        }

        let mut registry = Self::default();
        for (ordinal, info) in infos.iter().enumerate() {
            info.validate()?;
            if registry.by_slot.insert(info.soa_index, ordinal).is_some() {
                return Err(GpuSceneError::DuplicateSlot(info.soa_index));
            }
            if registry.by_component.insert(info.component_id, ordinal).is_some() {
                return Err(GpuSceneError::InvalidComponent {
                    name: info.name.clone(),
                    reason: "component type registered twice".into(),
                });
            }
            info!(
                "GPU scene component `{}`: slot {}, size {}, align {}",
                info.name, info.soa_index, info.element_size, info.element_align
            );
        }
        registry.infos = infos;
        Ok(registry)
    }

    /// Marks the slot whose uploads also refresh acceleration-structure transforms.
    pub fn set_transform_slot(&mut self, soa_index: u32) -> Result<(), GpuSceneError> {
        let Some(&ordinal) = self.by_slot.get(&soa_index) else {
            return Err(GpuSceneError::Config(format!(
                "transform slot {soa_index} is not registered"
            )));
        };
        self.transform = Some(ordinal);
        Ok(())
    }

    pub fn component_soa_index(&self, component: ComponentId) -> Option<u32> {
        self.by_component.get(&component).map(|&i| self.infos[i].soa_index)
    }

    pub fn component_type(&self, soa_index: u32) -> Option<ComponentId> {
        self.by_slot.get(&soa_index).map(|&i| self.infos[i].component_id)
    }

    pub fn is_registered(&self, component: ComponentId) -> bool {
        self.by_component.contains_key(&component)
    }

    /// Dense ordinal and descriptor for a registered component.
    pub fn lookup(&self, component: ComponentId) -> Option<(usize, &ComponentTypeInfo)> {
        self.by_component.get(&component).map(|&i| (i, &self.infos[i]))
    }

    pub fn get(&self, ordinal: usize) -> Option<&ComponentTypeInfo> {
        self.infos.get(ordinal)
    }

    pub fn transform_ordinal(&self) -> Option<usize> {
        self.transform
    }

    pub fn iter(&self) -> impl Iterator<Item = &ComponentTypeInfo> {
        self.infos.iter()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Dirty mask with every registered component set.
    pub fn all_mask(&self) -> u64 {
        match self.infos.len() {
            0 => 0,
            MAX_COMPONENT_TYPES => u64::MAX,
            n => (1u64 << n) - 1,
        }
    }

    /// Total bytes of every registered component for one instance.
    pub fn instance_bytes(&self) -> u64 {
        self.infos.iter().map(|i| i.element_size as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: usize, slot: u32, size: u32) -> ComponentTypeInfo {
        // SAFETY: these ids are never read from a world.
        unsafe { ComponentTypeInfo::new(ComponentId::new(id), slot, size, 4, format!("c{id}")) }
    }

    #[test]
    fn lookups_go_both_ways() {
        let registry = ComponentRegistry::new(vec![info(7, 0, 12), info(9, 3, 16)]).unwrap();
        assert_eq!(registry.component_soa_index(ComponentId::new(9)), Some(3));
        assert_eq!(registry.component_type(0), Some(ComponentId::new(7)));
        assert!(registry.is_registered(ComponentId::new(7)));
        assert!(!registry.is_registered(ComponentId::new(8)));
        assert_eq!(registry.component_type(1), None);
        assert_eq!(registry.all_mask(), 0b11);
        assert_eq!(registry.instance_bytes(), 28);
    }

    #[test]
    fn rejects_duplicate_slots_and_bad_sizes() {
        let dup = ComponentRegistry::new(vec![info(1, 2, 4), info(2, 2, 4)]);
        assert!(matches!(dup, Err(GpuSceneError::DuplicateSlot(2))));

        let odd = ComponentRegistry::new(vec![info(1, 0, 6)]);
        assert!(matches!(odd, Err(GpuSceneError::InvalidComponent { .. })));
    }

    #[test]
    fn transform_slot_must_exist() {
        let mut registry = ComponentRegistry::new(vec![info(1, 5, 64)]).unwrap();
        assert!(registry.set_transform_slot(4).is_err());
        registry.set_transform_slot(5).unwrap();
        assert_eq!(registry.transform_ordinal(), Some(0));
    }

    #[test]
    fn of_reads_rust_layout() {
        #[repr(C)]
        #[derive(Component, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
        struct Position([f32; 3]);

        let mut world = World::new();
        let info = ComponentTypeInfo::of::<Position>(&mut world, 0, "Position");
        assert_eq!(info.element_size(), 12);
        assert_eq!(info.element_align(), 4);
        assert_eq!(world.component_id::<Position>(), Some(info.component_id()));
    }
}
