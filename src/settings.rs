//! GPU scene configuration, persisted as JSON.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::GpuSceneError;
use crate::gpu::SPARSE_UPLOAD_WORKGROUP_SIZE;

/// Pins a registered component to a specific SoA slot by display name.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ComponentSlotConfig {
    pub name: String,
    pub soa_index: u32,
}

/// Tunables for the GPU scene. Loaded once at startup.
#[derive(Resource, Serialize, Deserialize, Clone, Debug)]
pub struct GpuSceneConfig {
    // Buffer growth
    #[serde(default = "default_growth_factor")]
    pub resize_growth_factor: f32,
    #[serde(default = "default_initial_instances")]
    pub initial_instances: u32,
    /// Instances per page. `None` lays segments out back to back.
    #[serde(default)]
    pub page_size: Option<u32>,
    /// Frames the GPU may still be working on while the CPU records the next.
    #[serde(default = "default_frames_in_flight")]
    pub frames_in_flight: u32,
    // Upload
    #[serde(default = "default_upload_alignment")]
    pub upload_alignment: u32,
    /// Scatter threads per descriptor, at most one workgroup.
    #[serde(default = "default_max_threads_per_op")]
    pub max_threads_per_op: u32,
    #[serde(default = "default_scan_batch_min")]
    pub scan_batch_min: usize,
    #[serde(default = "default_scan_batch_divisor")]
    pub scan_batch_divisor: usize,
    /// Upper bound on upload descriptors per frame. `None` sizes the list to the dirty count.
    #[serde(default)]
    pub max_upload_operations: Option<u32>,
    #[serde(default = "default_max_operations_per_dispatch")]
    pub max_operations_per_dispatch: u32,
    /// Re-mark dropped uploads dirty so they go out next frame.
    #[serde(default = "default_true")]
    pub requeue_on_overflow: bool,
    // Registration
    #[serde(default)]
    pub components: Vec<ComponentSlotConfig>,
}

fn default_true() -> bool { true }
fn default_growth_factor() -> f32 { 1.5 }
fn default_initial_instances() -> u32 { 1024 }
fn default_frames_in_flight() -> u32 { 2 }
fn default_upload_alignment() -> u32 { 256 }
fn default_max_threads_per_op() -> u32 { 4 }
fn default_scan_batch_min() -> usize { 1024 }
fn default_scan_batch_divisor() -> usize { 8 }
fn default_max_operations_per_dispatch() -> u32 { 65536 }

impl Default for GpuSceneConfig {
    fn default() -> Self {
        Self {
            resize_growth_factor: default_growth_factor(),
            initial_instances: default_initial_instances(),
            page_size: None,
            frames_in_flight: default_frames_in_flight(),
            upload_alignment: default_upload_alignment(),
            max_threads_per_op: default_max_threads_per_op(),
            scan_batch_min: default_scan_batch_min(),
            scan_batch_divisor: default_scan_batch_divisor(),
            max_upload_operations: None,
            max_operations_per_dispatch: default_max_operations_per_dispatch(),
            requeue_on_overflow: true,
            components: Vec::new(),
        }
    }
}

impl GpuSceneConfig {
    pub fn validate(&self) -> Result<(), GpuSceneError> {
        if !(self.resize_growth_factor > 1.0) {
            return Err(GpuSceneError::Config(format!(
                "resize_growth_factor must be > 1.0, got {}",
                self.resize_growth_factor
            )));
        }
        if self.frames_in_flight == 0 {
            return Err(GpuSceneError::Config("frames_in_flight must be at least 1".into()));
        }
        if !self.upload_alignment.is_power_of_two() {
            return Err(GpuSceneError::Config(format!(
                "upload_alignment must be a power of two, got {}",
                self.upload_alignment
            )));
        }
        if self.max_threads_per_op == 0 || self.max_threads_per_op > SPARSE_UPLOAD_WORKGROUP_SIZE {
            return Err(GpuSceneError::Config(format!(
                "max_threads_per_op must be in 1..={}, got {}",
                SPARSE_UPLOAD_WORKGROUP_SIZE, self.max_threads_per_op
            )));
        }
        if self.page_size == Some(0) {
            return Err(GpuSceneError::Config("page_size must be non-zero".into()));
        }
        if self.max_operations_per_dispatch == 0 {
            return Err(GpuSceneError::Config(
                "max_operations_per_dispatch must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Slot pinned for a component name, if the config names one.
    pub fn slot_for(&self, name: &str) -> Option<u32> {
        self.components.iter().find(|c| c.name == name).map(|c| c.soa_index)
    }

    pub fn load(path: &Path) -> Result<Self, GpuSceneError> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), GpuSceneError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from `path`, falling back to defaults when missing or malformed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(GpuSceneError::Io(_)) => Self::default(),
            Err(e) => {
                warn!("Failed to load GPU scene config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: GpuSceneConfig =
            serde_json::from_str(r#"{ "initial_instances": 64, "page_size": 32 }"#).unwrap();
        assert_eq!(config.initial_instances, 64);
        assert_eq!(config.page_size, Some(32));
        assert_eq!(config.resize_growth_factor, 1.5);
        assert_eq!(config.upload_alignment, 256);
        assert!(config.requeue_on_overflow);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = GpuSceneConfig::default();
        config.resize_growth_factor = 1.0;
        assert!(config.validate().is_err());

        let mut config = GpuSceneConfig::default();
        config.upload_alignment = 100;
        assert!(config.validate().is_err());

        let mut config = GpuSceneConfig::default();
        config.frames_in_flight = 0;
        assert!(config.validate().is_err());

        let mut config = GpuSceneConfig::default();
        config.max_threads_per_op = 0;
        assert!(config.validate().is_err());
        config.max_threads_per_op = SPARSE_UPLOAD_WORKGROUP_SIZE + 1;
        assert!(config.validate().is_err());
        config.max_threads_per_op = SPARSE_UPLOAD_WORKGROUP_SIZE;
        config.validate().unwrap();
    }

    #[test]
    fn save_then_load_keeps_slots() {
        let path = std::env::temp_dir().join(format!("gpu_scene_config_{}.json", std::process::id()));
        let mut config = GpuSceneConfig::default();
        config.components.push(ComponentSlotConfig { name: "Position".into(), soa_index: 3 });
        config.save(&path).unwrap();

        let loaded = GpuSceneConfig::load(&path).unwrap();
        assert_eq!(loaded.slot_for("Position"), Some(3));
        assert_eq!(loaded.slot_for("Velocity"), None);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let config = GpuSceneConfig::load_or_default(Path::new("/nonexistent/gpu_scene.json"));
        assert_eq!(config.initial_instances, 1024);
    }
}
