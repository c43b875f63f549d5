//! Boundary between the viewer session and the graphics engine.
//!
//! The session never rasterizes anything itself. It asks an engine for a
//! render surface, hands it model data to upload and tells it once per frame
//! what to draw. Everything the engine allocates on the session's behalf is
//! returned as a [`ResourceHandle`] so the session can release it explicitly.

use glam::{Mat4, Vec3};
use serde::{Deserialize, Serialize};

use crate::asset::{AnimationClip, AssetData};
use crate::error::ViewerError;

/// Identifier of a render surface created by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceId(pub u64);

/// Pixel dimensions of a render surface. Never zero in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceSize {
    pub width: u32,
    pub height: u32,
}

impl SurfaceSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }

    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Geometry,
    Material,
    Light,
    Mixer,
}

/// GPU-side object owned by a session and released through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    pub kind: ResourceKind,
    pub id: u64,
}

impl ResourceHandle {
    pub const fn new(kind: ResourceKind, id: u64) -> Self {
        Self { kind, id }
    }
}

/// Resources accumulated while building something, released once in reverse
/// order of acquisition.
#[derive(Debug, Default)]
pub struct OwnedResources {
    handles: Vec<ResourceHandle>,
}

impl OwnedResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: ResourceHandle) {
        self.handles.push(handle);
    }

    pub fn extend(&mut self, handles: impl IntoIterator<Item = ResourceHandle>) {
        self.handles.extend(handles);
    }

    pub fn handles(&self) -> &[ResourceHandle] {
        &self.handles
    }

    pub fn of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = ResourceHandle> + '_ {
        self.handles.iter().copied().filter(move |h| h.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Releases every handle, newest first. The list is empty afterwards.
    pub fn release_all(&mut self, engine: &mut dyn GraphicsEngine) {
        for handle in self.handles.drain(..).rev() {
            engine.release(handle);
        }
    }
}

/// Shadow quality applied by the engine's shadow-casting light.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowSettings {
    pub enabled: bool,
    pub map_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmbientLight {
    pub color: Vec3,
    pub intensity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    pub position: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    pub casts_shadow: bool,
}

/// Light arrangement installed once per session.
#[derive(Debug, Clone, PartialEq)]
pub struct LightRig {
    pub ambient: AmbientLight,
    pub key: DirectionalLight,
    pub fill: DirectionalLight,
}

impl LightRig {
    /// Ambient fill plus a shadow-casting key light and a soft fill light.
    pub fn studio() -> Self {
        Self {
            ambient: AmbientLight {
                color: Vec3::ONE,
                intensity: 0.6,
            },
            key: DirectionalLight {
                position: Vec3::new(5.0, 10.0, 7.0),
                color: Vec3::ONE,
                intensity: 1.0,
                casts_shadow: true,
            },
            fill: DirectionalLight {
                position: Vec3::new(-5.0, 3.0, 5.0),
                color: Vec3::ONE,
                intensity: 0.5,
                casts_shadow: false,
            },
        }
    }
}

/// Everything the engine needs to draw one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameState {
    pub view_proj: Mat4,
    pub camera_position: Vec3,
    /// Model matrix of the loaded asset, if any.
    pub model: Option<Mat4>,
    pub clear_color: [f64; 4],
}

/// Capability provider the session renders through.
pub trait GraphicsEngine {
    /// Probes for hardware-accelerated rendering without allocating a surface.
    fn supports_hardware_acceleration(&self) -> bool;

    fn create_surface(&mut self, size: SurfaceSize) -> Result<SurfaceId, ViewerError>;

    fn resize_surface(&mut self, surface: SurfaceId, size: SurfaceSize);

    fn dispose_surface(&mut self, surface: SurfaceId);

    fn install_lights(&mut self, rig: &LightRig) -> Result<Vec<ResourceHandle>, ViewerError>;

    /// Uploads geometry and materials; the returned handles are owned by the caller.
    fn upload_asset(&mut self, asset: &AssetData) -> Result<Vec<ResourceHandle>, ViewerError>;

    fn create_mixer(&mut self, clip: &AnimationClip) -> Result<ResourceHandle, ViewerError>;

    fn advance_mixer(&mut self, mixer: ResourceHandle, delta_seconds: f32);

    fn apply_shadow_settings(&mut self, settings: ShadowSettings);

    fn release(&mut self, resource: ResourceHandle);

    fn render(&mut self, surface: SurfaceId, frame: &FrameState) -> Result<(), ViewerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessEngine;

    #[test]
    fn surface_size_never_collapses_to_zero() {
        let size = SurfaceSize::new(0, 0);
        assert_eq!((size.width, size.height), (1, 1));
        assert_eq!(SurfaceSize::new(800, 400).aspect(), 2.0);
    }

    #[test]
    fn owned_resources_release_newest_first() {
        let mut engine = HeadlessEngine::new(true);
        let probe = engine.probe();
        let mut resources = OwnedResources::new();
        resources.push(ResourceHandle::new(ResourceKind::Geometry, 1));
        resources.push(ResourceHandle::new(ResourceKind::Material, 2));
        resources.push(ResourceHandle::new(ResourceKind::Mixer, 3));

        resources.release_all(&mut engine);

        assert!(resources.is_empty());
        let released: Vec<u64> = probe.released().iter().map(|h| h.id).collect();
        assert_eq!(released, vec![3, 2, 1]);
    }
}
