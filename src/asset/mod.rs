//! Model data, normalization and the session-owned loaded asset.

pub mod cache;
pub mod gltf_import;
pub mod obj;
pub mod primitive;

use std::fmt;
use std::sync::Arc;

use glam::{Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::engine::{GraphicsEngine, OwnedResources, ResourceHandle, ResourceKind};
use crate::error::ViewerError;

pub use cache::AssetCache;

/// Locator of a model: a path, a URL or a `builtin:` name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetSource(String);

impl AssetSource {
    pub const BUILTIN_SCHEME: &'static str = "builtin:";

    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into().trim().to_string())
    }

    pub fn builtin(name: &str) -> Self {
        Self(format!("{}{name}", Self::BUILTIN_SCHEME))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Name after the `builtin:` scheme, including any `#color` suffix.
    pub fn builtin_name(&self) -> Option<&str> {
        self.0.strip_prefix(Self::BUILTIN_SCHEME)
    }

    /// Lower-cased file extension of the last path segment, ignoring query and fragment.
    pub fn extension(&self) -> Option<String> {
        let path = self.0.split(['?', '#']).next().unwrap_or_default();
        let file = path.rsplit(['/', '\\']).next()?;
        let (stem, ext) = file.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }
}

impl fmt::Display for AssetSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetSource {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl Bounds {
    pub fn from_points(points: impl IntoIterator<Item = Vec3>) -> Option<Self> {
        let mut points = points.into_iter();
        let first = points.next()?;
        let (min, max) = points.fold((first, first), |(min, max), p| (min.min(p), max.max(p)));
        Some(Self { min, max })
    }

    pub fn union(self, other: Bounds) -> Bounds {
        Bounds {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn max_dimension(&self) -> f32 {
        self.size().max_element()
    }
}

/// Triangle mesh with interleaved `position.xyz`, `normal.xyz` vertices.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MeshData {
    pub name: String,
    pub vertices: Vec<f32>,
    pub indices: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material: Option<usize>,
}

impl MeshData {
    pub const STRIDE: usize = 6;

    pub fn vertex_count(&self) -> usize {
        self.vertices.len() / Self::STRIDE
    }

    pub fn positions(&self) -> impl Iterator<Item = Vec3> + '_ {
        self.vertices
            .chunks_exact(Self::STRIDE)
            .map(|chunk| Vec3::new(chunk[0], chunk[1], chunk[2]))
    }

    pub fn bounds(&self) -> Option<Bounds> {
        Bounds::from_points(self.positions())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialData {
    pub name: String,
    pub color: Vec3,
    pub metalness: f32,
    pub roughness: f32,
}

impl Default for MaterialData {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            color: Vec3::splat(0.8),
            metalness: 0.1,
            roughness: 0.8,
        }
    }
}

/// Periodic rotation of one mesh around a local axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationChannel {
    pub mesh: usize,
    pub axis: Vec3,
    /// Peak angle in radians.
    pub amplitude: f32,
}

/// Looping animation embedded in a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationClip {
    pub name: String,
    /// Period in seconds.
    pub duration: f32,
    pub channels: Vec<RotationChannel>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tracks: Vec<KeyframeTrack>,
}

/// Sampled rotation of one mesh relative to its rest pose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyframeTrack {
    pub mesh: usize,
    /// Key times in seconds, ascending.
    pub times: Vec<f32>,
    pub rotations: Vec<Quat>,
    /// Hold each key until the next one instead of interpolating.
    #[serde(default)]
    pub step: bool,
}

impl KeyframeTrack {
    pub fn sample(&self, time: f32) -> Quat {
        let len = self.times.len().min(self.rotations.len());
        if len == 0 {
            return Quat::IDENTITY;
        }
        if time <= self.times[0] {
            return self.rotations[0];
        }
        if time >= self.times[len - 1] {
            return self.rotations[len - 1];
        }
        let next = self.times[..len].partition_point(|t| *t <= time);
        let prev = next - 1;
        if self.step {
            return self.rotations[prev];
        }
        let span = self.times[next] - self.times[prev];
        let t = if span > f32::EPSILON {
            (time - self.times[prev]) / span
        } else {
            0.0
        };
        self.rotations[prev].slerp(self.rotations[next], t)
    }
}

impl AnimationClip {
    /// Angle of a channel at `time` seconds into the clip.
    pub fn sample(&self, channel: &RotationChannel, time: f32) -> f32 {
        if self.duration <= f32::EPSILON {
            return 0.0;
        }
        let phase = (time / self.duration).fract() * std::f32::consts::TAU;
        channel.amplitude * phase.sin()
    }

    /// Rotation this clip applies to `mesh` at `time` seconds. Keyframe
    /// tracks loop over the clip duration.
    pub fn rotation(&self, mesh: usize, time: f32) -> Quat {
        let mut rotation = Quat::IDENTITY;
        for channel in self.channels.iter().filter(|c| c.mesh == mesh) {
            let axis = channel.axis.normalize_or_zero();
            if axis != Vec3::ZERO {
                rotation *= Quat::from_axis_angle(axis, self.sample(channel, time));
            }
        }
        if self.duration > f32::EPSILON {
            let local = time.rem_euclid(self.duration);
            for track in self.tracks.iter().filter(|t| t.mesh == mesh) {
                rotation *= track.sample(local);
            }
        }
        rotation
    }
}

/// Decoded model as produced by a loader, before any GPU upload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AssetData {
    pub meshes: Vec<MeshData>,
    pub materials: Vec<MaterialData>,
    pub animations: Vec<AnimationClip>,
}

impl AssetData {
    pub fn vertex_count(&self) -> usize {
        self.meshes.iter().map(MeshData::vertex_count).sum()
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.meshes
            .iter()
            .filter_map(MeshData::bounds)
            .reduce(Bounds::union)
    }

    /// Checks that the model has geometry and that every index is in range.
    pub fn validate(&self) -> Result<(), ViewerError> {
        if self.vertex_count() == 0 {
            return Err(ViewerError::InvalidAsset(
                "model does not contain any vertices".to_string(),
            ));
        }
        if self.meshes.iter().any(|mesh| mesh.vertices.iter().any(|v| !v.is_finite())) {
            return Err(ViewerError::InvalidAsset(
                "model contains non-finite vertex data".to_string(),
            ));
        }
        for clip in &self.animations {
            let targets = clip.channels.iter().map(|c| c.mesh);
            if let Some(mesh) = targets
                .chain(clip.tracks.iter().map(|t| t.mesh))
                .find(|mesh| *mesh >= self.meshes.len())
            {
                return Err(ViewerError::InvalidAsset(format!(
                    "animation `{}` targets missing mesh {mesh}",
                    clip.name
                )));
            }
        }
        for mesh in &self.meshes {
            let count = mesh.vertex_count() as u32;
            if mesh.indices.iter().any(|&i| i >= count) {
                return Err(ViewerError::InvalidAsset(format!(
                    "mesh `{}` references a vertex out of range",
                    mesh.name
                )));
            }
            if let Some(material) = mesh.material {
                if material >= self.materials.len() {
                    return Err(ViewerError::InvalidAsset(format!(
                        "mesh `{}` references missing material {material}",
                        mesh.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Placement of the loaded model in the scene.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AssetTransform {
    pub translation: Vec3,
    pub scale: f32,
    pub yaw: f32,
    pub pitch: f32,
}

impl Default for AssetTransform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            scale: 1.0,
            yaw: 0.0,
            pitch: 0.0,
        }
    }
}

impl AssetTransform {
    /// Centers `bounds` on the origin and scales its largest side to `target_size`.
    pub fn normalizing(bounds: &Bounds, target_size: f32) -> Self {
        let max_dim = bounds.max_dimension();
        let scale = if max_dim > f32::EPSILON {
            target_size / max_dim
        } else {
            1.0
        };
        Self {
            translation: -bounds.center() * scale,
            scale,
            ..Self::default()
        }
    }

    pub fn model_matrix(&self) -> Mat4 {
        Mat4::from_rotation_y(self.yaw)
            * Mat4::from_rotation_x(self.pitch)
            * Mat4::from_translation(self.translation)
            * Mat4::from_scale(Vec3::splat(self.scale))
    }

    /// Bounds after scale and translation, before rotation.
    pub fn apply(&self, bounds: &Bounds) -> Bounds {
        Bounds {
            min: bounds.min * self.scale + self.translation,
            max: bounds.max * self.scale + self.translation,
        }
    }
}

/// Read-only description of a loaded model handed to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetSummary {
    pub source: AssetSource,
    pub mesh_count: usize,
    pub vertex_count: usize,
    pub animations: Vec<String>,
    pub normalized_bounds: Bounds,
}

/// Model owned by a session together with every GPU resource built from it.
#[derive(Debug)]
pub struct LoadedAsset {
    source: AssetSource,
    data: Arc<AssetData>,
    raw_bounds: Bounds,
    transform: AssetTransform,
    initial_transform: AssetTransform,
    resources: OwnedResources,
}

impl LoadedAsset {
    /// Uploads `data` and starts its clips. On failure everything acquired so
    /// far is released before returning.
    pub fn build(
        source: AssetSource,
        data: Arc<AssetData>,
        target_size: f32,
        autoplay: bool,
        engine: &mut dyn GraphicsEngine,
    ) -> Result<Self, ViewerError> {
        data.validate()?;
        let raw_bounds = data
            .bounds()
            .ok_or_else(|| ViewerError::InvalidAsset("model has no extent".to_string()))?;
        let transform = AssetTransform::normalizing(&raw_bounds, target_size);

        let mut resources = OwnedResources::new();
        match engine.upload_asset(&data) {
            Ok(handles) => resources.extend(handles),
            Err(err) => {
                resources.release_all(engine);
                return Err(err);
            }
        }
        if autoplay {
            for clip in &data.animations {
                match engine.create_mixer(clip) {
                    Ok(mixer) => resources.push(mixer),
                    Err(err) => {
                        resources.release_all(engine);
                        return Err(err);
                    }
                }
            }
        }

        Ok(Self {
            source,
            data,
            raw_bounds,
            transform,
            initial_transform: transform,
            resources,
        })
    }

    pub fn source(&self) -> &AssetSource {
        &self.source
    }

    pub fn data(&self) -> &AssetData {
        &self.data
    }

    pub fn transform(&self) -> &AssetTransform {
        &self.transform
    }

    pub fn transform_mut(&mut self) -> &mut AssetTransform {
        &mut self.transform
    }

    pub fn initial_transform(&self) -> &AssetTransform {
        &self.initial_transform
    }

    pub fn reset_transform(&mut self) {
        self.transform = self.initial_transform;
    }

    pub fn normalized_bounds(&self) -> Bounds {
        self.initial_transform.apply(&self.raw_bounds)
    }

    pub fn mixers(&self) -> impl Iterator<Item = ResourceHandle> + '_ {
        self.resources.of_kind(ResourceKind::Mixer)
    }

    pub fn resources(&self) -> &OwnedResources {
        &self.resources
    }

    pub fn summary(&self) -> AssetSummary {
        AssetSummary {
            source: self.source.clone(),
            mesh_count: self.data.meshes.len(),
            vertex_count: self.data.vertex_count(),
            animations: self.data.animations.iter().map(|c| c.name.clone()).collect(),
            normalized_bounds: self.normalized_bounds(),
        }
    }

    /// Frees the GPU side of the model. The asset is consumed.
    pub fn dispose(mut self, engine: &mut dyn GraphicsEngine) {
        self.resources.release_all(engine);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessEngine;

    fn cube(min: Vec3, max: Vec3) -> AssetData {
        let mut vertices = Vec::new();
        for corner in [min, max, Vec3::new(min.x, max.y, min.z)] {
            vertices.extend_from_slice(&[corner.x, corner.y, corner.z, 0.0, 1.0, 0.0]);
        }
        AssetData {
            meshes: vec![MeshData {
                name: "box".into(),
                vertices,
                indices: vec![0, 1, 2],
                material: None,
            }],
            ..AssetData::default()
        }
    }

    #[test]
    fn extension_ignores_query_and_case() {
        assert_eq!(
            AssetSource::new("https://cdn.test/m/Model.OBJ?v=2").extension(),
            Some("obj".to_string())
        );
        assert_eq!(AssetSource::new("models/.hidden").extension(), None);
        assert_eq!(AssetSource::builtin("fire-extinguisher").extension(), None);
    }

    #[test]
    fn normalization_centers_and_scales_largest_side() {
        let bounds = Bounds {
            min: Vec3::new(10.0, -4.0, 2.0),
            max: Vec3::new(30.0, 6.0, 7.0),
        };
        let transform = AssetTransform::normalizing(&bounds, 2.0);
        let normalized = transform.apply(&bounds);
        assert!(normalized.center().length() < 1e-5);
        assert!((normalized.max_dimension() - 2.0).abs() < 1e-5);
    }

    #[test]
    fn degenerate_bounds_keep_unit_scale() {
        let point = Bounds {
            min: Vec3::splat(3.0),
            max: Vec3::splat(3.0),
        };
        let transform = AssetTransform::normalizing(&point, 2.0);
        assert_eq!(transform.scale, 1.0);
        assert_eq!(transform.translation, Vec3::splat(-3.0));
    }

    #[test]
    fn validate_rejects_non_finite_vertices() {
        let mut data = cube(Vec3::ZERO, Vec3::ONE);
        data.meshes[0].vertices[0] = f32::INFINITY;
        assert!(matches!(data.validate(), Err(ViewerError::InvalidAsset(_))));
        data.meshes[0].vertices[0] = f32::NAN;
        assert!(matches!(data.validate(), Err(ViewerError::InvalidAsset(_))));
    }

    #[test]
    fn keyframe_tracks_interpolate_and_loop() {
        let quarter = Quat::from_rotation_z(std::f32::consts::FRAC_PI_2);
        let track = KeyframeTrack {
            mesh: 0,
            times: vec![0.0, 2.0],
            rotations: vec![Quat::IDENTITY, quarter],
            step: false,
        };
        let halfway = Quat::from_rotation_z(std::f32::consts::FRAC_PI_4);
        assert!(track.sample(1.0).abs_diff_eq(halfway, 1e-5));
        assert_eq!(track.sample(5.0), quarter);

        let clip = AnimationClip {
            name: "spin".into(),
            duration: 2.0,
            channels: Vec::new(),
            tracks: vec![track],
        };
        assert!(clip.rotation(0, 3.0).abs_diff_eq(halfway, 1e-5));
        assert_eq!(clip.rotation(1, 3.0), Quat::IDENTITY);
    }

    #[test]
    fn step_tracks_hold_the_previous_key() {
        let track = KeyframeTrack {
            mesh: 0,
            times: vec![0.0, 1.0],
            rotations: vec![Quat::IDENTITY, Quat::from_rotation_x(1.0)],
            step: true,
        };
        assert_eq!(track.sample(0.9), Quat::IDENTITY);
    }

    #[test]
    fn validate_rejects_out_of_range_indices() {
        let mut data = cube(Vec3::ZERO, Vec3::ONE);
        data.meshes[0].indices.push(9);
        assert!(matches!(data.validate(), Err(ViewerError::InvalidAsset(_))));
    }

    #[test]
    fn failed_upload_leaves_no_live_resources() {
        let mut engine = HeadlessEngine::new(true);
        let probe = engine.probe();
        probe.fail_next_upload("out of memory");
        let result = LoadedAsset::build(
            AssetSource::new("a.obj"),
            Arc::new(cube(Vec3::ZERO, Vec3::ONE)),
            2.0,
            true,
            &mut engine,
        );
        assert!(result.is_err());
        assert_eq!(probe.live_resources(), 0);
    }

    #[test]
    fn dispose_releases_everything_built() {
        let mut engine = HeadlessEngine::new(true);
        let probe = engine.probe();
        let asset = LoadedAsset::build(
            AssetSource::new("a.obj"),
            Arc::new(cube(Vec3::ZERO, Vec3::splat(4.0))),
            2.0,
            true,
            &mut engine,
        )
        .unwrap();
        assert!(probe.live_resources() > 0);
        assert!((asset.normalized_bounds().max_dimension() - 2.0).abs() < 1e-5);
        asset.dispose(&mut engine);
        assert_eq!(probe.live_resources(), 0);
    }
}
