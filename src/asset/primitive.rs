//! Models assembled from geometric primitives instead of a downloaded file.

use std::f32::consts::{FRAC_PI_2, PI, TAU};

use glam::{EulerRot, Quat, Vec3};

use super::{AnimationClip, AssetData, MaterialData, MeshData, RotationChannel};
use crate::config::hex_to_rgb;
use crate::error::ViewerError;

pub const FIRE_EXTINGUISHER: &str = "fire-extinguisher";

const DEFAULT_BODY_COLOR: u32 = 0xff0000;

/// Resolves a `builtin:` name such as `fire-extinguisher#cc2200`.
pub fn build_builtin(name: &str) -> Result<AssetData, ViewerError> {
    let (model, color) = match name.split_once('#') {
        Some((model, hex)) => {
            let color = u32::from_str_radix(hex, 16).map_err(|_| {
                ViewerError::InvalidAsset(format!("`#{hex}` is not a hex colour"))
            })?;
            (model, color)
        }
        None => (name, DEFAULT_BODY_COLOR),
    };
    match model {
        FIRE_EXTINGUISHER => Ok(fire_extinguisher(color)),
        other => Err(ViewerError::UnsupportedFormat(format!("builtin:{other}"))),
    }
}

/// Red cylinder body with a silver top, angled nozzle, handle ring and a
/// pressure gauge. The gauge needle breathes and the nozzle sways through
/// the embedded `idle` clip.
pub fn fire_extinguisher(body_color: u32) -> AssetData {
    const RED: usize = 0;
    const SILVER: usize = 1;
    const BLACK: usize = 2;
    const WHITE: usize = 3;

    let materials = vec![
        material("body", hex_to_rgb(body_color), 0.3, 0.7),
        material("silver", hex_to_rgb(0xcccccc), 0.9, 0.3),
        material("black", hex_to_rgb(0x222222), 0.1, 0.9),
        material("white", hex_to_rgb(0xffffff), 0.1, 0.9),
    ];

    let facing_forward = Vec3::new(FRAC_PI_2, 0.0, 0.0);
    let meshes = vec![
        cylinder(0.8, 0.8, 2.0, 32)
            .placed(Vec3::ZERO, Vec3::new(0.0, 0.2, 0.0))
            .into_mesh("body", RED),
        cylinder(0.6, 0.8, 0.4, 32)
            .placed(Vec3::ZERO, Vec3::new(0.0, 1.4, 0.0))
            .into_mesh("top", SILVER),
        cylinder(0.1, 0.1, 0.8, 16)
            .placed(Vec3::new(0.0, 0.0, -1.2), Vec3::new(0.75, 1.55, 0.0))
            .into_mesh("nozzle", SILVER),
        torus(0.15, 0.03, 16, 32)
            .placed(facing_forward, Vec3::new(0.0, 1.75, 0.0))
            .into_mesh("handle", BLACK),
        cylinder(0.2, 0.2, 0.1, 16)
            .placed(facing_forward, Vec3::new(0.0, 0.9, 0.82))
            .into_mesh("gauge", SILVER),
        cylinder(0.15, 0.15, 0.11, 16)
            .placed(facing_forward, Vec3::new(0.0, 0.9, 0.83))
            .into_mesh("gauge-face", WHITE),
    ];

    let idle = AnimationClip {
        name: "idle".to_string(),
        duration: 4.0 * PI,
        channels: vec![
            RotationChannel {
                mesh: 5,
                axis: Vec3::Z,
                amplitude: 0.05,
            },
            RotationChannel {
                mesh: 2,
                axis: Vec3::Z,
                amplitude: 0.1,
            },
        ],
        tracks: Vec::new(),
    };

    AssetData {
        meshes,
        materials,
        animations: vec![idle],
    }
}

fn material(name: &str, color: Vec3, metalness: f32, roughness: f32) -> MaterialData {
    MaterialData {
        name: name.to_string(),
        color,
        metalness,
        roughness,
    }
}

/// Geometry under construction, in local space.
#[derive(Default)]
struct Shape {
    positions: Vec<Vec3>,
    normals: Vec<Vec3>,
    indices: Vec<u32>,
}

impl Shape {
    fn push(&mut self, position: Vec3, normal: Vec3) -> u32 {
        self.positions.push(position);
        self.normals.push(normal);
        (self.positions.len() - 1) as u32
    }

    /// Bakes an XYZ Euler rotation followed by a translation into the vertices.
    fn placed(mut self, rotation: Vec3, translation: Vec3) -> Self {
        let q = Quat::from_euler(EulerRot::XYZ, rotation.x, rotation.y, rotation.z);
        for p in &mut self.positions {
            *p = q * *p + translation;
        }
        for n in &mut self.normals {
            *n = (q * *n).normalize_or_zero();
        }
        self
    }

    fn into_mesh(self, name: &str, material: usize) -> MeshData {
        let vertices = self
            .positions
            .iter()
            .zip(&self.normals)
            .flat_map(|(p, n)| [p.x, p.y, p.z, n.x, n.y, n.z])
            .collect();
        MeshData {
            name: name.to_string(),
            vertices,
            indices: self.indices,
            material: Some(material),
        }
    }
}

/// Y-aligned (possibly tapered) cylinder centred on the origin, with caps.
fn cylinder(radius_top: f32, radius_bottom: f32, height: f32, segments: u32) -> Shape {
    let mut shape = Shape::default();
    let half = height * 0.5;
    let slope = (radius_bottom - radius_top) / height;

    let mut ring = Vec::with_capacity(segments as usize + 1);
    for i in 0..=segments {
        let theta = i as f32 / segments as f32 * TAU;
        let (sin, cos) = theta.sin_cos();
        let normal = Vec3::new(sin, slope, cos).normalize();
        let top = shape.push(Vec3::new(radius_top * sin, half, radius_top * cos), normal);
        let bottom = shape.push(
            Vec3::new(radius_bottom * sin, -half, radius_bottom * cos),
            normal,
        );
        ring.push((top, bottom));
    }
    for pair in ring.windows(2) {
        let ((a, b), (c, d)) = (pair[0], pair[1]);
        shape.indices.extend_from_slice(&[a, b, c, c, b, d]);
    }

    for (y, radius, normal) in [(half, radius_top, Vec3::Y), (-half, radius_bottom, -Vec3::Y)] {
        if radius <= 0.0 {
            continue;
        }
        let center = shape.push(Vec3::new(0.0, y, 0.0), normal);
        let first = shape.positions.len() as u32;
        for i in 0..=segments {
            let theta = i as f32 / segments as f32 * TAU;
            let (sin, cos) = theta.sin_cos();
            shape.push(Vec3::new(radius * sin, y, radius * cos), normal);
        }
        for i in 0..segments {
            shape
                .indices
                .extend_from_slice(&[center, first + i, first + i + 1]);
        }
    }
    shape
}

/// Ring in the XY plane around the Z axis.
fn torus(radius: f32, tube: f32, radial_segments: u32, tubular_segments: u32) -> Shape {
    let mut shape = Shape::default();
    for j in 0..=radial_segments {
        let v = j as f32 / radial_segments as f32 * TAU;
        for i in 0..=tubular_segments {
            let u = i as f32 / tubular_segments as f32 * TAU;
            let center = Vec3::new(radius * u.cos(), radius * u.sin(), 0.0);
            let position = Vec3::new(
                (radius + tube * v.cos()) * u.cos(),
                (radius + tube * v.cos()) * u.sin(),
                tube * v.sin(),
            );
            shape.push(position, (position - center).normalize_or_zero());
        }
    }
    let row = tubular_segments + 1;
    for j in 1..=radial_segments {
        for i in 1..=tubular_segments {
            let a = row * j + i - 1;
            let b = row * (j - 1) + i - 1;
            let c = row * (j - 1) + i;
            let d = row * j + i;
            shape.indices.extend_from_slice(&[a, b, d, b, c, d]);
        }
    }
    shape
}
