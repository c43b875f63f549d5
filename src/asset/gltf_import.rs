use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use glam::{Mat3, Mat4, Quat, Vec3};
use gltf::animation::util::ReadOutputs;
use gltf::animation::{Interpolation, Property};
use gltf::buffer::Data;
use gltf::mesh::Mode;
use gltf::Gltf;
use log::debug;

use super::obj::{compute_normals, missing_normals};
use super::{AnimationClip, AssetData, KeyframeTrack, MaterialData, MeshData};

/// Parses a glTF 2.0 document, JSON or binary GLB, into model data.
///
/// Buffers must be embedded: the GLB binary chunk or `data:` URIs. Node
/// transforms of the default scene are baked into the vertices, one mesh per
/// triangle primitive. Rotation channels become keyframe tracks relative to
/// the rest pose; translation, scale and morph-weight channels are skipped.
pub fn parse_gltf(bytes: &[u8]) -> Result<AssetData> {
    let Gltf { document, blob } = Gltf::from_slice(bytes).context("invalid glTF document")?;
    let buffers = gltf::import_buffers(&document, None, blob)
        .context("glTF buffers must be embedded in the file")?;

    let materials = document
        .materials()
        .map(|material| {
            let pbr = material.pbr_metallic_roughness();
            let [r, g, b, _] = pbr.base_color_factor();
            MaterialData {
                name: material.name().unwrap_or("material").to_string(),
                color: Vec3::new(r, g, b),
                metalness: pbr.metallic_factor(),
                roughness: pbr.roughness_factor(),
            }
        })
        .collect();

    let scene = document
        .default_scene()
        .or_else(|| document.scenes().next())
        .ok_or_else(|| anyhow!("glTF file does not define a scene"))?;
    let mut scene_meshes = SceneMeshes::new(&buffers);
    for node in scene.nodes() {
        scene_meshes.visit(&node, Mat4::IDENTITY)?;
    }
    if scene_meshes.meshes.is_empty() {
        bail!("glTF scene does not contain any triangle meshes");
    }

    let mut animations = Vec::new();
    for animation in document.animations() {
        let name = animation
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("animation-{}", animation.index()));
        let mut tracks = Vec::new();
        let mut duration = 0.0f32;
        for channel in animation.channels() {
            let target = channel.target();
            if !matches!(target.property(), Property::Rotation) {
                debug!("`{name}`: skipping non-rotation channel");
                continue;
            }
            let node = target.node().index();
            let (Some(meshes), Some(pose)) = (
                scene_meshes.node_meshes.get(&node),
                scene_meshes.poses.get(&node),
            ) else {
                continue;
            };
            let reader = channel.reader(|buffer| buffers.get(buffer.index()).map(|d| d.0.as_slice()));
            let times: Vec<f32> = reader
                .read_inputs()
                .ok_or_else(|| anyhow!("animation `{name}` has a channel without key times"))?
                .collect();
            let Some(ReadOutputs::Rotations(values)) = reader.read_outputs() else {
                continue;
            };
            let mut keys: Vec<Quat> = values.into_f32().map(Quat::from_array).collect();
            let interpolation = channel.sampler().interpolation();
            if matches!(interpolation, Interpolation::CubicSpline) {
                // in-tangent, value, out-tangent per key
                keys = keys.chunks_exact(3).map(|key| key[1]).collect();
            }
            let rotations: Vec<Quat> = keys.into_iter().map(|key| pose.delta(key)).collect();

            duration = duration.max(times.last().copied().unwrap_or(0.0));
            for &mesh in meshes {
                tracks.push(KeyframeTrack {
                    mesh,
                    times: times.clone(),
                    rotations: rotations.clone(),
                    step: matches!(interpolation, Interpolation::Step),
                });
            }
        }
        if tracks.is_empty() {
            debug!("`{name}` animates nothing this viewer can play");
            continue;
        }
        animations.push(AnimationClip {
            name,
            duration,
            channels: Vec::new(),
            tracks,
        });
    }

    Ok(AssetData {
        meshes: scene_meshes.meshes,
        materials,
        animations,
    })
}

/// Rest orientation of an animated node, in the frame the vertices were baked in.
#[derive(Debug, Clone, Copy)]
struct NodePose {
    parent: Quat,
    rest: Quat,
}

impl NodePose {
    /// World-space rotation taking the baked rest pose to `key`.
    fn delta(&self, key: Quat) -> Quat {
        (self.parent * key.normalize() * self.rest.inverse() * self.parent.inverse()).normalize()
    }
}

struct SceneMeshes<'a> {
    buffers: &'a [Data],
    meshes: Vec<MeshData>,
    node_meshes: HashMap<usize, Vec<usize>>,
    poses: HashMap<usize, NodePose>,
}

impl<'a> SceneMeshes<'a> {
    fn new(buffers: &'a [Data]) -> Self {
        Self {
            buffers,
            meshes: Vec::new(),
            node_meshes: HashMap::new(),
            poses: HashMap::new(),
        }
    }

    fn visit(&mut self, node: &gltf::Node<'_>, parent: Mat4) -> Result<()> {
        let local = Mat4::from_cols_array_2d(&node.transform().matrix());
        let world = parent * local;
        let (_, parent_rotation, _) = parent.to_scale_rotation_translation();
        let (_, rest, _) = local.to_scale_rotation_translation();
        self.poses.insert(
            node.index(),
            NodePose {
                parent: parent_rotation,
                rest,
            },
        );

        if let Some(mesh) = node.mesh() {
            let name = mesh.name().unwrap_or("mesh").to_string();
            for primitive in mesh.primitives() {
                if primitive.mode() != Mode::Triangles {
                    debug!("mesh `{name}`: skipping {:?} primitive", primitive.mode());
                    continue;
                }
                let data = self
                    .primitive(&name, &primitive, world)
                    .with_context(|| format!("invalid primitive in mesh `{name}`"))?;
                self.node_meshes
                    .entry(node.index())
                    .or_default()
                    .push(self.meshes.len());
                self.meshes.push(data);
            }
        }

        for child in node.children() {
            self.visit(&child, world)?;
        }
        Ok(())
    }

    fn primitive(&self, name: &str, primitive: &gltf::Primitive<'_>, world: Mat4) -> Result<MeshData> {
        let buffers = self.buffers;
        let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|d| d.0.as_slice()));
        let positions: Vec<Vec3> = reader
            .read_positions()
            .ok_or_else(|| anyhow!("primitive has no positions"))?
            .map(|p| world.transform_point3(Vec3::from(p)))
            .collect();
        let normal_matrix = Mat3::from_mat4(world).inverse().transpose();
        let normals: Option<Vec<Vec3>> = reader.read_normals().map(|normals| {
            normals
                .map(|n| (normal_matrix * Vec3::from(n)).normalize_or_zero())
                .collect()
        });
        let indices: Vec<u32> = match reader.read_indices() {
            Some(indices) => indices.into_u32().collect(),
            None => (0..positions.len() as u32).collect(),
        };
        if let Some(index) = indices.iter().find(|&&i| i as usize >= positions.len()) {
            bail!("index {index} is out of range");
        }

        let mut vertices = Vec::with_capacity(positions.len() * MeshData::STRIDE);
        for (i, p) in positions.iter().enumerate() {
            let n = normals
                .as_ref()
                .and_then(|normals| normals.get(i))
                .copied()
                .unwrap_or(Vec3::ZERO);
            vertices.extend_from_slice(&[p.x, p.y, p.z, n.x, n.y, n.z]);
        }
        let mut mesh = MeshData {
            name: name.to_string(),
            vertices,
            indices,
            material: primitive.material().index(),
        };
        if missing_normals(&mesh) {
            compute_normals(&mut mesh);
        }
        Ok(mesh)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    const DOCUMENT: &str = r#"{
  "asset": { "version": "2.0" },
  "scene": 0,
  "scenes": [{ "nodes": [0] }],
  "nodes": [{ "name": "blade", "mesh": 0, "translation": [1.0, 0.0, 0.0] }],
  "meshes": [{
    "name": "blade",
    "primitives": [{ "attributes": { "POSITION": 0 }, "indices": 1, "material": 0 }]
  }],
  "materials": [{
    "name": "steel",
    "pbrMetallicRoughness": {
      "baseColorFactor": [0.5, 0.25, 1.0, 1.0],
      "metallicFactor": 0.9,
      "roughnessFactor": 0.2
    }
  }],
  "animations": [{
    "name": "spin",
    "channels": [{ "sampler": 0, "target": { "node": 0, "path": "rotation" } }],
    "samplers": [{ "input": 2, "output": 3, "interpolation": "LINEAR" }]
  }],
  "buffers": [{ "byteLength": 84 }],
  "bufferViews": [
    { "buffer": 0, "byteOffset": 0, "byteLength": 36 },
    { "buffer": 0, "byteOffset": 36, "byteLength": 6 },
    { "buffer": 0, "byteOffset": 44, "byteLength": 8 },
    { "buffer": 0, "byteOffset": 52, "byteLength": 32 }
  ],
  "accessors": [
    { "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
      "min": [0.0, 0.0, 0.0], "max": [4.0, 2.0, 0.0] },
    { "bufferView": 1, "componentType": 5123, "count": 3, "type": "SCALAR" },
    { "bufferView": 2, "componentType": 5126, "count": 2, "type": "SCALAR",
      "min": [0.0], "max": [2.0] },
    { "bufferView": 3, "componentType": 5126, "count": 2, "type": "VEC4" }
  ]
}"#;

    fn binary_chunk() -> Vec<u8> {
        let mut bin = Vec::new();
        for value in [0.0f32, 0.0, 0.0, 4.0, 0.0, 0.0, 0.0, 2.0, 0.0] {
            bin.extend_from_slice(&value.to_le_bytes());
        }
        for index in [0u16, 1, 2] {
            bin.extend_from_slice(&index.to_le_bytes());
        }
        bin.extend_from_slice(&[0, 0]);
        for time in [0.0f32, 2.0] {
            bin.extend_from_slice(&time.to_le_bytes());
        }
        let quarter = Quat::from_rotation_z(FRAC_PI_2);
        for q in [Quat::IDENTITY, quarter] {
            for c in q.to_array() {
                bin.extend_from_slice(&c.to_le_bytes());
            }
        }
        assert_eq!(bin.len(), 84);
        bin
    }

    /// One animated triangle with a single material, as a binary GLB.
    pub(crate) fn glb() -> Vec<u8> {
        let mut json = DOCUMENT.as_bytes().to_vec();
        while json.len() % 4 != 0 {
            json.push(b' ');
        }
        let bin = binary_chunk();
        let total = 12 + 8 + json.len() + 8 + bin.len();

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(b"glTF");
        out.extend_from_slice(&2u32.to_le_bytes());
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.extend_from_slice(&(json.len() as u32).to_le_bytes());
        out.extend_from_slice(b"JSON");
        out.extend_from_slice(&json);
        out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
        out.extend_from_slice(b"BIN\0");
        out.extend_from_slice(&bin);
        out
    }

    #[test]
    fn bakes_node_transforms_into_meshes() {
        let asset = parse_gltf(&glb()).unwrap();
        assert_eq!(asset.meshes.len(), 1);
        let mesh = &asset.meshes[0];
        assert_eq!(mesh.name, "blade");
        assert_eq!(mesh.indices, vec![0, 1, 2]);
        assert_eq!(mesh.material, Some(0));

        let bounds = asset.bounds().unwrap();
        assert_eq!(bounds.min, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(bounds.max, Vec3::new(5.0, 2.0, 0.0));
        let normal = Vec3::from_slice(&mesh.vertices[3..6]);
        assert!((normal - Vec3::Z).length() < 1e-5);
        asset.validate().unwrap();
    }

    #[test]
    fn reads_pbr_materials() {
        let asset = parse_gltf(&glb()).unwrap();
        let steel = &asset.materials[0];
        assert_eq!(steel.name, "steel");
        assert_eq!(steel.color, Vec3::new(0.5, 0.25, 1.0));
        assert!((steel.metalness - 0.9).abs() < 1e-6);
        assert!((steel.roughness - 0.2).abs() < 1e-6);
    }

    #[test]
    fn rotation_channels_become_keyframe_tracks() {
        let asset = parse_gltf(&glb()).unwrap();
        assert_eq!(asset.animations.len(), 1);
        let clip = &asset.animations[0];
        assert_eq!(clip.name, "spin");
        assert_eq!(clip.duration, 2.0);
        assert_eq!(clip.tracks.len(), 1);
        assert!(!clip.tracks[0].step);

        let halfway = Quat::from_rotation_z(FRAC_PI_2 / 2.0);
        assert!(clip.rotation(0, 1.0).abs_diff_eq(halfway, 1e-5));
    }

    #[test]
    fn rejects_documents_without_meshes() {
        let empty = r#"{
  "asset": { "version": "2.0" },
  "scenes": [{ "nodes": [0] }],
  "nodes": [{ "name": "pivot" }]
}"#;
        let err = parse_gltf(empty.as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("triangle meshes"));
        assert!(parse_gltf(b"not gltf").is_err());
    }
}
