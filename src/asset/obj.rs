use std::collections::HashMap;

use anyhow::{anyhow, bail, Context, Result};
use glam::Vec3;

use super::{AssetData, MaterialData, MeshData};

/// Parses a Wavefront OBJ document into model data.
///
/// Each `o`/`g` statement starts a new mesh; `usemtl` names become materials
/// with default shading since `.mtl` libraries are not fetched. Polygons are
/// fan-triangulated and normals are computed when the file omits them.
pub fn parse_obj(data: &str) -> Result<AssetData> {
    let mut positions = Vec::new();
    let mut normals = Vec::new();
    let mut finished: Vec<Group> = Vec::new();
    let mut current = Group::new("default");
    let mut materials: Vec<MaterialData> = Vec::new();
    let mut material_lookup: HashMap<String, usize> = HashMap::new();

    for (line_no, line) in data.lines().enumerate() {
        let line_no = line_no + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let mut parts = trimmed.split_whitespace();
        let Some(tag) = parts.next() else {
            continue;
        };
        match tag {
            "v" => positions.push(
                parse_vec3(parts).with_context(|| format!("invalid vertex on line {line_no}"))?,
            ),
            "vn" => normals.push(
                parse_vec3(parts).with_context(|| format!("invalid normal on line {line_no}"))?,
            ),
            "f" => {
                let polygon =
                    parse_face(parts).with_context(|| format!("invalid face on line {line_no}"))?;
                for i in 1..polygon.len() - 1 {
                    current
                        .triangles
                        .push([polygon[0], polygon[i], polygon[i + 1]]);
                }
            }
            "o" | "g" => {
                let name = parts.collect::<Vec<_>>().join(" ");
                if current.triangles.is_empty() {
                    current.name = name;
                } else {
                    let mut next = Group::new(&name);
                    next.material = current.material;
                    finished.push(std::mem::replace(&mut current, next));
                }
            }
            "usemtl" => {
                let name = parts.next().unwrap_or("default").to_string();
                let index = *material_lookup.entry(name.clone()).or_insert_with(|| {
                    materials.push(MaterialData {
                        name,
                        ..MaterialData::default()
                    });
                    materials.len() - 1
                });
                if current.triangles.is_empty() {
                    current.material = Some(index);
                } else {
                    let mut next = Group::new(&current.name);
                    next.material = Some(index);
                    finished.push(std::mem::replace(&mut current, next));
                }
            }
            _ => {}
        }
    }

    if positions.is_empty() {
        bail!("OBJ file does not define any vertices");
    }

    finished.push(current);
    let mut meshes = Vec::new();
    for group in finished.into_iter().filter(|g| !g.triangles.is_empty()) {
        let mut mesh = group.into_mesh(&positions, &normals)?;
        if missing_normals(&mesh) {
            compute_normals(&mut mesh);
        }
        meshes.push(mesh);
    }
    if meshes.is_empty() {
        bail!("OBJ file does not define any faces");
    }

    Ok(AssetData {
        meshes,
        materials,
        animations: Vec::new(),
    })
}

#[derive(Debug, Clone, Copy)]
struct Corner {
    position: i32,
    normal: i32,
}

struct Group {
    name: String,
    material: Option<usize>,
    triangles: Vec<[Corner; 3]>,
}

impl Group {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            material: None,
            triangles: Vec::new(),
        }
    }

    /// Deduplicates position/normal pairs into an indexed mesh.
    fn into_mesh(self, positions: &[Vec3], normals: &[Vec3]) -> Result<MeshData> {
        let mut lookup: HashMap<(usize, Option<usize>), u32> = HashMap::new();
        let mut vertices = Vec::new();
        let mut indices = Vec::with_capacity(self.triangles.len() * 3);

        for corner in self.triangles.iter().flatten() {
            let position = resolve_index(corner.position, positions.len())
                .ok_or_else(|| anyhow!("vertex index {} out of range", corner.position))?;
            let normal = resolve_index(corner.normal, normals.len());
            let next = (vertices.len() / MeshData::STRIDE) as u32;
            let index = *lookup.entry((position, normal)).or_insert_with(|| {
                let p = positions[position];
                let n = normal.map(|i| normals[i]).unwrap_or(Vec3::ZERO);
                vertices.extend_from_slice(&[p.x, p.y, p.z, n.x, n.y, n.z]);
                next
            });
            indices.push(index);
        }

        Ok(MeshData {
            name: self.name,
            vertices,
            indices,
            material: self.material,
        })
    }
}

fn parse_vec3<'a>(mut parts: impl Iterator<Item = &'a str>) -> Result<Vec3> {
    let mut next = || -> Result<f32> {
        let raw = parts
            .next()
            .ok_or_else(|| anyhow!("missing vector component"))?;
        let value = raw
            .parse::<f32>()
            .with_context(|| format!("`{raw}` is not a number"))?;
        if !value.is_finite() {
            bail!("`{raw}` is not a finite number");
        }
        Ok(value)
    };
    Ok(Vec3::new(next()?, next()?, next()?))
}

/// Accepts `v`, `v/vt`, `v//vn` and `v/vt/vn` corners.
fn parse_face<'a>(parts: impl Iterator<Item = &'a str>) -> Result<Vec<Corner>> {
    let mut corners = Vec::new();
    for part in parts {
        let mut segments = part.split('/');
        let position = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("missing vertex index"))?
            .parse::<i32>()
            .with_context(|| format!("bad vertex reference `{part}`"))?;
        let _texcoord = segments.next();
        let normal = match segments.next() {
            Some(s) if !s.is_empty() => s
                .parse::<i32>()
                .with_context(|| format!("bad normal reference `{part}`"))?,
            _ => 0,
        };
        corners.push(Corner { position, normal });
    }
    if corners.len() < 3 {
        bail!("faces must reference at least 3 vertices");
    }
    Ok(corners)
}

/// OBJ indices are 1-based; negative values count back from the end.
fn resolve_index(index: i32, len: usize) -> Option<usize> {
    match index {
        i if i > 0 => {
            let zero_based = i as usize - 1;
            (zero_based < len).then_some(zero_based)
        }
        i if i < 0 => {
            let back = i.unsigned_abs() as usize;
            (back <= len).then(|| len - back)
        }
        _ => None,
    }
}

pub(super) fn missing_normals(mesh: &MeshData) -> bool {
    mesh.vertices
        .chunks_exact(MeshData::STRIDE)
        .any(|v| v[3] == 0.0 && v[4] == 0.0 && v[5] == 0.0)
}

/// Area-weighted vertex normals from the triangle list.
pub(super) fn compute_normals(mesh: &mut MeshData) {
    let mut accum = vec![Vec3::ZERO; mesh.vertex_count()];
    let position = |v: &[f32], i: usize| Vec3::from_slice(&v[i * MeshData::STRIDE..][..3]);

    for tri in mesh.indices.chunks_exact(3) {
        let [a, b, c] = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
        let (p0, p1, p2) = (
            position(&mesh.vertices, a),
            position(&mesh.vertices, b),
            position(&mesh.vertices, c),
        );
        let face = (p1 - p0).cross(p2 - p0);
        for i in [a, b, c] {
            accum[i] += face;
        }
    }

    for (i, normal) in accum.into_iter().enumerate() {
        let n = normal.normalize_or_zero();
        let base = i * MeshData::STRIDE + 3;
        mesh.vertices[base..base + 3].copy_from_slice(&[n.x, n.y, n.z]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUAD: &str = "
v 0 0 0
v 2 0 0
v 2 1 0
v 0 1 0
f 1 2 3 4
";

    #[test]
    fn triangulates_quads() {
        let asset = parse_obj(QUAD).unwrap();
        assert_eq!(asset.meshes.len(), 1);
        assert_eq!(asset.meshes[0].indices, vec![0, 1, 2, 0, 2, 3]);
        assert_eq!(asset.vertex_count(), 4);
    }

    #[test]
    fn fills_in_missing_normals() {
        let asset = parse_obj(QUAD).unwrap();
        for v in asset.meshes[0].vertices.chunks_exact(MeshData::STRIDE) {
            assert!((Vec3::new(v[3], v[4], v[5]) - Vec3::Z).length() < 1e-5);
        }
    }

    #[test]
    fn groups_and_materials_split_meshes() {
        let doc = "
v 0 0 0
v 1 0 0
v 0 1 0
v 0 0 1
o body
usemtl red
f 1 2 3
o cap
usemtl steel
f -4 -3 -1
";
        let asset = parse_obj(doc).unwrap();
        let names: Vec<&str> = asset.meshes.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["body", "cap"]);
        assert_eq!(asset.materials.len(), 2);
        assert_eq!(asset.meshes[1].material, Some(1));
        asset.validate().unwrap();
    }

    #[test]
    fn rejects_documents_without_vertices() {
        assert!(parse_obj("# nothing here\n").is_err());
    }

    #[test]
    fn rejects_coordinates_that_overflow() {
        let err = parse_obj("v 0 0 0\nv 1e39 0 0\nv 0 1 0\nf 1 2 3\n").unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
        assert!(parse_obj("v nan 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n").is_err());
    }

    #[test]
    fn reports_line_of_bad_face() {
        let err = parse_obj("v 0 0 0\nf 1 2\n").unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }
}
