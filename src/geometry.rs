use cgmath::{Matrix4, SquareMatrix, Vector3};
use std::sync::Arc;

/// Vertex and index arrays of one sub-surface.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SurfaceArrays {
    pub positions: Vec<[f32; 3]>,
    pub normals: Vec<[f32; 3]>,
    pub uvs: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
}

impl SurfaceArrays {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn is_consistent(&self) -> bool {
        let n = self.positions.len();
        self.normals.len() == n
            && self.uvs.len() == n
            && self.indices.len() % 3 == 0
            && self.indices.iter().all(|&i| (i as usize) < n)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshData {
    pub surfaces: Vec<SurfaceArrays>,
}

impl MeshData {
    /// Flat square in the XZ plane centred on the origin, facing +Y, with
    /// `subdivisions` interior lines per side.
    pub fn grid_patch(subdivisions: u32, size: f32) -> Self {
        let side = subdivisions as usize + 2;
        let mut arrays = SurfaceArrays::default();
        for i in 0..side {
            for j in 0..side {
                let u = j as f32 / (side - 1) as f32;
                let v = i as f32 / (side - 1) as f32;
                arrays.positions.push([(u - 0.5) * size, 0.0, (v - 0.5) * size]);
                arrays.normals.push([0.0, 1.0, 0.0]);
                arrays.uvs.push([u, v]);
            }
        }
        for i in 0..side - 1 {
            for j in 0..side - 1 {
                let a = (i * side + j) as u32;
                let b = a + 1;
                let c = a + side as u32;
                let d = c + 1;
                arrays.indices.extend_from_slice(&[a, c, b, b, c, d]);
            }
        }
        Self {
            surfaces: vec![arrays],
        }
    }

    /// Axis-aligned box with its base on y = 0.
    pub fn box_mesh(extent: Vector3<f32>) -> Self {
        let (hx, hz) = (extent.x / 2.0, extent.z / 2.0);
        let y = extent.y;
        #[rustfmt::skip]
        let faces: [([f32; 3], [[f32; 3]; 4]); 6] = [
            ([0.0, 1.0, 0.0], [[-hx, y, -hz], [-hx, y, hz], [hx, y, hz], [hx, y, -hz]]),
            ([0.0, -1.0, 0.0], [[-hx, 0.0, hz], [-hx, 0.0, -hz], [hx, 0.0, -hz], [hx, 0.0, hz]]),
            ([1.0, 0.0, 0.0], [[hx, 0.0, -hz], [hx, y, -hz], [hx, y, hz], [hx, 0.0, hz]]),
            ([-1.0, 0.0, 0.0], [[-hx, 0.0, hz], [-hx, y, hz], [-hx, y, -hz], [-hx, 0.0, -hz]]),
            ([0.0, 0.0, 1.0], [[hx, 0.0, hz], [hx, y, hz], [-hx, y, hz], [-hx, 0.0, hz]]),
            ([0.0, 0.0, -1.0], [[-hx, 0.0, -hz], [-hx, y, -hz], [hx, y, -hz], [hx, 0.0, -hz]]),
        ];
        let mut arrays = SurfaceArrays::default();
        for (normal, corners) in faces {
            let base = arrays.positions.len() as u32;
            for (corner, uv) in corners.iter().zip([[0.0, 0.0], [0.0, 1.0], [1.0, 1.0], [1.0, 0.0]]) {
                arrays.positions.push(*corner);
                arrays.normals.push(normal);
                arrays.uvs.push(uv);
            }
            arrays
                .indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        Self {
            surfaces: vec![arrays],
        }
    }
}

/// A mesh placed in the world.
#[derive(Clone, Debug)]
pub struct DeformableSurface {
    pub mesh: Arc<MeshData>,
    pub transform: Matrix4<f32>,
}

/// Source of deformable geometry. Mesh changes raise the staleness flag;
/// transform changes do not.
pub trait GeometryRegistry {
    fn deformable_surfaces(&self) -> Vec<DeformableSurface>;
    fn transforms(&self) -> Vec<Matrix4<f32>>;
    fn is_stale(&self) -> bool;
    fn mark_synced(&mut self);
}

#[derive(Default)]
pub struct SurfaceRegistry {
    surfaces: Vec<DeformableSurface>,
    stale: bool,
}

impl SurfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }

    pub fn add(&mut self, mesh: Arc<MeshData>, transform: Matrix4<f32>) -> usize {
        self.surfaces.push(DeformableSurface { mesh, transform });
        self.stale = true;
        self.surfaces.len() - 1
    }

    pub fn replace_mesh(&mut self, id: usize, mesh: Arc<MeshData>) {
        if let Some(surface) = self.surfaces.get_mut(id) {
            surface.mesh = mesh;
            self.stale = true;
        }
    }

    pub fn set_transform(&mut self, id: usize, transform: Matrix4<f32>) {
        if let Some(surface) = self.surfaces.get_mut(id) {
            surface.transform = transform;
        }
    }

    pub fn clear(&mut self) {
        if !self.surfaces.is_empty() {
            self.surfaces.clear();
            self.stale = true;
        }
    }
}

impl GeometryRegistry for SurfaceRegistry {
    fn deformable_surfaces(&self) -> Vec<DeformableSurface> {
        self.surfaces.clone()
    }

    fn transforms(&self) -> Vec<Matrix4<f32>> {
        self.surfaces.iter().map(|s| s.transform).collect()
    }

    fn is_stale(&self) -> bool {
        self.stale
    }

    fn mark_synced(&mut self) {
        self.stale = false;
    }
}

pub fn identity_transform() -> Matrix4<f32> {
    Matrix4::identity()
}
