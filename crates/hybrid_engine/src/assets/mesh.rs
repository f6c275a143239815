//! Mesh data, procedural builders and GPU mesh assets
//!
//! A mesh asset owns its vertex and index buffers, a per-triangle area CDF
//! used by the ray tracer for light sampling, and the bottom-level
//! acceleration structure built over its triangles at load time.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use super::texture::TextureData;
use super::AssetError;
use crate::foundation::logging::debug;
use crate::foundation::math::Vec3;
use crate::render::api::{
    AccelerationStructureHandle, BlasDesc, BufferDesc, BufferHandle, RenderDevice, VertexAttribute,
    VertexInputLayout,
};

/// Stable mesh identity, never reused while the pool lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MeshId(pub u32);

impl std::fmt::Display for MeshId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mesh#{}", self.0)
    }
}

/// Interleaved vertex as stored in vertex buffers
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex {
    /// Object-space position
    pub position: [f32; 3],
    /// Object-space normal
    pub normal: [f32; 3],
    /// Object-space tangent
    pub tangent: [f32; 3],
    /// Texture coordinate
    pub tex_coord: [f32; 2],
    /// Free per-vertex scalar passed through to shaders
    pub signal: f32,
}

impl Vertex {
    /// Vertex with position, normal and texture coordinate
    pub fn new(position: [f32; 3], normal: [f32; 3], tex_coord: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            tangent: [0.0; 3],
            tex_coord,
            signal: 0.0,
        }
    }

    /// Stride in bytes
    pub const STRIDE: u32 = std::mem::size_of::<Self>() as u32;

    /// Vertex input layout for graphics pipelines
    pub fn layout() -> VertexInputLayout {
        let attribute = |location, format, offset| VertexAttribute { location, format, offset };
        VertexInputLayout {
            stride: Self::STRIDE,
            attributes: vec![
                attribute(0, vk::Format::R32G32B32_SFLOAT, 0),
                attribute(1, vk::Format::R32G32B32_SFLOAT, 12),
                attribute(2, vk::Format::R32G32B32_SFLOAT, 24),
                attribute(3, vk::Format::R32G32_SFLOAT, 36),
                attribute(4, vk::Format::R32_SFLOAT, 44),
            ],
        }
    }
}

/// Decoded or generated triangle mesh
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeshData {
    /// Vertices
    pub vertices: Vec<Vertex>,
    /// Triangle list indices
    pub indices: Vec<u32>,
}

/// Maps grid column `index` of a `target`-wide grid onto a `source`-wide
/// texel row. Widened so very large height maps do not overflow.
fn resample(index: u32, source: u32, target: u32) -> u32 {
    let span = u64::from(target.max(2) - 1);
    (u64::from(index) * u64::from(source.saturating_sub(1)) / span) as u32
}

impl MeshData {
    /// Wrap vertex and index lists, checking the indices
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Result<Self, AssetError> {
        let mesh = Self { vertices, indices };
        mesh.validate()?;
        Ok(mesh)
    }

    /// Check for an empty mesh, a partial triangle or an out-of-range index
    pub fn validate(&self) -> Result<(), AssetError> {
        if self.vertices.is_empty() || self.indices.is_empty() {
            return Err(AssetError::InvalidData("mesh has no geometry".into()));
        }
        if self.indices.len() % 3 != 0 {
            return Err(AssetError::InvalidData(format!(
                "{} indices do not form whole triangles",
                self.indices.len()
            )));
        }
        if let Some(&index) = self.indices.iter().find(|&&i| i as usize >= self.vertices.len()) {
            return Err(AssetError::InvalidData(format!(
                "index {index} out of range for {} vertices",
                self.vertices.len()
            )));
        }
        Ok(())
    }

    /// Unit cube centered at the origin, 24 vertices with flat normals
    pub fn cube() -> Self {
        let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
            ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
            ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ];
        let mut mesh = Self::default();
        for (normal, u_axis, v_axis) in faces {
            let (n, u, v) = (Vec3::from(normal), Vec3::from(u_axis), Vec3::from(v_axis));
            let base = mesh.vertices.len() as u32;
            for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                let position = (n + u * su + v * sv) * 0.5;
                mesh.vertices.push(Vertex {
                    position: position.into(),
                    normal,
                    tangent: u_axis,
                    tex_coord: [(su + 1.0) * 0.5, (1.0 - sv) * 0.5],
                    signal: 0.0,
                });
            }
            mesh.indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        mesh
    }

    /// Square in the XZ plane, `size` wide, facing +Y, split into
    /// `subdivisions × subdivisions` quads
    pub fn plane(size: f32, subdivisions: u32) -> Self {
        let heights = TextureData::solid(subdivisions.max(1) + 1, subdivisions.max(1) + 1, [0.0; 4]);
        Self::heightmap(&heights, size, 0.0)
    }

    /// Terrain grid with one vertex per texel; the red channel times
    /// `height_scale` is the elevation.
    pub fn heightmap(heights: &TextureData, size: f32, height_scale: f32) -> Self {
        let (w, h) = (heights.width().max(2), heights.height().max(2));
        let elevation = |x: u32, y: u32| {
            let sx = resample(x, heights.width(), w);
            let sy = resample(y, heights.height(), h);
            heights.pixel(sx, sy)[0] * height_scale
        };
        let step_x = size / (w - 1) as f32;
        let step_z = size / (h - 1) as f32;

        let mut mesh = Self::default();
        for y in 0..h {
            for x in 0..w {
                let left = elevation(x.saturating_sub(1), y);
                let right = elevation((x + 1).min(w - 1), y);
                let down = elevation(x, y.saturating_sub(1));
                let up = elevation(x, (y + 1).min(h - 1));
                let normal = Vec3::new(
                    (left - right) / (2.0 * step_x),
                    1.0,
                    (down - up) / (2.0 * step_z),
                )
                .normalize();
                mesh.vertices.push(Vertex {
                    position: [
                        x as f32 * step_x - size * 0.5,
                        elevation(x, y),
                        y as f32 * step_z - size * 0.5,
                    ],
                    normal: normal.into(),
                    tangent: [1.0, 0.0, 0.0],
                    tex_coord: [x as f32 / (w - 1) as f32, y as f32 / (h - 1) as f32],
                    signal: 0.0,
                });
            }
        }
        for y in 0..h - 1 {
            for x in 0..w - 1 {
                let i = y * w + x;
                mesh.indices.extend_from_slice(&[i, i + w, i + 1, i + 1, i + w, i + w + 1]);
            }
        }
        mesh
    }

    /// Area of every triangle
    pub fn triangle_areas(&self) -> Vec<f32> {
        self.indices
            .chunks_exact(3)
            .map(|tri| {
                let p = |i: u32| Vec3::from(self.vertices[i as usize].position);
                let (a, b, c) = (p(tri[0]), p(tri[1]), p(tri[2]));
                (b - a).cross(&(c - a)).norm() * 0.5
            })
            .collect()
    }

    /// Total area and the normalized cumulative distribution over triangles
    ///
    /// The last CDF entry is exactly 1.0 unless the mesh has zero area, in
    /// which case triangles are weighted uniformly.
    pub fn area_cdf(&self) -> (f32, Vec<f32>) {
        let areas = self.triangle_areas();
        let total: f32 = areas.iter().sum();
        let count = areas.len().max(1) as f32;
        let mut running = 0.0;
        let mut cdf: Vec<f32> = areas
            .iter()
            .map(|&area| {
                running += if total > 0.0 { area / total } else { 1.0 / count };
                running
            })
            .collect();
        if let Some(last) = cdf.last_mut() {
            *last = 1.0;
        }
        (total, cdf)
    }
}

/// A mesh resident on the device
#[derive(Debug, Clone)]
pub struct MeshAsset {
    pub(crate) id: MeshId,
    pub(crate) name: String,
    pub(crate) vertex_buffer: BufferHandle,
    pub(crate) index_buffer: BufferHandle,
    pub(crate) area_cdf_buffer: BufferHandle,
    pub(crate) blas: AccelerationStructureHandle,
    pub(crate) vertex_count: u32,
    pub(crate) index_count: u32,
    pub(crate) area: f32,
    pub(crate) binding_slot: u32,
}

fn geometry_usage(kind: vk::BufferUsageFlags) -> vk::BufferUsageFlags {
    kind | vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
}

impl MeshAsset {
    /// Upload geometry and build the bottom-level structure synchronously.
    /// Nothing is leaked when a step fails.
    pub(crate) fn upload(
        device: &mut dyn RenderDevice,
        id: MeshId,
        data: &MeshData,
        name: &str,
    ) -> Result<Self, AssetError> {
        data.validate()?;
        let mut created = Vec::with_capacity(3);
        match Self::build(device, id, data, name, &mut created) {
            Ok(mesh) => {
                debug!(
                    "[ASSETS] Uploaded {id} '{name}' ({} vertices, {} triangles, area {:.3})",
                    mesh.vertex_count,
                    mesh.index_count / 3,
                    mesh.area
                );
                Ok(mesh)
            }
            Err(err) => {
                created.iter().for_each(|&buffer| device.destroy_buffer(buffer));
                Err(err)
            }
        }
    }

    fn build(
        device: &mut dyn RenderDevice,
        id: MeshId,
        data: &MeshData,
        name: &str,
        created: &mut Vec<BufferHandle>,
    ) -> Result<Self, AssetError> {
        let (area, cdf) = data.area_cdf();
        let mut upload = |bytes: &[u8], usage: vk::BufferUsageFlags| -> Result<BufferHandle, AssetError> {
            let buffer = device.create_buffer(&BufferDesc::device_local(bytes.len() as u64, usage))?;
            created.push(buffer);
            device.upload_buffer(buffer, bytes)?;
            Ok(buffer)
        };
        let vertex_buffer = upload(
            bytemuck::cast_slice(&data.vertices),
            geometry_usage(vk::BufferUsageFlags::VERTEX_BUFFER),
        )?;
        let index_buffer = upload(
            bytemuck::cast_slice(&data.indices),
            geometry_usage(vk::BufferUsageFlags::INDEX_BUFFER),
        )?;
        let area_cdf_buffer = upload(bytemuck::cast_slice(&cdf), vk::BufferUsageFlags::STORAGE_BUFFER)?;

        let blas = device.create_blas(&BlasDesc {
            vertex_buffer,
            vertex_count: data.vertices.len() as u32,
            vertex_stride: u64::from(Vertex::STRIDE),
            index_buffer,
            index_count: data.indices.len() as u32,
        })?;

        Ok(Self {
            id,
            name: name.to_string(),
            vertex_buffer,
            index_buffer,
            area_cdf_buffer,
            blas,
            vertex_count: data.vertices.len() as u32,
            index_count: data.indices.len() as u32,
            area,
            binding_slot: 0,
        })
    }

    /// Release buffers and the bottom-level structure
    pub(crate) fn destroy(&self, device: &mut dyn RenderDevice) {
        device.destroy_acceleration_structure(self.blas);
        for buffer in [self.vertex_buffer, self.index_buffer, self.area_cdf_buffer] {
            device.destroy_buffer(buffer);
        }
    }

    /// Stable identity
    pub fn id(&self) -> MeshId {
        self.id
    }

    /// Human-readable name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Vertex buffer
    pub fn vertex_buffer(&self) -> BufferHandle {
        self.vertex_buffer
    }

    /// Index buffer
    pub fn index_buffer(&self) -> BufferHandle {
        self.index_buffer
    }

    /// Per-triangle area CDF buffer
    pub fn area_cdf_buffer(&self) -> BufferHandle {
        self.area_cdf_buffer
    }

    /// Bottom-level acceleration structure
    pub fn blas(&self) -> AccelerationStructureHandle {
        self.blas
    }

    /// Number of indices
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Number of vertices
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    /// Total surface area
    pub fn area(&self) -> f32 {
        self.area
    }

    /// Dense bindless slot, valid until the next load or destroy
    pub fn binding_slot(&self) -> u32 {
        self.binding_slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_vertex_stride_matches_layout() {
        assert_eq!(Vertex::STRIDE, 48);
        let layout = Vertex::layout();
        assert_eq!(layout.stride, 48);
        assert_eq!(layout.attributes.last().unwrap().offset, 44);
    }

    #[test]
    fn test_cube_is_closed_unit_box() {
        let cube = MeshData::cube();
        assert!(cube.validate().is_ok());
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        let (area, cdf) = cube.area_cdf();
        assert_relative_eq!(area, 6.0, epsilon = 1e-5);
        assert_eq!(cdf.len(), 12);
        assert_eq!(*cdf.last().unwrap(), 1.0);
        assert!(cube
            .vertices
            .iter()
            .all(|v| v.position.iter().all(|c| c.abs() <= 0.5 + 1e-6)));
    }

    #[test]
    fn test_cdf_is_monotonic() {
        let heights = TextureData::from_fn(4, 4, |x, y| [(x * y) as f32 * 0.1, 0.0, 0.0, 1.0]);
        let terrain = MeshData::heightmap(&heights, 10.0, 2.0);
        let (_, cdf) = terrain.area_cdf();
        assert!(cdf.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_plane_area_and_normals() {
        let plane = MeshData::plane(2.0, 4);
        assert_eq!(plane.vertices.len(), 25);
        assert_eq!(plane.indices.len(), 4 * 4 * 6);
        assert_relative_eq!(plane.area_cdf().0, 4.0, epsilon = 1e-4);
        assert!(plane.vertices.iter().all(|v| v.normal == [0.0, 1.0, 0.0]));
    }

    #[test]
    fn test_plane_faces_up() {
        let plane = MeshData::plane(1.0, 1);
        let p = |i: usize| Vec3::from(plane.vertices[plane.indices[i] as usize].position);
        let normal = (p(1) - p(0)).cross(&(p(2) - p(0)));
        assert!(normal.y > 0.0);
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let vertices = vec![Vertex::default(); 3];
        assert!(MeshData::new(vertices.clone(), vec![0, 1, 3]).is_err());
        assert!(MeshData::new(vertices.clone(), vec![0, 1]).is_err());
        assert!(MeshData::new(vertices, vec![0, 1, 2]).is_ok());
    }

    #[test]
    fn test_resample_handles_wide_height_maps() {
        let width = 100_000;
        assert_eq!(resample(width - 1, width, width), width - 1);
        assert_eq!(resample(70_000, width, width), 70_000);
        // coarse grid over a wide map lands on the far edge
        assert_eq!(resample(1, width, 2), width - 1);
        assert_eq!(resample(1, 1, 2), 0);
    }
}
