//! Host-side scene model: GPU-facing vertex/material layouts, validation,
//! and the emissive-triangle light list with its sampling CDF.
//!
//! Struct layouts are std430-compatible (16-byte aligned vectors with
//! explicit padding) and must match the shader-side declarations.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Emission luminance below this is treated as non-emissive.
const EMISSIVE_EPSILON: f32 = 1e-4;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub _pad0: f32,
    pub normal: [f32; 3],
    pub _pad1: f32,
    pub tangent: [f32; 4],
    pub uv: [f32; 2],
    pub _pad2: [f32; 2],
}

impl Vertex {
    pub fn new(position: Vec3, normal: Vec3, tangent: [f32; 4], uv: [f32; 2]) -> Self {
        Vertex {
            position: position.to_array(),
            _pad0: 0.0,
            normal: normal.to_array(),
            _pad1: 0.0,
            tangent,
            uv,
            _pad2: [0.0; 2],
        }
    }
}

/// Shading model selector, mirrored as an i32 in the GPU material record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaterialKind {
    Lambertian,
    Metal,
    Dielectric,
}

impl MaterialKind {
    pub fn as_gpu(self) -> i32 {
        match self {
            MaterialKind::Lambertian => 0,
            MaterialKind::Metal => 1,
            MaterialKind::Dielectric => 2,
        }
    }
}

/// Thresholds turning continuous glTF factors into a discrete shading model.
///
/// The factors come straight from the file; anything at or above
/// `transmission_threshold` is a dielectric, else anything at or above
/// `metallic_threshold` is a metal, else Lambertian.
#[derive(Clone, Copy, Debug)]
pub struct ClassifyParams {
    pub metallic_threshold: f32,
    pub transmission_threshold: f32,
}

impl Default for ClassifyParams {
    fn default() -> Self {
        ClassifyParams {
            metallic_threshold: 0.5,
            transmission_threshold: 0.5,
        }
    }
}

impl ClassifyParams {
    pub fn classify(&self, metallic: f32, transmission: f32) -> MaterialKind {
        if transmission >= self.transmission_threshold {
            MaterialKind::Dielectric
        } else if metallic >= self.metallic_threshold {
            MaterialKind::Metal
        } else {
            MaterialKind::Lambertian
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Material {
    pub albedo: [f32; 4],
    /// Radiance in linear RGB; w unused.
    pub emission: [f32; 4],
    /// Texture indices into the scene texture array; -1 means none.
    pub base_color_texture: i32,
    pub metallic_roughness_texture: i32,
    pub normal_texture: i32,
    /// `MaterialKind::as_gpu()`.
    pub kind: i32,
    pub roughness: f32,
    pub metallic: f32,
    pub ior: f32,
    pub alpha: f32,
}

impl Default for Material {
    fn default() -> Self {
        Material {
            albedo: [1.0, 1.0, 1.0, 1.0],
            emission: [0.0; 4],
            base_color_texture: -1,
            metallic_roughness_texture: -1,
            normal_texture: -1,
            kind: MaterialKind::Lambertian.as_gpu(),
            roughness: 1.0,
            metallic: 0.0,
            ior: 1.5,
            alpha: 1.0,
        }
    }
}

/// Decoded RGBA8 texture pixels waiting for GPU upload.
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// The complete host-side scene, ready for buffer upload and BLAS build.
pub struct SceneData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub materials: Vec<Material>,
    /// One material index per triangle.
    pub material_indices: Vec<u32>,
    pub textures: Vec<TextureData>,
}

impl SceneData {
    /// Cross-check every index relation before anything touches the GPU.
    pub fn validate(&self) -> Result<(), String> {
        if self.indices.len() % 3 != 0 {
            return Err(format!(
                "Index count {} is not a multiple of 3",
                self.indices.len()
            ));
        }
        let triangle_count = self.indices.len() / 3;
        if self.material_indices.len() != triangle_count {
            return Err(format!(
                "{} material indices for {} triangles",
                self.material_indices.len(),
                triangle_count
            ));
        }
        for (i, &idx) in self.indices.iter().enumerate() {
            if idx as usize >= self.vertices.len() {
                return Err(format!(
                    "Vertex index {} at position {} out of bounds ({} vertices)",
                    idx,
                    i,
                    self.vertices.len()
                ));
            }
        }
        for (tri, &mat) in self.material_indices.iter().enumerate() {
            if mat as usize >= self.materials.len() {
                return Err(format!(
                    "Material index {} on triangle {} out of bounds ({} materials)",
                    mat,
                    tri,
                    self.materials.len()
                ));
            }
        }
        for (i, mat) in self.materials.iter().enumerate() {
            for tex in [
                mat.base_color_texture,
                mat.metallic_roughness_texture,
                mat.normal_texture,
            ] {
                if tex != -1 && (tex < 0 || tex as usize >= self.textures.len()) {
                    return Err(format!(
                        "Texture index {} on material {} out of bounds ({} textures)",
                        tex,
                        i,
                        self.textures.len()
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// One emissive triangle, GPU layout for the light-sampling SSBO.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct EmissiveLight {
    /// Triangle corners in world space; w unused.
    pub v0: [f32; 4],
    pub v1: [f32; 4],
    pub v2: [f32; 4],
    /// xyz geometric normal, w triangle area.
    pub normal_area: [f32; 4],
    pub radiance: [f32; 4],
}

fn luminance(rgb: [f32; 3]) -> f32 {
    0.2126 * rgb[0] + 0.7152 * rgb[1] + 0.0722 * rgb[2]
}

/// Extract every emissive triangle and its power-weighted sampling CDF.
///
/// Emitted radiance is the emission factor modulated by albedo, so a black
/// surface never becomes a light regardless of its emission factor. The CDF
/// is normalized so the last entry is exactly 1.0. Scenes without emissive
/// triangles yield two empty vectors.
pub fn build_light_list(scene: &SceneData) -> (Vec<EmissiveLight>, Vec<f32>) {
    let mut lights = Vec::new();
    let mut weights = Vec::new();

    for tri in 0..scene.triangle_count() {
        let mat = &scene.materials[scene.material_indices[tri] as usize];
        let radiance = [
            mat.emission[0] * mat.albedo[0],
            mat.emission[1] * mat.albedo[1],
            mat.emission[2] * mat.albedo[2],
        ];
        let lum = luminance(radiance);
        if lum <= EMISSIVE_EPSILON {
            continue;
        }

        let i0 = scene.indices[tri * 3] as usize;
        let i1 = scene.indices[tri * 3 + 1] as usize;
        let i2 = scene.indices[tri * 3 + 2] as usize;
        let p0 = Vec3::from(scene.vertices[i0].position);
        let p1 = Vec3::from(scene.vertices[i1].position);
        let p2 = Vec3::from(scene.vertices[i2].position);

        let cross = (p1 - p0).cross(p2 - p0);
        let area = 0.5 * cross.length();
        if area <= 0.0 {
            continue;
        }
        let normal = cross.normalize();

        lights.push(EmissiveLight {
            v0: [p0.x, p0.y, p0.z, 0.0],
            v1: [p1.x, p1.y, p1.z, 0.0],
            v2: [p2.x, p2.y, p2.z, 0.0],
            normal_area: [normal.x, normal.y, normal.z, area],
            radiance: [radiance[0], radiance[1], radiance[2], 0.0],
        });
        // Emitted power scales with both radiance and surface area.
        weights.push(lum * area);
    }

    if lights.is_empty() {
        return (lights, Vec::new());
    }

    let total: f32 = weights.iter().sum();
    let mut cdf = Vec::with_capacity(weights.len());
    let mut acc = 0.0f32;
    for w in &weights {
        acc += w / total;
        cdf.push(acc);
    }
    // Pin the tail against float accumulation error.
    if let Some(last) = cdf.last_mut() {
        *last = 1.0;
    }

    (lights, cdf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_scene(emissions: &[[f32; 3]]) -> SceneData {
        // One right triangle per material, laid out side by side.
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        let mut materials = Vec::new();
        let mut material_indices = Vec::new();
        for (i, e) in emissions.iter().enumerate() {
            let x = i as f32 * 2.0;
            let base = vertices.len() as u32;
            vertices.push(Vertex::new(
                Vec3::new(x, 0.0, 0.0),
                Vec3::Z,
                [1.0, 0.0, 0.0, 1.0],
                [0.0, 0.0],
            ));
            vertices.push(Vertex::new(
                Vec3::new(x + 1.0, 0.0, 0.0),
                Vec3::Z,
                [1.0, 0.0, 0.0, 1.0],
                [1.0, 0.0],
            ));
            vertices.push(Vertex::new(
                Vec3::new(x, 1.0, 0.0),
                Vec3::Z,
                [1.0, 0.0, 0.0, 1.0],
                [0.0, 1.0],
            ));
            indices.extend([base, base + 1, base + 2]);
            materials.push(Material {
                emission: [e[0], e[1], e[2], 0.0],
                ..Material::default()
            });
            material_indices.push(i as u32);
        }
        SceneData {
            vertices,
            indices,
            materials,
            material_indices,
            textures: Vec::new(),
        }
    }

    #[test]
    fn validation_accepts_a_consistent_scene() {
        let scene = quad_scene(&[[0.0; 3], [1.0; 3]]);
        assert!(scene.validate().is_ok());
    }

    #[test]
    fn validation_rejects_material_index_out_of_bounds() {
        let mut scene = quad_scene(&[[0.0; 3]]);
        scene.material_indices[0] = 7;
        assert!(scene.validate().is_err());
    }

    #[test]
    fn validation_rejects_wrong_material_index_count() {
        let mut scene = quad_scene(&[[0.0; 3], [0.0; 3]]);
        scene.material_indices.pop();
        assert!(scene.validate().is_err());
    }

    #[test]
    fn validation_rejects_vertex_index_out_of_bounds() {
        let mut scene = quad_scene(&[[0.0; 3]]);
        scene.indices[1] = 999;
        assert!(scene.validate().is_err());
    }

    #[test]
    fn validation_rejects_bad_texture_index() {
        let mut scene = quad_scene(&[[0.0; 3]]);
        scene.materials[0].base_color_texture = 2;
        assert!(scene.validate().is_err());
    }

    #[test]
    fn cdf_is_monotone_and_ends_at_one() {
        let scene = quad_scene(&[[5.0, 5.0, 5.0], [1.0, 1.0, 1.0], [0.2, 0.9, 0.1]]);
        let (lights, cdf) = build_light_list(&scene);
        assert_eq!(lights.len(), 3);
        assert_eq!(cdf.len(), 3);
        for pair in cdf.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!((cdf.last().unwrap() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn no_emissive_triangles_means_no_lights() {
        let scene = quad_scene(&[[0.0; 3], [0.0; 3]]);
        let (lights, cdf) = build_light_list(&scene);
        assert!(lights.is_empty());
        assert!(cdf.is_empty());
    }

    #[test]
    fn one_emissive_one_dark_yields_a_single_light() {
        let scene = quad_scene(&[[0.0; 3], [10.0, 10.0, 10.0]]);
        let (lights, cdf) = build_light_list(&scene);
        assert_eq!(lights.len(), 1);
        assert_eq!(cdf, vec![1.0]);
        assert_eq!(lights[0].radiance[0], 10.0);
        // Unit right triangle.
        assert!((lights[0].normal_area[3] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn albedo_modulates_emission() {
        // Black albedo suppresses the light entirely.
        let mut scene = quad_scene(&[[10.0, 10.0, 10.0]]);
        scene.materials[0].albedo = [0.0, 0.0, 0.0, 1.0];
        let (lights, cdf) = build_light_list(&scene);
        assert!(lights.is_empty());
        assert!(cdf.is_empty());

        // Grey albedo scales the stored radiance.
        let mut scene = quad_scene(&[[10.0, 10.0, 10.0]]);
        scene.materials[0].albedo = [0.5, 0.5, 0.5, 1.0];
        let (lights, _) = build_light_list(&scene);
        assert_eq!(lights.len(), 1);
        assert_eq!(lights[0].radiance[0], 5.0);
    }

    #[test]
    fn classification_thresholds() {
        let params = ClassifyParams::default();
        assert_eq!(params.classify(0.0, 0.0), MaterialKind::Lambertian);
        assert_eq!(params.classify(0.9, 0.0), MaterialKind::Metal);
        assert_eq!(params.classify(0.9, 0.9), MaterialKind::Dielectric);
        assert_eq!(params.classify(0.49, 0.49), MaterialKind::Lambertian);

        let strict = ClassifyParams {
            metallic_threshold: 0.95,
            transmission_threshold: 0.95,
        };
        assert_eq!(strict.classify(0.9, 0.0), MaterialKind::Lambertian);
    }

    #[test]
    fn gpu_struct_sizes_are_stable() {
        assert_eq!(std::mem::size_of::<Vertex>(), 64);
        assert_eq!(std::mem::size_of::<Material>(), 64);
        assert_eq!(std::mem::size_of::<EmissiveLight>(), 80);
    }
}
