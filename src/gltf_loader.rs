//! glTF 2.0 ingestion: flattens the node hierarchy into one world-space
//! triangle soup with per-triangle material indices, ready for BLAS build.
//!
//! Uses the `gltf` crate for parsing and image decoding. Texture images are
//! deduplicated by glTF image index so a texture shared by several materials
//! is uploaded once.

use glam::{Mat4, Quat, Vec3, Vec4};
use log::{info, warn};
use std::collections::HashMap;
use std::path::Path;

use crate::scene::{ClassifyParams, Material, SceneData, TextureData, Vertex};

/// Load a .glb/.gltf file and bake it into a flat scene.
pub fn load_gltf(path: &Path, classify: ClassifyParams) -> Result<SceneData, String> {
    let (document, buffers, images) =
        gltf::import(path).map_err(|e| format!("Failed to load glTF {}: {}", path.display(), e))?;

    info!(
        "Loaded glTF: {} meshes, {} materials, {} images",
        document.meshes().count(),
        document.materials().count(),
        images.len()
    );

    let mut scene = SceneData {
        vertices: Vec::new(),
        indices: Vec::new(),
        materials: Vec::new(),
        material_indices: Vec::new(),
        textures: Vec::new(),
    };

    // glTF image index -> scene texture slot, shared across materials.
    let mut texture_slots: HashMap<usize, i32> = HashMap::new();
    let mut intern_texture = |images: &[gltf::image::Data],
                              scene_textures: &mut Vec<TextureData>,
                              texture: Option<gltf::Texture>|
     -> i32 {
        let Some(tex) = texture else { return -1 };
        let img_index = tex.source().index();
        if let Some(&slot) = texture_slots.get(&img_index) {
            return slot;
        }
        let Some(data) = images.get(img_index).and_then(decode_image) else {
            warn!("Skipping undecodable texture image {}", img_index);
            return -1;
        };
        let slot = scene_textures.len() as i32;
        scene_textures.push(data);
        texture_slots.insert(img_index, slot);
        slot
    };

    // --- Materials ---
    for mat in document.materials() {
        let pbr = mat.pbr_metallic_roughness();
        let transmission = mat
            .transmission()
            .map(|t| t.transmission_factor())
            .unwrap_or(0.0);
        let emissive = mat.emissive_factor();
        let emissive_strength = mat.emissive_strength().unwrap_or(1.0);

        let base_color_texture = intern_texture(
            &images,
            &mut scene.textures,
            pbr.base_color_texture().map(|t| t.texture()),
        );
        let metallic_roughness_texture = intern_texture(
            &images,
            &mut scene.textures,
            pbr.metallic_roughness_texture().map(|t| t.texture()),
        );
        let normal_texture = intern_texture(
            &images,
            &mut scene.textures,
            mat.normal_texture().map(|t| t.texture()),
        );

        scene.materials.push(Material {
            albedo: pbr.base_color_factor(),
            emission: [
                emissive[0] * emissive_strength,
                emissive[1] * emissive_strength,
                emissive[2] * emissive_strength,
                0.0,
            ],
            base_color_texture,
            metallic_roughness_texture,
            normal_texture,
            kind: classify
                .classify(pbr.metallic_factor(), transmission)
                .as_gpu(),
            roughness: pbr.roughness_factor(),
            metallic: pbr.metallic_factor(),
            ior: mat.ior().unwrap_or(1.5),
            alpha: pbr.base_color_factor()[3],
        });
    }
    if scene.materials.is_empty() {
        scene.materials.push(Material::default());
    }

    // --- Geometry, baked to world space ---
    let nodes: Vec<gltf::Node> = document.nodes().collect();
    let roots: Vec<usize> = document
        .default_scene()
        .or_else(|| document.scenes().next())
        .map(|s| s.nodes().map(|n| n.index()).collect())
        .unwrap_or_default();

    for root in roots {
        bake_node(&nodes, root, Mat4::IDENTITY, &buffers, &mut scene);
    }

    if scene.indices.is_empty() {
        return Err(format!(
            "{}: no triangle geometry in the default scene",
            path.display()
        ));
    }

    scene.validate()?;

    info!(
        "Scene baked: {} vertices, {} triangles, {} materials, {} textures",
        scene.vertices.len(),
        scene.triangle_count(),
        scene.materials.len(),
        scene.textures.len()
    );

    Ok(scene)
}

fn bake_node(
    nodes: &[gltf::Node],
    node_idx: usize,
    parent_world: Mat4,
    buffers: &[gltf::buffer::Data],
    scene: &mut SceneData,
) {
    let node = &nodes[node_idx];
    let (t, r, s) = node.transform().decomposed();
    let local = Mat4::from_translation(Vec3::from(t))
        * Mat4::from_quat(Quat::from_array(r))
        * Mat4::from_scale(Vec3::from(s));
    let world = parent_world * local;

    if let Some(mesh) = node.mesh() {
        for prim in mesh.primitives() {
            if prim.mode() != gltf::mesh::Mode::Triangles {
                warn!("Skipping non-triangle primitive in mesh {:?}", mesh.name());
                continue;
            }
            bake_primitive(&prim, world, buffers, scene);
        }
    }

    for child in node.children() {
        bake_node(nodes, child.index(), world, buffers, scene);
    }
}

fn bake_primitive(
    prim: &gltf::Primitive,
    world: Mat4,
    buffers: &[gltf::buffer::Data],
    scene: &mut SceneData,
) {
    let reader = prim.reader(|buffer| Some(&buffers[buffer.index()]));

    let positions: Vec<[f32; 3]> = reader
        .read_positions()
        .map(|iter| iter.collect())
        .unwrap_or_default();
    if positions.is_empty() {
        return;
    }

    let normals: Vec<[f32; 3]> = reader
        .read_normals()
        .map(|iter| iter.collect())
        .unwrap_or_default();
    let texcoords: Vec<[f32; 2]> = reader
        .read_tex_coords(0)
        .map(|iter| iter.into_f32().collect())
        .unwrap_or_default();
    let tangents: Vec<[f32; 4]> = reader
        .read_tangents()
        .map(|iter| iter.collect())
        .unwrap_or_default();

    // Normals need the inverse-transpose under non-uniform scale.
    let normal_matrix = world.inverse().transpose();

    let base = scene.vertices.len() as u32;
    for i in 0..positions.len() {
        let world_pos = world.transform_point3(Vec3::from(positions[i]));
        let normal = if i < normals.len() {
            normal_matrix
                .transform_vector3(Vec3::from(normals[i]))
                .normalize_or_zero()
        } else {
            Vec3::Y
        };
        let tangent = if i < tangents.len() {
            let t = tangents[i];
            let world_t = world.transform_vector3(Vec3::new(t[0], t[1], t[2]));
            let world_t = Vec4::new(world_t.x, world_t.y, world_t.z, t[3]);
            world_t.to_array()
        } else {
            [1.0, 0.0, 0.0, 1.0]
        };
        let uv = if i < texcoords.len() {
            texcoords[i]
        } else {
            [0.0, 0.0]
        };
        scene.vertices.push(Vertex::new(world_pos, normal, tangent, uv));
    }

    let indices: Vec<u32> = reader
        .read_indices()
        .map(|iter| iter.into_u32().collect())
        .unwrap_or_else(|| (0..positions.len() as u32).collect());

    let material_index = prim.material().index().unwrap_or(0) as u32;
    for tri in indices.chunks_exact(3) {
        scene.indices.extend(tri.iter().map(|&i| base + i));
        scene.material_indices.push(material_index);
    }
}

/// Normalize whatever the gltf crate decoded into tightly packed RGBA8.
fn decode_image(img: &gltf::image::Data) -> Option<TextureData> {
    let (width, height) = (img.width, img.height);
    let pixel_count = (width * height) as usize;

    let pixels = match img.format {
        gltf::image::Format::R8G8B8A8 => img.pixels.clone(),
        gltf::image::Format::R8G8B8 => {
            // chunks_exact drops a truncated tail; the size check below
            // then rejects the image instead of panicking mid-decode.
            let mut rgba = Vec::with_capacity(pixel_count * 4);
            for chunk in img.pixels.chunks_exact(3) {
                rgba.extend_from_slice(chunk);
                rgba.push(255);
            }
            rgba
        }
        gltf::image::Format::R8 => {
            let mut rgba = Vec::with_capacity(pixel_count * 4);
            for &v in &img.pixels {
                rgba.extend_from_slice(&[v, v, v, 255]);
            }
            rgba
        }
        gltf::image::Format::R8G8 => {
            let mut rgba = Vec::with_capacity(pixel_count * 4);
            for chunk in img.pixels.chunks_exact(2) {
                rgba.extend_from_slice(&[chunk[0], chunk[1], 0, 255]);
            }
            rgba
        }
        _ => return None,
    };

    if pixels.len() != pixel_count * 4 {
        return None;
    }
    Some(TextureData {
        width,
        height,
        pixels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_data(format: gltf::image::Format, width: u32, pixels: Vec<u8>) -> gltf::image::Data {
        gltf::image::Data {
            pixels,
            format,
            width,
            height: 1,
        }
    }

    #[test]
    fn rgb_expands_to_rgba() {
        let img = image_data(gltf::image::Format::R8G8B8, 2, vec![1, 2, 3, 4, 5, 6]);
        let tex = decode_image(&img).unwrap();
        assert_eq!(tex.pixels, vec![1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn truncated_pixel_data_is_rejected() {
        // 2x1 RGB image missing the last byte of the second pixel.
        let img = image_data(gltf::image::Format::R8G8B8, 2, vec![1, 2, 3, 4, 5]);
        assert!(decode_image(&img).is_none());

        let img = image_data(gltf::image::Format::R8G8, 2, vec![1, 2, 3]);
        assert!(decode_image(&img).is_none());

        let img = image_data(gltf::image::Format::R8G8B8A8, 2, vec![0; 7]);
        assert!(decode_image(&img).is_none());
    }

    #[test]
    fn sixteen_bit_formats_are_unsupported() {
        let img = image_data(gltf::image::Format::R16G16B16A16, 1, vec![0; 8]);
        assert!(decode_image(&img).is_none());
    }
}
