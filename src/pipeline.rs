//! Ray tracing pipeline: shader stages, the host side of the descriptor
//! binding contract, push constants, and the shader binding table.
//!
//! Binding layout (must match the shader declarations):
//!   0  TLAS                      raygen + closest-hit
//!   1  output radiance image     raygen
//!   2  vertex SSBO               closest-hit
//!   3  index SSBO                closest-hit
//!   4  material SSBO             closest-hit
//!   5  material-index SSBO       closest-hit
//!   6  texture array             closest-hit (size = max(1, texture count))
//!   7  g-buffer position         raygen
//!   8  g-buffer normal           raygen
//!   9  g-buffer albedo           raygen
//!   10 g-buffer motion           raygen
//!   11 matrices UBO              raygen
//!   12 light SSBO                closest-hit
//!   13 light CDF SSBO            closest-hit

use ash::vk;
use bytemuck::{Pod, Zeroable};
use log::info;
use std::path::Path;

use crate::accel::Accel;
use crate::buffer::{Buffer, BufferKind};
use crate::context::VulkanContext;
use crate::gbuffer::GBuffer;
use crate::image::{GpuImage, Texture};
use crate::spv_loader;

pub const BINDING_TLAS: u32 = 0;
pub const BINDING_OUTPUT: u32 = 1;
pub const BINDING_VERTICES: u32 = 2;
pub const BINDING_INDICES: u32 = 3;
pub const BINDING_MATERIALS: u32 = 4;
pub const BINDING_MATERIAL_INDICES: u32 = 5;
pub const BINDING_TEXTURES: u32 = 6;
pub const BINDING_GBUFFER_POSITION: u32 = 7;
pub const BINDING_GBUFFER_NORMAL: u32 = 8;
pub const BINDING_GBUFFER_ALBEDO: u32 = 9;
pub const BINDING_GBUFFER_MOTION: u32 = 10;
pub const BINDING_MATRICES: u32 = 11;
pub const BINDING_LIGHTS: u32 = 12;
pub const BINDING_LIGHT_CDF: u32 = 13;

const MAX_RECURSION_DEPTH: u32 = 4;

/// Push constants visible to the raygen stage.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct PushConstants {
    pub camera_position: [f32; 3],
    /// Accumulation frame counter; 0 restarts the temporal history.
    pub frame: u32,
    pub light_count: u32,
    pub _pad: [u32; 3],
}

/// View/projection matrices plus last frame's, for motion vectors.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct MatrixBuffer {
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
    pub prev_view: [[f32; 4]; 4],
    pub prev_proj: [[f32; 4]; 4],
}

/// Round `value` up to the next multiple of `alignment` (a power of two).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    (value + alignment - 1) & !(alignment - 1)
}

/// The full binding contract as layout bindings.
pub fn descriptor_bindings(texture_count: u32) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
    let rgen = vk::ShaderStageFlags::RAYGEN_KHR;
    let chit = vk::ShaderStageFlags::CLOSEST_HIT_KHR;

    let mut bindings = vec![
        vk::DescriptorSetLayoutBinding::default()
            .binding(BINDING_TLAS)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .descriptor_count(1)
            .stage_flags(rgen | chit),
        vk::DescriptorSetLayoutBinding::default()
            .binding(BINDING_OUTPUT)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .descriptor_count(1)
            .stage_flags(rgen),
    ];
    for binding in [
        BINDING_VERTICES,
        BINDING_INDICES,
        BINDING_MATERIALS,
        BINDING_MATERIAL_INDICES,
    ] {
        bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(chit),
        );
    }
    bindings.push(
        vk::DescriptorSetLayoutBinding::default()
            .binding(BINDING_TEXTURES)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(texture_count.max(1))
            .stage_flags(chit),
    );
    for binding in [
        BINDING_GBUFFER_POSITION,
        BINDING_GBUFFER_NORMAL,
        BINDING_GBUFFER_ALBEDO,
        BINDING_GBUFFER_MOTION,
    ] {
        bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1)
                .stage_flags(rgen),
        );
    }
    bindings.push(
        vk::DescriptorSetLayoutBinding::default()
            .binding(BINDING_MATRICES)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(rgen),
    );
    for binding in [BINDING_LIGHTS, BINDING_LIGHT_CDF] {
        bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(chit),
        );
    }
    bindings
}

/// The built pipeline with its SBT regions and descriptor set.
pub struct RtPipeline {
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub descriptor_set: vk::DescriptorSet,
    sbt_buffer: Buffer,
    pub raygen_region: vk::StridedDeviceAddressRegionKHR,
    pub miss_region: vk::StridedDeviceAddressRegionKHR,
    pub hit_region: vk::StridedDeviceAddressRegionKHR,
    pub callable_region: vk::StridedDeviceAddressRegionKHR,
}

impl RtPipeline {
    pub fn new(
        ctx: &mut VulkanContext,
        shader_dir: &Path,
        texture_count: u32,
    ) -> Result<Self, String> {
        let device = ctx.device.clone();

        // --- Descriptor set layout ---
        let bindings = descriptor_bindings(texture_count);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let descriptor_set_layout = unsafe {
            device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| format!("Failed to create RT descriptor set layout: {:?}", e))?
        };

        // --- Pipeline layout ---
        let push_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::RAYGEN_KHR)
            .offset(0)
            .size(std::mem::size_of::<PushConstants>() as u32);
        let set_layouts = [descriptor_set_layout];
        let push_ranges = [push_range];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        let pipeline_layout = unsafe {
            device
                .create_pipeline_layout(&pipeline_layout_info, None)
                .map_err(|e| format!("Failed to create RT pipeline layout: {:?}", e))?
        };

        // --- Shader stages ---
        let rgen_code = spv_loader::load_spirv(&shader_dir.join("pathtrace.rgen.spv"))?;
        let rmiss_code = spv_loader::load_spirv(&shader_dir.join("pathtrace.rmiss.spv"))?;
        let rchit_code = spv_loader::load_spirv(&shader_dir.join("pathtrace.rchit.spv"))?;
        let rgen_module = spv_loader::create_shader_module(&device, &rgen_code)?;
        let rmiss_module = spv_loader::create_shader_module(&device, &rmiss_code)?;
        let rchit_module = spv_loader::create_shader_module(&device, &rchit_code)?;

        let entry_name = c"main";
        let shader_stages = [
            // Index 0: raygen
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::RAYGEN_KHR)
                .module(rgen_module)
                .name(entry_name),
            // Index 1: miss
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::MISS_KHR)
                .module(rmiss_module)
                .name(entry_name),
            // Index 2: closest hit
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR)
                .module(rchit_module)
                .name(entry_name),
        ];

        let shader_groups = [
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(0)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(1)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(2)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
        ];

        let recursion_depth =
            MAX_RECURSION_DEPTH.min(ctx.rt_properties.max_ray_recursion_depth);
        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&shader_stages)
            .groups(&shader_groups)
            .max_pipeline_ray_recursion_depth(recursion_depth)
            .layout(pipeline_layout);

        let pipeline = unsafe {
            ctx.rt_pipeline_loader
                .create_ray_tracing_pipelines(
                    vk::DeferredOperationKHR::null(),
                    vk::PipelineCache::null(),
                    &[pipeline_info],
                    None,
                )
                .map_err(|e| format!("Failed to create RT pipeline: {:?}", e))?[0]
        };

        unsafe {
            device.destroy_shader_module(rgen_module, None);
            device.destroy_shader_module(rmiss_module, None);
            device.destroy_shader_module(rchit_module, None);
        }

        info!("RT pipeline created (recursion depth {})", recursion_depth);

        // --- Shader binding table ---
        let (sbt_buffer, raygen_region, miss_region, hit_region) =
            create_sbt(ctx, pipeline)?;

        let descriptor_set = ctx.allocate_desc_set(descriptor_set_layout)?;

        Ok(RtPipeline {
            descriptor_set_layout,
            pipeline_layout,
            pipeline,
            descriptor_set,
            sbt_buffer,
            raygen_region,
            miss_region,
            hit_region,
            callable_region: vk::StridedDeviceAddressRegionKHR::default(),
        })
    }

    /// Point every binding at its resource. Called once after scene upload.
    #[allow(clippy::too_many_arguments)]
    pub fn write_descriptors(
        &self,
        ctx: &VulkanContext,
        tlas: &Accel,
        output: &GpuImage,
        vertex_buffer: &Buffer,
        index_buffer: &Buffer,
        material_buffer: &Buffer,
        material_index_buffer: &Buffer,
        textures: &[Texture],
        dummy_texture: &Texture,
        gbuffer: &GBuffer,
        matrix_buffer: &Buffer,
        light_buffer: &Buffer,
        light_cdf_buffer: &Buffer,
    ) {
        let accel_structures = [tlas.accel];
        let mut tlas_write_info = vk::WriteDescriptorSetAccelerationStructureKHR::default()
            .acceleration_structures(&accel_structures);
        let mut tlas_write = vk::WriteDescriptorSet::default()
            .dst_set(self.descriptor_set)
            .dst_binding(BINDING_TLAS)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .push_next(&mut tlas_write_info);
        tlas_write.descriptor_count = 1;

        let output_info = [output.storage_desc_info()];
        let position_info = [gbuffer.position.storage_desc_info()];
        let normal_info = [gbuffer.normal.storage_desc_info()];
        let albedo_info = [gbuffer.albedo.storage_desc_info()];
        let motion_info = [gbuffer.motion.storage_desc_info()];

        let vertex_info = [vertex_buffer.desc_info()];
        let index_info = [index_buffer.desc_info()];
        let material_info = [material_buffer.desc_info()];
        let material_index_info = [material_index_buffer.desc_info()];
        let matrix_info = [matrix_buffer.desc_info()];
        let light_info = [light_buffer.desc_info()];
        let light_cdf_info = [light_cdf_buffer.desc_info()];

        let texture_infos: Vec<vk::DescriptorImageInfo> = if textures.is_empty() {
            vec![dummy_texture.desc_info()]
        } else {
            textures.iter().map(|t| t.desc_info()).collect()
        };

        let storage_image =
            |binding: u32, info| {
                vk::WriteDescriptorSet::default()
                    .dst_set(self.descriptor_set)
                    .dst_binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(info)
            };
        let storage_buffer =
            |binding: u32, info| {
                vk::WriteDescriptorSet::default()
                    .dst_set(self.descriptor_set)
                    .dst_binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(info)
            };

        let writes = [
            tlas_write,
            storage_image(BINDING_OUTPUT, &output_info),
            storage_buffer(BINDING_VERTICES, &vertex_info),
            storage_buffer(BINDING_INDICES, &index_info),
            storage_buffer(BINDING_MATERIALS, &material_info),
            storage_buffer(BINDING_MATERIAL_INDICES, &material_index_info),
            vk::WriteDescriptorSet::default()
                .dst_set(self.descriptor_set)
                .dst_binding(BINDING_TEXTURES)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&texture_infos),
            storage_image(BINDING_GBUFFER_POSITION, &position_info),
            storage_image(BINDING_GBUFFER_NORMAL, &normal_info),
            storage_image(BINDING_GBUFFER_ALBEDO, &albedo_info),
            storage_image(BINDING_GBUFFER_MOTION, &motion_info),
            vk::WriteDescriptorSet::default()
                .dst_set(self.descriptor_set)
                .dst_binding(BINDING_MATRICES)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&matrix_info),
            storage_buffer(BINDING_LIGHTS, &light_info),
            storage_buffer(BINDING_LIGHT_CDF, &light_cdf_info),
        ];

        unsafe {
            ctx.device.update_descriptor_sets(&writes, &[]);
        }
    }

    pub fn destroy(&mut self, ctx: &mut VulkanContext) {
        unsafe {
            ctx.device.destroy_pipeline(self.pipeline, None);
            ctx.device
                .destroy_pipeline_layout(self.pipeline_layout, None);
            ctx.device
                .destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        }
        self.sbt_buffer.destroy(ctx);
    }
}

/// Region descriptors for an SBT at `base_addr` laid out [raygen][miss][hit].
///
/// The raygen region's size must equal its stride
/// (VUID-vkCmdTraceRaysKHR-size-04023), so it spans the whole base-aligned
/// region; miss and hit regions keep the aligned handle size as stride.
fn sbt_regions(
    base_addr: u64,
    handle_size: u64,
    handle_alignment: u64,
    base_alignment: u64,
) -> (
    vk::StridedDeviceAddressRegionKHR,
    vk::StridedDeviceAddressRegionKHR,
    vk::StridedDeviceAddressRegionKHR,
) {
    let handle_size_aligned = align_up(handle_size, handle_alignment);
    let region_size = align_up(handle_size_aligned, base_alignment);

    let raygen = vk::StridedDeviceAddressRegionKHR {
        device_address: base_addr,
        stride: region_size,
        size: region_size,
    };
    let miss = vk::StridedDeviceAddressRegionKHR {
        device_address: base_addr + region_size,
        stride: handle_size_aligned,
        size: region_size,
    };
    let hit = vk::StridedDeviceAddressRegionKHR {
        device_address: base_addr + region_size * 2,
        stride: handle_size_aligned,
        size: region_size,
    };
    (raygen, miss, hit)
}

/// Build the SBT: one buffer laid out [raygen][miss][hit], each region padded
/// to the group base alignment, handles copied at region starts.
fn create_sbt(
    ctx: &mut VulkanContext,
    pipeline: vk::Pipeline,
) -> Result<
    (
        Buffer,
        vk::StridedDeviceAddressRegionKHR,
        vk::StridedDeviceAddressRegionKHR,
        vk::StridedDeviceAddressRegionKHR,
    ),
    String,
> {
    let props = &ctx.rt_properties;
    let handle_size = props.shader_group_handle_size as u64;
    let handle_alignment = props.shader_group_handle_alignment as u64;
    let base_alignment = props.shader_group_base_alignment as u64;

    let handle_size_aligned = align_up(handle_size, handle_alignment);
    let region_size = align_up(handle_size_aligned, base_alignment);
    let total_size = region_size * 3;

    let group_count = 3u32;
    let handle_data_size = (handle_size as usize) * group_count as usize;
    let handles = unsafe {
        ctx.rt_pipeline_loader
            .get_ray_tracing_shader_group_handles(pipeline, 0, group_count, handle_data_size)
            .map_err(|e| format!("Failed to get RT shader group handles: {:?}", e))?
    };

    let hs = handle_size as usize;
    let mut table = vec![0u8; total_size as usize];
    for group in 0..group_count as usize {
        let offset = group * region_size as usize;
        table[offset..offset + hs].copy_from_slice(&handles[group * hs..(group + 1) * hs]);
    }

    let sbt_buffer = Buffer::new(ctx, BufferKind::ShaderBindingTable, total_size, Some(&table))?;

    let (raygen_region, miss_region, hit_region) = sbt_regions(
        sbt_buffer.device_address,
        handle_size,
        handle_alignment,
        base_alignment,
    );

    info!(
        "SBT created: raygen=0x{:X} miss=0x{:X} hit=0x{:X} total={}",
        raygen_region.device_address,
        miss_region.device_address,
        hit_region.device_address,
        total_size
    );

    Ok((sbt_buffer, raygen_region, miss_region, hit_region))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_reference_values() {
        assert_eq!(align_up(32, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
    }

    #[test]
    fn align_up_is_a_multiple_and_never_shrinks() {
        for value in [1u64, 7, 16, 31, 32, 33, 255, 256, 1000] {
            for alignment in [1u64, 2, 4, 8, 16, 32, 64, 128, 256] {
                let aligned = align_up(value, alignment);
                assert_eq!(aligned % alignment, 0);
                assert!(aligned >= value);
                assert!(aligned - value < alignment);
            }
        }
    }

    #[test]
    fn binding_contract_is_complete_and_ordered() {
        let bindings = descriptor_bindings(3);
        assert_eq!(bindings.len(), 14);
        for (i, b) in bindings.iter().enumerate() {
            assert_eq!(b.binding, i as u32);
        }
        assert_eq!(
            bindings[BINDING_TLAS as usize].descriptor_type,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR
        );
        assert_eq!(
            bindings[BINDING_OUTPUT as usize].descriptor_type,
            vk::DescriptorType::STORAGE_IMAGE
        );
        assert_eq!(
            bindings[BINDING_TEXTURES as usize].descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(bindings[BINDING_TEXTURES as usize].descriptor_count, 3);
        assert_eq!(
            bindings[BINDING_MATRICES as usize].descriptor_type,
            vk::DescriptorType::UNIFORM_BUFFER
        );
        assert_eq!(
            bindings[BINDING_LIGHT_CDF as usize].descriptor_type,
            vk::DescriptorType::STORAGE_BUFFER
        );
    }

    #[test]
    fn texture_array_is_never_empty() {
        let bindings = descriptor_bindings(0);
        assert_eq!(bindings[BINDING_TEXTURES as usize].descriptor_count, 1);
    }

    #[test]
    fn push_constants_fit_the_declared_range() {
        assert_eq!(std::mem::size_of::<PushConstants>(), 32);
    }

    #[test]
    fn raygen_region_size_equals_its_stride() {
        // Handle alignment below base alignment, the common discrete-GPU case.
        let (raygen, miss, hit) = sbt_regions(0x1000, 32, 32, 64);
        assert_eq!(raygen.stride, raygen.size);
        assert_eq!(raygen.stride, 64);
        assert_eq!(miss.stride, 32);
        assert_eq!(miss.size, 64);
        assert_eq!(hit.stride, 32);
        assert_eq!(hit.size, 64);

        for (handle_alignment, base_alignment) in [(16u64, 64u64), (32, 32), (64, 256)] {
            let (raygen, _, _) = sbt_regions(0, 32, handle_alignment, base_alignment);
            assert_eq!(raygen.stride, raygen.size);
        }
    }

    #[test]
    fn sbt_regions_are_contiguous_and_base_aligned() {
        let (raygen, miss, hit) = sbt_regions(0x4000, 32, 32, 64);
        assert_eq!(raygen.device_address, 0x4000);
        assert_eq!(miss.device_address, 0x4040);
        assert_eq!(hit.device_address, 0x4080);
        for region in [&raygen, &miss, &hit] {
            assert_eq!(region.device_address % 64, 0);
        }
    }
}
