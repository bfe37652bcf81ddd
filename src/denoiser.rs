//! SVGF-style denoiser: temporal accumulation against ping-pong history
//! images, variance estimation, and edge-aware à-trous filtering, all in one
//! compute dispatch per frame.
//!
//! Binding layout (must match svgf.comp):
//!   0    input radiance          (storage image)
//!   1-4  g-buffer channels       (storage images)
//!   5    color history  [2]      (storage image array)
//!   6    moments history [2]
//!   7    normal history  [2]
//!   8    depth history   [2]
//!   9    denoised output         (storage image)
//!   10   intensity working image
//!   11   variance working image
//!   12   filtered working image
//!   13   settings UBO

use ash::vk;
use bytemuck::{Pod, Zeroable};
use log::info;
use std::path::Path;

use crate::buffer::{Buffer, BufferKind};
use crate::context::VulkanContext;
use crate::gbuffer::GBuffer;
use crate::image::GpuImage;
use crate::spv_loader;

const WORKGROUP_SIZE: u32 = 8;

/// Output format matches the swapchain so the present copy is a plain
/// vkCmdCopyImage with no format conversion. Storage-image support for BGRA8
/// is optional in Vulkan, so creation checks the device's format features.
const OUTPUT_FORMAT: vk::Format = vk::Format::B8G8R8A8_UNORM;

fn supports_storage_image(props: &vk::FormatProperties) -> bool {
    props
        .optimal_tiling_features
        .contains(vk::FormatFeatureFlags::STORAGE_IMAGE)
}

/// Which history slot is written this frame.
///
/// The slot written in frame N is the slot read in frame N+1; the flip
/// happens exactly once per frame, after the dispatch is recorded.
#[derive(Clone, Copy, Debug, Default)]
pub struct HistoryPingPong {
    index: u32,
}

impl HistoryPingPong {
    pub fn write_slot(&self) -> u32 {
        self.index
    }

    pub fn read_slot(&self) -> u32 {
        1 - self.index
    }

    pub fn flip(&mut self) {
        self.index = 1 - self.index;
    }
}

/// Host mirror of the shader-side settings UBO.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct DenoiserSettings {
    pub temporal_accumulation: i32,
    pub atrous_iterations: i32,
    pub phi_color: f32,
    pub phi_normal: f32,
    pub phi_depth: f32,
    /// Slot written this frame; the shader reads from the other one.
    pub history_index: i32,
    pub _pad: [i32; 2],
}

impl Default for DenoiserSettings {
    fn default() -> Self {
        DenoiserSettings {
            temporal_accumulation: 1,
            atrous_iterations: 5,
            phi_color: 10.0,
            phi_normal: 128.0,
            phi_depth: 128.0,
            history_index: 0,
            _pad: [0; 2],
        }
    }
}

pub struct Denoiser {
    pub history: HistoryPingPong,
    pub settings: DenoiserSettings,

    color_history: [GpuImage; 2],
    moments_history: [GpuImage; 2],
    normal_history: [GpuImage; 2],
    depth_history: [GpuImage; 2],
    intensity: GpuImage,
    variance: GpuImage,
    filtered: GpuImage,
    /// The denoised frame, copied to the swapchain after dispatch.
    pub output: GpuImage,

    settings_buffer: Buffer,
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    pub descriptor_set: vk::DescriptorSet,
    extent: vk::Extent2D,
}

impl Denoiser {
    pub fn new(
        ctx: &mut VulkanContext,
        shader_dir: &Path,
        extent: vk::Extent2D,
        input: &GpuImage,
        gbuffer: &GBuffer,
    ) -> Result<Self, String> {
        let device = ctx.device.clone();

        let output_props = unsafe {
            ctx.instance
                .get_physical_device_format_properties(ctx.physical_device, OUTPUT_FORMAT)
        };
        if !supports_storage_image(&output_props) {
            return Err(format!(
                "Device has no storage-image support for {:?}; cannot write the denoised output",
                OUTPUT_FORMAT
            ));
        }

        let mut make = |format| -> Result<GpuImage, String> {
            let mut img = GpuImage::new(
                ctx,
                format,
                extent,
                vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
            )?;
            img.transition(ctx, vk::ImageLayout::GENERAL)?;
            Ok(img)
        };

        let color_history = [make(vk::Format::R32G32B32A32_SFLOAT)?, make(vk::Format::R32G32B32A32_SFLOAT)?];
        let moments_history = [make(vk::Format::R32G32_SFLOAT)?, make(vk::Format::R32G32_SFLOAT)?];
        let normal_history = [make(vk::Format::R32G32B32A32_SFLOAT)?, make(vk::Format::R32G32B32A32_SFLOAT)?];
        let depth_history = [make(vk::Format::R32_SFLOAT)?, make(vk::Format::R32_SFLOAT)?];
        let intensity = make(vk::Format::R32_SFLOAT)?;
        let variance = make(vk::Format::R32_SFLOAT)?;
        let filtered = make(vk::Format::R32G32B32A32_SFLOAT)?;
        let output = make(OUTPUT_FORMAT)?;

        let settings = DenoiserSettings::default();
        let settings_buffer = Buffer::new(
            ctx,
            BufferKind::Uniform,
            std::mem::size_of::<DenoiserSettings>() as vk::DeviceSize,
            Some(bytemuck::bytes_of(&settings)),
        )?;

        // --- Descriptor set layout ---
        let compute = vk::ShaderStageFlags::COMPUTE;
        let mut bindings = Vec::new();
        for binding in 0..=4u32 {
            bindings.push(
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .descriptor_count(1)
                    .stage_flags(compute),
            );
        }
        for binding in 5..=8u32 {
            bindings.push(
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .descriptor_count(2)
                    .stage_flags(compute),
            );
        }
        for binding in 9..=12u32 {
            bindings.push(
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .descriptor_count(1)
                    .stage_flags(compute),
            );
        }
        bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(13)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(compute),
        );

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let descriptor_set_layout = unsafe {
            device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|e| format!("Failed to create denoiser descriptor layout: {:?}", e))?
        };

        let set_layouts = [descriptor_set_layout];
        let pipeline_layout_info =
            vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let pipeline_layout = unsafe {
            device
                .create_pipeline_layout(&pipeline_layout_info, None)
                .map_err(|e| format!("Failed to create denoiser pipeline layout: {:?}", e))?
        };

        // --- Compute pipeline ---
        let comp_code = spv_loader::load_spirv(&shader_dir.join("svgf.comp.spv"))?;
        let comp_module = spv_loader::create_shader_module(&device, &comp_code)?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(comp_module)
            .name(c"main");
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(pipeline_layout);
        let pipeline = unsafe {
            device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| format!("Failed to create denoiser pipeline: {:?}", e))?[0]
        };
        unsafe {
            device.destroy_shader_module(comp_module, None);
        }

        let descriptor_set = ctx.allocate_desc_set(descriptor_set_layout)?;

        let denoiser = Denoiser {
            history: HistoryPingPong::default(),
            settings,
            color_history,
            moments_history,
            normal_history,
            depth_history,
            intensity,
            variance,
            filtered,
            output,
            settings_buffer,
            descriptor_set_layout,
            pipeline_layout,
            pipeline,
            descriptor_set,
            extent,
        };
        denoiser.write_descriptors(ctx, input, gbuffer);

        info!(
            "Denoiser created: {}x{}, {} atrous iterations",
            extent.width, extent.height, denoiser.settings.atrous_iterations
        );

        Ok(denoiser)
    }

    fn write_descriptors(&self, ctx: &VulkanContext, input: &GpuImage, gbuffer: &GBuffer) {
        let input_info = [input.storage_desc_info()];
        let position_info = [gbuffer.position.storage_desc_info()];
        let normal_info = [gbuffer.normal.storage_desc_info()];
        let albedo_info = [gbuffer.albedo.storage_desc_info()];
        let motion_info = [gbuffer.motion.storage_desc_info()];

        // History arrays are written whole, slot 0 then slot 1; the shader
        // indexes them with the settings history_index.
        let color_hist_info = [
            self.color_history[0].storage_desc_info(),
            self.color_history[1].storage_desc_info(),
        ];
        let moments_hist_info = [
            self.moments_history[0].storage_desc_info(),
            self.moments_history[1].storage_desc_info(),
        ];
        let normal_hist_info = [
            self.normal_history[0].storage_desc_info(),
            self.normal_history[1].storage_desc_info(),
        ];
        let depth_hist_info = [
            self.depth_history[0].storage_desc_info(),
            self.depth_history[1].storage_desc_info(),
        ];

        let output_info = [self.output.storage_desc_info()];
        let intensity_info = [self.intensity.storage_desc_info()];
        let variance_info = [self.variance.storage_desc_info()];
        let filtered_info = [self.filtered.storage_desc_info()];
        let settings_info = [self.settings_buffer.desc_info()];

        let image_write =
            |binding: u32, info| {
                vk::WriteDescriptorSet::default()
                    .dst_set(self.descriptor_set)
                    .dst_binding(binding)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(info)
            };

        let writes = [
            image_write(0, &input_info),
            image_write(1, &position_info),
            image_write(2, &normal_info),
            image_write(3, &albedo_info),
            image_write(4, &motion_info),
            image_write(5, &color_hist_info),
            image_write(6, &moments_hist_info),
            image_write(7, &normal_hist_info),
            image_write(8, &depth_hist_info),
            image_write(9, &output_info),
            image_write(10, &intensity_info),
            image_write(11, &variance_info),
            image_write(12, &filtered_info),
            vk::WriteDescriptorSet::default()
                .dst_set(self.descriptor_set)
                .dst_binding(13)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&settings_info),
        ];

        unsafe {
            ctx.device.update_descriptor_sets(&writes, &[]);
        }
    }

    /// Push the current settings (including the write slot) to the GPU.
    /// Must happen before the frame's command buffer is submitted.
    pub fn update_settings(&mut self) -> Result<(), String> {
        self.settings.history_index = self.history.write_slot() as i32;
        let bytes = bytemuck::bytes_of(&self.settings).to_vec();
        self.settings_buffer.upload(&bytes, 0)
    }

    /// Record the denoise dispatch.
    pub fn cmd_dispatch(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.pipeline_layout,
                0,
                &[self.descriptor_set],
                &[],
            );
            device.cmd_dispatch(
                cmd,
                self.extent.width.div_ceil(WORKGROUP_SIZE),
                self.extent.height.div_ceil(WORKGROUP_SIZE),
                1,
            );
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
        for img in self
            .color_history
            .iter_mut()
            .chain(self.moments_history.iter_mut())
            .chain(self.normal_history.iter_mut())
            .chain(self.depth_history.iter_mut())
        {
            img.destroy(ctx);
        }
        self.intensity.destroy(ctx);
        self.variance.destroy(ctx);
        self.filtered.destroy(ctx);
        self.output.destroy(ctx);
        self.settings_buffer.destroy(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_alternates_every_flip() {
        let mut hist = HistoryPingPong::default();
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(hist.write_slot());
            hist.flip();
        }
        assert_eq!(seen, vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn written_slot_becomes_next_read_slot() {
        let mut hist = HistoryPingPong::default();
        for _ in 0..4 {
            let written = hist.write_slot();
            assert_ne!(written, hist.read_slot());
            hist.flip();
            assert_eq!(hist.read_slot(), written);
        }
    }

    #[test]
    fn output_format_requires_storage_feature() {
        let with_storage = vk::FormatProperties {
            optimal_tiling_features: vk::FormatFeatureFlags::STORAGE_IMAGE
                | vk::FormatFeatureFlags::TRANSFER_SRC,
            ..Default::default()
        };
        assert!(supports_storage_image(&with_storage));

        let without_storage = vk::FormatProperties {
            optimal_tiling_features: vk::FormatFeatureFlags::COLOR_ATTACHMENT
                | vk::FormatFeatureFlags::TRANSFER_SRC,
            ..Default::default()
        };
        assert!(!supports_storage_image(&without_storage));
    }

    #[test]
    fn default_settings_and_ubo_size() {
        let s = DenoiserSettings::default();
        assert_eq!(s.temporal_accumulation, 1);
        assert_eq!(s.atrous_iterations, 5);
        assert_eq!(s.phi_color, 10.0);
        assert_eq!(s.phi_normal, 128.0);
        assert_eq!(s.phi_depth, 128.0);
        assert_eq!(std::mem::size_of::<DenoiserSettings>(), 32);
    }
}
