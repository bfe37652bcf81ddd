//! Frame orchestration: scene upload, acceleration structures, and the
//! per-frame trace -> denoise -> present sequence.
//!
//! The loop runs one frame at a time with a blocking fence wait at the end;
//! there is no CPU/GPU overlap. Temporal accumulation restarts whenever the
//! camera pose changes between frames.

use ash::vk;
use bytemuck::cast_slice;
use glam::Mat4;
use log::{info, warn};
use std::path::Path;

use crate::accel::{self, Accel};
use crate::buffer::{Buffer, BufferKind};
use crate::camera::{Camera, CameraPose};
use crate::context::VulkanContext;
use crate::denoiser::Denoiser;
use crate::gbuffer::GBuffer;
use crate::image::{self, GpuImage, Texture};
use crate::pipeline::{MatrixBuffer, PushConstants, RtPipeline};
use crate::scene::{self, SceneData};

/// Accumulation counter for the frame about to be traced.
///
/// Any pose change (position, yaw, or pitch) restarts accumulation; an
/// unchanged pose keeps counting. The first frame always starts at 0.
pub fn accumulation_counter(
    counter: u32,
    prev_pose: Option<CameraPose>,
    pose: CameraPose,
) -> u32 {
    match prev_pose {
        Some(prev) if prev == pose => counter,
        _ => 0,
    }
}

pub struct Renderer {
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    material_buffer: Buffer,
    material_index_buffer: Buffer,
    matrix_buffer: Buffer,
    light_buffer: Buffer,
    light_cdf_buffer: Buffer,
    light_count: u32,

    textures: Vec<Texture>,
    dummy_texture: Texture,

    blas: Accel,
    instance_buffer: Buffer,
    tlas: Accel,

    /// Raw per-frame radiance, input to the denoiser.
    radiance: GpuImage,
    gbuffer: GBuffer,
    rt_pipeline: RtPipeline,
    denoiser: Denoiser,

    cmd: vk::CommandBuffer,
    acquire_semaphore: vk::Semaphore,
    render_semaphore: vk::Semaphore,
    frame_fence: vk::Fence,

    frame: u32,
    prev_pose: Option<CameraPose>,
    prev_view: Mat4,
    prev_proj: Mat4,
}

impl Renderer {
    pub fn new(
        ctx: &mut VulkanContext,
        scene_data: &SceneData,
        shader_dir: &Path,
    ) -> Result<Self, String> {
        scene_data.validate()?;
        let device = ctx.device.clone();
        let extent = ctx.swapchain_extent;

        // --- Scene buffers ---
        let vertex_buffer = Buffer::new(
            ctx,
            BufferKind::AccelInput,
            std::mem::size_of_val(scene_data.vertices.as_slice()) as vk::DeviceSize,
            Some(cast_slice(&scene_data.vertices)),
        )?;
        let index_buffer = Buffer::new(
            ctx,
            BufferKind::AccelInput,
            std::mem::size_of_val(scene_data.indices.as_slice()) as vk::DeviceSize,
            Some(cast_slice(&scene_data.indices)),
        )?;
        let material_buffer = Buffer::new(
            ctx,
            BufferKind::Storage,
            std::mem::size_of_val(scene_data.materials.as_slice()) as vk::DeviceSize,
            Some(cast_slice(&scene_data.materials)),
        )?;
        let material_index_buffer = Buffer::new(
            ctx,
            BufferKind::Storage,
            std::mem::size_of_val(scene_data.material_indices.as_slice()) as vk::DeviceSize,
            Some(cast_slice(&scene_data.material_indices)),
        )?;
        let matrix_buffer = Buffer::new(
            ctx,
            BufferKind::Uniform,
            std::mem::size_of::<MatrixBuffer>() as vk::DeviceSize,
            None,
        )?;

        // --- Emissive lights ---
        let (lights, cdf) = scene::build_light_list(scene_data);
        let light_count = lights.len() as u32;
        info!("Scene has {} emissive triangles", light_count);
        // The SSBOs stay bound even for dark scenes; give them one zeroed
        // entry so the descriptor is always valid.
        let light_bytes: Vec<u8> = if lights.is_empty() {
            vec![0u8; std::mem::size_of::<scene::EmissiveLight>()]
        } else {
            cast_slice(&lights).to_vec()
        };
        let cdf_bytes: Vec<u8> = if cdf.is_empty() {
            vec![0u8; std::mem::size_of::<f32>()]
        } else {
            cast_slice(&cdf).to_vec()
        };
        let light_buffer = Buffer::new(
            ctx,
            BufferKind::Storage,
            light_bytes.len() as vk::DeviceSize,
            Some(&light_bytes),
        )?;
        let light_cdf_buffer = Buffer::new(
            ctx,
            BufferKind::Storage,
            cdf_bytes.len() as vk::DeviceSize,
            Some(&cdf_bytes),
        )?;

        // --- Textures ---
        let mut textures = Vec::with_capacity(scene_data.textures.len());
        for tex in &scene_data.textures {
            textures.push(Texture::from_rgba8(ctx, tex.width, tex.height, &tex.pixels)?);
        }
        let dummy_texture = Texture::dummy(ctx)?;

        // --- Acceleration structures ---
        let blas = Accel::new(
            ctx,
            accel::triangle_geometry(
                vertex_buffer.device_address,
                std::mem::size_of::<scene::Vertex>() as u64,
                scene_data.vertices.len() as u32 - 1,
                index_buffer.device_address,
            ),
            scene_data.triangle_count() as u32,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        )?;

        let instance = accel::blas_instance(blas.device_address, Mat4::IDENTITY, 0);
        let instance_bytes = unsafe {
            std::slice::from_raw_parts(
                &instance as *const _ as *const u8,
                std::mem::size_of::<vk::AccelerationStructureInstanceKHR>(),
            )
        };
        let instance_buffer = Buffer::new(
            ctx,
            BufferKind::AccelInput,
            instance_bytes.len() as vk::DeviceSize,
            Some(instance_bytes),
        )?;

        let tlas = Accel::new(
            ctx,
            accel::instance_geometry(instance_buffer.device_address),
            1,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        )?;
        info!(
            "Acceleration structures built: blas=0x{:X} tlas=0x{:X}",
            blas.device_address, tlas.device_address
        );

        // --- Images and pipelines ---
        let mut radiance = GpuImage::new(
            ctx,
            vk::Format::R32G32B32A32_SFLOAT,
            extent,
            vk::ImageUsageFlags::STORAGE,
        )?;
        radiance.transition(ctx, vk::ImageLayout::GENERAL)?;
        let gbuffer = GBuffer::new(ctx, extent)?;

        let rt_pipeline = RtPipeline::new(ctx, shader_dir, textures.len() as u32)?;
        let denoiser = Denoiser::new(ctx, shader_dir, extent, &radiance, &gbuffer)?;

        rt_pipeline.write_descriptors(
            ctx,
            &tlas,
            &radiance,
            &vertex_buffer,
            &index_buffer,
            &material_buffer,
            &material_index_buffer,
            &textures,
            &dummy_texture,
            &gbuffer,
            &matrix_buffer,
            &light_buffer,
            &light_cdf_buffer,
        );

        // --- Per-frame sync and command buffer ---
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(ctx.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe {
            device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| format!("Failed to allocate frame command buffer: {:?}", e))?[0]
        };

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let acquire_semaphore = unsafe {
            device
                .create_semaphore(&semaphore_info, None)
                .map_err(|e| format!("Failed to create semaphore: {:?}", e))?
        };
        let render_semaphore = unsafe {
            device
                .create_semaphore(&semaphore_info, None)
                .map_err(|e| format!("Failed to create semaphore: {:?}", e))?
        };
        let fence_info = vk::FenceCreateInfo::default();
        let frame_fence = unsafe {
            device
                .create_fence(&fence_info, None)
                .map_err(|e| format!("Failed to create frame fence: {:?}", e))?
        };

        Ok(Renderer {
            vertex_buffer,
            index_buffer,
            material_buffer,
            material_index_buffer,
            matrix_buffer,
            light_buffer,
            light_cdf_buffer,
            light_count,
            textures,
            dummy_texture,
            blas,
            instance_buffer,
            tlas,
            radiance,
            gbuffer,
            rt_pipeline,
            denoiser,
            cmd,
            acquire_semaphore,
            render_semaphore,
            frame_fence,
            frame: 0,
            prev_pose: None,
            prev_view: Mat4::IDENTITY,
            prev_proj: Mat4::IDENTITY,
        })
    }

    /// Trace, denoise, and present one frame.
    pub fn draw_frame(&mut self, ctx: &mut VulkanContext, camera: &Camera) -> Result<(), String> {
        let device = ctx.device.clone();
        let extent = ctx.swapchain_extent;
        let aspect = extent.width as f32 / extent.height as f32;

        // Camera movement invalidates the temporal history.
        let pose = camera.pose();
        self.frame = accumulation_counter(self.frame, self.prev_pose, pose);
        self.prev_pose = Some(pose);

        let view = camera.view_matrix();
        let proj = camera.projection_matrix(aspect);
        if self.frame == 0 {
            // No usable history on a reset; previous matrices mirror the
            // current ones so motion vectors come out zero.
            self.prev_view = view;
            self.prev_proj = proj;
        }
        let matrices = MatrixBuffer {
            view: view.to_cols_array_2d(),
            proj: proj.to_cols_array_2d(),
            prev_view: self.prev_view.to_cols_array_2d(),
            prev_proj: self.prev_proj.to_cols_array_2d(),
        };
        self.matrix_buffer
            .upload(bytemuck::bytes_of(&matrices), 0)?;
        self.denoiser.update_settings()?;

        // --- Acquire ---
        let (image_index, suboptimal) = ctx
            .acquire_next_image(self.acquire_semaphore)
            .map_err(|e| format!("Failed to acquire swapchain image: {:?}", e))?;
        if suboptimal {
            warn!("Swapchain is suboptimal");
        }
        let swapchain_image = ctx.swapchain_images[image_index as usize];

        // --- Record ---
        let rt_loader = ctx.rt_pipeline_loader.clone();
        self.record_frame(&device, &rt_loader, swapchain_image, camera, extent)?;

        // --- Submit ---
        let wait_semaphores = [self.acquire_semaphore];
        let wait_stages = [vk::PipelineStageFlags::TRANSFER];
        let signal_semaphores = [self.render_semaphore];
        let command_buffers = [self.cmd];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        unsafe {
            device
                .queue_submit(ctx.queue, &[submit_info], self.frame_fence)
                .map_err(|e| format!("Failed to submit frame: {:?}", e))?;
        }

        // --- Present ---
        match ctx.queue_present(image_index, self.render_semaphore) {
            Ok(true) => warn!("Present reported suboptimal swapchain"),
            Ok(false) => {}
            Err(e) => return Err(format!("Failed to present: {:?}", e)),
        }

        // --- Wait for the GPU; a lost device here is unrecoverable ---
        unsafe {
            device
                .wait_for_fences(&[self.frame_fence], true, u64::MAX)
                .map_err(|e| match e {
                    vk::Result::ERROR_DEVICE_LOST => {
                        "Device lost during frame execution".to_string()
                    }
                    other => format!("Failed to wait for frame fence: {:?}", other),
                })?;
            device
                .reset_fences(&[self.frame_fence])
                .map_err(|e| format!("Failed to reset frame fence: {:?}", e))?;
        }

        // --- Advance frame state ---
        self.denoiser.history.flip();
        self.prev_view = view;
        self.prev_proj = proj;
        self.frame += 1;

        Ok(())
    }

    fn record_frame(
        &mut self,
        device: &ash::Device,
        rt_loader: &ash::khr::ray_tracing_pipeline::Device,
        swapchain_image: vk::Image,
        camera: &Camera,
        extent: vk::Extent2D,
    ) -> Result<(), String> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device
                .begin_command_buffer(self.cmd, &begin_info)
                .map_err(|e| format!("Failed to begin frame command buffer: {:?}", e))?;
        }

        // --- Trace ---
        let push = PushConstants {
            camera_position: camera.position.to_array(),
            frame: self.frame,
            light_count: self.light_count,
            _pad: [0; 3],
        };
        unsafe {
            device.cmd_bind_pipeline(
                self.cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.rt_pipeline.pipeline,
            );
            device.cmd_bind_descriptor_sets(
                self.cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.rt_pipeline.pipeline_layout,
                0,
                &[self.rt_pipeline.descriptor_set],
                &[],
            );
            device.cmd_push_constants(
                self.cmd,
                self.rt_pipeline.pipeline_layout,
                vk::ShaderStageFlags::RAYGEN_KHR,
                0,
                bytemuck::bytes_of(&push),
            );
        }
        unsafe {
            rt_loader.cmd_trace_rays(
                self.cmd,
                &self.rt_pipeline.raygen_region,
                &self.rt_pipeline.miss_region,
                &self.rt_pipeline.hit_region,
                &self.rt_pipeline.callable_region,
                extent.width,
                extent.height,
                1,
            );
        }

        // RT writes must land before the denoiser reads them.
        memory_barrier(
            device,
            self.cmd,
            vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::PipelineStageFlags::COMPUTE_SHADER,
        );

        // --- Denoise ---
        self.denoiser.cmd_dispatch(device, self.cmd);

        memory_barrier(
            device,
            self.cmd,
            vk::AccessFlags::SHADER_WRITE,
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::TRANSFER,
        );

        // --- Copy the denoised frame into the swapchain image ---
        self.denoiser.output.cmd_set_layout(
            device,
            self.cmd,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::PipelineStageFlags::TRANSFER,
        );
        image::cmd_transition(
            device,
            self.cmd,
            swapchain_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
        );

        let subresource = vk::ImageSubresourceLayers::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .mip_level(0)
            .base_array_layer(0)
            .layer_count(1);
        let copy = vk::ImageCopy::default()
            .src_subresource(subresource)
            .dst_subresource(subresource)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            });
        unsafe {
            device.cmd_copy_image(
                self.cmd,
                self.denoiser.output.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                swapchain_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy],
            );
        }

        self.denoiser.output.cmd_set_layout(
            device,
            self.cmd,
            vk::ImageLayout::GENERAL,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::COMPUTE_SHADER,
        );
        image::cmd_transition(
            device,
            self.cmd,
            swapchain_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        );

        unsafe {
            device
                .end_command_buffer(self.cmd)
                .map_err(|e| format!("Failed to end frame command buffer: {:?}", e))?;
        }
        Ok(())
    }

    pub fn destroy(&mut self, ctx: &mut VulkanContext) {
        unsafe {
            let _ = ctx.device.device_wait_idle();
            ctx.device.destroy_fence(self.frame_fence, None);
            ctx.device.destroy_semaphore(self.acquire_semaphore, None);
            ctx.device.destroy_semaphore(self.render_semaphore, None);
            ctx.device
                .free_command_buffers(ctx.command_pool, &[self.cmd]);
        }

        self.denoiser.destroy(ctx);
        self.rt_pipeline.destroy(ctx);
        self.gbuffer.destroy(ctx);
        self.radiance.destroy(ctx);
        self.tlas.destroy(ctx);
        self.instance_buffer.destroy(ctx);
        self.blas.destroy(ctx);
        for tex in &mut self.textures {
            tex.destroy(ctx);
        }
        self.dummy_texture.destroy(ctx);
        self.light_cdf_buffer.destroy(ctx);
        self.light_buffer.destroy(ctx);
        self.matrix_buffer.destroy(ctx);
        self.material_index_buffer.destroy(ctx);
        self.material_buffer.destroy(ctx);
        self.index_buffer.destroy(ctx);
        self.vertex_buffer.destroy(ctx);
    }
}

fn memory_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn pose(x: f32, yaw: f32, pitch: f32) -> CameraPose {
        CameraPose {
            position: Vec3::new(x, 0.0, 0.0),
            yaw,
            pitch,
        }
    }

    #[test]
    fn first_frame_starts_at_zero() {
        assert_eq!(accumulation_counter(17, None, pose(0.0, 0.0, 0.0)), 0);
    }

    #[test]
    fn unchanged_pose_keeps_accumulating() {
        let p = pose(1.0, -90.0, 10.0);
        assert_eq!(accumulation_counter(5, Some(p), p), 5);
    }

    #[test]
    fn any_pose_component_change_resets() {
        let p = pose(1.0, -90.0, 10.0);
        assert_eq!(accumulation_counter(5, Some(p), pose(1.1, -90.0, 10.0)), 0);
        assert_eq!(accumulation_counter(5, Some(p), pose(1.0, -89.0, 10.0)), 0);
        assert_eq!(accumulation_counter(5, Some(p), pose(1.0, -90.0, 10.5)), 0);
    }
}
