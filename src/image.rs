//! Device-local images, layout transitions, and sampled textures.
//!
//! Every image tracks the layout of its last recorded transition so that
//! descriptor writes and barriers never guess. Access masks for barriers come
//! from a fixed per-layout table rather than ad hoc flag math.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use crate::buffer::{Buffer, BufferKind};
use crate::context::VulkanContext;

/// Source access mask implied by an image layout, per the transition table.
pub fn src_access_mask(layout: vk::ImageLayout) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::UNDEFINED => vk::AccessFlags::empty(),
        vk::ImageLayout::PREINITIALIZED => vk::AccessFlags::HOST_WRITE,
        vk::ImageLayout::GENERAL => vk::AccessFlags::SHADER_WRITE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        _ => vk::AccessFlags::empty(),
    }
}

/// Destination access mask implied by an image layout.
pub fn dst_access_mask(layout: vk::ImageLayout) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::GENERAL => vk::AccessFlags::SHADER_WRITE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        vk::ImageLayout::PRESENT_SRC_KHR => vk::AccessFlags::empty(),
        _ => vk::AccessFlags::empty(),
    }
}

/// Record a layout-transition barrier for `image` into `cmd`.
///
/// Works on any color image handle, including swapchain images this crate
/// does not own.
pub fn cmd_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(src_access_mask(old_layout))
        .dst_access_mask(dst_access_mask(new_layout))
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .base_mip_level(0)
                .level_count(1)
                .base_array_layer(0)
                .layer_count(1),
        );

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// A device-local 2D single-mip image with its view and tracked layout.
pub struct GpuImage {
    pub image: vk::Image,
    allocation: Option<Allocation>,
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl GpuImage {
    pub fn new(
        ctx: &mut VulkanContext,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self, String> {
        let device = ctx.device.clone();

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe {
            device
                .create_image(&image_info, None)
                .map_err(|e| format!("Failed to create image: {:?}", e))?
        };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let allocation = ctx
            .allocator_mut()
            .allocate(&AllocationCreateDesc {
                name: "pathlight_image",
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| format!("Failed to allocate image memory: {:?}", e))?;

        unsafe {
            device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .map_err(|e| format!("Failed to bind image memory: {:?}", e))?;
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );
        let view = unsafe {
            device
                .create_image_view(&view_info, None)
                .map_err(|e| format!("Failed to create image view: {:?}", e))?
        };

        Ok(GpuImage {
            image,
            allocation: Some(allocation),
            view,
            layout: vk::ImageLayout::UNDEFINED,
            format,
            extent,
        })
    }

    /// Record a transition from the tracked layout and update the record.
    pub fn cmd_set_layout(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        new_layout: vk::ImageLayout,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    ) {
        cmd_transition(
            device,
            cmd,
            self.image,
            self.layout,
            new_layout,
            src_stage,
            dst_stage,
        );
        self.layout = new_layout;
    }

    /// One-shot blocking transition. Setup-time use only.
    pub fn transition(
        &mut self,
        ctx: &mut VulkanContext,
        new_layout: vk::ImageLayout,
    ) -> Result<(), String> {
        let device = ctx.device.clone();
        let image = self.image;
        let old = self.layout;
        ctx.one_time_submit(|cmd| {
            cmd_transition(
                &device,
                cmd,
                image,
                old,
                new_layout,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
            );
        })?;
        self.layout = new_layout;
        Ok(())
    }

    /// Copy tightly-packed pixel data from `buffer` into mip 0.
    ///
    /// The image must already be in TRANSFER_DST_OPTIMAL.
    pub fn copy_from_buffer(
        &mut self,
        ctx: &mut VulkanContext,
        buffer: &Buffer,
    ) -> Result<(), String> {
        if self.layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
            return Err(format!(
                "copy_from_buffer requires TRANSFER_DST_OPTIMAL, image is in {:?}",
                self.layout
            ));
        }
        let device = ctx.device.clone();
        let region = vk::BufferImageCopy::default()
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            });
        let image = self.image;
        let src = buffer.buffer;
        ctx.one_time_submit(|cmd| unsafe {
            device.cmd_copy_buffer_to_image(
                cmd,
                src,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        })
    }

    /// Descriptor info for storage-image bindings (expects GENERAL).
    pub fn storage_desc_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo::default()
            .image_view(self.view)
            .image_layout(vk::ImageLayout::GENERAL)
    }

    pub fn destroy(&mut self, ctx: &mut VulkanContext) {
        unsafe {
            ctx.device.destroy_image_view(self.view, None);
        }
        if let Some(alloc) = self.allocation.take() {
            let _ = ctx.allocator_mut().free(alloc);
        }
        unsafe {
            ctx.device.destroy_image(self.image, None);
        }
        self.image = vk::Image::null();
    }
}

/// A sampled texture: immutable image + sampler pair.
pub struct Texture {
    pub image: GpuImage,
    pub sampler: vk::Sampler,
}

impl Texture {
    /// Upload RGBA8 pixels: staging buffer, transition to TRANSFER_DST,
    /// copy, transition to SHADER_READ_ONLY.
    pub fn from_rgba8(
        ctx: &mut VulkanContext,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> Result<Self, String> {
        let expected = (width as usize) * (height as usize) * 4;
        if pixels.len() != expected {
            return Err(format!(
                "Texture pixel data is {} bytes, expected {} for {}x{} RGBA8",
                pixels.len(),
                expected,
                width,
                height
            ));
        }

        let mut image = GpuImage::new(
            ctx,
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent2D { width, height },
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        )?;

        let mut staging = Buffer::new(
            ctx,
            BufferKind::TransferSrc,
            pixels.len() as vk::DeviceSize,
            Some(pixels),
        )?;

        image.transition(ctx, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
        image.copy_from_buffer(ctx, &staging)?;
        image.transition(ctx, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;
        staging.destroy(ctx);

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe {
            ctx.device
                .create_sampler(&sampler_info, None)
                .map_err(|e| format!("Failed to create sampler: {:?}", e))?
        };

        Ok(Texture { image, sampler })
    }

    /// 1x1 white fallback so the texture descriptor array is never empty.
    pub fn dummy(ctx: &mut VulkanContext) -> Result<Self, String> {
        Texture::from_rgba8(ctx, 1, 1, &[255, 255, 255, 255])
    }

    pub fn desc_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo::default()
            .sampler(self.sampler)
            .image_view(self.image.view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    }

    pub fn destroy(&mut self, ctx: &mut VulkanContext) {
        unsafe {
            ctx.device.destroy_sampler(self.sampler, None);
        }
        self.image.destroy(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_access_table() {
        assert_eq!(
            src_access_mask(vk::ImageLayout::UNDEFINED),
            vk::AccessFlags::empty()
        );
        assert_eq!(
            src_access_mask(vk::ImageLayout::PREINITIALIZED),
            vk::AccessFlags::HOST_WRITE
        );
        assert_eq!(
            src_access_mask(vk::ImageLayout::GENERAL),
            vk::AccessFlags::SHADER_WRITE
        );
        assert_eq!(
            src_access_mask(vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
            vk::AccessFlags::TRANSFER_READ
        );
        assert_eq!(
            src_access_mask(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            vk::AccessFlags::TRANSFER_WRITE
        );
        assert_eq!(
            src_access_mask(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            vk::AccessFlags::SHADER_READ
        );
    }

    #[test]
    fn destination_access_table() {
        assert_eq!(
            dst_access_mask(vk::ImageLayout::GENERAL),
            vk::AccessFlags::SHADER_WRITE
        );
        assert_eq!(
            dst_access_mask(vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
            vk::AccessFlags::TRANSFER_READ
        );
        assert_eq!(
            dst_access_mask(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            vk::AccessFlags::TRANSFER_WRITE
        );
        assert_eq!(
            dst_access_mask(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            vk::AccessFlags::SHADER_READ
        );
        assert_eq!(
            dst_access_mask(vk::ImageLayout::PRESENT_SRC_KHR),
            vk::AccessFlags::empty()
        );
    }
}
