//! G-buffer channels written by the raygen shader and read by the denoiser.

use ash::vk;

use crate::context::VulkanContext;
use crate::image::GpuImage;

pub struct GBuffer {
    /// World-space position (RGBA32F).
    pub position: GpuImage,
    /// World-space normal (RGBA32F).
    pub normal: GpuImage,
    /// Surface albedo (RGBA32F).
    pub albedo: GpuImage,
    /// Screen-space motion vectors (RG32F).
    pub motion: GpuImage,
}

impl GBuffer {
    pub fn new(ctx: &mut VulkanContext, extent: vk::Extent2D) -> Result<Self, String> {
        let mut make = |format| -> Result<GpuImage, String> {
            let mut img = GpuImage::new(ctx, format, extent, vk::ImageUsageFlags::STORAGE)?;
            img.transition(ctx, vk::ImageLayout::GENERAL)?;
            Ok(img)
        };

        Ok(GBuffer {
            position: make(vk::Format::R32G32B32A32_SFLOAT)?,
            normal: make(vk::Format::R32G32B32A32_SFLOAT)?,
            albedo: make(vk::Format::R32G32B32A32_SFLOAT)?,
            motion: make(vk::Format::R32G32_SFLOAT)?,
        })
    }

    pub fn destroy(&mut self, ctx: &mut VulkanContext) {
        self.position.destroy(ctx);
        self.normal.destroy(ctx);
        self.albedo.destroy(ctx);
        self.motion.destroy(ctx);
    }
}
