//! GPU buffers with semantic kind tags driving usage and memory placement.
//!
//! Callers never pick raw usage/memory flag combinations; they pick a
//! [`BufferKind`] and the fixed table in [`kind_flags`] derives the pairing.
//! This is what guarantees e.g. that acceleration-structure inputs always
//! carry SHADER_DEVICE_ADDRESS (a missing flag there yields a zero device
//! address that only fails much later, inside a geometry descriptor).

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use crate::context::VulkanContext;

/// Closed set of buffer roles. Each maps to exactly one
/// (usage flags, memory location) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    /// Acceleration-structure build scratch space.
    Scratch,
    /// Geometry/instance input for acceleration-structure builds, also
    /// bound as a storage buffer for shader access.
    AccelInput,
    /// Backing storage for a built acceleration structure.
    AccelStorage,
    /// Shader binding table regions.
    ShaderBindingTable,
    /// Host-side staging source for uploads.
    TransferSrc,
    /// Readback destination.
    TransferDst,
    /// General storage buffer (host-writable).
    Storage,
    /// Uniform buffer (host-writable).
    Uniform,
}

/// The fixed kind → (usage, memory) table.
///
/// Device-local kinds additionally carry TRANSFER_DST so they can receive
/// staged uploads.
pub fn kind_flags(kind: BufferKind) -> (vk::BufferUsageFlags, MemoryLocation) {
    match kind {
        BufferKind::Scratch => (
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        ),
        BufferKind::AccelInput => (
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
        ),
        BufferKind::AccelStorage => (
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        ),
        BufferKind::ShaderBindingTable => (
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
        ),
        BufferKind::TransferSrc => (
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        ),
        BufferKind::TransferDst => (
            vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuToCpu,
        ),
        BufferKind::Storage => (
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::CpuToGpu,
        ),
        BufferKind::Uniform => (
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        ),
    }
}

/// A GPU buffer with exclusively owned backing memory.
pub struct Buffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
    /// Non-zero only for kinds whose usage carries SHADER_DEVICE_ADDRESS.
    pub device_address: u64,
    pub kind: BufferKind,
}

impl Buffer {
    /// Create a buffer of `kind`, optionally filled with `data`.
    ///
    /// Host-visible kinds write through the mapped allocation. Device-local
    /// kinds (Scratch, AccelStorage) stage through a TransferSrc buffer and
    /// a blocking one-shot copy.
    pub fn new(
        ctx: &mut VulkanContext,
        kind: BufferKind,
        size: vk::DeviceSize,
        data: Option<&[u8]>,
    ) -> Result<Self, String> {
        if size == 0 {
            return Err(format!("Refusing to create zero-sized {:?} buffer", kind));
        }
        if let Some(d) = data {
            if d.len() as vk::DeviceSize > size {
                return Err(format!(
                    "Initial data ({} bytes) exceeds {:?} buffer size {}",
                    d.len(),
                    kind,
                    size
                ));
            }
        }

        let device = ctx.device.clone();
        let (usage, location) = kind_flags(kind);

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .create_buffer(&buffer_info, None)
                .map_err(|e| format!("Failed to create {:?} buffer: {:?}", kind, e))?
        };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let mut allocation = ctx
            .allocator_mut()
            .allocate(&AllocationCreateDesc {
                name: "pathlight_buffer",
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| format!("Failed to allocate memory for {:?} buffer: {:?}", kind, e))?;

        unsafe {
            device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .map_err(|e| format!("Failed to bind {:?} buffer memory: {:?}", kind, e))?;
        }

        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
            unsafe { device.get_buffer_device_address(&info) }
        } else {
            0
        };

        let mut out = Buffer {
            buffer,
            allocation: None,
            size,
            device_address,
            kind,
        };

        if let Some(data) = data {
            match allocation.mapped_slice_mut() {
                Some(mapped) => {
                    mapped[..data.len()].copy_from_slice(data);
                    out.allocation = Some(allocation);
                }
                None => {
                    // Device-local target: stage and copy on the GPU.
                    out.allocation = Some(allocation);
                    out.staged_upload(ctx, data)?;
                }
            }
        } else {
            out.allocation = Some(allocation);
        }

        Ok(out)
    }

    fn staged_upload(&self, ctx: &mut VulkanContext, data: &[u8]) -> Result<(), String> {
        let device = ctx.device.clone();
        let mut staging = Buffer::new(
            ctx,
            BufferKind::TransferSrc,
            data.len() as vk::DeviceSize,
            Some(data),
        )?;

        let region = vk::BufferCopy::default().size(data.len() as vk::DeviceSize);
        let dst = self.buffer;
        let src = staging.buffer;
        ctx.one_time_submit(|cmd| unsafe {
            device.cmd_copy_buffer(cmd, src, dst, &[region]);
        })?;

        staging.destroy(ctx);
        Ok(())
    }

    /// Write `data` into the buffer at `offset` through the host mapping.
    ///
    /// Fails loudly for kinds whose memory is not host-visible; use the
    /// staged construction path for those instead.
    pub fn upload(&mut self, data: &[u8], offset: usize) -> Result<(), String> {
        if offset + data.len() > self.size as usize {
            return Err(format!(
                "Upload of {} bytes at offset {} overflows {:?} buffer of size {}",
                data.len(),
                offset,
                self.kind,
                self.size
            ));
        }
        let alloc = self
            .allocation
            .as_mut()
            .ok_or("Buffer already destroyed")?;
        let mapped = alloc.mapped_slice_mut().ok_or_else(|| {
            format!(
                "{:?} buffer is not host-visible; cannot map for upload",
                self.kind
            )
        })?;
        mapped[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn desc_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(self.buffer)
            .offset(0)
            .range(self.size)
    }

    pub fn destroy(&mut self, ctx: &mut VulkanContext) {
        if let Some(alloc) = self.allocation.take() {
            let _ = ctx.allocator_mut().free(alloc);
        }
        unsafe {
            ctx.device.destroy_buffer(self.buffer, None);
        }
        self.buffer = vk::Buffer::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_KINDS: [BufferKind; 8] = [
        BufferKind::Scratch,
        BufferKind::AccelInput,
        BufferKind::AccelStorage,
        BufferKind::ShaderBindingTable,
        BufferKind::TransferSrc,
        BufferKind::TransferDst,
        BufferKind::Storage,
        BufferKind::Uniform,
    ];

    #[test]
    fn every_kind_has_nonempty_usage() {
        for kind in ALL_KINDS {
            let (usage, _) = kind_flags(kind);
            assert!(!usage.is_empty(), "{:?} fell through to empty usage", kind);
        }
    }

    #[test]
    fn device_address_kinds_carry_the_flag() {
        for kind in [
            BufferKind::Scratch,
            BufferKind::AccelInput,
            BufferKind::AccelStorage,
            BufferKind::ShaderBindingTable,
            BufferKind::Storage,
        ] {
            let (usage, _) = kind_flags(kind);
            assert!(
                usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS),
                "{:?} must be device-address capable",
                kind
            );
        }
        for kind in [
            BufferKind::TransferSrc,
            BufferKind::TransferDst,
            BufferKind::Uniform,
        ] {
            let (usage, _) = kind_flags(kind);
            assert!(!usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
        }
    }

    #[test]
    fn memory_locations_match_the_table() {
        assert_eq!(kind_flags(BufferKind::Scratch).1, MemoryLocation::GpuOnly);
        assert_eq!(
            kind_flags(BufferKind::AccelStorage).1,
            MemoryLocation::GpuOnly
        );
        assert_eq!(
            kind_flags(BufferKind::AccelInput).1,
            MemoryLocation::CpuToGpu
        );
        assert_eq!(
            kind_flags(BufferKind::ShaderBindingTable).1,
            MemoryLocation::CpuToGpu
        );
        assert_eq!(
            kind_flags(BufferKind::TransferSrc).1,
            MemoryLocation::CpuToGpu
        );
        assert_eq!(
            kind_flags(BufferKind::TransferDst).1,
            MemoryLocation::GpuToCpu
        );
        assert_eq!(kind_flags(BufferKind::Storage).1, MemoryLocation::CpuToGpu);
        assert_eq!(kind_flags(BufferKind::Uniform).1, MemoryLocation::CpuToGpu);
    }

    #[test]
    fn accel_kinds_carry_their_build_roles() {
        let (input, _) = kind_flags(BufferKind::AccelInput);
        assert!(input
            .contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR));

        let (storage, _) = kind_flags(BufferKind::AccelStorage);
        assert!(storage.contains(vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR));

        let (sbt, _) = kind_flags(BufferKind::ShaderBindingTable);
        assert!(sbt.contains(vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR));
    }
}
