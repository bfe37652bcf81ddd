//! Acceleration structures: BLAS over triangle geometry, TLAS over instances.
//!
//! Builds are one-shot and blocking. Each `Accel::new` runs the full recipe:
//! query build sizes, allocate backing and scratch, record the build, wait.
//! Structures are immutable after build; there is no refit path.

use ash::vk;
use glam::Mat4;
use log::info;

use crate::buffer::{Buffer, BufferKind};
use crate::context::VulkanContext;

/// A built acceleration structure and its backing storage.
pub struct Accel {
    pub accel: vk::AccelerationStructureKHR,
    pub buffer: Buffer,
    /// Address BLAS instances and TLAS descriptors refer to.
    pub device_address: u64,
}

impl Accel {
    /// Build an acceleration structure from one geometry descriptor.
    ///
    /// Empty geometry is rejected here; callers decide what an empty scene
    /// means before reaching the builder.
    pub fn new(
        ctx: &mut VulkanContext,
        geometry: vk::AccelerationStructureGeometryKHR,
        primitive_count: u32,
        ty: vk::AccelerationStructureTypeKHR,
    ) -> Result<Self, String> {
        if primitive_count == 0 {
            return Err(format!(
                "Refusing to build {:?} acceleration structure with zero primitives",
                ty
            ));
        }

        let accel_loader = ctx.accel_loader.clone();
        let geometries = [geometry];

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(ty)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            accel_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[primitive_count],
                &mut sizes,
            );
        }
        info!(
            "{:?} build sizes: storage={} scratch={}",
            ty, sizes.acceleration_structure_size, sizes.build_scratch_size
        );

        let buffer = Buffer::new(
            ctx,
            BufferKind::AccelStorage,
            sizes.acceleration_structure_size,
            None,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.buffer)
            .size(sizes.acceleration_structure_size)
            .ty(ty);
        let accel = unsafe {
            accel_loader
                .create_acceleration_structure(&create_info, None)
                .map_err(|e| format!("Failed to create {:?} acceleration structure: {:?}", ty, e))?
        };

        let mut scratch = Buffer::new(ctx, BufferKind::Scratch, sizes.build_scratch_size, None)?;

        build_info = build_info
            .dst_acceleration_structure(accel)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch.device_address,
            });

        let range = vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(primitive_count);

        ctx.one_time_submit(|cmd| unsafe {
            accel_loader.cmd_build_acceleration_structures(cmd, &[build_info], &[&[range]]);
        })?;

        scratch.destroy(ctx);

        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(accel);
        let device_address =
            unsafe { accel_loader.get_acceleration_structure_device_address(&address_info) };

        Ok(Accel {
            accel,
            buffer,
            device_address,
        })
    }

    pub fn destroy(&mut self, ctx: &mut VulkanContext) {
        unsafe {
            ctx.accel_loader
                .destroy_acceleration_structure(self.accel, None);
        }
        self.accel = vk::AccelerationStructureKHR::null();
        self.buffer.destroy(ctx);
    }
}

/// Geometry descriptor for an indexed triangle mesh already resident in
/// device-addressable buffers.
pub fn triangle_geometry(
    vertex_address: u64,
    vertex_stride: u64,
    max_vertex: u32,
    index_address: u64,
) -> vk::AccelerationStructureGeometryKHR<'static> {
    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
        .vertex_format(vk::Format::R32G32B32_SFLOAT)
        .vertex_data(vk::DeviceOrHostAddressConstKHR {
            device_address: vertex_address,
        })
        .vertex_stride(vertex_stride)
        .max_vertex(max_vertex)
        .index_type(vk::IndexType::UINT32)
        .index_data(vk::DeviceOrHostAddressConstKHR {
            device_address: index_address,
        });

    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            triangles,
        })
        .flags(vk::GeometryFlagsKHR::OPAQUE)
}

/// Geometry descriptor for a TLAS over an instance buffer.
pub fn instance_geometry(
    instances_address: u64,
) -> vk::AccelerationStructureGeometryKHR<'static> {
    let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
        .array_of_pointers(false)
        .data(vk::DeviceOrHostAddressConstKHR {
            device_address: instances_address,
        });

    vk::AccelerationStructureGeometryKHR::default()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
        .flags(vk::GeometryFlagsKHR::OPAQUE)
}

/// One TLAS instance referencing a built BLAS.
pub fn blas_instance(
    blas_address: u64,
    transform: Mat4,
    custom_index: u32,
) -> vk::AccelerationStructureInstanceKHR {
    vk::AccelerationStructureInstanceKHR {
        transform: transform_3x4(transform),
        instance_custom_index_and_mask: vk::Packed24_8::new(custom_index, 0xFF),
        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
            0,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE
                .as_raw() as u8,
        ),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: blas_address,
        },
    }
}

/// Convert a column-major Mat4 into Vulkan's row-major 3x4 instance transform.
pub fn transform_3x4(m: Mat4) -> vk::TransformMatrixKHR {
    let c = m.to_cols_array_2d();
    vk::TransformMatrixKHR {
        matrix: [
            c[0][0], c[1][0], c[2][0], c[3][0],
            c[0][1], c[1][1], c[2][1], c[3][1],
            c[0][2], c[1][2], c[2][2], c[3][2],
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn identity_transform_rows() {
        let t = transform_3x4(Mat4::IDENTITY);
        assert_eq!(
            t.matrix,
            [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
        );
    }

    #[test]
    fn translation_lands_in_the_fourth_column() {
        let t = transform_3x4(Mat4::from_translation(Vec3::new(3.0, -5.0, 7.0)));
        assert_eq!(t.matrix[3], 3.0);
        assert_eq!(t.matrix[7], -5.0);
        assert_eq!(t.matrix[11], 7.0);
    }

    #[test]
    fn instance_packs_custom_index_and_full_mask() {
        let inst = blas_instance(0xDEAD_BEEF, Mat4::IDENTITY, 42);
        assert_eq!(inst.instance_custom_index_and_mask.low_24(), 42);
        assert_eq!(inst.instance_custom_index_and_mask.high_8(), 0xFF);
        let handle = unsafe { inst.acceleration_structure_reference.device_handle };
        assert_eq!(handle, 0xDEAD_BEEF);
    }
}
