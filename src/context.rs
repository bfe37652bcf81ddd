//! Vulkan initialization: instance, device, queues, pools, swapchain.
//!
//! Hardware ray tracing is a hard requirement here. Device selection rejects
//! GPUs without the full RT extension set instead of falling back, and
//! everything downstream can assume the loaders and RT properties exist.

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use log::{info, warn};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{CStr, CString};

/// Device extensions the renderer cannot run without.
const REQUIRED_DEVICE_EXTENSIONS: [&str; 5] = [
    "VK_KHR_swapchain",
    "VK_KHR_ray_tracing_pipeline",
    "VK_KHR_acceleration_structure",
    "VK_KHR_deferred_host_operations",
    "VK_KHR_buffer_device_address",
];

/// Holds all core Vulkan state for the renderer.
///
/// Fields are ordered so that Rust's drop order (top-to-bottom declaration)
/// destroys resources before the device/instance they depend on; `destroy()`
/// follows the same order explicitly.
pub struct VulkanContext {
    // Extension loaders are fn-pointer tables, no drop needed.
    pub rt_pipeline_loader: ash::khr::ray_tracing_pipeline::Device,
    pub accel_loader: ash::khr::acceleration_structure::Device,
    pub rt_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'static>,

    // Allocator must be dropped before the device; Option so destroy() can take() it.
    allocator_inner: Option<Allocator>,

    pub descriptor_pool: vk::DescriptorPool,
    pub command_pool: vk::CommandPool,
    pub queue: vk::Queue,
    pub queue_family: u32,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,

    debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,

    surface_loader: ash::khr::surface::Instance,
    swapchain_loader: ash::khr::swapchain::Device,
    pub surface: vk::SurfaceKHR,
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_images: Vec<vk::Image>,
    pub swapchain_image_views: Vec<vk::ImageView>,
    pub swapchain_format: vk::Format,
    pub swapchain_extent: vk::Extent2D,

    pub instance: ash::Instance,
    pub entry: ash::Entry,

    destroyed: bool,
}

impl VulkanContext {
    /// Create a context with a window surface and swapchain.
    pub fn new(
        window: &(impl HasDisplayHandle + HasWindowHandle),
        width: u32,
        height: u32,
    ) -> Result<Self, String> {
        let entry =
            unsafe { ash::Entry::load().map_err(|e| format!("Failed to load Vulkan: {}", e))? };

        let display_handle = window
            .display_handle()
            .map_err(|e| format!("Failed to get display handle: {}", e))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| format!("Failed to get window handle: {}", e))?;

        let surface_extensions = ash_window::enumerate_required_extensions(display_handle.as_raw())
            .map_err(|e| format!("Failed to enumerate surface extensions: {:?}", e))?;

        // --- Instance ---
        let app_info = vk::ApplicationInfo::default()
            .application_name(c"pathlight")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"pathlight")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::make_api_version(0, 1, 2, 0));

        let mut extension_names: Vec<*const i8> = surface_extensions.to_vec();

        let enable_validation = cfg!(debug_assertions);
        let mut layer_names: Vec<CString> = Vec::new();
        let mut extra_extensions: Vec<CString> = Vec::new();
        if enable_validation {
            let validation_layer = CString::new("VK_LAYER_KHRONOS_validation").unwrap();
            let available_layers = unsafe {
                entry
                    .enumerate_instance_layer_properties()
                    .unwrap_or_default()
            };
            let has_validation = available_layers.iter().any(|layer| {
                let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
                name == validation_layer.as_c_str()
            });
            if has_validation {
                layer_names.push(validation_layer);
                extra_extensions.push(CString::new("VK_EXT_debug_utils").unwrap());
                info!("Validation layers enabled");
            } else {
                warn!("Validation layers requested but not available");
            }
        }

        let layer_name_ptrs: Vec<*const i8> = layer_names.iter().map(|n| n.as_ptr()).collect();
        for ext in &extra_extensions {
            extension_names.push(ext.as_ptr());
        }

        let instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_name_ptrs)
            .enabled_extension_names(&extension_names);

        let instance = unsafe {
            entry
                .create_instance(&instance_create_info, None)
                .map_err(|e| format!("Failed to create Vulkan instance: {:?}", e))?
        };

        // --- Debug messenger ---
        let (debug_utils_loader, debug_messenger) = if enable_validation
            && extra_extensions
                .iter()
                .any(|n| n.as_c_str() == c"VK_EXT_debug_utils")
        {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &instance);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(debug_callback));
            let messenger = unsafe {
                loader
                    .create_debug_utils_messenger(&messenger_info, None)
                    .ok()
            };
            (Some(loader), messenger)
        } else {
            (None, None)
        };

        // --- Surface ---
        let surface = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                display_handle.as_raw(),
                window_handle.as_raw(),
                None,
            )
            .map_err(|e| format!("Failed to create Vulkan surface: {:?}", e))?
        };
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        // --- Physical device selection ---
        let physical_devices = unsafe {
            instance
                .enumerate_physical_devices()
                .map_err(|e| format!("Failed to enumerate physical devices: {:?}", e))?
        };
        if physical_devices.is_empty() {
            return Err("No Vulkan-capable GPUs found".to_string());
        }

        let mut selected_physical_device = None;
        let mut selected_queue_family = 0u32;
        let mut selected_is_discrete = false;

        for &phys_dev in &physical_devices {
            let props = unsafe { instance.get_physical_device_properties(phys_dev) };
            let api_version = props.api_version;
            if vk::api_version_major(api_version) < 1
                || (vk::api_version_major(api_version) == 1
                    && vk::api_version_minor(api_version) < 2)
            {
                continue;
            }

            let queue_families =
                unsafe { instance.get_physical_device_queue_family_properties(phys_dev) };
            let graphics_family = queue_families.iter().enumerate().find(|(idx, qprops)| {
                let supports_graphics = qprops.queue_flags.contains(vk::QueueFlags::GRAPHICS);
                let supports_present = unsafe {
                    surface_loader
                        .get_physical_device_surface_support(phys_dev, *idx as u32, surface)
                        .unwrap_or(false)
                };
                supports_graphics && supports_present
            });

            let Some((family_idx, _)) = graphics_family else {
                continue;
            };

            let dev_extensions = unsafe {
                instance
                    .enumerate_device_extension_properties(phys_dev)
                    .unwrap_or_default()
            };
            let ext_names: Vec<String> = dev_extensions
                .iter()
                .map(|e| {
                    unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }
                        .to_string_lossy()
                        .into_owned()
                })
                .collect();

            let has_all = REQUIRED_DEVICE_EXTENSIONS
                .iter()
                .all(|req| ext_names.iter().any(|n| n == req));
            if !has_all {
                let dev_name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
                info!(
                    "Skipping {}: missing ray tracing extensions",
                    dev_name.to_string_lossy()
                );
                continue;
            }

            let is_discrete = props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
            if selected_physical_device.is_none() || (is_discrete && !selected_is_discrete) {
                selected_physical_device = Some(phys_dev);
                selected_queue_family = family_idx as u32;
                selected_is_discrete = is_discrete;

                let dev_name = unsafe { CStr::from_ptr(props.device_name.as_ptr()) };
                info!(
                    "Selected GPU: {} (Vulkan {}.{})",
                    dev_name.to_string_lossy(),
                    vk::api_version_major(api_version),
                    vk::api_version_minor(api_version)
                );
            }
        }

        let physical_device = selected_physical_device.ok_or(
            "No suitable GPU found (need Vulkan 1.2+ with present support and \
             VK_KHR_ray_tracing_pipeline/VK_KHR_acceleration_structure)",
        )?;

        // Fail now, not at first allocation, if the memory heaps are unusable.
        check_memory_types(&instance, physical_device)?;

        // --- Device creation ---
        let queue_priority = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(selected_queue_family)
            .queue_priorities(&queue_priority);
        let queue_create_infos = [queue_create_info];

        let device_extensions: Vec<CString> = REQUIRED_DEVICE_EXTENSIONS
            .iter()
            .map(|n| CString::new(*n).unwrap())
            .collect();
        let device_ext_ptrs: Vec<*const i8> =
            device_extensions.iter().map(|n| n.as_ptr()).collect();

        // Descriptor indexing is needed for the runtime-sized texture array.
        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .runtime_descriptor_array(true)
            .shader_sampled_image_array_non_uniform_indexing(true);

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);

        let mut rt_pipeline_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_12_features)
            .push_next(&mut accel_features)
            .push_next(&mut rt_pipeline_features);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_ext_ptrs)
            .push_next(&mut features2);

        let device = unsafe {
            instance
                .create_device(physical_device, &device_create_info, None)
                .map_err(|e| format!("Failed to create logical device: {:?}", e))?
        };

        let queue = unsafe { device.get_device_queue(selected_queue_family, 0) };

        // --- Command pool ---
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(selected_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe {
            device
                .create_command_pool(&pool_info, None)
                .map_err(|e| format!("Failed to create command pool: {:?}", e))?
        };

        // --- Descriptor pool ---
        let pool_sizes = [
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
                .descriptor_count(10),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(100),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(100),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(100),
            vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .descriptor_count(100),
        ];
        let descriptor_pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(100);
        let descriptor_pool = unsafe {
            device
                .create_descriptor_pool(&descriptor_pool_info, None)
                .map_err(|e| format!("Failed to create descriptor pool: {:?}", e))?
        };

        // --- gpu-allocator ---
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings::default(),
            buffer_device_address: true,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })
        .map_err(|e| format!("Failed to create GPU allocator: {:?}", e))?;

        // --- RT extension loaders and properties ---
        let rt_pipeline_loader = ash::khr::ray_tracing_pipeline::Device::new(&instance, &device);
        let accel_loader = ash::khr::acceleration_structure::Device::new(&instance, &device);

        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default().push_next(&mut rt_props);
        unsafe {
            instance.get_physical_device_properties2(physical_device, &mut props2);
        }
        info!(
            "RT properties: handle_size={}, handle_alignment={}, base_alignment={}, max_recursion={}",
            rt_props.shader_group_handle_size,
            rt_props.shader_group_handle_alignment,
            rt_props.shader_group_base_alignment,
            rt_props.max_ray_recursion_depth
        );
        // The properties struct is plain-old-data; safe to transmute the lifetime.
        let rt_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR<'static> =
            unsafe { std::mem::transmute(rt_props) };

        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);

        info!("Vulkan context initialized");

        let mut ctx = VulkanContext {
            rt_pipeline_loader,
            accel_loader,
            rt_properties,
            allocator_inner: Some(allocator),
            descriptor_pool,
            command_pool,
            queue,
            queue_family: selected_queue_family,
            physical_device,
            device,
            debug_utils_loader,
            debug_messenger,
            surface_loader,
            swapchain_loader,
            surface,
            swapchain: vk::SwapchainKHR::null(),
            swapchain_images: Vec::new(),
            swapchain_image_views: Vec::new(),
            swapchain_format: vk::Format::UNDEFINED,
            swapchain_extent: vk::Extent2D {
                width: 0,
                height: 0,
            },
            instance,
            entry,
            destroyed: false,
        };

        ctx.create_swapchain(width, height)?;

        Ok(ctx)
    }

    /// Get a mutable reference to the allocator. Panics if already destroyed.
    pub fn allocator_mut(&mut self) -> &mut Allocator {
        self.allocator_inner
            .as_mut()
            .expect("Allocator already destroyed")
    }

    /// Create the swapchain for the given dimensions.
    fn create_swapchain(&mut self, width: u32, height: u32) -> Result<(), String> {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(|e| format!("Failed to get surface capabilities: {:?}", e))?
        };
        let formats = unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.physical_device, self.surface)
                .map_err(|e| format!("Failed to get surface formats: {:?}", e))?
        };

        let surface_format = formats
            .iter()
            .find(|f| {
                f.format == vk::Format::B8G8R8A8_UNORM
                    && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .or_else(|| formats.first())
            .ok_or("No surface formats available")?;
        self.swapchain_format = surface_format.format;

        self.swapchain_extent = if caps.current_extent.width != u32::MAX {
            caps.current_extent
        } else {
            vk::Extent2D {
                width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
                height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
            }
        };

        let image_count = (caps.min_image_count + 1).min(if caps.max_image_count > 0 {
            caps.max_image_count
        } else {
            u32::MAX
        });

        // The denoised result is copied in; swapchain images are transfer
        // destinations, never render targets.
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(self.swapchain_extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::STORAGE)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true);

        let swapchain = unsafe {
            self.swapchain_loader
                .create_swapchain(&create_info, None)
                .map_err(|e| format!("Failed to create swapchain: {:?}", e))?
        };

        self.swapchain_images = unsafe {
            self.swapchain_loader
                .get_swapchain_images(swapchain)
                .map_err(|e| format!("Failed to get swapchain images: {:?}", e))?
        };

        for &image in &self.swapchain_images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.swapchain_format)
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .level_count(1)
                        .layer_count(1),
                );
            let view = unsafe {
                self.device
                    .create_image_view(&view_info, None)
                    .map_err(|e| format!("Failed to create swapchain image view: {:?}", e))?
            };
            self.swapchain_image_views.push(view);
        }

        self.swapchain = swapchain;

        info!(
            "Swapchain created: {}x{} format={:?} images={}",
            self.swapchain_extent.width,
            self.swapchain_extent.height,
            self.swapchain_format,
            self.swapchain_images.len()
        );

        Ok(())
    }

    /// Acquire the next swapchain image. Returns (image_index, suboptimal).
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<(u32, bool), vk::Result> {
        unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        }
    }

    /// Present a swapchain image. Returns true if suboptimal.
    pub fn queue_present(
        &self,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool, vk::Result> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait_semaphore];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        unsafe {
            self.swapchain_loader
                .queue_present(self.queue, &present_info)
        }
    }

    /// Record `f` into a one-shot command buffer, submit, and block on a fence.
    pub fn one_time_submit(&self, f: impl FnOnce(vk::CommandBuffer)) -> Result<(), String> {
        let cmd = self.begin_single_commands()?;
        f(cmd);
        self.end_single_commands(cmd)
    }

    /// Allocate and begin a one-shot command buffer.
    pub fn begin_single_commands(&self) -> Result<vk::CommandBuffer, String> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(|e| format!("Failed to allocate command buffer: {:?}", e))?[0]
        };

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| format!("Failed to begin command buffer: {:?}", e))?;
        }

        Ok(cmd)
    }

    /// End, submit, and wait for a one-shot command buffer.
    pub fn end_single_commands(&self, cmd: vk::CommandBuffer) -> Result<(), String> {
        unsafe {
            self.device
                .end_command_buffer(cmd)
                .map_err(|e| format!("Failed to end command buffer: {:?}", e))?;
        }

        let cmd_bufs = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&cmd_bufs);

        let fence_info = vk::FenceCreateInfo::default();
        let fence = unsafe {
            self.device
                .create_fence(&fence_info, None)
                .map_err(|e| format!("Failed to create fence: {:?}", e))?
        };

        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], fence)
                .map_err(|e| format!("Failed to submit command buffer: {:?}", e))?;

            self.device
                .wait_for_fences(&[fence], true, u64::MAX)
                .map_err(|e| format!("Failed to wait for fence: {:?}", e))?;

            self.device.destroy_fence(fence, None);
            self.device.free_command_buffers(self.command_pool, &[cmd]);
        }

        Ok(())
    }

    /// Allocate one descriptor set from the shared pool.
    pub fn allocate_desc_set(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, String> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(&layouts);
        let sets = unsafe {
            self.device
                .allocate_descriptor_sets(&alloc_info)
                .map_err(|e| format!("Failed to allocate descriptor set: {:?}", e))?
        };
        Ok(sets[0])
    }

    /// Explicitly destroy all Vulkan resources in the correct order.
    ///
    /// The Drop impl calls this if it has not been called yet; all other
    /// GPU resources must already be destroyed by then.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        unsafe {
            let _ = self.device.device_wait_idle();
        }

        for view in self.swapchain_image_views.drain(..) {
            unsafe {
                self.device.destroy_image_view(view, None);
            }
        }
        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe {
                self.swapchain_loader.destroy_swapchain(self.swapchain, None);
            }
            self.swapchain = vk::SwapchainKHR::null();
        }
        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);
        }

        unsafe {
            self.device
                .destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_command_pool(self.command_pool, None);
        }

        // Allocator teardown needs the device alive.
        drop(self.allocator_inner.take());

        unsafe {
            if let (Some(loader), Some(messenger)) =
                (&self.debug_utils_loader, self.debug_messenger.take())
            {
                loader.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Linear scan of a physical-device memory-type table for a type matching
/// `type_bits` and carrying all `required` property flags.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Result<u32, String> {
    for i in 0..props.memory_type_count {
        let supported = type_bits & (1 << i) != 0;
        let has_flags = props.memory_types[i as usize]
            .property_flags
            .contains(required);
        if supported && has_flags {
            return Ok(i);
        }
    }
    Err(format!(
        "No suitable memory type for bits 0x{:X} with {:?}",
        type_bits, required
    ))
}

/// Startup sanity check: the device must expose a DEVICE_LOCAL type and a
/// HOST_VISIBLE|HOST_COHERENT type or nothing downstream can allocate.
fn check_memory_types(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<(), String> {
    let props = unsafe { instance.get_physical_device_memory_properties(physical_device) };
    let all_types = (1u32 << props.memory_type_count) - 1;
    find_memory_type(&props, all_types, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
    find_memory_type(
        &props,
        all_types,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;
    Ok(())
}

/// Vulkan debug callback for validation layers.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _msg_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let msg = if callback_data.is_null() {
        "Unknown validation message".to_string()
    } else {
        let data = unsafe { &*callback_data };
        if data.p_message.is_null() {
            "Empty validation message".to_string()
        } else {
            unsafe { CStr::from_ptr(data.p_message) }
                .to_string_lossy()
                .into_owned()
        }
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[Vulkan] {}", msg);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[Vulkan] {}", msg);
    } else {
        log::info!("[Vulkan] {}", msg);
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_memory_props() -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 3;
        props.memory_types[0] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            heap_index: 0,
        };
        props.memory_types[1] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 1,
        };
        props.memory_types[2] = vk::MemoryType {
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
            heap_index: 0,
        };
        props
    }

    #[test]
    fn picks_first_matching_type() {
        let props = fake_memory_props();
        let idx =
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        assert_eq!(idx, 0);
        let idx = find_memory_type(
            &props,
            0b111,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .unwrap();
        assert_eq!(idx, 1);
    }

    #[test]
    fn respects_the_type_bits_filter() {
        let props = fake_memory_props();
        // Type 0 excluded by the bitmask: must land on type 2.
        let idx =
            find_memory_type(&props, 0b100, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        assert_eq!(idx, 2);
    }

    #[test]
    fn errors_when_nothing_matches() {
        let props = fake_memory_props();
        let res = find_memory_type(&props, 0b011, vk::MemoryPropertyFlags::PROTECTED);
        assert!(res.is_err());
    }
}
