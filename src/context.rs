//! Vulkan instance and device bootstrap
//!
//! Owns everything with process lifetime: entry, instance, logical device,
//! compute queue, command pool, the shared descriptor pool, and the pipeline
//! cache. All pipelines and buffers of a network hold an `Arc<Context>`, so
//! these objects outlive every user.

use ash::{vk, Device, Entry, Instance};
use std::ffi::CString;
use std::sync::Arc;

use crate::error::NnError;

const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

/// Device limits relevant to dispatch sizing.
///
/// Queried once at startup; the pipeline factories size every grid against
/// these before compiling anything.
#[derive(Debug, Clone, Copy)]
pub struct DeviceLimits {
    /// Subgroup width; element counts are rounded up to a multiple of this
    pub subgroup_size: u32,

    /// maxComputeWorkGroupCount per axis
    pub max_group_count: [u32; 3],

    /// maxComputeWorkGroupSize per axis
    pub max_group_size: [u32; 3],
}

/// Process-lifetime Vulkan state.
pub struct Context {
    _entry: Entry,
    instance: Instance,
    physical_device: vk::PhysicalDevice,
    device: Arc<Device>,
    queue: vk::Queue,
    queue_family: u32,
    command_pool: vk::CommandPool,
    descriptor_pool: vk::DescriptorPool,
    pipeline_cache: vk::PipelineCache,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: DeviceLimits,
    device_name: String,
}

impl Context {
    /// Create a context on the physical device at `device_index`.
    ///
    /// # Arguments
    ///
    /// * `device_index` - Index into the enumeration order (see `list_devices`)
    /// * `validation` - Enable the Khronos validation layer if present
    pub fn new(device_index: usize, validation: bool) -> Result<Self, NnError> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| NnError::VulkanUnavailable(format!("{:?}", e)))?;

        let instance = Self::create_instance(&entry, validation)?;

        let physical_devices = unsafe { instance.enumerate_physical_devices() }?;
        if physical_devices.is_empty() {
            unsafe { instance.destroy_instance(None) };
            return Err(NnError::DeviceUnavailable);
        }
        if device_index >= physical_devices.len() {
            let count = physical_devices.len();
            unsafe { instance.destroy_instance(None) };
            return Err(NnError::DeviceIndexOutOfRange {
                index: device_index,
                count,
            });
        }
        let physical_device = physical_devices[device_index];

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name = unsafe {
            std::ffi::CStr::from_ptr(properties.device_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        };

        // Subgroup width needs the properties2 chain
        let mut subgroup = vk::PhysicalDeviceSubgroupProperties::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default().push_next(&mut subgroup);
        unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };

        let limits = DeviceLimits {
            subgroup_size: subgroup.subgroup_size.max(1),
            max_group_count: properties.limits.max_compute_work_group_count,
            max_group_size: properties.limits.max_compute_work_group_size,
        };

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        // Find a compute-capable queue family
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let queue_family = queue_families
            .iter()
            .enumerate()
            .find(|(_, props)| props.queue_flags.contains(vk::QueueFlags::COMPUTE))
            .map(|(idx, _)| idx as u32)
            .ok_or(NnError::QueueUnavailable)?;

        let queue_priorities = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info));

        let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }?;
        let device = Arc::new(device);

        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }?;

        let descriptor_pool = Self::create_descriptor_pool(&device)?;

        let cache_info = vk::PipelineCacheCreateInfo::default();
        let pipeline_cache = unsafe { device.create_pipeline_cache(&cache_info, None) }?;

        log::info!(
            "Context ready: device=\"{}\", queue_family={}, subgroup={}, \
             max_group_count={:?}",
            device_name,
            queue_family,
            limits.subgroup_size,
            limits.max_group_count
        );

        Ok(Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            queue,
            queue_family,
            command_pool,
            descriptor_pool,
            pipeline_cache,
            memory_properties,
            limits,
            device_name,
        })
    }

    /// Enumerate physical device names in index order.
    pub fn list_devices() -> Result<Vec<String>, NnError> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| NnError::VulkanUnavailable(format!("{:?}", e)))?;
        let instance = Self::create_instance(&entry, false)?;

        let devices = match unsafe { instance.enumerate_physical_devices() } {
            Ok(devices) => devices,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e.into());
            }
        };
        let names = devices
            .iter()
            .map(|pd| {
                let props = unsafe { instance.get_physical_device_properties(*pd) };
                unsafe {
                    std::ffi::CStr::from_ptr(props.device_name.as_ptr())
                        .to_string_lossy()
                        .into_owned()
                }
            })
            .collect();

        unsafe { instance.destroy_instance(None) };
        Ok(names)
    }

    fn create_instance(entry: &Entry, validation: bool) -> Result<Instance, NnError> {
        let app_name = CString::new("vknet").unwrap();
        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let layer_name = CString::new(VALIDATION_LAYER).unwrap();
        let mut layers: Vec<*const std::os::raw::c_char> = Vec::new();
        if validation {
            let available = unsafe { entry.enumerate_instance_layer_properties() }?;
            let present = available.iter().any(|l| {
                unsafe { std::ffi::CStr::from_ptr(l.layer_name.as_ptr()) }
                    .to_string_lossy()
                    == VALIDATION_LAYER
            });
            if present {
                layers.push(layer_name.as_ptr());
                log::info!("Validation layer enabled");
            } else {
                log::warn!("Validation layer requested but not installed");
            }
        }

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| NnError::VulkanUnavailable(format!("{:?}", e)))?;
        Ok(instance)
    }

    /// One pool serves every descriptor set of a network; sized generously
    /// because sets are allocated once at construction and never freed
    /// individually.
    fn create_descriptor_pool(device: &Device) -> Result<vk::DescriptorPool, NnError> {
        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: 2048,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(512);
        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }?;
        log::debug!("Created shared descriptor pool");
        Ok(pool)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn descriptor_pool(&self) -> vk::DescriptorPool {
        self.descriptor_pool
    }

    pub fn pipeline_cache(&self) -> vk::PipelineCache {
        self.pipeline_cache
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Allocate primary command buffers from the context pool.
    ///
    /// The returned buffers live until the pool is destroyed; recorded
    /// sequences are reused by resubmission, never re-recorded.
    pub fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>, NnError> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }?;
        log::debug!("Allocated {} command buffers", count);
        Ok(buffers)
    }

    /// Begin recording a reusable command buffer.
    pub fn begin_recording(&self, cmd: vk::CommandBuffer) -> Result<(), NnError> {
        let begin_info = vk::CommandBufferBeginInfo::default();
        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }?;
        Ok(())
    }

    pub fn end_recording(&self, cmd: vk::CommandBuffer) -> Result<(), NnError> {
        unsafe { self.device.end_command_buffer(cmd) }?;
        Ok(())
    }

    /// Submit a recorded command buffer without waiting.
    pub fn submit(&self, cmd: vk::CommandBuffer) -> Result<(), NnError> {
        let submit_info =
            vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd));
        unsafe {
            self.device
                .queue_submit(self.queue, &[submit_info], vk::Fence::null())
        }?;
        Ok(())
    }

    /// Block until every submitted command buffer has completed.
    pub fn wait_idle(&self) -> Result<(), NnError> {
        unsafe { self.device.queue_wait_idle(self.queue) }?;
        Ok(())
    }

    /// Record commands through `f` into a fresh command buffer, submit it,
    /// and block until completion. Used for one-shot work: weight init,
    /// staging copies for dump/restore.
    pub fn one_shot<F>(&self, f: F) -> Result<(), NnError>
    where
        F: FnOnce(vk::CommandBuffer) -> Result<(), NnError>,
    {
        let cmd = self.allocate_command_buffers(1)?[0];
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }?;

        let recorded = f(cmd);

        unsafe { self.device.end_command_buffer(cmd) }?;
        let result = recorded.and_then(|_| {
            self.submit(cmd)?;
            self.wait_idle()
        });
        unsafe {
            self.device
                .free_command_buffers(self.command_pool, std::slice::from_ref(&cmd))
        };
        result
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        log::debug!("Dropping Context for \"{}\"", self.device_name);
        unsafe {
            self.device.device_wait_idle().ok();
            self.device.destroy_pipeline_cache(self.pipeline_cache, None);
            self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}
