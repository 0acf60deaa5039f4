//! Device context: instance, physical device, logical device, queue and
//! command pool, guarded by a process-wide spinlock.
//!
//! The context is acquired for the duration of any device work; at most
//! one thread holds it at a time, and everything downstream (allocator,
//! cache, dispatch) relies on that exclusion instead of its own locking.

use std::ffi::CStr;
use std::sync::atomic::{AtomicBool, Ordering};

use ash::vk;
use log::{debug, warn};

use crate::error::{Result, RuntimeError, VkResultExt};

static CONTEXT_HELD: AtomicBool = AtomicBool::new(false);

/// Exclusive access to the device context. Released on drop; callers must
/// pair every acquire with a release on every exit path, which the guard
/// enforces structurally.
pub struct ContextGuard<'a> {
    pub ctx: &'a DeviceContext,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        CONTEXT_HELD.store(false, Ordering::Release);
    }
}

pub struct DeviceContext {
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    queue_family_index: u32,
    command_pool: vk::CommandPool,
    device_name: String,
}

impl DeviceContext {
    pub fn new() -> Result<Self> {
        unsafe {
            let entry = ash::Entry::load()
                .map_err(|e| RuntimeError::Generic(format!("failed to load Vulkan: {}", e)))?;

            let app_name = CStr::from_bytes_with_nul(b"cinder\0").unwrap();
            let app_info = vk::ApplicationInfo::default()
                .application_name(app_name)
                .application_version(vk::make_api_version(0, 1, 0, 0))
                .engine_name(app_name)
                .engine_version(vk::make_api_version(0, 1, 0, 0))
                .api_version(vk::API_VERSION_1_1);
            let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
            let instance = entry
                .create_instance(&create_info, None)
                .vk("vkCreateInstance")?;

            let (physical_device, queue_family_index, device_name) =
                select_compute_device(&instance)?;
            debug!("using device {}", device_name);

            let device =
                create_logical_device(&instance, physical_device, queue_family_index)?;
            let queue = device.get_device_queue(queue_family_index, 0);

            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(queue_family_index)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            let command_pool = device
                .create_command_pool(&pool_info, None)
                .vk("vkCreateCommandPool")?;

            Ok(Self {
                _entry: entry,
                instance,
                physical_device,
                device,
                queue,
                queue_family_index,
                command_pool,
                device_name,
            })
        }
    }

    /// Spin until the process-wide context lock is free, then take it.
    pub fn acquire(&self) -> ContextGuard<'_> {
        while CONTEXT_HELD
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        ContextGuard { ctx: self }
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Block until the queue drains. Every submission path waits on this
    /// before returning, so dispatches never overlap on the device.
    pub fn queue_wait_idle(&self) -> Result<()> {
        unsafe { self.device.queue_wait_idle(self.queue).vk("vkQueueWaitIdle") }
    }

    pub fn find_memory_type(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        let memory_properties = unsafe {
            self.instance
                .get_physical_device_memory_properties(self.physical_device)
        };
        (0..memory_properties.memory_type_count)
            .find(|&i| {
                let supported = (type_bits & (1 << i)) != 0;
                let props = memory_properties.memory_types[i as usize].property_flags;
                supported && props.contains(properties)
            })
            .ok_or(RuntimeError::OutOfMemory)
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            if self.device.device_wait_idle().is_err() {
                warn!("device did not go idle before teardown");
            }
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

unsafe fn select_compute_device(
    instance: &ash::Instance,
) -> Result<(vk::PhysicalDevice, u32, String)> {
    let physical_devices = instance
        .enumerate_physical_devices()
        .vk("vkEnumeratePhysicalDevices")?;
    for pd in physical_devices {
        let queue_families = instance.get_physical_device_queue_family_properties(pd);
        if let Some((idx, _)) = queue_families
            .iter()
            .enumerate()
            .find(|(_, props)| props.queue_flags.contains(vk::QueueFlags::COMPUTE))
        {
            let props = instance.get_physical_device_properties(pd);
            let name = CStr::from_ptr(props.device_name.as_ptr())
                .to_string_lossy()
                .into_owned();
            return Ok((pd, idx as u32, name));
        }
    }
    Err(RuntimeError::NoDevice)
}

unsafe fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
) -> Result<ash::Device> {
    let queue_priorities = [1.0f32];
    let queue_create_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family_index)
        .queue_priorities(&queue_priorities);

    // Narrow storage types are requested when the implementation offers
    // them; compiled modules declare the matching capabilities.
    let mut features_8bit =
        vk::PhysicalDevice8BitStorageFeatures::default().storage_buffer8_bit_access(true);
    let mut features_16bit =
        vk::PhysicalDevice16BitStorageFeatures::default().storage_buffer16_bit_access(true);
    let mut base_features = vk::PhysicalDeviceFeatures2::default();
    instance.get_physical_device_features2(physical_device, &mut base_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::slice::from_ref(&queue_create_info))
        .push_next(&mut features_8bit)
        .push_next(&mut features_16bit);

    instance
        .create_device(physical_device, &device_create_info, None)
        .vk("vkCreateDevice")
}
