//! The device runtime surface: buffer lifecycle, copies, synchronisation
//! and kernel dispatch over a compiled module.
//!
//! All submission is synchronous: every path records one command buffer,
//! submits it, waits for queue idle and resets the command pool before
//! returning. Ordering between producers and consumers of a buffer comes
//! from that wait, plus the memory barriers the kernels themselves emit.

use ash::vk;
use log::debug;

use crate::allocator::{
    MemoryCaching, MemoryRegion, MemoryRequest, MemoryUsage, MemoryVisibility, RegionAllocator,
};
use crate::cache::{CompilationCache, UNIFORM_ARGS_CAPACITY};
use crate::context::{ContextGuard, DeviceContext};
use crate::error::{Result, RuntimeError, VkResultExt};
use crate::header::fingerprint;

pub struct DeviceRuntime {
    context: DeviceContext,
    allocator: RegionAllocator,
    cache: CompilationCache,
}

impl DeviceRuntime {
    pub fn new() -> Result<DeviceRuntime> {
        Ok(DeviceRuntime {
            context: DeviceContext::new()?,
            allocator: RegionAllocator::new(),
            cache: CompilationCache::new(),
        })
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    // ---------------------------------------------------------------------
    // Buffer lifecycle
    // ---------------------------------------------------------------------

    pub fn device_malloc(&mut self, size: u64) -> Result<MemoryRegion> {
        let guard = self.context.acquire();
        self.allocator.reserve(
            &guard,
            MemoryRequest {
                size,
                usage: MemoryUsage::TransferSrcDst,
                caching: MemoryCaching::Uncached,
                visibility: MemoryVisibility::DeviceOnly,
            },
        )
    }

    /// Host-visible storage reachable from both sides.
    pub fn device_and_host_malloc(&mut self, size: u64) -> Result<MemoryRegion> {
        let guard = self.context.acquire();
        self.allocator.reserve(
            &guard,
            MemoryRequest {
                size,
                usage: MemoryUsage::TransferSrcDst,
                caching: MemoryCaching::Coherent,
                visibility: MemoryVisibility::HostToDevice,
            },
        )
    }

    pub fn device_free(&mut self, region: MemoryRegion) {
        let _guard = self.context.acquire();
        self.allocator.release(region);
    }

    pub fn device_and_host_free(&mut self, region: MemoryRegion) {
        self.device_free(region);
    }

    /// A view of a sub-range of `region` at `offset`, sharing storage.
    pub fn device_crop(&mut self, region: MemoryRegion, offset: u64, size: u64) -> Result<MemoryRegion> {
        let _guard = self.context.acquire();
        self.allocator.crop(region, offset, size)
    }

    /// Crops and slices differ only in how the caller derived the range.
    pub fn device_slice(&mut self, region: MemoryRegion, offset: u64, size: u64) -> Result<MemoryRegion> {
        self.device_crop(region, offset, size)
    }

    pub fn device_release_crop(&mut self, region: MemoryRegion) {
        let _guard = self.context.acquire();
        self.allocator.destroy_crop(region);
    }

    pub fn release_unused_device_allocations(&mut self) {
        let guard = self.context.acquire();
        self.allocator.collect(&guard);
    }

    /// Adopt a caller-owned buffer; the runtime will bind it but never
    /// free it.
    pub fn wrap(&mut self, buffer: vk::Buffer, size: u64) -> MemoryRegion {
        let _guard = self.context.acquire();
        self.allocator.wrap(buffer, size)
    }

    /// Return ownership of a wrapped buffer to the caller.
    pub fn detach(&mut self, region: MemoryRegion) -> vk::Buffer {
        let _guard = self.context.acquire();
        self.allocator.detach(region)
    }

    /// The native handle and offset backing a region.
    pub fn get_native(&self, region: MemoryRegion) -> (vk::Buffer, u64) {
        (self.allocator.buffer_of(region), region.head_offset)
    }

    // ---------------------------------------------------------------------
    // Copies and synchronisation
    // ---------------------------------------------------------------------

    pub fn copy_to_device(&mut self, region: MemoryRegion, data: &[u8]) -> Result<()> {
        if (data.len() as u64) > region.size {
            return Err(RuntimeError::SizeMismatch {
                expected: region.size,
                got: data.len() as u64,
            });
        }
        let guard = self.context.acquire();
        // Producers of this region must be done before the host writes it.
        guard.ctx.queue_wait_idle()?;
        let ptr = self.allocator.map(&guard, region)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }
        self.allocator.unmap(&guard, region);
        Ok(())
    }

    pub fn copy_to_host(&mut self, region: MemoryRegion, out: &mut [u8]) -> Result<()> {
        if (out.len() as u64) > region.size {
            return Err(RuntimeError::SizeMismatch {
                expected: region.size,
                got: out.len() as u64,
            });
        }
        let guard = self.context.acquire();
        guard.ctx.queue_wait_idle()?;
        let ptr = self.allocator.map(&guard, region)?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), out.len());
        }
        self.allocator.unmap(&guard, region);
        Ok(())
    }

    /// Device-side copy between two regions through one command buffer.
    pub fn buffer_copy(&mut self, src: MemoryRegion, dst: MemoryRegion, size: u64) -> Result<()> {
        let guard = self.context.acquire();
        guard.ctx.queue_wait_idle()?;
        let cmd = begin_commands(&guard)?;
        let copy = vk::BufferCopy::default()
            .src_offset(src.head_offset)
            .dst_offset(dst.head_offset)
            .size(size);
        unsafe {
            guard.ctx.device().cmd_copy_buffer(
                cmd,
                self.allocator.buffer_of(src),
                self.allocator.buffer_of(dst),
                &[copy],
            );
        }
        submit_and_wait(&guard, cmd)
    }

    pub fn device_sync(&mut self) -> Result<()> {
        let guard = self.context.acquire();
        guard.ctx.queue_wait_idle()
    }

    // ---------------------------------------------------------------------
    // Kernel management
    // ---------------------------------------------------------------------

    /// Build (or reuse) pipeline state for a compiled module. Returns the
    /// module fingerprint used as the dispatch key.
    pub fn initialize_kernels(&mut self, module_bytes: &[u8]) -> Result<u64> {
        let key = fingerprint(module_bytes);
        let guard = self.context.acquire();
        self.cache.get_or_create(&guard, key, module_bytes)?;
        Ok(key)
    }

    /// Drop every cached kernel and empty block.
    pub fn finalize_kernels(&mut self) {
        let guard = self.context.acquire();
        self.cache.destroy(&guard);
        self.allocator.collect(&guard);
    }

    /// Dispatch one entry point: write scalar args, point the descriptor
    /// set at the caller's buffers, record, submit, wait, reset the pool.
    pub fn run(
        &mut self,
        module_bytes: &[u8],
        entry_name: &str,
        blocks: [u32; 3],
        scalar_args: &[u8],
        buffers: &[MemoryRegion],
    ) -> Result<()> {
        if scalar_args.len() as u64 > UNIFORM_ARGS_CAPACITY {
            return Err(RuntimeError::SizeMismatch {
                expected: UNIFORM_ARGS_CAPACITY,
                got: scalar_args.len() as u64,
            });
        }
        let key = fingerprint(module_bytes);
        let guard = self.context.acquire();
        let entry = self
            .cache
            .get_or_create(&guard, key, module_bytes)?
            .entry_point(entry_name)?;
        debug!(
            "dispatching {} over {:?} blocks ({} buffers)",
            entry_name,
            blocks,
            buffers.len()
        );
        if buffers.len() as u32 != entry.layout.storage_buffer_count {
            return Err(RuntimeError::SizeMismatch {
                expected: entry.layout.storage_buffer_count as u64,
                got: buffers.len() as u64,
            });
        }

        let device = guard.ctx.device();

        // Stage scalar arguments.
        if let Some((uniform_buffer, uniform_memory)) = entry.uniform_buffer {
            unsafe {
                let ptr = device
                    .map_memory(
                        uniform_memory,
                        0,
                        UNIFORM_ARGS_CAPACITY,
                        vk::MemoryMapFlags::empty(),
                    )
                    .vk("vkMapMemory")? as *mut u8;
                std::ptr::copy_nonoverlapping(scalar_args.as_ptr(), ptr, scalar_args.len());
                device.unmap_memory(uniform_memory);
            }
            let info = vk::DescriptorBufferInfo::default()
                .buffer(uniform_buffer)
                .offset(0)
                .range(UNIFORM_ARGS_CAPACITY);
            let write = vk::WriteDescriptorSet::default()
                .dst_set(entry.descriptor_set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(std::slice::from_ref(&info));
            unsafe { device.update_descriptor_sets(&[write], &[]) };
        }

        // Point the storage bindings at the caller's regions.
        let buffer_infos: Vec<vk::DescriptorBufferInfo> = buffers
            .iter()
            .map(|r| {
                vk::DescriptorBufferInfo::default()
                    .buffer(self.allocator.buffer_of(*r))
                    .offset(r.head_offset)
                    .range(r.size)
            })
            .collect();
        let writes: Vec<vk::WriteDescriptorSet> = buffer_infos
            .iter()
            .enumerate()
            .map(|(i, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(entry.descriptor_set)
                    .dst_binding(entry.layout.uniform_buffer_count + i as u32)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
            })
            .collect();
        unsafe { device.update_descriptor_sets(&writes, &[]) };

        let cmd = begin_commands(&guard)?;
        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, entry.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                entry.pipeline_layout,
                0,
                &[entry.descriptor_set],
                &[],
            );
            device.cmd_dispatch(cmd, blocks[0], blocks[1], blocks[2]);
        }
        submit_and_wait(&guard, cmd)
    }
}

impl Drop for DeviceRuntime {
    fn drop(&mut self) {
        let guard = self.context.acquire();
        self.cache.destroy(&guard);
        self.allocator.destroy(&guard);
    }
}

fn begin_commands(guard: &ContextGuard) -> Result<vk::CommandBuffer> {
    let device = guard.ctx.device();
    unsafe {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(guard.ctx.command_pool())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = device
            .allocate_command_buffers(&alloc_info)
            .vk("vkAllocateCommandBuffers")?[0];
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(e) = device.begin_command_buffer(cmd, &begin_info).vk("vkBeginCommandBuffer") {
            device.free_command_buffers(guard.ctx.command_pool(), &[cmd]);
            return Err(e);
        }
        Ok(cmd)
    }
}

/// End, submit, wait for idle, then release the command buffer and reset
/// the pool. Cleanup runs on the error paths too.
fn submit_and_wait(guard: &ContextGuard, cmd: vk::CommandBuffer) -> Result<()> {
    let device = guard.ctx.device();
    unsafe {
        let release = |guard: &ContextGuard| {
            device.free_command_buffers(guard.ctx.command_pool(), &[cmd]);
            let _ = device
                .reset_command_pool(guard.ctx.command_pool(), vk::CommandPoolResetFlags::empty());
        };
        if let Err(e) = device.end_command_buffer(cmd).vk("vkEndCommandBuffer") {
            release(guard);
            return Err(e);
        }
        let submit_info = vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd));
        if let Err(e) = device
            .queue_submit(guard.ctx.queue(), &[submit_info], vk::Fence::null())
            .vk("vkQueueSubmit")
        {
            release(guard);
            return Err(e);
        }
        let wait = guard.ctx.queue_wait_idle();
        release(guard);
        wait
    }
}
