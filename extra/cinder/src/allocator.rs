//! Region allocator: device buffers suballocated from larger blocks.
//!
//! Callers see `MemoryRegion` handles. A region knows its `head_offset`
//! within the owning block, so crops and slices can share an allocation.
//! `reserve` pairs with `release` (the space becomes reusable) or
//! `reclaim` (the space is returned immediately); `map` pairs with
//! `unmap`. `collect` frees blocks with no live regions. The allocator is
//! only touched while the device context is held, so it carries no lock
//! of its own.

use ash::vk;
use log::debug;

use crate::context::ContextGuard;
use crate::error::{Result, RuntimeError, VkResultExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUsage {
    TransferSrc,
    TransferDst,
    TransferSrcDst,
    Storage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryCaching {
    Cached,
    Uncached,
    Coherent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryVisibility {
    DeviceOnly,
    HostToDevice,
    DeviceToHost,
    HostToHost,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryRequest {
    pub size: u64,
    pub usage: MemoryUsage,
    pub caching: MemoryCaching,
    pub visibility: MemoryVisibility,
}

/// A caller-visible handle to a suballocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    block: usize,
    slot: usize,
    /// Byte offset of this region within its owning block.
    pub head_offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Live,
    Free,
}

#[derive(Debug)]
struct Slot {
    offset: u64,
    size: u64,
    state: SlotState,
}

struct Block {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
    host_visible: bool,
    slots: Vec<Slot>,
    destroyed: bool,
    /// Caller-owned storage wrapped into the allocator; never freed here.
    external: bool,
}

impl Block {
    fn live_bytes(&self) -> u64 {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Live)
            .map(|s| s.size)
            .sum()
    }
}

/// Blocks grow in fixed quanta; oversized requests get a dedicated block.
const BLOCK_SIZE: u64 = 16 * 1024 * 1024;
const ALIGNMENT: u64 = 256;

pub struct RegionAllocator {
    blocks: Vec<Block>,
}

impl RegionAllocator {
    pub fn new() -> RegionAllocator {
        RegionAllocator { blocks: Vec::new() }
    }

    fn usage_flags(usage: MemoryUsage) -> vk::BufferUsageFlags {
        let base = vk::BufferUsageFlags::STORAGE_BUFFER;
        match usage {
            MemoryUsage::TransferSrc => base | vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryUsage::TransferDst => base | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryUsage::TransferSrcDst => {
                base | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST
            }
            MemoryUsage::Storage => base,
        }
    }

    fn memory_properties(request: &MemoryRequest) -> vk::MemoryPropertyFlags {
        let mut props = match request.visibility {
            MemoryVisibility::DeviceOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            _ => vk::MemoryPropertyFlags::HOST_VISIBLE,
        };
        if props.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            props |= match request.caching {
                MemoryCaching::Cached => vk::MemoryPropertyFlags::HOST_CACHED,
                MemoryCaching::Coherent | MemoryCaching::Uncached => {
                    vk::MemoryPropertyFlags::HOST_COHERENT
                }
            };
        }
        props
    }

    /// Hand out a region satisfying `request`, reusing released space in
    /// an existing block when it fits.
    pub fn reserve(&mut self, guard: &ContextGuard, request: MemoryRequest) -> Result<MemoryRegion> {
        let size = request.size.max(1).next_multiple_of(ALIGNMENT);
        let want_host = request.visibility != MemoryVisibility::DeviceOnly;

        // First fit over freed slots.
        for (bi, block) in self.blocks.iter_mut().enumerate() {
            if block.destroyed || block.host_visible != want_host {
                continue;
            }
            for (si, slot) in block.slots.iter_mut().enumerate() {
                if slot.state == SlotState::Free && slot.size >= size {
                    slot.state = SlotState::Live;
                    return Ok(MemoryRegion {
                        block: bi,
                        slot: si,
                        head_offset: slot.offset,
                        size: slot.size,
                    });
                }
            }
            let tail = block.slots.last().map(|s| s.offset + s.size).unwrap_or(0);
            if block.size - tail >= size {
                block.slots.push(Slot {
                    offset: tail,
                    size,
                    state: SlotState::Live,
                });
                return Ok(MemoryRegion {
                    block: bi,
                    slot: block.slots.len() - 1,
                    head_offset: tail,
                    size,
                });
            }
        }

        // No room anywhere: grow by one block.
        let block_size = size.max(BLOCK_SIZE);
        let bi = self.create_block(guard, block_size, &request)?;
        self.blocks[bi].slots.push(Slot {
            offset: 0,
            size,
            state: SlotState::Live,
        });
        Ok(MemoryRegion {
            block: bi,
            slot: 0,
            head_offset: 0,
            size,
        })
    }

    fn create_block(
        &mut self,
        guard: &ContextGuard,
        size: u64,
        request: &MemoryRequest,
    ) -> Result<usize> {
        let device = guard.ctx.device();
        unsafe {
            let buffer_info = vk::BufferCreateInfo::default()
                .size(size)
                .usage(Self::usage_flags(request.usage))
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            let buffer = device.create_buffer(&buffer_info, None).vk("vkCreateBuffer")?;

            let requirements = device.get_buffer_memory_requirements(buffer);
            let properties = Self::memory_properties(request);
            let memory_type = match guard.ctx.find_memory_type(requirements.memory_type_bits, properties) {
                Ok(t) => t,
                Err(e) => {
                    device.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };
            let alloc_info = vk::MemoryAllocateInfo::default()
                .allocation_size(requirements.size)
                .memory_type_index(memory_type);
            let memory = match device.allocate_memory(&alloc_info, None).vk("vkAllocateMemory") {
                Ok(m) => m,
                Err(e) => {
                    device.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };
            if let Err(e) = device.bind_buffer_memory(buffer, memory, 0).vk("vkBindBufferMemory") {
                device.free_memory(memory, None);
                device.destroy_buffer(buffer, None);
                return Err(e);
            }

            debug!("allocated {} byte block ({} total)", size, self.blocks.len() + 1);
            self.blocks.push(Block {
                buffer,
                memory,
                size,
                host_visible: request.visibility != MemoryVisibility::DeviceOnly,
                slots: Vec::new(),
                destroyed: false,
                external: false,
            });
            Ok(self.blocks.len() - 1)
        }
    }

    /// Adopt a caller-owned buffer as a region. The allocator never frees
    /// wrapped storage; `detach` returns ownership.
    pub fn wrap(&mut self, buffer: vk::Buffer, size: u64) -> MemoryRegion {
        self.blocks.push(Block {
            buffer,
            memory: vk::DeviceMemory::null(),
            size,
            host_visible: false,
            slots: vec![Slot {
                offset: 0,
                size,
                state: SlotState::Live,
            }],
            destroyed: false,
            external: true,
        });
        MemoryRegion {
            block: self.blocks.len() - 1,
            slot: 0,
            head_offset: 0,
            size,
        }
    }

    /// Release a wrapped region back to its owner.
    pub fn detach(&mut self, region: MemoryRegion) -> vk::Buffer {
        let block = &mut self.blocks[region.block];
        assert!(block.external, "BUG: detach of an allocator-owned region");
        block.destroyed = true;
        block.slots.clear();
        block.buffer
    }

    fn slot_mut(&mut self, region: MemoryRegion) -> &mut Slot {
        &mut self.blocks[region.block].slots[region.slot]
    }

    /// Return a region for reuse by a later `reserve`.
    pub fn release(&mut self, region: MemoryRegion) {
        self.slot_mut(region).state = SlotState::Free;
    }

    /// Return a region that must not be reused (the block space is still
    /// freed for the collector).
    pub fn reclaim(&mut self, region: MemoryRegion) {
        let slot = self.slot_mut(region);
        slot.state = SlotState::Free;
        slot.size = 0;
    }

    /// Map the region for host access. Pairs with `unmap`.
    pub fn map(&self, guard: &ContextGuard, region: MemoryRegion) -> Result<*mut u8> {
        let block = &self.blocks[region.block];
        if !block.host_visible {
            return Err(RuntimeError::Generic(
                "mapping a device-only region".to_string(),
            ));
        }
        unsafe {
            let ptr = guard
                .ctx
                .device()
                .map_memory(
                    block.memory,
                    region.head_offset,
                    region.size,
                    vk::MemoryMapFlags::empty(),
                )
                .vk("vkMapMemory")?;
            Ok(ptr as *mut u8)
        }
    }

    pub fn unmap(&self, guard: &ContextGuard, region: MemoryRegion) {
        unsafe {
            guard
                .ctx
                .device()
                .unmap_memory(self.blocks[region.block].memory);
        }
    }

    /// The region covering the whole owning allocation.
    pub fn owner_of(&self, region: MemoryRegion) -> MemoryRegion {
        MemoryRegion {
            block: region.block,
            slot: usize::MAX,
            head_offset: 0,
            size: self.blocks[region.block].size,
        }
    }

    /// A sub-range of an existing region sharing its storage.
    pub fn crop(&self, region: MemoryRegion, offset: u64, size: u64) -> Result<MemoryRegion> {
        if offset + size > region.size {
            return Err(RuntimeError::SizeMismatch {
                expected: region.size,
                got: offset + size,
            });
        }
        Ok(MemoryRegion {
            block: region.block,
            slot: region.slot,
            head_offset: region.head_offset + offset,
            size,
        })
    }

    /// Drop a crop handle. The underlying slot stays live; only a release
    /// or reclaim of the owning region frees it.
    pub fn destroy_crop(&mut self, _region: MemoryRegion) {}

    /// Free every block with no live regions left.
    pub fn collect(&mut self, guard: &ContextGuard) {
        for block in self.blocks.iter_mut() {
            if block.destroyed || block.external || block.live_bytes() > 0 {
                continue;
            }
            unsafe {
                guard.ctx.device().free_memory(block.memory, None);
                guard.ctx.device().destroy_buffer(block.buffer, None);
            }
            block.destroyed = true;
            block.slots.clear();
        }
    }

    /// Tear everything down; the context must be held and idle.
    pub fn destroy(&mut self, guard: &ContextGuard) {
        for block in self.blocks.iter_mut() {
            if !block.destroyed && !block.external {
                unsafe {
                    guard.ctx.device().free_memory(block.memory, None);
                    guard.ctx.device().destroy_buffer(block.buffer, None);
                }
            }
            block.destroyed = true;
        }
    }

    pub fn buffer_of(&self, region: MemoryRegion) -> vk::Buffer {
        self.blocks[region.block].buffer
    }
}

impl Default for RegionAllocator {
    fn default() -> Self {
        Self::new()
    }
}
