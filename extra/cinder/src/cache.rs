//! Compilation cache: pipeline state per compiled module.
//!
//! Keyed by a content fingerprint of the module bytes. An entry is built
//! on first use and reused for every later dispatch with the same module;
//! descriptor sets belong to the entry (per kernel, not per dispatch) and
//! are rewritten in place while the context is held.

use std::collections::HashMap;
use std::ffi::CString;

use ash::vk;
use log::debug;

use crate::context::ContextGuard;
use crate::error::{Result, RuntimeError, VkResultExt};
use crate::header::{parse_module, EntryPointLayout};

/// Scalar arguments are staged through one small uniform buffer per entry
/// point; this is its fixed capacity in bytes.
pub const UNIFORM_ARGS_CAPACITY: u64 = 256;

pub struct EntryPointState {
    pub layout: EntryPointLayout,
    pub descriptor_set_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub descriptor_pool: vk::DescriptorPool,
    pub descriptor_set: vk::DescriptorSet,
    pub uniform_buffer: Option<(vk::Buffer, vk::DeviceMemory)>,
}

pub struct ModuleEntry {
    pub shader_module: vk::ShaderModule,
    pub entry_points: Vec<EntryPointState>,
    byte_len: usize,
}

impl ModuleEntry {
    pub fn entry_point(&self, name: &str) -> Result<&EntryPointState> {
        self.entry_points
            .iter()
            .find(|e| e.layout.name == name)
            .ok_or_else(|| RuntimeError::BadEntryName(name.to_string()))
    }
}

pub struct CompilationCache {
    entries: HashMap<u64, ModuleEntry>,
}

impl CompilationCache {
    pub fn new() -> CompilationCache {
        CompilationCache {
            entries: HashMap::new(),
        }
    }

    /// Fetch or build the pipeline state for a module.
    pub fn get_or_create(
        &mut self,
        guard: &ContextGuard,
        fingerprint: u64,
        module_bytes: &[u8],
    ) -> Result<&ModuleEntry> {
        if let Some(existing) = self.entries.get(&fingerprint) {
            if existing.byte_len == module_bytes.len() {
                // Borrow dance: re-fetch immutably below.
            } else {
                return Err(RuntimeError::BadModule(
                    "fingerprint collision between different modules".to_string(),
                ));
            }
        } else {
            let entry = build_entry(guard, module_bytes)?;
            self.entries.insert(fingerprint, entry);
            debug!("compiled module {:#018x}", fingerprint);
        }
        Ok(self.entries.get(&fingerprint).unwrap())
    }

    /// Destroy all cached device objects. The context must be held.
    pub fn destroy(&mut self, guard: &ContextGuard) {
        let device = guard.ctx.device();
        for (_, entry) in self.entries.drain() {
            unsafe {
                for ep in entry.entry_points {
                    if let Some((buffer, memory)) = ep.uniform_buffer {
                        device.destroy_buffer(buffer, None);
                        device.free_memory(memory, None);
                    }
                    device.destroy_descriptor_pool(ep.descriptor_pool, None);
                    device.destroy_pipeline(ep.pipeline, None);
                    device.destroy_pipeline_layout(ep.pipeline_layout, None);
                    device.destroy_descriptor_set_layout(ep.descriptor_set_layout, None);
                }
                device.destroy_shader_module(entry.shader_module, None);
            }
        }
    }
}

impl Default for CompilationCache {
    fn default() -> Self {
        Self::new()
    }
}

fn build_entry(guard: &ContextGuard, module_bytes: &[u8]) -> Result<ModuleEntry> {
    let parsed = parse_module(module_bytes)?;
    let device = guard.ctx.device();

    unsafe {
        let shader_info = vk::ShaderModuleCreateInfo::default().code(&parsed.spirv);
        let shader_module = device
            .create_shader_module(&shader_info, None)
            .vk("vkCreateShaderModule")?;

        let mut entry_points = Vec::with_capacity(parsed.entry_points.len());
        for layout in &parsed.entry_points {
            match build_entry_point(guard, shader_module, layout) {
                Ok(state) => entry_points.push(state),
                Err(e) => {
                    // Unwind the partial entry before surfacing the error.
                    for ep in entry_points {
                        if let Some((buffer, memory)) = ep.uniform_buffer {
                            device.destroy_buffer(buffer, None);
                            device.free_memory(memory, None);
                        }
                        device.destroy_descriptor_pool(ep.descriptor_pool, None);
                        device.destroy_pipeline(ep.pipeline, None);
                        device.destroy_pipeline_layout(ep.pipeline_layout, None);
                        device.destroy_descriptor_set_layout(ep.descriptor_set_layout, None);
                    }
                    device.destroy_shader_module(shader_module, None);
                    return Err(e);
                }
            }
        }

        Ok(ModuleEntry {
            shader_module,
            entry_points,
            byte_len: module_bytes.len(),
        })
    }
}

unsafe fn build_entry_point(
    guard: &ContextGuard,
    shader_module: vk::ShaderModule,
    layout: &EntryPointLayout,
) -> Result<EntryPointState> {
    let device = guard.ctx.device();

    // Binding order matches the compiler: the scalar-args uniform buffer
    // first (if any), then each storage buffer.
    let mut bindings = Vec::new();
    for i in 0..layout.uniform_buffer_count {
        bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(i)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE),
        );
    }
    for i in 0..layout.storage_buffer_count {
        bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(layout.uniform_buffer_count + i)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE),
        );
    }

    let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
    let descriptor_set_layout = device
        .create_descriptor_set_layout(&layout_info, None)
        .vk("vkCreateDescriptorSetLayout")?;

    let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(std::slice::from_ref(&descriptor_set_layout));
    let pipeline_layout = device
        .create_pipeline_layout(&pipeline_layout_info, None)
        .vk("vkCreatePipelineLayout")?;

    let entry_cstr = CString::new(layout.name.clone())
        .map_err(|_| RuntimeError::BadModule("entry point name contains NUL".to_string()))?;
    let stage_info = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(shader_module)
        .name(&entry_cstr);
    let pipeline_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage_info)
        .layout(pipeline_layout);
    let pipeline = device
        .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        .map_err(|(_, e)| RuntimeError::from_vk("vkCreateComputePipelines", e))?[0];

    let pool_sizes = [
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(layout.uniform_buffer_count.max(1)),
        vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(layout.storage_buffer_count.max(1)),
    ];
    let pool_info = vk::DescriptorPoolCreateInfo::default()
        .max_sets(1)
        .pool_sizes(&pool_sizes);
    let descriptor_pool = device
        .create_descriptor_pool(&pool_info, None)
        .vk("vkCreateDescriptorPool")?;

    let alloc_info = vk::DescriptorSetAllocateInfo::default()
        .descriptor_pool(descriptor_pool)
        .set_layouts(std::slice::from_ref(&descriptor_set_layout));
    let descriptor_set = device
        .allocate_descriptor_sets(&alloc_info)
        .vk("vkAllocateDescriptorSets")?[0];

    let uniform_buffer = if layout.uniform_buffer_count > 0 {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(UNIFORM_ARGS_CAPACITY)
            .usage(vk::BufferUsageFlags::UNIFORM_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = device.create_buffer(&buffer_info, None).vk("vkCreateBuffer")?;
        let requirements = device.get_buffer_memory_requirements(buffer);
        let memory_type = guard.ctx.find_memory_type(
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let alloc = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        let memory = device.allocate_memory(&alloc, None).vk("vkAllocateMemory")?;
        device
            .bind_buffer_memory(buffer, memory, 0)
            .vk("vkBindBufferMemory")?;
        Some((buffer, memory))
    } else {
        None
    };

    Ok(EntryPointState {
        layout: layout.clone(),
        descriptor_set_layout,
        pipeline_layout,
        pipeline,
        descriptor_pool,
        descriptor_set,
        uniform_buffer,
    })
}
