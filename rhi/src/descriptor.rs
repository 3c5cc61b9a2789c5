//! Descriptor binding model.
//!
//! A set layout is the schema for one descriptor set; a pipeline layout
//! stacks set layouts by set index plus push-constant ranges. On the
//! explicit backend descriptor sets come from a per-frame pool that is reset
//! at frame begin; on the immediate backend they are software binding
//! trackers applied at draw time. Either way, updates become visible at the
//! next bind and missing bindings surface at draw with a category-tagged
//! message.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use fxhash::FxHashMap;

use crate::buffer::Buffer;
use crate::device::DeviceShared;
use crate::error::{RhiError, RhiResult};
use crate::resource::{impl_gpu_resource, ResourceCommon, ResourceKind, ResourceUsage};
use crate::sampler::Sampler;
use crate::shader::ShaderStageFlags;
use crate::texture::Texture;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    UniformBuffer,
    StorageBuffer,
    Texture,
    StorageTexture,
    Sampler,
    CombinedTextureSampler,
    InputAttachment,
}

#[derive(Debug, Clone)]
pub struct DescriptorSetLayoutBinding {
    pub binding: u32,
    pub kind: DescriptorKind,
    /// Array size; 1 for a single descriptor.
    pub count: u32,
    pub visibility: ShaderStageFlags,
}

impl DescriptorSetLayoutBinding {
    pub fn new(binding: u32, kind: DescriptorKind, visibility: ShaderStageFlags) -> Self {
        DescriptorSetLayoutBinding {
            binding,
            kind,
            count: 1,
            visibility,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutDesc {
    pub set_index: u32,
    pub bindings: Vec<DescriptorSetLayoutBinding>,
    pub debug_name: String,
}

pub struct DescriptorSetLayout {
    pub(crate) common: ResourceCommon,
    desc: DescriptorSetLayoutDesc,
}

impl_gpu_resource!(DescriptorSetLayout);

impl DescriptorSetLayout {
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        desc: &DescriptorSetLayoutDesc,
    ) -> Option<Arc<DescriptorSetLayout>> {
        let mut seen = FxHashMap::default();
        for binding in &desc.bindings {
            if seen.insert(binding.binding, binding.kind).is_some() {
                log::error!(
                    target: "gfx-descriptor",
                    "set layout '{}': duplicate binding index {}",
                    desc.debug_name,
                    binding.binding
                );
                return None;
            }
        }
        let common = ResourceCommon::new(
            device,
            ResourceKind::DescriptorSetLayout,
            &desc.debug_name,
            ResourceUsage::empty(),
            0,
        )?;
        Some(Arc::new(DescriptorSetLayout {
            common,
            desc: desc.clone(),
        }))
    }

    pub fn set_index(&self) -> u32 {
        self.desc.set_index
    }

    pub fn bindings(&self) -> &[DescriptorSetLayoutBinding] {
        &self.desc.bindings
    }

    pub fn binding(&self, index: u32) -> Option<&DescriptorSetLayoutBinding> {
        self.desc.bindings.iter().find(|b| b.binding == index)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PushConstantRange {
    pub stages: ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Default)]
pub struct PipelineLayoutDesc {
    /// Indexed by each layout's `set_index`.
    pub set_layouts: Vec<Arc<DescriptorSetLayout>>,
    pub push_constant_ranges: Vec<PushConstantRange>,
    pub debug_name: String,
}

pub struct PipelineLayout {
    pub(crate) common: ResourceCommon,
    desc: PipelineLayoutDesc,
}

impl_gpu_resource!(PipelineLayout);

impl PipelineLayout {
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        desc: &PipelineLayoutDesc,
    ) -> Option<Arc<PipelineLayout>> {
        let common = ResourceCommon::new(
            device,
            ResourceKind::PipelineLayout,
            &desc.debug_name,
            ResourceUsage::empty(),
            0,
        )?;
        Some(Arc::new(PipelineLayout {
            common,
            desc: desc.clone(),
        }))
    }

    pub fn set_layouts(&self) -> &[Arc<DescriptorSetLayout>] {
        &self.desc.set_layouts
    }

    pub fn push_constant_ranges(&self) -> &[PushConstantRange] {
        &self.desc.push_constant_ranges
    }
}

/// A resource bound into one slot of a descriptor set.
#[derive(Clone)]
pub enum BoundDescriptor {
    UniformBuffer {
        buffer: Arc<Buffer>,
        offset: u64,
        /// 0 means the whole buffer.
        range: u64,
    },
    StorageBuffer {
        buffer: Arc<Buffer>,
        offset: u64,
        range: u64,
    },
    Texture(Arc<Texture>),
    StorageTexture(Arc<Texture>),
    Sampler(Arc<Sampler>),
    CombinedTextureSampler {
        texture: Arc<Texture>,
        sampler: Arc<Sampler>,
    },
}

impl BoundDescriptor {
    pub fn kind(&self) -> DescriptorKind {
        match self {
            BoundDescriptor::UniformBuffer { .. } => DescriptorKind::UniformBuffer,
            BoundDescriptor::StorageBuffer { .. } => DescriptorKind::StorageBuffer,
            BoundDescriptor::Texture(_) => DescriptorKind::Texture,
            BoundDescriptor::StorageTexture(_) => DescriptorKind::StorageTexture,
            BoundDescriptor::Sampler(_) => DescriptorKind::Sampler,
            BoundDescriptor::CombinedTextureSampler { .. } => {
                DescriptorKind::CombinedTextureSampler
            }
        }
    }

    fn compatible_with(&self, declared: DescriptorKind) -> bool {
        match declared {
            // Input attachments bind plain textures.
            DescriptorKind::InputAttachment => matches!(self, BoundDescriptor::Texture(_)),
            other => self.kind() == other,
        }
    }
}

/// How a set was allocated; decides staleness rules.
pub(crate) enum DescriptorSetOrigin {
    /// Explicit backend: carved from a per-frame pool. The set goes stale
    /// when the pool is reset for the next frame.
    Pooled {
        pool: Arc<DescriptorPoolShared>,
        generation: u64,
    },
    /// Immediate backend: a software binding tracker, never stale.
    Tracker,
}

pub struct DescriptorSet {
    pub(crate) common: ResourceCommon,
    layout: Arc<DescriptorSetLayout>,
    bindings: Mutex<FxHashMap<u32, BoundDescriptor>>,
    origin: DescriptorSetOrigin,
}

impl_gpu_resource!(DescriptorSet);

impl DescriptorSet {
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        layout: &Arc<DescriptorSetLayout>,
        origin: DescriptorSetOrigin,
    ) -> Option<Arc<DescriptorSet>> {
        let common = ResourceCommon::new(
            device,
            ResourceKind::DescriptorSet,
            layout.common.debug_name(),
            ResourceUsage::empty(),
            0,
        )?;
        Some(Arc::new(DescriptorSet {
            common,
            layout: Arc::clone(layout),
            bindings: Mutex::new(FxHashMap::default()),
            origin,
        }))
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.layout
    }

    pub fn update_uniform_buffer(
        &self,
        binding: u32,
        buffer: &Arc<Buffer>,
        offset: u64,
        range: u64,
    ) -> RhiResult<()> {
        self.update(
            binding,
            BoundDescriptor::UniformBuffer {
                buffer: Arc::clone(buffer),
                offset,
                range,
            },
        )
    }

    pub fn update_storage_buffer(
        &self,
        binding: u32,
        buffer: &Arc<Buffer>,
        offset: u64,
        range: u64,
    ) -> RhiResult<()> {
        self.update(
            binding,
            BoundDescriptor::StorageBuffer {
                buffer: Arc::clone(buffer),
                offset,
                range,
            },
        )
    }

    pub fn update_texture(&self, binding: u32, texture: &Arc<Texture>) -> RhiResult<()> {
        self.update(binding, BoundDescriptor::Texture(Arc::clone(texture)))
    }

    pub fn update_storage_texture(&self, binding: u32, texture: &Arc<Texture>) -> RhiResult<()> {
        self.update(
            binding,
            BoundDescriptor::StorageTexture(Arc::clone(texture)),
        )
    }

    pub fn update_sampler(&self, binding: u32, sampler: &Arc<Sampler>) -> RhiResult<()> {
        self.update(binding, BoundDescriptor::Sampler(Arc::clone(sampler)))
    }

    pub fn update_combined_texture_sampler(
        &self,
        binding: u32,
        texture: &Arc<Texture>,
        sampler: &Arc<Sampler>,
    ) -> RhiResult<()> {
        self.update(
            binding,
            BoundDescriptor::CombinedTextureSampler {
                texture: Arc::clone(texture),
                sampler: Arc::clone(sampler),
            },
        )
    }

    fn update(&self, binding: u32, value: BoundDescriptor) -> RhiResult<()> {
        let Some(declared) = self.layout.binding(binding) else {
            let message = format!(
                "set '{}': binding {} not declared in layout",
                self.common.debug_name(),
                binding
            );
            log::error!(target: "gfx-descriptor", "{message}");
            return Err(RhiError::InvalidArgument(message));
        };
        if !value.compatible_with(declared.kind) {
            let message = format!(
                "set '{}': binding {} declared {:?}, update holds {:?}",
                self.common.debug_name(),
                binding,
                declared.kind,
                value.kind()
            );
            log::error!(target: "gfx-descriptor", "{message}");
            return Err(RhiError::InvalidArgument(message));
        }
        self.bindings.lock().unwrap().insert(binding, value);
        Ok(())
    }

    /// Snapshot of the current bindings, for draw-time consumption.
    pub(crate) fn bound(&self, binding: u32) -> Option<BoundDescriptor> {
        self.bindings.lock().unwrap().get(&binding).cloned()
    }

    /// True when the backing pool has been reset since allocation.
    pub(crate) fn is_stale(&self) -> bool {
        match &self.origin {
            DescriptorSetOrigin::Pooled { pool, generation } => {
                pool.generation.load(Ordering::Acquire) != *generation
            }
            DescriptorSetOrigin::Tracker => false,
        }
    }

    /// Checks that every declared binding is populated with a compatible
    /// resource; the draw-time contract.
    pub(crate) fn validate_complete(&self) -> RhiResult<()> {
        let bindings = self.bindings.lock().unwrap();
        for declared in self.layout.bindings() {
            match bindings.get(&declared.binding) {
                None => {
                    return Err(RhiError::ValidationFailed(format!(
                        "set {} binding {} ({:?}) is not populated",
                        self.layout.set_index(),
                        declared.binding,
                        declared.kind
                    )));
                }
                Some(bound) if !bound.compatible_with(declared.kind) => {
                    return Err(RhiError::ValidationFailed(format!(
                        "set {} binding {} expects {:?}, holds {:?}",
                        self.layout.set_index(),
                        declared.binding,
                        declared.kind,
                        bound.kind()
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Shared state of one per-frame descriptor pool on the explicit backend.
pub(crate) struct DescriptorPoolShared {
    pub(crate) capacity: u32,
    pub(crate) generation: AtomicU64,
    pub(crate) allocated_this_frame: AtomicU32,
    pub(crate) peak_allocated: AtomicU32,
}

impl DescriptorPoolShared {
    pub(crate) fn new(capacity: u32) -> Arc<DescriptorPoolShared> {
        Arc::new(DescriptorPoolShared {
            capacity,
            generation: AtomicU64::new(0),
            allocated_this_frame: AtomicU32::new(0),
            peak_allocated: AtomicU32::new(0),
        })
    }

    /// Frame-begin reset: previously allocated sets go stale and the pool is
    /// reusable in full.
    pub(crate) fn reset(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.allocated_this_frame.store(0, Ordering::Release);
    }

    /// Claims one slot; `None` once the pool is exhausted for this frame.
    pub(crate) fn allocate_slot(&self) -> Option<u64> {
        let previous = self.allocated_this_frame.fetch_add(1, Ordering::AcqRel);
        if previous >= self.capacity {
            self.allocated_this_frame.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        self.peak_allocated.fetch_max(previous + 1, Ordering::AcqRel);
        Some(self.generation.load(Ordering::Acquire))
    }

    pub(crate) fn peak_allocated(&self) -> u32 {
        self.peak_allocated.load(Ordering::Acquire)
    }
}
