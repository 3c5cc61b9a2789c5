//! Common resource model.
//!
//! Every GPU-visible object shares four attributes: the backend tag, a debug
//! name, a usage bitset and a size in bytes. Handles are `Arc`s; the last
//! drop enqueues the backend handle on the owning device's deferred-deletion
//! list, which `collect_garbage` drains once the GPU timeline has passed the
//! resource's last possible use.

use std::sync::Arc;

use bitflags::bitflags;

use crate::device::DeviceShared;
use crate::Backend;

bitflags! {
    /// Permissible operations on a resource. Composable; shared between
    /// buffers and textures.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceUsage: u32 {
        const VERTEX_BUFFER    = 1 << 0;
        const INDEX_BUFFER     = 1 << 1;
        const UNIFORM_BUFFER   = 1 << 2;
        const STORAGE_BUFFER   = 1 << 3;
        const TRANSFER_SRC     = 1 << 4;
        const TRANSFER_DST     = 1 << 5;
        const RENDER_TARGET    = 1 << 6;
        const DEPTH_STENCIL    = 1 << 7;
        const SHADER_RESOURCE  = 1 << 8;
        const UNORDERED_ACCESS = 1 << 9;
    }
}

impl Default for ResourceUsage {
    fn default() -> Self {
        ResourceUsage::empty()
    }
}

/// Backend handle id, allocated from the device's live-object table.
pub type RawHandle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Texture,
    Sampler,
    Shader,
    PipelineState,
    DescriptorSetLayout,
    PipelineLayout,
    DescriptorSet,
    Swapchain,
}

/// Attributes shared by every resource kind, plus the back-reference that
/// routes the deferred deletion.
pub(crate) struct ResourceCommon {
    backend: Backend,
    kind: ResourceKind,
    debug_name: String,
    usage: ResourceUsage,
    size: u64,
    handle: RawHandle,
    device: Arc<DeviceShared>,
}

impl ResourceCommon {
    /// Registers the resource with the device and charges its size against
    /// the memory budget. Returns `None` when the budget is exhausted.
    pub(crate) fn new(
        device: &Arc<DeviceShared>,
        kind: ResourceKind,
        debug_name: &str,
        usage: ResourceUsage,
        size: u64,
    ) -> Option<ResourceCommon> {
        if !device.charge(size) {
            log::error!(
                target: "gfx",
                "out of device memory creating {:?} '{}' ({} bytes)",
                kind,
                debug_name,
                size
            );
            return None;
        }
        let handle = device.register_object(kind);
        Some(ResourceCommon {
            backend: device.backend(),
            kind,
            debug_name: debug_name.to_owned(),
            usage,
            size,
            handle,
            device: Arc::clone(device),
        })
    }

    pub(crate) fn backend(&self) -> Backend {
        self.backend
    }

    pub(crate) fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub(crate) fn debug_name(&self) -> &str {
        &self.debug_name
    }

    pub(crate) fn usage(&self) -> ResourceUsage {
        self.usage
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn handle(&self) -> RawHandle {
        self.handle
    }

    pub(crate) fn device(&self) -> &Arc<DeviceShared> {
        &self.device
    }
}

impl Drop for ResourceCommon {
    fn drop(&mut self) {
        self.device.release(self.size);
        self.device.defer_deletion(self.kind, self.handle);
    }
}

/// The four attributes every GPU-visible object exposes.
pub trait GpuResource {
    fn backend(&self) -> Backend;
    fn kind(&self) -> ResourceKind;
    fn debug_name(&self) -> &str;
    fn usage(&self) -> ResourceUsage;
    fn size(&self) -> u64;
}

macro_rules! impl_gpu_resource {
    ($ty:ty) => {
        impl crate::resource::GpuResource for $ty {
            fn backend(&self) -> crate::Backend {
                self.common.backend()
            }
            fn kind(&self) -> crate::resource::ResourceKind {
                self.common.kind()
            }
            fn debug_name(&self) -> &str {
                self.common.debug_name()
            }
            fn usage(&self) -> crate::resource::ResourceUsage {
                self.common.usage()
            }
            fn size(&self) -> u64 {
                self.common.size()
            }
        }
    };
}

pub(crate) use impl_gpu_resource;
