//! GPU buffers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::device::DeviceShared;
use crate::error::{RhiError, RhiResult};
use crate::resource::{impl_gpu_resource, ResourceCommon, ResourceKind, ResourceUsage};

/// Where the buffer's memory should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryHint {
    /// Device-local memory, GPU only.
    #[default]
    DeviceLocal,
    /// Host-visible staging memory for CPU to GPU transfers.
    Upload,
    /// Host-visible memory for GPU to CPU readback.
    Readback,
    /// Frequently rewritten by the CPU.
    Dynamic,
}

/// Width of index-buffer elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    pub fn stride(self) -> u32 {
        match self {
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: ResourceUsage,
    pub memory: MemoryHint,
    pub cpu_accessible: bool,
    /// Element stride, for structured/vertex buffers.
    pub stride: Option<u32>,
    /// Present on index buffers.
    pub index_format: Option<IndexFormat>,
    pub debug_name: String,
}

impl BufferDesc {
    pub fn new(size: u64, usage: ResourceUsage) -> BufferDesc {
        BufferDesc {
            size,
            usage,
            ..BufferDesc::default()
        }
    }
}

pub struct Buffer {
    pub(crate) common: ResourceCommon,
    desc: BufferDesc,
    storage: Mutex<Box<[u8]>>,
    mapped: AtomicBool,
}

impl_gpu_resource!(Buffer);

impl Buffer {
    pub(crate) fn create(device: &Arc<DeviceShared>, desc: &BufferDesc) -> Option<Arc<Buffer>> {
        if desc.size == 0 {
            log::error!(
                target: "gfx",
                "buffer '{}' rejected: size must be non-zero",
                desc.debug_name
            );
            return None;
        }
        let common = ResourceCommon::new(
            device,
            ResourceKind::Buffer,
            &desc.debug_name,
            desc.usage,
            desc.size,
        )?;
        Some(Arc::new(Buffer {
            common,
            desc: desc.clone(),
            storage: Mutex::new(vec![0u8; desc.size as usize].into_boxed_slice()),
            mapped: AtomicBool::new(false),
        }))
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn len(&self) -> u64 {
        self.desc.size
    }

    pub fn is_empty(&self) -> bool {
        self.desc.size == 0
    }

    /// Whether a mapping is currently outstanding. A mapped buffer must not
    /// be referenced by a submission.
    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire)
    }

    /// Maps the buffer for CPU access. Returns `None` (with a warning) when
    /// the buffer was not created `cpu_accessible`.
    pub fn map(&self) -> Option<MappedBuffer<'_>> {
        if !self.desc.cpu_accessible {
            log::warn!(
                target: "gfx",
                "map rejected: buffer '{}' is not CPU accessible",
                self.common.debug_name()
            );
            return None;
        }
        let guard = self.storage.lock().unwrap();
        self.mapped.store(true, Ordering::Release);
        Some(MappedBuffer {
            guard,
            mapped: &self.mapped,
        })
    }

    /// Copies `data` into the buffer at `offset` through the transfer path.
    pub fn write(&self, offset: u64, data: &[u8]) -> RhiResult<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| RhiError::InvalidArgument("buffer write range overflow".into()))?;
        if end > self.desc.size {
            return Err(RhiError::InvalidArgument(format!(
                "write of {} bytes at offset {} exceeds buffer '{}' ({} bytes)",
                data.len(),
                offset,
                self.common.debug_name(),
                self.desc.size
            )));
        }
        let mut storage = self.storage.lock().unwrap();
        storage[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    /// Reads `out.len()` bytes starting at `offset`.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> RhiResult<()> {
        let end = offset
            .checked_add(out.len() as u64)
            .ok_or_else(|| RhiError::InvalidArgument("buffer read range overflow".into()))?;
        if end > self.desc.size {
            return Err(RhiError::InvalidArgument(format!(
                "read of {} bytes at offset {} exceeds buffer '{}' ({} bytes)",
                out.len(),
                offset,
                self.common.debug_name(),
                self.desc.size
            )));
        }
        let storage = self.storage.lock().unwrap();
        out.copy_from_slice(&storage[offset as usize..end as usize]);
        Ok(())
    }
}

/// RAII mapping. The buffer stays flagged as mapped until this drops.
pub struct MappedBuffer<'a> {
    guard: MutexGuard<'a, Box<[u8]>>,
    mapped: &'a AtomicBool,
}

impl std::ops::Deref for MappedBuffer<'_> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl std::ops::DerefMut for MappedBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

impl Drop for MappedBuffer<'_> {
    fn drop(&mut self) {
        self.mapped.store(false, Ordering::Release);
    }
}
