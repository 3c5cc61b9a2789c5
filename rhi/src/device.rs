//! The RHI device: a factory for every resource kind, owner of the frame
//! contexts, and the place where the two backends meet one contract.
//!
//! Factory methods are safe to call from any thread (internal state is
//! serialized); the immediate command list and the frame lifecycle belong to
//! the render thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use slotmap::{DefaultKey, Key, KeyData, SlotMap};

use crate::buffer::{Buffer, BufferDesc, IndexFormat};
use crate::command::CommandList;
use crate::context::FrameContext;
use crate::descriptor::{
    DescriptorPoolShared, DescriptorSet, DescriptorSetLayout, DescriptorSetLayoutDesc,
    DescriptorSetOrigin, PipelineLayout, PipelineLayoutDesc,
};
use crate::error::{RhiError, RhiResult};
use crate::explicit::DESCRIPTOR_POOL_CAPACITY;
use crate::immediate::ImmediateDevice;
use crate::pipeline::{PipelineState, PipelineStateDesc};
use crate::resource::{RawHandle, ResourceKind, ResourceUsage};
use crate::sampler::{Sampler, SamplerDesc};
use crate::settings::Settings;
use crate::shader::{ShaderModule, ShaderStage};
use crate::swapchain::{Swapchain, SwapchainDesc, SwapchainStatus};
use crate::sync::Timeline;
use crate::texture::{Texture, TextureDesc};
use crate::Backend;

/// Ring size for frame contexts and swapchain synchronization.
pub(crate) const FRAMES_IN_FLIGHT: usize = 2;

struct PendingDelete {
    kind: ResourceKind,
    handle: RawHandle,
    /// Timeline value that must retire before the backend handle may go.
    fence: u64,
}

/// State shared between the device and every resource it created; resources
/// hold an `Arc` to route deferred deletion and fence queries.
pub(crate) struct DeviceShared {
    backend: Backend,
    timeline: Timeline,
    live: Mutex<SlotMap<DefaultKey, ResourceKind>>,
    garbage: Mutex<Vec<PendingDelete>>,
    used_bytes: AtomicU64,
    budget_bytes: u64,
    validation: AtomicBool,
    debug_markers: AtomicBool,
    lost: AtomicBool,
    lost_hook: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
}

impl DeviceShared {
    fn new(backend: Backend, budget_bytes: u64, settings: &Settings) -> Arc<DeviceShared> {
        Arc::new(DeviceShared {
            backend,
            timeline: Timeline::new(0),
            live: Mutex::new(SlotMap::new()),
            garbage: Mutex::new(Vec::new()),
            used_bytes: AtomicU64::new(0),
            budget_bytes,
            validation: AtomicBool::new(settings.enable_validation),
            debug_markers: AtomicBool::new(settings.enable_debug_markers),
            lost: AtomicBool::new(false),
            lost_hook: Mutex::new(None),
        })
    }

    pub(crate) fn backend(&self) -> Backend {
        self.backend
    }

    pub(crate) fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Retires a virtual transfer-queue operation.
    pub(crate) fn retire_transfer(&self, fence: u64) {
        self.timeline.signal(fence);
    }

    pub(crate) fn validation_enabled(&self) -> bool {
        self.validation.load(Ordering::Relaxed)
    }

    pub(crate) fn debug_markers_enabled(&self) -> bool {
        self.debug_markers.load(Ordering::Relaxed)
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    fn mark_lost(&self, reason: &str) {
        if self.lost.swap(true, Ordering::AcqRel) {
            return;
        }
        log::error!(target: "gfx", "device lost: {reason}");
        let hook = self.lost_hook.lock().unwrap();
        match &*hook {
            Some(hook) => hook(reason),
            None => {
                log::error!(target: "gfx", "no device-lost hook installed; aborting");
                std::process::abort();
            }
        }
    }

    /// Charges `bytes` against the device budget; false when exhausted.
    pub(crate) fn charge(&self, bytes: u64) -> bool {
        let mut used = self.used_bytes.load(Ordering::Relaxed);
        loop {
            let next = used.saturating_add(bytes);
            if next > self.budget_bytes {
                return false;
            }
            match self.used_bytes.compare_exchange_weak(
                used,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => used = observed,
            }
        }
    }

    pub(crate) fn release(&self, bytes: u64) {
        self.used_bytes.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub(crate) fn register_object(&self, kind: ResourceKind) -> RawHandle {
        self.live.lock().unwrap().insert(kind).data().as_ffi()
    }

    pub(crate) fn defer_deletion(&self, kind: ResourceKind, handle: RawHandle) {
        self.garbage.lock().unwrap().push(PendingDelete {
            kind,
            handle,
            fence: self.timeline.head(),
        });
    }

    /// Destroys backend handles whose last-use fence has retired.
    fn drain_garbage(&self) -> usize {
        let completed = self.timeline.completed();
        let mut garbage = self.garbage.lock().unwrap();
        let mut live = self.live.lock().unwrap();
        let before = garbage.len();
        garbage.retain(|entry| {
            if entry.fence <= completed {
                let key = DefaultKey::from(KeyData::from_ffi(entry.handle));
                if live.remove(key).is_none() {
                    log::warn!(
                        target: "gfx",
                        "deferred delete of unknown {:?} handle {:#x}",
                        entry.kind,
                        entry.handle
                    );
                }
                false
            } else {
                true
            }
        });
        before - garbage.len()
    }

    fn live_objects(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

/// Reported device limits and feature bits.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub device_name: String,
    pub vendor_name: String,
    pub dedicated_video_memory: u64,
    pub supports_geometry_shader: bool,
    pub supports_tessellation: bool,
    pub supports_compute_shader: bool,
    pub supports_multi_draw_indirect: bool,
    pub supports_timestamp_query: bool,
    pub max_texture_2d: u32,
    pub max_texture_3d: u32,
    pub max_texture_cube: u32,
    pub max_texture_array_layers: u32,
    pub max_render_targets: u32,
    pub max_vertex_input_bindings: u32,
    pub max_vertex_input_attributes: u32,
}

impl DeviceCapabilities {
    fn for_backend(backend: Backend) -> DeviceCapabilities {
        match backend {
            Backend::Explicit => DeviceCapabilities {
                device_name: "Granite Virtual Adapter".to_owned(),
                vendor_name: "Granite".to_owned(),
                dedicated_video_memory: 4 * 1024 * 1024 * 1024,
                supports_geometry_shader: true,
                supports_tessellation: true,
                supports_compute_shader: true,
                supports_multi_draw_indirect: true,
                supports_timestamp_query: true,
                max_texture_2d: 16384,
                max_texture_3d: 2048,
                max_texture_cube: 16384,
                max_texture_array_layers: 2048,
                max_render_targets: 8,
                max_vertex_input_bindings: 16,
                max_vertex_input_attributes: 16,
            },
            Backend::Immediate => DeviceCapabilities {
                device_name: "Granite Virtual Adapter (compat)".to_owned(),
                vendor_name: "Granite".to_owned(),
                dedicated_video_memory: 1024 * 1024 * 1024,
                supports_geometry_shader: true,
                supports_tessellation: false,
                supports_compute_shader: false,
                supports_multi_draw_indirect: false,
                supports_timestamp_query: false,
                max_texture_2d: 8192,
                max_texture_3d: 1024,
                max_texture_cube: 8192,
                max_texture_array_layers: 256,
                max_render_targets: 4,
                max_vertex_input_bindings: 8,
                max_vertex_input_attributes: 16,
            },
        }
    }
}

enum BackendState {
    /// The explicit backend keeps no device-wide mutable state beyond
    /// `DeviceShared`; its per-frame pieces live in the frame contexts.
    Explicit,
    Immediate(ImmediateDevice),
}

struct DeviceFrameState {
    swapchain: Option<Arc<Swapchain>>,
    contexts: Vec<FrameContext>,
    current: usize,
    frames_submitted: u64,
}

pub struct Device {
    caps: DeviceCapabilities,
    shared: Arc<DeviceShared>,
    state: BackendState,
    inner: Mutex<DeviceFrameState>,
}

/// Creates a device for the configured backend.
pub fn create_device(settings: &Settings) -> Option<Device> {
    Device::new(settings.resolve_backend(), settings)
}

impl Device {
    pub fn new(backend: Backend, settings: &Settings) -> Option<Device> {
        let caps = DeviceCapabilities::for_backend(backend);
        let shared = DeviceShared::new(backend, caps.dedicated_video_memory, settings);

        let (state, contexts) = match backend {
            Backend::Explicit => {
                let contexts = (0..FRAMES_IN_FLIGHT)
                    .map(|_| {
                        FrameContext::new(
                            CommandList::new(&shared, None),
                            Some(DescriptorPoolShared::new(DESCRIPTOR_POOL_CAPACITY)),
                        )
                    })
                    .collect();
                (BackendState::Explicit, contexts)
            }
            Backend::Immediate => {
                let device = ImmediateDevice::new();
                let contexts = vec![FrameContext::new(
                    CommandList::new(&shared, Some(Arc::clone(&device.state))),
                    None,
                )];
                (BackendState::Immediate(device), contexts)
            }
        };

        log::info!(
            target: "gfx",
            "created {:?} device '{}' ({} MiB budget)",
            backend,
            caps.device_name,
            caps.dedicated_video_memory / 1024 / 1024
        );

        Some(Device {
            caps,
            shared,
            state,
            inner: Mutex::new(DeviceFrameState {
                swapchain: None,
                contexts,
                current: 0,
                frames_submitted: 0,
            }),
        })
    }

    pub fn backend(&self) -> Backend {
        self.shared.backend()
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.caps
    }

    // ------------------------------------------------------------------
    // Resource factories. All return `None` on failure after logging at
    // error verbosity.

    pub fn create_buffer(&self, desc: &BufferDesc) -> Option<Arc<Buffer>> {
        Buffer::create(&self.shared, desc)
    }

    /// Convenience constructor for vertex buffers, optionally initialized.
    pub fn create_vertex_buffer(
        &self,
        size: u64,
        stride: u32,
        initial_data: Option<&[u8]>,
    ) -> Option<Arc<Buffer>> {
        let buffer = Buffer::create(
            &self.shared,
            &BufferDesc {
                size,
                usage: ResourceUsage::VERTEX_BUFFER | ResourceUsage::TRANSFER_DST,
                stride: Some(stride),
                ..BufferDesc::default()
            },
        )?;
        if let Some(data) = initial_data {
            buffer.write(0, data).ok()?;
        }
        Some(buffer)
    }

    /// Convenience constructor for index buffers.
    pub fn create_index_buffer(
        &self,
        format: IndexFormat,
        size: u64,
        initial_data: Option<&[u8]>,
    ) -> Option<Arc<Buffer>> {
        let buffer = Buffer::create(
            &self.shared,
            &BufferDesc {
                size,
                usage: ResourceUsage::INDEX_BUFFER | ResourceUsage::TRANSFER_DST,
                stride: Some(format.stride()),
                index_format: Some(format),
                ..BufferDesc::default()
            },
        )?;
        if let Some(data) = initial_data {
            buffer.write(0, data).ok()?;
        }
        Some(buffer)
    }

    pub fn create_texture(
        &self,
        desc: &TextureDesc,
        initial_data: Option<&[u8]>,
    ) -> Option<Arc<Texture>> {
        if desc.width > self.caps.max_texture_2d || desc.height > self.caps.max_texture_2d {
            log::error!(
                target: "gfx",
                "texture '{}' exceeds device limit {}",
                desc.debug_name,
                self.caps.max_texture_2d
            );
            return None;
        }
        Texture::create(&self.shared, desc, initial_data)
    }

    pub fn create_vertex_shader(&self, bytecode: &[u8]) -> Option<Arc<ShaderModule>> {
        ShaderModule::create(&self.shared, ShaderStage::Vertex, bytecode)
    }

    pub fn create_pixel_shader(&self, bytecode: &[u8]) -> Option<Arc<ShaderModule>> {
        ShaderModule::create(&self.shared, ShaderStage::Pixel, bytecode)
    }

    pub fn create_pipeline_state(&self, desc: &PipelineStateDesc) -> Option<Arc<PipelineState>> {
        PipelineState::create(&self.shared, desc)
    }

    pub fn create_sampler(&self, desc: &SamplerDesc) -> Option<Arc<Sampler>> {
        match &self.state {
            // The immediate backend deduplicates sampler objects through a
            // weak cache.
            BackendState::Immediate(immediate) => {
                immediate.get_or_create_sampler(&self.shared, desc)
            }
            BackendState::Explicit => Sampler::create(&self.shared, desc),
        }
    }

    pub fn create_descriptor_set_layout(
        &self,
        desc: &DescriptorSetLayoutDesc,
    ) -> Option<Arc<DescriptorSetLayout>> {
        DescriptorSetLayout::create(&self.shared, desc)
    }

    pub fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> Option<Arc<PipelineLayout>> {
        PipelineLayout::create(&self.shared, desc)
    }

    /// Allocates a descriptor set. On the explicit backend the set comes
    /// from the active frame context's pool and goes stale when that pool
    /// resets; call this from the render thread inside the frame. On the
    /// immediate backend the set is a standalone binding tracker.
    pub fn allocate_descriptor_set(
        &self,
        layout: &Arc<DescriptorSetLayout>,
    ) -> Option<Arc<DescriptorSet>> {
        let origin = match self.backend() {
            Backend::Explicit => {
                let inner = self.inner.lock().unwrap();
                let pool = inner.contexts[inner.current]
                    .descriptor_pool()
                    .expect("explicit contexts always carry a pool");
                let Some(generation) = pool.allocate_slot() else {
                    log::error!(
                        target: "gfx-descriptor",
                        "per-frame descriptor pool exhausted ({} sets)",
                        pool.capacity
                    );
                    return None;
                };
                DescriptorSetOrigin::Pooled {
                    pool: Arc::clone(pool),
                    generation,
                }
            }
            Backend::Immediate => DescriptorSetOrigin::Tracker,
        };
        DescriptorSet::create(&self.shared, layout, origin)
    }

    pub fn create_swapchain(&self, desc: &SwapchainDesc) -> Option<Arc<Swapchain>> {
        let swapchain = Swapchain::create(&self.shared, desc)?;
        self.inner.lock().unwrap().swapchain = Some(Arc::clone(&swapchain));
        Some(swapchain)
    }

    pub fn swapchain(&self) -> Option<Arc<Swapchain>> {
        self.inner.lock().unwrap().swapchain.clone()
    }

    // ------------------------------------------------------------------
    // Frame lifecycle (render thread)

    /// The per-frame-rotated primary command list.
    pub fn immediate_command_list(&self) -> Arc<Mutex<CommandList>> {
        let inner = self.inner.lock().unwrap();
        inner.contexts[inner.current].command_list()
    }

    /// Step 1 of the frame: rotate to the next context, gate on its fence,
    /// reset its descriptor pool, acquire the next swapchain image and open
    /// the command list. On `OutOfDate` the swapchain is recreated and the
    /// frame should be skipped.
    pub fn prepare_for_new_frame(&self) -> SwapchainStatus {
        let mut inner = self.inner.lock().unwrap();
        inner.current = (inner.frames_submitted as usize) % inner.contexts.len();
        let swapchain = inner.swapchain.clone();
        inner.contexts[inner.current].prepare_for_new_frame(&self.shared, swapchain.as_ref())
    }

    /// Resets the active command list for synchronous intra-frame work.
    pub fn refresh_command_buffer(&self) {
        let inner = self.inner.lock().unwrap();
        inner.contexts[inner.current].refresh_command_buffer();
    }

    pub fn end_recording(&self) {
        let inner = self.inner.lock().unwrap();
        inner.contexts[inner.current].end_recording();
    }

    /// Submits the active command list; returns the timeline fence that
    /// retires when the work completes.
    pub fn submit_commands(&self) -> RhiResult<u64> {
        if self.shared.is_lost() {
            return Err(RhiError::DeviceLost("submission refused".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        let swapchain = inner.swapchain.clone();
        let fence =
            inner.contexts[inner.current].submit_commands(&self.shared, swapchain.as_ref())?;
        inner.frames_submitted += 1;
        Ok(fence)
    }

    /// Queues the rendered image for display.
    pub fn present(&self) -> SwapchainStatus {
        let Some(swapchain) = self.swapchain() else {
            log::warn!(target: "gfx", "present without a swapchain");
            return SwapchainStatus::Error;
        };
        swapchain.present()
    }

    pub fn frames_submitted(&self) -> u64 {
        self.inner.lock().unwrap().frames_submitted
    }

    // ------------------------------------------------------------------
    // Synchronization and housekeeping

    /// Blocks until the GPU timeline has drained.
    pub fn wait_for_idle(&self) {
        self.shared.timeline().drain();
    }

    /// Destroys backend handles whose deferred-deletion fences have
    /// retired; returns how many were destroyed.
    pub fn collect_garbage(&self) -> usize {
        let drained = self.shared.drain_garbage();
        if drained > 0 {
            log::debug!(target: "gfx", "collected {drained} deferred deletions");
        }
        drained
    }

    /// Live backend objects, including those awaiting deferred deletion.
    pub fn live_object_count(&self) -> usize {
        self.shared.live_objects()
    }

    pub fn memory_stats(&self) -> (u64, u64) {
        let used = self.shared.used_bytes.load(Ordering::Relaxed);
        (used, self.shared.budget_bytes.saturating_sub(used))
    }

    pub fn set_validation_enabled(&self, enabled: bool) {
        self.shared.validation.store(enabled, Ordering::Relaxed);
    }

    pub fn set_debug_markers_enabled(&self, enabled: bool) {
        self.shared.debug_markers.store(enabled, Ordering::Relaxed);
    }

    /// Installs the hook invoked on device loss. Without one, loss aborts
    /// the process.
    pub fn set_device_lost_hook(&self, hook: Box<dyn Fn(&str) + Send + Sync>) {
        *self.shared.lost_hook.lock().unwrap() = Some(hook);
    }

    /// Host escalation path for a fatal device error: runs the hook and
    /// refuses all further submissions.
    pub fn notify_device_lost(&self, reason: &str) {
        self.shared.mark_lost(reason);
    }

    pub fn is_lost(&self) -> bool {
        self.shared.is_lost()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.wait_for_idle();
        self.shared.drain_garbage();
    }
}
