//! Immediate-mode backend.
//!
//! There are no command buffers: every command-list operation replays
//! straight into a cached device state, the way a GL-style driver applies
//! state changes as they arrive. Descriptor sets are software binding
//! tables resolved against texture units and uniform-buffer binding points
//! at draw time; barriers are no-ops; present is a buffer swap handled by
//! the swapchain.

use std::sync::{Arc, Mutex, Weak};

use fxhash::FxHashMap;
use smallvec::SmallVec;

use crate::buffer::{Buffer, IndexFormat};
use crate::command::{CommandList, RecordedCommand};
use crate::descriptor::DescriptorSet;
use crate::device::DeviceShared;
use crate::error::RhiResult;
use crate::pipeline::{CompareFunc, PipelineState, ScissorRect, Viewport};
use crate::sampler::{AddressMode, Filter, MipmapMode, Sampler, SamplerDesc};
use crate::texture::Texture;

/// Cached binding state, invalidated between frames only by rebinding.
#[derive(Default)]
pub(crate) struct ImmediateState {
    pub(crate) pipeline: Option<Arc<PipelineState>>,
    pub(crate) vertex_buffers: FxHashMap<u32, Arc<Buffer>>,
    pub(crate) index_buffer: Option<(Arc<Buffer>, IndexFormat)>,
    pub(crate) uniform_bindings: FxHashMap<u32, Arc<Buffer>>,
    pub(crate) texture_units: FxHashMap<u32, Arc<Texture>>,
    pub(crate) sampler_units: FxHashMap<u32, Arc<Sampler>>,
    pub(crate) descriptor_sets: FxHashMap<u32, Arc<DescriptorSet>>,
    pub(crate) viewport: Option<Viewport>,
    pub(crate) scissor: Option<ScissorRect>,
    pub(crate) render_targets: SmallVec<[Arc<Texture>; 8]>,
    pub(crate) depth_target: Option<Arc<Texture>>,
    pub(crate) draw_count: u64,
    pub(crate) dropped_draws: u64,
}

impl ImmediateState {
    /// Applies one operation to the cached state. Invalid operations have
    /// already been filtered by the command list; what remains is binding
    /// bookkeeping and the draw-time descriptor check.
    pub(crate) fn apply(&mut self, cmd: &RecordedCommand) {
        match cmd {
            RecordedCommand::SetPipelineState(pipeline) => {
                self.pipeline = Some(Arc::clone(pipeline));
            }
            RecordedCommand::SetVertexBuffers {
                first_slot,
                buffers,
            } => {
                for (i, buffer) in buffers.iter().enumerate() {
                    self.vertex_buffers
                        .insert(first_slot + i as u32, Arc::clone(buffer));
                }
            }
            RecordedCommand::SetStreamSource { stream, buffer, .. } => {
                self.vertex_buffers.insert(*stream, Arc::clone(buffer));
            }
            RecordedCommand::SetIndexBuffer { buffer, format } => {
                self.index_buffer = Some((Arc::clone(buffer), *format));
            }
            RecordedCommand::SetConstantBuffer { slot, buffer } => {
                self.uniform_bindings.insert(*slot, Arc::clone(buffer));
            }
            RecordedCommand::SetShaderResource { slot, texture } => {
                self.texture_units.insert(*slot, Arc::clone(texture));
            }
            RecordedCommand::SetSampler { slot, sampler } => {
                self.sampler_units.insert(*slot, Arc::clone(sampler));
            }
            RecordedCommand::SetDescriptorSet { set_index, set } => {
                self.descriptor_sets.insert(*set_index, Arc::clone(set));
            }
            RecordedCommand::SetViewport(viewport) => {
                self.viewport = Some(*viewport);
            }
            RecordedCommand::SetScissorRect(rect) => {
                self.scissor = Some(*rect);
            }
            RecordedCommand::BeginRenderPass {
                color_targets,
                depth_stencil,
            } => {
                self.render_targets = color_targets.clone();
                self.depth_target = depth_stencil.clone();
            }
            RecordedCommand::EndRenderPass => {
                self.render_targets.clear();
                self.depth_target = None;
            }
            RecordedCommand::Draw { .. }
            | RecordedCommand::DrawIndexed { .. }
            | RecordedCommand::DrawInstanced { .. }
            | RecordedCommand::DrawIndexedInstanced { .. } => {
                self.draw(cmd);
            }
            RecordedCommand::ClearRenderTarget { texture, color } => {
                texture.fill(*color);
            }
            RecordedCommand::ClearDepthStencil { texture, depth, .. } => {
                texture.fill([*depth, *depth, *depth, *depth]);
            }
            // Implicit synchronization: barriers do nothing here.
            RecordedCommand::Transition { .. } | RecordedCommand::ResourceBarrier => {}
            RecordedCommand::BeginEvent(name) => {
                log::trace!(target: "gfx-cmd", "event begin: {name}");
            }
            RecordedCommand::EndEvent => {
                log::trace!(target: "gfx-cmd", "event end");
            }
            RecordedCommand::SetMarker(name) => {
                log::trace!(target: "gfx-cmd", "marker: {name}");
            }
        }
    }

    fn draw(&mut self, cmd: &RecordedCommand) {
        // Missing or incomplete bindings degrade the draw to a warning.
        for (set_index, set) in &self.descriptor_sets {
            if let Err(err) = set.validate_complete() {
                log::warn!(
                    target: "gfx-descriptor",
                    "draw dropped: set {set_index}: {err}"
                );
                self.dropped_draws += 1;
                return;
            }
        }
        if matches!(
            cmd,
            RecordedCommand::DrawIndexed { .. } | RecordedCommand::DrawIndexedInstanced { .. }
        ) && self.index_buffer.is_none()
        {
            log::warn!(target: "gfx-cmd", "indexed draw without an index buffer; dropped");
            self.dropped_draws += 1;
            return;
        }
        self.draw_count += 1;
    }
}

/// Identity of a sampler state, minus its debug name.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct SamplerCacheKey {
    min_filter: Filter,
    mag_filter: Filter,
    mipmap_mode: MipmapMode,
    address: (AddressMode, AddressMode, AddressMode),
    max_anisotropy: u32,
    compare: Option<CompareFunc>,
}

impl From<&SamplerDesc> for SamplerCacheKey {
    fn from(desc: &SamplerDesc) -> SamplerCacheKey {
        SamplerCacheKey {
            min_filter: desc.min_filter,
            mag_filter: desc.mag_filter,
            mipmap_mode: desc.mipmap_mode,
            address: (desc.address_u, desc.address_v, desc.address_w),
            max_anisotropy: desc.max_anisotropy,
            compare: desc.compare,
        }
    }
}

/// Immediate backend device payload.
pub(crate) struct ImmediateDevice {
    pub(crate) state: Arc<Mutex<ImmediateState>>,
    /// Weak entries so the cache never extends sampler lifetime; a dead
    /// entry fails its upgrade and is replaced.
    sampler_cache: Mutex<FxHashMap<SamplerCacheKey, Weak<Sampler>>>,
}

impl ImmediateDevice {
    pub(crate) fn new() -> ImmediateDevice {
        ImmediateDevice {
            state: Arc::new(Mutex::new(ImmediateState::default())),
            sampler_cache: Mutex::new(FxHashMap::default()),
        }
    }

    /// Looks up or creates the unique sampler object for `desc`.
    pub(crate) fn get_or_create_sampler(
        &self,
        device: &Arc<DeviceShared>,
        desc: &SamplerDesc,
    ) -> Option<Arc<Sampler>> {
        let key = SamplerCacheKey::from(desc);
        let mut cache = self.sampler_cache.lock().unwrap();
        if let Some(existing) = cache.get(&key).and_then(Weak::upgrade) {
            return Some(existing);
        }
        let sampler = Sampler::create(device, desc)?;
        cache.insert(key, Arc::downgrade(&sampler));
        Some(sampler)
    }
}

/// "Submission" on the immediate backend: everything already executed while
/// recording, so this just retires a timeline point in order.
pub(crate) fn submit(device: &Arc<DeviceShared>, list: &mut CommandList) -> RhiResult<u64> {
    for message in list.take_validation_errors() {
        log::warn!(target: "gfx-cmd", "{message}");
    }
    let fence = device.timeline().allocate();
    device.timeline().signal(fence);
    list.mark_submitted();
    Ok(fence)
}
