//! Command recording.
//!
//! On the explicit backend, operations append to a recorded command stream
//! that is validated and executed at submission. On the immediate backend
//! there is no command buffer: every operation replays straight into the
//! device's cached state, and calls made in an invalid state degrade to
//! warnings instead of deferred validation errors.
//!
//! State machine: `Initial -> Recording -> Executable -> Submitted`, with
//! `reset` returning any state to `Initial`. Draws and clears require an
//! open render pass; transitions and barriers require no pass.

use std::sync::{Arc, Mutex};

use smallvec::SmallVec;

use crate::buffer::{Buffer, IndexFormat};
use crate::descriptor::DescriptorSet;
use crate::device::DeviceShared;
use crate::pipeline::{PipelineState, ScissorRect, Viewport};
use crate::resource::ResourceUsage;
use crate::sampler::Sampler;
use crate::texture::Texture;
use crate::Backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandListState {
    Initial,
    Recording,
    Executable,
    Submitted,
}

/// A resource referenced by a barrier.
#[derive(Clone)]
pub enum TransitionTarget {
    Buffer(Arc<Buffer>),
    Texture(Arc<Texture>),
}

/// One recorded operation. The executor consumes these in recording order.
#[derive(Clone)]
pub enum RecordedCommand {
    SetPipelineState(Arc<PipelineState>),
    SetVertexBuffers {
        first_slot: u32,
        buffers: SmallVec<[Arc<Buffer>; 4]>,
    },
    SetStreamSource {
        stream: u32,
        buffer: Arc<Buffer>,
        offset: u64,
        stride: u32,
    },
    SetIndexBuffer {
        buffer: Arc<Buffer>,
        format: IndexFormat,
    },
    SetConstantBuffer {
        slot: u32,
        buffer: Arc<Buffer>,
    },
    SetShaderResource {
        slot: u32,
        texture: Arc<Texture>,
    },
    SetSampler {
        slot: u32,
        sampler: Arc<Sampler>,
    },
    SetDescriptorSet {
        set_index: u32,
        set: Arc<DescriptorSet>,
    },
    SetViewport(Viewport),
    SetScissorRect(ScissorRect),
    BeginRenderPass {
        color_targets: SmallVec<[Arc<Texture>; 8]>,
        depth_stencil: Option<Arc<Texture>>,
    },
    EndRenderPass,
    Draw {
        vertex_count: u32,
        start_vertex: u32,
    },
    DrawIndexed {
        index_count: u32,
        start_index: u32,
        base_vertex: i32,
    },
    DrawInstanced {
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    },
    DrawIndexedInstanced {
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    },
    ClearRenderTarget {
        texture: Arc<Texture>,
        color: [f32; 4],
    },
    ClearDepthStencil {
        texture: Arc<Texture>,
        clear_depth: bool,
        clear_stencil: bool,
        depth: f32,
        stencil: u8,
    },
    Transition {
        target: TransitionTarget,
        from: ResourceUsage,
        to: ResourceUsage,
    },
    ResourceBarrier,
    BeginEvent(String),
    EndEvent,
    SetMarker(String),
}

enum Placement {
    /// Needs `Recording` and an open render pass.
    InPass,
    /// Needs `Recording` and no open render pass.
    OutsidePass,
    /// Needs `Recording`; pass state irrelevant.
    Any,
}

impl RecordedCommand {
    fn placement(&self) -> Placement {
        use RecordedCommand::*;
        match self {
            Draw { .. }
            | DrawIndexed { .. }
            | DrawInstanced { .. }
            | DrawIndexedInstanced { .. }
            | ClearRenderTarget { .. }
            | ClearDepthStencil { .. } => Placement::InPass,
            Transition { .. } | ResourceBarrier => Placement::OutsidePass,
            _ => Placement::Any,
        }
    }

    fn name(&self) -> &'static str {
        use RecordedCommand::*;
        match self {
            SetPipelineState(_) => "set_pipeline_state",
            SetVertexBuffers { .. } => "set_vertex_buffers",
            SetStreamSource { .. } => "set_stream_source",
            SetIndexBuffer { .. } => "set_index_buffer",
            SetConstantBuffer { .. } => "set_constant_buffer",
            SetShaderResource { .. } => "set_shader_resource",
            SetSampler { .. } => "set_sampler",
            SetDescriptorSet { .. } => "set_descriptor_set",
            SetViewport(_) => "set_viewport",
            SetScissorRect(_) => "set_scissor_rect",
            BeginRenderPass { .. } => "set_render_targets",
            EndRenderPass => "end_render_pass",
            Draw { .. } => "draw",
            DrawIndexed { .. } => "draw_indexed",
            DrawInstanced { .. } => "draw_instanced",
            DrawIndexedInstanced { .. } => "draw_indexed_instanced",
            ClearRenderTarget { .. } => "clear_render_target",
            ClearDepthStencil { .. } => "clear_depth_stencil",
            Transition { .. } => "transition_resource",
            ResourceBarrier => "resource_barrier",
            BeginEvent(_) => "begin_event",
            EndEvent => "end_event",
            SetMarker(_) => "set_marker",
        }
    }
}

pub struct CommandList {
    backend: Backend,
    device: Arc<DeviceShared>,
    state: CommandListState,
    in_render_pass: bool,
    commands: Vec<RecordedCommand>,
    /// Deferred validation notes, reported at submission on the explicit
    /// backend.
    validation_errors: Vec<String>,
    event_depth: u32,
    draw_count: u64,
    /// Immediate-backend replay target.
    replay: Option<Arc<Mutex<crate::immediate::ImmediateState>>>,
}

impl CommandList {
    pub(crate) fn new(
        device: &Arc<DeviceShared>,
        replay: Option<Arc<Mutex<crate::immediate::ImmediateState>>>,
    ) -> CommandList {
        CommandList {
            backend: device.backend(),
            device: Arc::clone(device),
            state: CommandListState::Initial,
            in_render_pass: false,
            commands: Vec::new(),
            validation_errors: Vec::new(),
            event_depth: 0,
            draw_count: 0,
            replay,
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn state(&self) -> CommandListState {
        self.state
    }

    pub fn is_recording(&self) -> bool {
        self.state == CommandListState::Recording
    }

    pub fn in_render_pass(&self) -> bool {
        self.in_render_pass
    }

    /// Draws recorded (explicit) or issued (immediate) since the last reset.
    pub fn draw_count(&self) -> u64 {
        self.draw_count
    }

    pub(crate) fn recorded(&self) -> &[RecordedCommand] {
        &self.commands
    }

    pub(crate) fn take_validation_errors(&mut self) -> Vec<String> {
        std::mem::take(&mut self.validation_errors)
    }

    pub(crate) fn unbalanced_events(&self) -> bool {
        self.event_depth != 0
    }

    // ------------------------------------------------------------------
    // Lifecycle

    pub fn begin(&mut self) {
        match self.state {
            CommandListState::Initial | CommandListState::Executable => {
                self.commands.clear();
                self.validation_errors.clear();
                self.in_render_pass = false;
                self.event_depth = 0;
                self.draw_count = 0;
                self.state = CommandListState::Recording;
            }
            other => self.invalid_lifecycle("begin", other),
        }
    }

    pub fn end(&mut self) {
        match self.state {
            CommandListState::Recording => {
                if self.in_render_pass {
                    self.note_error("end called with an open render pass".to_owned());
                    self.in_render_pass = false;
                }
                self.state = CommandListState::Executable;
            }
            other => self.invalid_lifecycle("end", other),
        }
    }

    /// Returns the list to `Initial` from any state.
    pub fn reset(&mut self) {
        self.commands.clear();
        self.validation_errors.clear();
        self.in_render_pass = false;
        self.event_depth = 0;
        self.draw_count = 0;
        self.state = CommandListState::Initial;
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.state = CommandListState::Submitted;
    }

    fn invalid_lifecycle(&mut self, op: &str, state: CommandListState) {
        match self.backend {
            Backend::Explicit => {
                self.note_error(format!("{op} called in state {state:?}"));
            }
            Backend::Immediate => {
                log::warn!(target: "gfx-cmd", "{op} ignored in state {state:?}");
            }
        }
    }

    fn note_error(&mut self, message: String) {
        log::debug!(target: "gfx-cmd", "deferred validation: {message}");
        self.validation_errors.push(message);
    }

    // ------------------------------------------------------------------
    // Recording

    fn dispatch(&mut self, cmd: RecordedCommand) {
        // Pass bracketing and event depth are tracked at record time on
        // both backends.
        let legal = self.state == CommandListState::Recording
            && match cmd.placement() {
                Placement::InPass => self.in_render_pass,
                Placement::OutsidePass => !self.in_render_pass,
                Placement::Any => true,
            };

        if !legal {
            let message = format!(
                "{} invalid here (state {:?}, render pass {})",
                cmd.name(),
                self.state,
                if self.in_render_pass { "open" } else { "closed" }
            );
            match self.backend {
                Backend::Explicit => self.note_error(message),
                Backend::Immediate => {
                    log::warn!(target: "gfx-cmd", "{message}; ignored");
                }
            }
            return;
        }

        match &cmd {
            RecordedCommand::BeginRenderPass { .. } => {
                if self.in_render_pass {
                    self.note_error("render pass opened while one is active".to_owned());
                }
                self.in_render_pass = true;
            }
            RecordedCommand::EndRenderPass => {
                if !self.in_render_pass {
                    match self.backend {
                        Backend::Explicit => {
                            self.note_error("end_render_pass without an open pass".to_owned())
                        }
                        Backend::Immediate => {
                            log::warn!(target: "gfx-cmd", "end_render_pass without an open pass");
                            return;
                        }
                    }
                }
                self.in_render_pass = false;
            }
            RecordedCommand::BeginEvent(_) => self.event_depth += 1,
            RecordedCommand::EndEvent => {
                if self.event_depth == 0 {
                    log::warn!(target: "gfx-cmd", "end_event without begin_event");
                    return;
                }
                self.event_depth -= 1;
            }
            RecordedCommand::Draw { .. }
            | RecordedCommand::DrawIndexed { .. }
            | RecordedCommand::DrawInstanced { .. }
            | RecordedCommand::DrawIndexedInstanced { .. } => {
                self.draw_count += 1;
            }
            _ => {}
        }

        match self.backend {
            Backend::Explicit => self.commands.push(cmd),
            Backend::Immediate => {
                if let Some(replay) = &self.replay {
                    replay.lock().unwrap().apply(&cmd);
                }
            }
        }
    }

    pub fn set_pipeline_state(&mut self, pipeline: &Arc<PipelineState>) {
        self.dispatch(RecordedCommand::SetPipelineState(Arc::clone(pipeline)));
    }

    pub fn set_vertex_buffers(&mut self, first_slot: u32, buffers: &[Arc<Buffer>]) {
        self.dispatch(RecordedCommand::SetVertexBuffers {
            first_slot,
            buffers: buffers.iter().map(Arc::clone).collect(),
        });
    }

    /// Vertex-stream binding with an explicit offset and stride.
    pub fn set_stream_source(&mut self, stream: u32, buffer: &Arc<Buffer>, offset: u64, stride: u32) {
        self.dispatch(RecordedCommand::SetStreamSource {
            stream,
            buffer: Arc::clone(buffer),
            offset,
            stride,
        });
    }

    pub fn set_index_buffer(&mut self, buffer: &Arc<Buffer>, format: IndexFormat) {
        self.dispatch(RecordedCommand::SetIndexBuffer {
            buffer: Arc::clone(buffer),
            format,
        });
    }

    pub fn set_constant_buffer(&mut self, slot: u32, buffer: &Arc<Buffer>) {
        self.dispatch(RecordedCommand::SetConstantBuffer {
            slot,
            buffer: Arc::clone(buffer),
        });
    }

    pub fn set_shader_resource(&mut self, slot: u32, texture: &Arc<Texture>) {
        self.dispatch(RecordedCommand::SetShaderResource {
            slot,
            texture: Arc::clone(texture),
        });
    }

    pub fn set_sampler(&mut self, slot: u32, sampler: &Arc<Sampler>) {
        self.dispatch(RecordedCommand::SetSampler {
            slot,
            sampler: Arc::clone(sampler),
        });
    }

    pub fn set_descriptor_set(&mut self, set_index: u32, set: &Arc<DescriptorSet>) {
        self.dispatch(RecordedCommand::SetDescriptorSet {
            set_index,
            set: Arc::clone(set),
        });
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.dispatch(RecordedCommand::SetViewport(viewport));
    }

    pub fn set_scissor_rect(&mut self, rect: ScissorRect) {
        self.dispatch(RecordedCommand::SetScissorRect(rect));
    }

    /// Binds the render targets and opens a render pass.
    pub fn set_render_targets(
        &mut self,
        color_targets: &[Arc<Texture>],
        depth_stencil: Option<&Arc<Texture>>,
    ) {
        self.dispatch(RecordedCommand::BeginRenderPass {
            color_targets: color_targets.iter().map(Arc::clone).collect(),
            depth_stencil: depth_stencil.map(Arc::clone),
        });
    }

    pub fn end_render_pass(&mut self) {
        self.dispatch(RecordedCommand::EndRenderPass);
    }

    pub fn draw(&mut self, vertex_count: u32, start_vertex: u32) {
        self.dispatch(RecordedCommand::Draw {
            vertex_count,
            start_vertex,
        });
    }

    pub fn draw_indexed(&mut self, index_count: u32, start_index: u32, base_vertex: i32) {
        self.dispatch(RecordedCommand::DrawIndexed {
            index_count,
            start_index,
            base_vertex,
        });
    }

    pub fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) {
        self.dispatch(RecordedCommand::DrawInstanced {
            vertex_count,
            instance_count,
            start_vertex,
            start_instance,
        });
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) {
        self.dispatch(RecordedCommand::DrawIndexedInstanced {
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        });
    }

    pub fn clear_render_target(&mut self, texture: &Arc<Texture>, color: [f32; 4]) {
        self.dispatch(RecordedCommand::ClearRenderTarget {
            texture: Arc::clone(texture),
            color,
        });
    }

    pub fn clear_depth_stencil(
        &mut self,
        texture: &Arc<Texture>,
        clear_depth: bool,
        clear_stencil: bool,
        depth: f32,
        stencil: u8,
    ) {
        self.dispatch(RecordedCommand::ClearDepthStencil {
            texture: Arc::clone(texture),
            clear_depth,
            clear_stencil,
            depth,
            stencil,
        });
    }

    /// Usage-state barrier. A no-op on the immediate backend, where the
    /// driver synchronizes implicitly.
    pub fn transition_resource(
        &mut self,
        target: TransitionTarget,
        from: ResourceUsage,
        to: ResourceUsage,
    ) {
        self.dispatch(RecordedCommand::Transition { target, from, to });
    }

    /// Flushes accumulated transitions.
    pub fn resource_barrier(&mut self) {
        self.dispatch(RecordedCommand::ResourceBarrier);
    }

    pub fn begin_event(&mut self, name: &str) {
        if !self.device.debug_markers_enabled() {
            return;
        }
        self.dispatch(RecordedCommand::BeginEvent(name.to_owned()));
    }

    pub fn end_event(&mut self) {
        if !self.device.debug_markers_enabled() {
            return;
        }
        self.dispatch(RecordedCommand::EndEvent);
    }

    pub fn set_marker(&mut self, name: &str) {
        if !self.device.debug_markers_enabled() {
            return;
        }
        self.dispatch(RecordedCommand::SetMarker(name.to_owned()));
    }
}

/// RAII debug scope: opens an event now, closes it on drop.
pub struct ScopedDebugEvent {
    list: Arc<Mutex<CommandList>>,
}

impl ScopedDebugEvent {
    pub fn new(list: &Arc<Mutex<CommandList>>, name: &str) -> ScopedDebugEvent {
        list.lock().unwrap().begin_event(name);
        ScopedDebugEvent {
            list: Arc::clone(list),
        }
    }
}

impl Drop for ScopedDebugEvent {
    fn drop(&mut self) {
        self.list.lock().unwrap().end_event();
    }
}
