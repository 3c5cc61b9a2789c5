//! Explicit-submission backend.
//!
//! Command lists are recorded up front and validated as a whole at
//! submission: render-pass bracketing, descriptor completeness at each draw,
//! mapped-buffer hazards, backend tags, and stale pooled descriptor sets.
//! Execution retires on the device timeline in submission order; the
//! returned fence value gates deferred deletion and frame pacing.

use std::sync::Arc;

use crate::command::{CommandList, CommandListState, RecordedCommand, TransitionTarget};
use crate::device::DeviceShared;
use crate::error::{RhiError, RhiResult};
use crate::resource::GpuResource;

/// Descriptor sets a single per-frame pool can hand out.
pub(crate) const DESCRIPTOR_POOL_CAPACITY: u32 = 1024;

/// Walks a recorded command stream, validating and "executing" it against
/// the virtual queue, then retires a timeline point for it.
pub(crate) fn submit(device: &Arc<DeviceShared>, list: &mut CommandList) -> RhiResult<u64> {
    if device.is_lost() {
        return Err(RhiError::DeviceLost("submission refused".into()));
    }
    if list.state() != CommandListState::Executable {
        return Err(RhiError::ValidationFailed(format!(
            "submission requires an executable command list, state is {:?}",
            list.state()
        )));
    }

    let mut errors = list.take_validation_errors();
    if list.unbalanced_events() {
        errors.push("unbalanced begin_event/end_event".to_owned());
    }
    validate_stream(device, list.recorded(), &mut errors);

    if !errors.is_empty() {
        for message in &errors {
            log::error!(target: "gfx-cmd", "validation: {message}");
        }
        if device.validation_enabled() {
            return Err(RhiError::ValidationFailed(errors.swap_remove(0)));
        }
    }

    execute_stream(list.recorded());

    let fence = device.timeline().allocate();
    device.timeline().signal(fence);
    list.mark_submitted();
    Ok(fence)
}

fn validate_stream(
    device: &Arc<DeviceShared>,
    commands: &[RecordedCommand],
    errors: &mut Vec<String>,
) {
    let backend = device.backend();
    let mut bound_sets: Vec<(u32, Arc<crate::descriptor::DescriptorSet>)> = Vec::new();

    let check_buffer = |buffer: &Arc<crate::buffer::Buffer>, errors: &mut Vec<String>| {
        if buffer.backend() != backend {
            errors.push(format!(
                "buffer '{}' belongs to backend {:?}",
                buffer.debug_name(),
                buffer.backend()
            ));
        }
        if buffer.is_mapped() {
            errors.push(format!(
                "buffer '{}' is mapped while referenced by a submission",
                buffer.debug_name()
            ));
        }
    };

    for cmd in commands {
        match cmd {
            RecordedCommand::SetVertexBuffers { buffers, .. } => {
                for buffer in buffers {
                    check_buffer(buffer, errors);
                }
            }
            RecordedCommand::SetStreamSource { buffer, .. }
            | RecordedCommand::SetIndexBuffer { buffer, .. }
            | RecordedCommand::SetConstantBuffer { buffer, .. } => {
                check_buffer(buffer, errors);
            }
            RecordedCommand::SetShaderResource { texture, .. } => {
                if texture.backend() != backend {
                    errors.push(format!(
                        "texture '{}' belongs to backend {:?}",
                        texture.debug_name(),
                        texture.backend()
                    ));
                }
            }
            RecordedCommand::SetPipelineState(pipeline) => {
                if pipeline.backend() != backend {
                    errors.push(format!(
                        "pipeline '{}' belongs to backend {:?}",
                        pipeline.debug_name(),
                        pipeline.backend()
                    ));
                }
            }
            RecordedCommand::SetDescriptorSet { set_index, set } => {
                if set.is_stale() {
                    errors.push(format!(
                        "descriptor set at index {set_index} was allocated from a pool that has since been reset"
                    ));
                }
                bound_sets.retain(|(index, _)| index != set_index);
                bound_sets.push((*set_index, Arc::clone(set)));
            }
            RecordedCommand::Draw { .. }
            | RecordedCommand::DrawIndexed { .. }
            | RecordedCommand::DrawInstanced { .. }
            | RecordedCommand::DrawIndexedInstanced { .. } => {
                // The draw-time contract: every declared binding populated
                // with a compatible resource.
                for (set_index, set) in &bound_sets {
                    if let Err(err) = set.validate_complete() {
                        errors.push(format!("draw with set {set_index}: {err}"));
                    }
                }
            }
            RecordedCommand::Transition { target, .. } => {
                let target_backend = match target {
                    TransitionTarget::Buffer(buffer) => buffer.backend(),
                    TransitionTarget::Texture(texture) => texture.backend(),
                };
                if target_backend != backend {
                    errors.push("barrier references a resource from another backend".to_owned());
                }
            }
            _ => {}
        }
    }
}

/// The virtual queue's execution pass: clears land in texture memory, draws
/// and barriers retire as ordering events.
fn execute_stream(commands: &[RecordedCommand]) {
    for cmd in commands {
        match cmd {
            RecordedCommand::ClearRenderTarget { texture, color } => {
                texture.fill(*color);
            }
            RecordedCommand::ClearDepthStencil { texture, depth, .. } => {
                texture.fill([*depth, *depth, *depth, *depth]);
            }
            RecordedCommand::BeginEvent(name) => {
                log::trace!(target: "gfx-cmd", "event begin: {name}");
            }
            RecordedCommand::EndEvent => log::trace!(target: "gfx-cmd", "event end"),
            RecordedCommand::SetMarker(name) => {
                log::trace!(target: "gfx-cmd", "marker: {name}");
            }
            _ => {}
        }
    }
}

