//! Granite RHI: one device/command-list/resource contract over two backend
//! models, so renderers are written once.
//!
//! The **explicit** backend records command lists, submits them with
//! semaphores and fences, and cycles per-frame descriptor pools — the shape
//! of a modern explicit-submission API. The **immediate** backend replays
//! operations as they are issued against cached binding state and presents
//! by swapping buffers — the shape of a legacy immediate-mode API. Both run
//! against an in-process virtual queue; the platform surface, shader
//! compiler and file parsers are external collaborators.
//!
//! The usual frame, on either backend:
//!
//! ```no_run
//! use granite_rhi::{create_device, Settings, SwapchainDesc, SwapchainStatus};
//!
//! let device = create_device(&Settings::default()).unwrap();
//! let swapchain = device.create_swapchain(&SwapchainDesc::default()).unwrap();
//! loop {
//!     if device.prepare_for_new_frame() != SwapchainStatus::Ok {
//!         continue; // swapchain was recreated, skip this frame
//!     }
//!     {
//!         let list = device.immediate_command_list();
//!         let mut list = list.lock().unwrap();
//!         let backbuffer = swapchain.current_backbuffer();
//!         list.set_render_targets(&[backbuffer.clone()], None);
//!         list.clear_render_target(&backbuffer, [0.1, 0.2, 0.3, 1.0]);
//!         list.end_render_pass();
//!     }
//!     device.end_recording();
//!     device.submit_commands().unwrap();
//!     device.present();
//! }
//! ```

pub mod buffer;
pub mod command;
mod context;
pub mod descriptor;
pub mod device;
pub mod error;
mod explicit;
pub mod format;
mod immediate;
pub mod pipeline;
pub mod resource;
pub mod sampler;
pub mod settings;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use buffer::{Buffer, BufferDesc, IndexFormat, MappedBuffer, MemoryHint};
pub use command::{
    CommandList, CommandListState, ScopedDebugEvent, TransitionTarget,
};
pub use descriptor::{
    BoundDescriptor, DescriptorKind, DescriptorSet, DescriptorSetLayout,
    DescriptorSetLayoutBinding, DescriptorSetLayoutDesc, PipelineLayout, PipelineLayoutDesc,
    PushConstantRange,
};
pub use device::{create_device, Device, DeviceCapabilities};
pub use error::{RhiError, RhiResult};
pub use format::{max_mip_count, mip_dimensions, PixelFormat};
pub use pipeline::{
    BlendFactor, BlendOp, BlendState, CompareFunc, CullMode, DepthStencilState, FillMode,
    PipelineState, PipelineStateDesc, PrimitiveTopology, RasterizerState, ScissorRect,
    VertexAttribute, VertexFormat, VertexInputLayout, Viewport,
};
pub use resource::{GpuResource, ResourceKind, ResourceUsage};
pub use sampler::{AddressMode, Filter, MipmapMode, Sampler, SamplerDesc};
pub use settings::{PreferredBackend, Settings};
pub use shader::{glsl_bytes, spirv_stub, ShaderModule, ShaderStage, ShaderStageFlags, SPIRV_MAGIC};
pub use swapchain::{
    PresentMode, SurfaceHandle, Swapchain, SwapchainDesc, SwapchainStatus,
};
pub use sync::{Fence, Semaphore, Timeline};
pub use texture::{Texture, TextureDesc};

/// Which backend model a device (and every resource it creates) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Modern explicit-submission semantics: recorded command lists,
    /// semaphores, fences, per-frame descriptor pools.
    Explicit,
    /// Legacy immediate-mode semantics: implicit synchronization, binding
    /// tables applied at draw, buffer-swap present.
    Immediate,
}

impl Backend {
    pub fn name(self) -> &'static str {
        match self {
            Backend::Explicit => "explicit",
            Backend::Immediate => "immediate",
        }
    }

    /// Clip-space Y points down on the explicit backend; projection helpers
    /// flip based on this.
    pub fn y_flipped(self) -> bool {
        matches!(self, Backend::Explicit)
    }

    /// Depth range is [0, 1] on the explicit backend, [-1, 1] on the
    /// immediate one.
    pub fn depth_zero_to_one(self) -> bool {
        matches!(self, Backend::Explicit)
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
