//! Fixed-function state and pipeline state objects.

use std::sync::Arc;

use crate::device::DeviceShared;
use crate::format::PixelFormat;
use crate::resource::{impl_gpu_resource, ResourceCommon, ResourceKind, ResourceUsage};
use crate::shader::{ShaderModule, ShaderStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
    DstColor,
    InvDstColor,
    DstAlpha,
    InvDstAlpha,
}

#[derive(Debug, Clone, Copy)]
pub struct BlendState {
    pub blend_enable: bool,
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub color_op: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub alpha_op: BlendOp,
}

impl Default for BlendState {
    fn default() -> BlendState {
        BlendState {
            blend_enable: false,
            src_color: BlendFactor::One,
            dst_color: BlendFactor::Zero,
            color_op: BlendOp::Add,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::Zero,
            alpha_op: BlendOp::Add,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FillMode {
    #[default]
    Solid,
    Wireframe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RasterizerState {
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub front_counter_clockwise: bool,
    pub depth_clamp_enable: bool,
    pub scissor_enable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareFunc {
    Never,
    #[default]
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Debug, Clone, Copy)]
pub struct DepthStencilState {
    pub depth_enable: bool,
    pub depth_write_enable: bool,
    pub depth_func: CompareFunc,
    pub stencil_enable: bool,
}

impl Default for DepthStencilState {
    fn default() -> DepthStencilState {
        DepthStencilState {
            depth_enable: true,
            depth_write_enable: true,
            depth_func: CompareFunc::Less,
            stencil_enable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float1,
    Float2,
    Float3,
    Float4,
    Int1,
    Int2,
    Int3,
    Int4,
    UInt1,
    UInt2,
    UInt3,
    UInt4,
}

impl VertexFormat {
    pub fn byte_size(self) -> u32 {
        use VertexFormat::*;
        match self {
            Float1 | Int1 | UInt1 => 4,
            Float2 | Int2 | UInt2 => 8,
            Float3 | Int3 | UInt3 => 12,
            Float4 | Int4 | UInt4 => 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VertexAttribute {
    /// Shader location.
    pub location: u32,
    pub format: VertexFormat,
    /// Byte offset from the start of the vertex.
    pub offset: u32,
}

#[derive(Debug, Clone, Default)]
pub struct VertexInputLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexInputLayout {
    /// Tightest stride covering every attribute.
    pub fn calculate_stride(attributes: &[VertexAttribute]) -> u32 {
        attributes
            .iter()
            .map(|a| a.offset + a.format.byte_size())
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Viewport {
        Viewport {
            x: 0.0,
            y: 0.0,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScissorRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl ScissorRect {
    pub fn new(width: i32, height: i32) -> ScissorRect {
        ScissorRect {
            left: 0,
            top: 0,
            right: width,
            bottom: height,
        }
    }
}

/// Everything a draw needs besides resources: shaders and all
/// fixed-function state. Immutable once the pipeline state is created.
#[derive(Clone)]
pub struct PipelineStateDesc {
    pub vertex_shader: Arc<ShaderModule>,
    pub pixel_shader: Arc<ShaderModule>,
    pub topology: PrimitiveTopology,
    pub blend: BlendState,
    pub rasterizer: RasterizerState,
    pub depth_stencil: DepthStencilState,
    pub render_target_formats: Vec<PixelFormat>,
    pub depth_format: Option<PixelFormat>,
    pub vertex_layout: VertexInputLayout,
    pub debug_name: String,
}

pub struct PipelineState {
    pub(crate) common: ResourceCommon,
    desc: PipelineStateDesc,
}

impl_gpu_resource!(PipelineState);

impl PipelineState {
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        desc: &PipelineStateDesc,
    ) -> Option<Arc<PipelineState>> {
        if desc.vertex_shader.stage() != ShaderStage::Vertex {
            log::error!(
                target: "gfx-pipeline",
                "pipeline '{}': vertex slot holds a {:?} shader",
                desc.debug_name,
                desc.vertex_shader.stage()
            );
            return None;
        }
        if desc.pixel_shader.stage() != ShaderStage::Pixel {
            log::error!(
                target: "gfx-pipeline",
                "pipeline '{}': pixel slot holds a {:?} shader",
                desc.debug_name,
                desc.pixel_shader.stage()
            );
            return None;
        }
        use crate::resource::GpuResource;
        if desc.vertex_shader.backend() != device.backend()
            || desc.pixel_shader.backend() != device.backend()
        {
            log::error!(
                target: "gfx-pipeline",
                "pipeline '{}': shader backend does not match device",
                desc.debug_name
            );
            return None;
        }
        let common = ResourceCommon::new(
            device,
            ResourceKind::PipelineState,
            &desc.debug_name,
            ResourceUsage::empty(),
            0,
        )?;
        Some(Arc::new(PipelineState {
            common,
            desc: desc.clone(),
        }))
    }

    pub fn desc(&self) -> &PipelineStateDesc {
        &self.desc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_covers_last_attribute() {
        let attrs = [
            VertexAttribute {
                location: 0,
                format: VertexFormat::Float3,
                offset: 0,
            },
            VertexAttribute {
                location: 1,
                format: VertexFormat::Float2,
                offset: 12,
            },
        ];
        assert_eq!(VertexInputLayout::calculate_stride(&attrs), 20);
        assert_eq!(VertexInputLayout::calculate_stride(&[]), 0);
    }
}
