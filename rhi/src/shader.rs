//! Shader modules.
//!
//! Bytecode arrives as a plain byte span produced offline. The explicit
//! backend accepts binary SPIR-V, detected by the magic number; the
//! immediate backend accepts NUL-terminated GLSL source. Handing the wrong
//! kind to a backend fails pipeline-visible creation with a diagnostic that
//! includes the span length and leading magic.

use std::sync::Arc;

use bitflags::bitflags;

use crate::device::DeviceShared;
use crate::resource::{impl_gpu_resource, ResourceCommon, ResourceKind, ResourceUsage};
use crate::Backend;

pub const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

bitflags! {
    /// Stage visibility mask for descriptor bindings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStageFlags: u32 {
        const VERTEX   = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE  = 1 << 2;
    }
}

impl Default for ShaderStageFlags {
    fn default() -> Self {
        ShaderStageFlags::VERTEX | ShaderStageFlags::FRAGMENT
    }
}

pub(crate) enum ShaderSource {
    SpirV(Vec<u32>),
    Glsl(String),
}

pub struct ShaderModule {
    pub(crate) common: ResourceCommon,
    stage: ShaderStage,
    source: ShaderSource,
}

impl_gpu_resource!(ShaderModule);

fn leading_magic(bytecode: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    let n = bytecode.len().min(4);
    word[..n].copy_from_slice(&bytecode[..n]);
    u32::from_le_bytes(word)
}

fn is_spirv(bytecode: &[u8]) -> bool {
    bytecode.len() >= 4 && leading_magic(bytecode) == SPIRV_MAGIC
}

impl ShaderModule {
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        stage: ShaderStage,
        bytecode: &[u8],
    ) -> Option<Arc<ShaderModule>> {
        let source = match device.backend() {
            Backend::Explicit => {
                if !is_spirv(bytecode) || bytecode.len() % 4 != 0 {
                    log::error!(
                        target: "gfx-shader",
                        "explicit backend expects SPIR-V: {} bytes, magic {:#010x}",
                        bytecode.len(),
                        leading_magic(bytecode)
                    );
                    return None;
                }
                let words = bytecode
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                ShaderSource::SpirV(words)
            }
            Backend::Immediate => {
                // Anything carrying the SPIR-V magic is binary IR, which the
                // immediate backend cannot consume.
                if is_spirv(bytecode) {
                    log::error!(
                        target: "gfx-shader",
                        "immediate backend expects GLSL source, got SPIR-V ({} bytes)",
                        bytecode.len()
                    );
                    return None;
                }
                let Some(stripped) = bytecode.strip_suffix(&[0u8]) else {
                    log::error!(
                        target: "gfx-shader",
                        "GLSL source must be NUL-terminated: {} bytes, magic {:#010x}",
                        bytecode.len(),
                        leading_magic(bytecode)
                    );
                    return None;
                };
                match std::str::from_utf8(stripped) {
                    Ok(text) => ShaderSource::Glsl(text.to_owned()),
                    Err(err) => {
                        log::error!(
                            target: "gfx-shader",
                            "GLSL source is not valid UTF-8: {err}"
                        );
                        return None;
                    }
                }
            }
        };

        let common = ResourceCommon::new(
            device,
            ResourceKind::Shader,
            "",
            ResourceUsage::empty(),
            bytecode.len() as u64,
        )?;
        Some(Arc::new(ShaderModule {
            common,
            stage,
            source,
        }))
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn is_spirv(&self) -> bool {
        matches!(self.source, ShaderSource::SpirV(_))
    }

    /// GLSL source text, when this module holds one.
    pub fn glsl_source(&self) -> Option<&str> {
        match &self.source {
            ShaderSource::Glsl(text) => Some(text),
            ShaderSource::SpirV(_) => None,
        }
    }
}

/// Builds the smallest span the explicit backend accepts as bytecode; test
/// and demo scaffolding.
pub fn spirv_stub(words: &[u32]) -> Vec<u8> {
    let mut out = SPIRV_MAGIC.to_le_bytes().to_vec();
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

/// NUL-terminates GLSL source the way the immediate backend expects.
pub fn glsl_bytes(source: &str) -> Vec<u8> {
    let mut out = source.as_bytes().to_vec();
    out.push(0);
    out
}
