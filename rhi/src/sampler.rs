//! Sampler states.

use std::sync::Arc;

use crate::device::DeviceShared;
use crate::pipeline::CompareFunc;
use crate::resource::{impl_gpu_resource, ResourceCommon, ResourceKind, ResourceUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MipmapMode {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    Clamp,
    Mirror,
    Wrap,
}

#[derive(Debug, Clone, Default)]
pub struct SamplerDesc {
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mipmap_mode: MipmapMode,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub max_anisotropy: u32,
    pub compare: Option<CompareFunc>,
    pub debug_name: String,
}

impl SamplerDesc {
    pub const LINEAR_MIPMAP_LINEAR: SamplerDesc = SamplerDesc {
        min_filter: Filter::Linear,
        mag_filter: Filter::Linear,
        mipmap_mode: MipmapMode::Linear,
        address_u: AddressMode::Clamp,
        address_v: AddressMode::Clamp,
        address_w: AddressMode::Clamp,
        max_anisotropy: 0,
        compare: None,
        debug_name: String::new(),
    };

    pub const NEAREST_MIPMAP_NEAREST: SamplerDesc = SamplerDesc {
        min_filter: Filter::Nearest,
        mag_filter: Filter::Nearest,
        mipmap_mode: MipmapMode::Nearest,
        address_u: AddressMode::Clamp,
        address_v: AddressMode::Clamp,
        address_w: AddressMode::Clamp,
        max_anisotropy: 0,
        compare: None,
        debug_name: String::new(),
    };
}

pub struct Sampler {
    pub(crate) common: ResourceCommon,
    desc: SamplerDesc,
}

impl_gpu_resource!(Sampler);

impl Sampler {
    pub(crate) fn create(device: &Arc<DeviceShared>, desc: &SamplerDesc) -> Option<Arc<Sampler>> {
        let common = ResourceCommon::new(
            device,
            ResourceKind::Sampler,
            &desc.debug_name,
            ResourceUsage::empty(),
            0,
        )?;
        Some(Arc::new(Sampler {
            common,
            desc: desc.clone(),
        }))
    }

    pub fn desc(&self) -> &SamplerDesc {
        &self.desc
    }
}
