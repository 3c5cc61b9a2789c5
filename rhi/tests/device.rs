//! Device factory and resource lifetime behavior, on both backends.

use std::sync::Arc;

use granite_rhi::{
    create_device, glsl_bytes, spirv_stub, Backend, BufferDesc, Device, GpuResource, IndexFormat,
    PipelineStateDesc, PixelFormat, PreferredBackend, ResourceUsage, Settings, TextureDesc,
    VertexInputLayout,
};

fn settings_for(backend: PreferredBackend) -> Settings {
    Settings {
        preferred_backend: backend,
        enable_validation: true,
        ..Settings::default()
    }
}

fn explicit_device() -> Device {
    create_device(&settings_for(PreferredBackend::Modern)).unwrap()
}

fn immediate_device() -> Device {
    create_device(&settings_for(PreferredBackend::Legacy)).unwrap()
}

#[test]
fn backend_resolution_matches_preference() {
    assert_eq!(explicit_device().backend(), Backend::Explicit);
    assert_eq!(immediate_device().backend(), Backend::Immediate);
}

#[test]
fn resources_carry_the_creating_backend() {
    let device = immediate_device();
    let buffer = device
        .create_buffer(&BufferDesc::new(256, ResourceUsage::UNIFORM_BUFFER))
        .unwrap();
    assert_eq!(buffer.backend(), Backend::Immediate);
    assert_eq!(buffer.size(), 256);
}

#[test]
fn zero_sized_buffer_is_rejected() {
    let device = explicit_device();
    assert!(device
        .create_buffer(&BufferDesc::new(0, ResourceUsage::VERTEX_BUFFER))
        .is_none());
}

#[test]
fn shader_bytecode_detection_per_backend() {
    let spirv = spirv_stub(&[0x0001_0000, 7, 0, 0]);
    let glsl = glsl_bytes("void main() { gl_Position = vec4(0.0); }");

    let explicit = explicit_device();
    assert!(explicit.create_vertex_shader(&spirv).is_some());
    // GLSL has no SPIR-V magic, the explicit backend refuses it.
    assert!(explicit.create_vertex_shader(&glsl).is_none());

    let immediate = immediate_device();
    assert!(immediate.create_vertex_shader(&glsl).is_some());
    // Binary IR is refused by the immediate backend.
    assert!(immediate.create_vertex_shader(&spirv).is_none());
    // Missing NUL terminator is also refused.
    assert!(immediate
        .create_vertex_shader("void main() {}".as_bytes())
        .is_none());
}

#[test]
fn pipeline_state_wants_matching_stages() {
    let device = explicit_device();
    let vs = device.create_vertex_shader(&spirv_stub(&[1])).unwrap();
    let ps = device.create_pixel_shader(&spirv_stub(&[2])).unwrap();

    let good = PipelineStateDesc {
        vertex_shader: Arc::clone(&vs),
        pixel_shader: Arc::clone(&ps),
        topology: Default::default(),
        blend: Default::default(),
        rasterizer: Default::default(),
        depth_stencil: Default::default(),
        render_target_formats: vec![PixelFormat::Bgra8Srgb],
        depth_format: Some(PixelFormat::D32Float),
        vertex_layout: VertexInputLayout::default(),
        debug_name: "test pipeline".to_owned(),
    };
    assert!(device.create_pipeline_state(&good).is_some());

    let swapped = PipelineStateDesc {
        vertex_shader: ps,
        pixel_shader: vs,
        ..good
    };
    assert!(device.create_pipeline_state(&swapped).is_none());
}

#[test]
fn index_buffer_records_width() {
    let device = explicit_device();
    let indices: Vec<u8> = (0u16..6).flat_map(|i| i.to_le_bytes()).collect();
    let buffer = device
        .create_index_buffer(IndexFormat::U16, indices.len() as u64, Some(&indices))
        .unwrap();
    assert_eq!(buffer.desc().index_format, Some(IndexFormat::U16));
    assert_eq!(buffer.desc().stride, Some(2));
}

#[test]
fn texture_size_accounts_for_mips_and_blocks() {
    let device = explicit_device();
    let tex = device
        .create_texture(
            &TextureDesc {
                width: 256,
                height: 256,
                mip_levels: 9,
                format: PixelFormat::Bc1Unorm,
                usage: ResourceUsage::SHADER_RESOURCE,
                debug_name: "bc1".to_owned(),
                ..TextureDesc::default()
            },
            None,
        )
        .unwrap();
    // BC1 is half a byte per pixel at block granularity, 8 bytes minimum
    // per mip.
    assert_eq!(tex.mip_size(0), 64 * 64 * 8);
    assert_eq!(tex.mip_size(8), 8);
    assert_eq!(tex.size(), (0..9).map(|m| tex.mip_size(m)).sum::<u64>());
    assert_eq!(tex.resident_mips(), 0);
}

#[test]
fn dropped_resources_are_deferred_then_collected() {
    let device = explicit_device();
    let before = device.live_object_count();
    let buffer = device
        .create_buffer(&BufferDesc::new(128, ResourceUsage::UNIFORM_BUFFER))
        .unwrap();
    assert_eq!(device.live_object_count(), before + 1);

    let (used_with_buffer, _) = device.memory_stats();
    assert!(used_with_buffer >= 128);

    drop(buffer);
    // Still live until the deferred-deletion fence retires and garbage is
    // collected.
    assert_eq!(device.live_object_count(), before + 1);
    device.wait_for_idle();
    let collected = device.collect_garbage();
    assert!(collected >= 1);
    assert_eq!(device.live_object_count(), before);
}

#[test]
fn mapped_buffer_blocks_submission() {
    let device = explicit_device();
    let buffer = device
        .create_buffer(&BufferDesc {
            size: 64,
            usage: ResourceUsage::UNIFORM_BUFFER,
            cpu_accessible: true,
            ..BufferDesc::default()
        })
        .unwrap();

    let mapping = buffer.map().unwrap();
    {
        let list = device.immediate_command_list();
        let mut list = list.lock().unwrap();
        list.begin();
        list.set_constant_buffer(0, &buffer);
        list.end();
    }
    let err = device.submit_commands();
    assert!(err.is_err());
    drop(mapping);

    // Unmapped, the same recording path submits cleanly.
    {
        let list = device.immediate_command_list();
        let mut list = list.lock().unwrap();
        list.reset();
        list.begin();
        list.set_constant_buffer(0, &buffer);
        list.end();
    }
    assert!(device.submit_commands().is_ok());
}

#[test]
fn device_lost_refuses_submissions() {
    let device = explicit_device();
    device.set_device_lost_hook(Box::new(|reason| {
        log::error!("test hook observed loss: {reason}");
    }));
    device.notify_device_lost("unit test");
    assert!(device.is_lost());
    {
        let list = device.immediate_command_list();
        let mut list = list.lock().unwrap();
        list.begin();
        list.end();
    }
    assert!(device.submit_commands().is_err());
}

#[test]
fn immediate_backend_deduplicates_samplers() {
    use granite_rhi::SamplerDesc;

    let device = immediate_device();
    let a = device
        .create_sampler(&SamplerDesc::LINEAR_MIPMAP_LINEAR)
        .unwrap();
    let b = device
        .create_sampler(&SamplerDesc::LINEAR_MIPMAP_LINEAR)
        .unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    let c = device
        .create_sampler(&SamplerDesc::NEAREST_MIPMAP_NEAREST)
        .unwrap();
    assert!(!Arc::ptr_eq(&a, &c));

    // The cache holds weak references only: once every handle drops, a new
    // request builds a fresh object instead of resurrecting the old one.
    drop((a, b));
    let d = device
        .create_sampler(&SamplerDesc::LINEAR_MIPMAP_LINEAR)
        .unwrap();
    assert_eq!(Arc::strong_count(&d), 1);
}

#[test]
fn buffer_write_read_roundtrip() {
    let device = immediate_device();
    let buffer = device
        .create_buffer(&BufferDesc::new(16, ResourceUsage::STORAGE_BUFFER))
        .unwrap();
    buffer.write(4, &[1, 2, 3, 4]).unwrap();
    let mut out = [0u8; 4];
    buffer.read(4, &mut out).unwrap();
    assert_eq!(out, [1, 2, 3, 4]);
    assert!(buffer.write(14, &[0; 4]).is_err());
}
