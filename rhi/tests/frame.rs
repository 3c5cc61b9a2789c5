//! Frame lifecycle: swapchain acquisition, recreation, descriptor-pool
//! cycling and command-list state transitions.

use granite_rhi::{
    create_device, BufferDesc, CommandListState, DescriptorKind, DescriptorSetLayoutBinding,
    DescriptorSetLayoutDesc, Device, PipelineLayoutDesc, PixelFormat, PreferredBackend,
    ResourceUsage, SamplerDesc, Settings, ShaderStageFlags, SwapchainDesc, SwapchainStatus,
    TextureDesc,
};

fn device_with(backend: PreferredBackend) -> Device {
    let _ = env_logger::builder().is_test(true).try_init();
    create_device(&Settings {
        preferred_backend: backend,
        enable_validation: true,
        ..Settings::default()
    })
    .unwrap()
}

fn render_one_frame(device: &Device) -> Result<(), granite_rhi::RhiError> {
    assert_eq!(device.prepare_for_new_frame(), SwapchainStatus::Ok);
    let swapchain = device.swapchain().unwrap();
    {
        let list = device.immediate_command_list();
        let mut list = list.lock().unwrap();
        let backbuffer = swapchain.current_backbuffer();
        let depth = swapchain.depth_stencil_texture();
        list.set_render_targets(&[backbuffer.clone()], depth.as_ref());
        list.clear_render_target(&backbuffer, [0.0, 0.0, 0.0, 1.0]);
        list.end_render_pass();
    }
    device.end_recording();
    device.submit_commands()?;
    assert_eq!(device.present(), SwapchainStatus::Ok);
    Ok(())
}

#[test]
fn acquire_submit_present_cycle_explicit() {
    let device = device_with(PreferredBackend::Modern);
    device.create_swapchain(&SwapchainDesc::default()).unwrap();
    for _ in 0..8 {
        render_one_frame(&device).unwrap();
    }
    assert_eq!(device.frames_submitted(), 8);
}

#[test]
fn acquire_submit_present_cycle_immediate() {
    let device = device_with(PreferredBackend::Legacy);
    device.create_swapchain(&SwapchainDesc::default()).unwrap();
    for _ in 0..8 {
        render_one_frame(&device).unwrap();
    }
}

#[test]
fn swapchain_recreate_after_surface_change() {
    let device = device_with(PreferredBackend::Modern);
    let swapchain = device.create_swapchain(&SwapchainDesc::default()).unwrap();

    render_one_frame(&device).unwrap();

    // The host reports a window resize.
    swapchain.notify_surface_changed();
    assert_eq!(swapchain.acquire_next_image(), SwapchainStatus::OutOfDate);
    // Out-of-date is sticky until resize.
    assert_eq!(swapchain.acquire_next_image(), SwapchainStatus::OutOfDate);
    assert_eq!(swapchain.present(), SwapchainStatus::OutOfDate);

    let count_before = swapchain.backbuffer_count();
    assert!(swapchain.resize(1920, 1080));

    assert_eq!(swapchain.acquire_next_image(), SwapchainStatus::Ok);
    assert_eq!(swapchain.backbuffer_count(), count_before);
    assert_eq!(swapchain.dimensions(), (1920, 1080));
    let depth = swapchain.depth_stencil_texture().unwrap();
    assert_eq!((depth.width(), depth.height()), (1920, 1080));
    assert_eq!(swapchain.present(), SwapchainStatus::Ok);

    // The frame-context path also recovers: it recreates on out-of-date
    // and skips that frame.
    swapchain.notify_surface_changed();
    assert_eq!(device.prepare_for_new_frame(), SwapchainStatus::OutOfDate);
    render_one_frame(&device).unwrap();
}

#[test]
fn descriptor_sets_cycle_for_256_frames() {
    let device = device_with(PreferredBackend::Modern);
    device.create_swapchain(&SwapchainDesc::default()).unwrap();
    let swapchain = device.swapchain().unwrap();

    let per_frame_layout = device
        .create_descriptor_set_layout(&DescriptorSetLayoutDesc {
            set_index: 0,
            bindings: vec![DescriptorSetLayoutBinding::new(
                0,
                DescriptorKind::UniformBuffer,
                ShaderStageFlags::VERTEX | ShaderStageFlags::FRAGMENT,
            )],
            debug_name: "per-frame".to_owned(),
        })
        .unwrap();
    let material_layout = device
        .create_descriptor_set_layout(&DescriptorSetLayoutDesc {
            set_index: 1,
            bindings: vec![
                DescriptorSetLayoutBinding::new(
                    0,
                    DescriptorKind::UniformBuffer,
                    ShaderStageFlags::FRAGMENT,
                ),
                DescriptorSetLayoutBinding::new(
                    1,
                    DescriptorKind::CombinedTextureSampler,
                    ShaderStageFlags::FRAGMENT,
                ),
            ],
            debug_name: "per-material".to_owned(),
        })
        .unwrap();
    let _pipeline_layout = device
        .create_pipeline_layout(&PipelineLayoutDesc {
            set_layouts: vec![per_frame_layout.clone(), material_layout.clone()],
            push_constant_ranges: Vec::new(),
            debug_name: "pbr".to_owned(),
        })
        .unwrap();

    let view_ubo = device
        .create_buffer(&BufferDesc::new(256, ResourceUsage::UNIFORM_BUFFER))
        .unwrap();
    let material_ubo = device
        .create_buffer(&BufferDesc::new(64, ResourceUsage::UNIFORM_BUFFER))
        .unwrap();
    let albedo = device
        .create_texture(
            &TextureDesc {
                width: 4,
                height: 4,
                format: PixelFormat::Rgba8Unorm,
                usage: ResourceUsage::SHADER_RESOURCE,
                debug_name: "albedo".to_owned(),
                ..TextureDesc::default()
            },
            Some(&[255u8; 64]),
        )
        .unwrap();
    let sampler = device.create_sampler(&SamplerDesc::LINEAR_MIPMAP_LINEAR).unwrap();

    for frame in 0..256u32 {
        assert_eq!(
            device.prepare_for_new_frame(),
            SwapchainStatus::Ok,
            "frame {frame}"
        );

        let set0 = device.allocate_descriptor_set(&per_frame_layout).unwrap();
        set0.update_uniform_buffer(0, &view_ubo, 0, 0).unwrap();
        let set1 = device.allocate_descriptor_set(&material_layout).unwrap();
        set1.update_uniform_buffer(0, &material_ubo, 0, 0).unwrap();
        set1.update_combined_texture_sampler(1, &albedo, &sampler)
            .unwrap();

        {
            let list = device.immediate_command_list();
            let mut list = list.lock().unwrap();
            let backbuffer = swapchain.current_backbuffer();
            list.set_render_targets(&[backbuffer], None);
            list.set_descriptor_set(0, &set0);
            list.set_descriptor_set(1, &set1);
            list.draw(3, 0);
            list.end_render_pass();
        }
        device.end_recording();
        device.submit_commands().unwrap_or_else(|err| {
            panic!("frame {frame}: {err}");
        });
        assert_eq!(device.present(), SwapchainStatus::Ok);
    }

    // Descriptor memory stays bounded: the pools recycle per frame instead
    // of accumulating 512 live sets.
    device.wait_for_idle();
    device.collect_garbage();
    assert!(device.live_object_count() < 64);
}

#[test]
fn incomplete_descriptor_set_fails_submission() {
    let device = device_with(PreferredBackend::Modern);
    let layout = device
        .create_descriptor_set_layout(&DescriptorSetLayoutDesc {
            set_index: 0,
            bindings: vec![
                DescriptorSetLayoutBinding::new(
                    0,
                    DescriptorKind::UniformBuffer,
                    ShaderStageFlags::VERTEX,
                ),
                DescriptorSetLayoutBinding::new(
                    1,
                    DescriptorKind::Texture,
                    ShaderStageFlags::FRAGMENT,
                ),
            ],
            debug_name: "incomplete".to_owned(),
        })
        .unwrap();
    let ubo = device
        .create_buffer(&BufferDesc::new(64, ResourceUsage::UNIFORM_BUFFER))
        .unwrap();
    let target = device
        .create_texture(
            &TextureDesc {
                width: 8,
                height: 8,
                usage: ResourceUsage::RENDER_TARGET,
                debug_name: "rt".to_owned(),
                ..TextureDesc::default()
            },
            None,
        )
        .unwrap();

    let set = device.allocate_descriptor_set(&layout).unwrap();
    set.update_uniform_buffer(0, &ubo, 0, 0).unwrap();
    // Binding 1 left unpopulated.

    {
        let list = device.immediate_command_list();
        let mut list = list.lock().unwrap();
        list.begin();
        list.set_render_targets(&[target], None);
        list.set_descriptor_set(0, &set);
        list.draw(3, 0);
        list.end_render_pass();
        list.end();
    }
    assert!(device.submit_commands().is_err());
}

#[test]
fn command_list_state_machine() {
    let device = device_with(PreferredBackend::Modern);
    let list = device.immediate_command_list();
    let mut list = list.lock().unwrap();

    assert_eq!(list.state(), CommandListState::Initial);
    list.begin();
    assert_eq!(list.state(), CommandListState::Recording);
    // A draw outside a render pass is a deferred validation error, not a
    // recorded command.
    list.draw(3, 0);
    list.end();
    assert_eq!(list.state(), CommandListState::Executable);
    list.reset();
    assert_eq!(list.state(), CommandListState::Initial);
}

#[test]
fn refresh_command_buffer_reopens_recording() {
    let device = device_with(PreferredBackend::Modern);
    device.create_swapchain(&SwapchainDesc::default()).unwrap();
    assert_eq!(device.prepare_for_new_frame(), SwapchainStatus::Ok);
    device.end_recording();
    device.submit_commands().unwrap();

    // Synchronous intra-frame work: reset the list without re-acquiring.
    device.refresh_command_buffer();
    {
        let list = device.immediate_command_list();
        let list = list.lock().unwrap();
        assert_eq!(list.state(), CommandListState::Recording);
    }
    device.end_recording();
    device.submit_commands().unwrap();
}
