//! Swapchain: a ring of backbuffers plus acquisition and present.
//!
//! The explicit backend carries per-frame-in-flight synchronization — an
//! image-available semaphore raised at acquire, a render-finished semaphore
//! raised by submission, and an in-flight fence gating CPU reuse, in a ring
//! of two. The immediate backend wraps the window's double buffer and
//! presents by swapping indices.
//!
//! Once the surface reports a change, `acquire_next_image` keeps returning
//! `OutOfDate` until `resize` recreates the ring.

use std::sync::{Arc, Mutex};

use crate::device::{DeviceShared, FRAMES_IN_FLIGHT};
use crate::format::PixelFormat;
use crate::resource::{impl_gpu_resource, ResourceCommon, ResourceKind, ResourceUsage};
use crate::sync::{Fence, Semaphore};
use crate::texture::{Texture, TextureDesc};
use crate::Backend;

/// Opaque platform surface pointer, provided by the (out-of-scope) window
/// host. Never dereferenced by the RHI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SurfaceHandle(usize);

impl SurfaceHandle {
    pub fn from_raw(raw: usize) -> SurfaceHandle {
        SurfaceHandle(raw)
    }

    pub fn as_raw(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresentMode {
    Immediate,
    VSync,
    Mailbox,
    #[default]
    Fifo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainStatus {
    Ok,
    OutOfDate,
    Suboptimal,
    Error,
}

#[derive(Debug, Clone)]
pub struct SwapchainDesc {
    pub surface: SurfaceHandle,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub buffer_count: u32,
    pub vsync: bool,
    pub present_mode: PresentMode,
    pub with_depth: bool,
    pub depth_format: PixelFormat,
    pub debug_name: String,
}

impl Default for SwapchainDesc {
    fn default() -> SwapchainDesc {
        SwapchainDesc {
            surface: SurfaceHandle::default(),
            width: 1280,
            height: 720,
            format: PixelFormat::Bgra8Srgb,
            buffer_count: 2,
            vsync: true,
            present_mode: PresentMode::Fifo,
            with_depth: true,
            depth_format: PixelFormat::D32Float,
            debug_name: String::new(),
        }
    }
}

/// Per-frame-in-flight synchronization bundle (explicit backend).
pub(crate) struct FrameSlot {
    pub(crate) image_available: Semaphore,
    pub(crate) render_finished: Semaphore,
    pub(crate) in_flight: Fence,
}

impl FrameSlot {
    fn new() -> FrameSlot {
        FrameSlot {
            image_available: Semaphore::new(),
            render_finished: Semaphore::new(),
            // Signalled so the first frame's wait passes.
            in_flight: Fence::new(true),
        }
    }
}

enum SwapchainSync {
    Explicit { slots: Vec<FrameSlot> },
    Immediate,
}

struct SwapchainInner {
    width: u32,
    height: u32,
    images: Vec<Arc<Texture>>,
    depth: Option<Arc<Texture>>,
    image_index: u32,
    acquired: bool,
    out_of_date: bool,
    vsync: bool,
    present_mode: PresentMode,
    /// Frames presented since creation; `% FRAMES_IN_FLIGHT` selects the
    /// sync slot.
    frame_counter: u64,
}

pub struct Swapchain {
    pub(crate) common: ResourceCommon,
    desc: SwapchainDesc,
    inner: Mutex<SwapchainInner>,
    sync: SwapchainSync,
}

impl_gpu_resource!(Swapchain);

fn make_images(
    device: &Arc<DeviceShared>,
    desc: &SwapchainDesc,
    width: u32,
    height: u32,
) -> Option<(Vec<Arc<Texture>>, Option<Arc<Texture>>)> {
    let mut images = Vec::with_capacity(desc.buffer_count as usize);
    for index in 0..desc.buffer_count {
        let tex = Texture::create(
            device,
            &TextureDesc {
                width,
                height,
                format: desc.format,
                usage: ResourceUsage::RENDER_TARGET | ResourceUsage::TRANSFER_SRC,
                debug_name: format!("{} backbuffer {}", desc.debug_name, index),
                ..TextureDesc::default()
            },
            None,
        )?;
        images.push(tex);
    }
    let depth = if desc.with_depth {
        Some(Texture::create(
            device,
            &TextureDesc {
                width,
                height,
                format: desc.depth_format,
                usage: ResourceUsage::DEPTH_STENCIL,
                debug_name: format!("{} depth", desc.debug_name),
                ..TextureDesc::default()
            },
            None,
        )?)
    } else {
        None
    };
    Some((images, depth))
}

impl Swapchain {
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        desc: &SwapchainDesc,
    ) -> Option<Arc<Swapchain>> {
        if desc.buffer_count < 2 {
            log::error!(
                target: "gfx-swapchain",
                "swapchain '{}' rejected: buffer count {} < 2",
                desc.debug_name,
                desc.buffer_count
            );
            return None;
        }
        let common = ResourceCommon::new(
            device,
            ResourceKind::Swapchain,
            &desc.debug_name,
            ResourceUsage::RENDER_TARGET,
            0,
        )?;
        let (images, depth) = make_images(device, desc, desc.width, desc.height)?;
        let sync = match device.backend() {
            Backend::Explicit => SwapchainSync::Explicit {
                slots: (0..FRAMES_IN_FLIGHT).map(|_| FrameSlot::new()).collect(),
            },
            Backend::Immediate => SwapchainSync::Immediate,
        };
        Some(Arc::new(Swapchain {
            common,
            desc: desc.clone(),
            inner: Mutex::new(SwapchainInner {
                width: desc.width,
                height: desc.height,
                images,
                depth,
                image_index: 0,
                acquired: false,
                out_of_date: false,
                vsync: desc.vsync,
                present_mode: desc.present_mode,
                frame_counter: 0,
            }),
            sync,
        }))
    }

    pub fn desc(&self) -> &SwapchainDesc {
        &self.desc
    }

    pub fn backbuffer_count(&self) -> u32 {
        self.desc.buffer_count
    }

    pub fn format(&self) -> PixelFormat {
        self.desc.format
    }

    pub fn dimensions(&self) -> (u32, u32) {
        let inner = self.inner.lock().unwrap();
        (inner.width, inner.height)
    }

    pub fn current_backbuffer(&self) -> Arc<Texture> {
        let inner = self.inner.lock().unwrap();
        Arc::clone(&inner.images[inner.image_index as usize])
    }

    pub fn current_backbuffer_index(&self) -> u32 {
        self.inner.lock().unwrap().image_index
    }

    pub fn depth_stencil_texture(&self) -> Option<Arc<Texture>> {
        self.inner.lock().unwrap().depth.clone()
    }

    /// Frames presented so far; `% ring size` gives the sync slot index.
    pub fn frame_counter(&self) -> u64 {
        self.inner.lock().unwrap().frame_counter
    }

    pub(crate) fn sync_slot(&self) -> Option<&FrameSlot> {
        match &self.sync {
            SwapchainSync::Explicit { slots } => {
                let index = self.inner.lock().unwrap().frame_counter as usize % slots.len();
                Some(&slots[index])
            }
            SwapchainSync::Immediate => None,
        }
    }

    /// Marks the surface as changed (window resize, mode switch). The next
    /// acquire reports `OutOfDate` until `resize` is called.
    pub fn notify_surface_changed(&self) {
        self.inner.lock().unwrap().out_of_date = true;
    }

    pub fn acquire_next_image(&self) -> SwapchainStatus {
        let mut inner = self.inner.lock().unwrap();
        if inner.out_of_date {
            return SwapchainStatus::OutOfDate;
        }
        if inner.acquired {
            log::warn!(
                target: "gfx-swapchain",
                "acquire_next_image: image {} already acquired",
                inner.image_index
            );
            return SwapchainStatus::Suboptimal;
        }
        match &self.sync {
            SwapchainSync::Explicit { slots } => {
                inner.image_index = (inner.image_index + 1) % self.desc.buffer_count;
                inner.acquired = true;
                // The display system raises image-available once the image
                // can be rendered to.
                let slot = &slots[inner.frame_counter as usize % slots.len()];
                slot.image_available.signal();
            }
            SwapchainSync::Immediate => {
                inner.acquired = true;
            }
        }
        SwapchainStatus::Ok
    }

    pub fn present(&self) -> SwapchainStatus {
        let mut inner = self.inner.lock().unwrap();
        if inner.out_of_date {
            return SwapchainStatus::OutOfDate;
        }
        if !inner.acquired {
            log::warn!(target: "gfx-swapchain", "present without an acquired image");
            return SwapchainStatus::Error;
        }
        match &self.sync {
            SwapchainSync::Explicit { slots } => {
                let slot = &slots[inner.frame_counter as usize % slots.len()];
                // Display waits for rendering to finish before scanning out.
                if !slot.render_finished.try_consume() {
                    log::warn!(
                        target: "gfx-swapchain",
                        "present before render-finished was signalled"
                    );
                }
            }
            SwapchainSync::Immediate => {
                // Double-buffer swap.
                inner.image_index = (inner.image_index + 1) % self.desc.buffer_count;
            }
        }
        inner.acquired = false;
        inner.frame_counter += 1;
        SwapchainStatus::Ok
    }

    /// Recreates the backbuffer ring (and depth attachment) at the new
    /// dimensions and clears the out-of-date flag.
    pub fn resize(&self, width: u32, height: u32) -> bool {
        if width == 0 || height == 0 {
            log::warn!(target: "gfx-swapchain", "resize to zero extent ignored");
            return false;
        }
        let device = Arc::clone(self.common.device());
        let Some((images, depth)) = make_images(&device, &self.desc, width, height) else {
            log::error!(target: "gfx-swapchain", "swapchain resize failed");
            return false;
        };
        let mut inner = self.inner.lock().unwrap();
        inner.width = width;
        inner.height = height;
        inner.images = images;
        inner.depth = depth;
        inner.image_index = 0;
        inner.acquired = false;
        inner.out_of_date = false;
        true
    }

    /// Recreates the ring at the current dimensions.
    pub(crate) fn recreate(&self) -> bool {
        let (w, h) = self.dimensions();
        self.resize(w, h)
    }

    pub fn set_vsync(&self, enabled: bool) {
        self.inner.lock().unwrap().vsync = enabled;
    }

    pub fn vsync(&self) -> bool {
        self.inner.lock().unwrap().vsync
    }

    pub fn set_present_mode(&self, mode: PresentMode) {
        self.inner.lock().unwrap().present_mode = mode;
    }

    pub fn present_mode(&self) -> PresentMode {
        self.inner.lock().unwrap().present_mode
    }
}
