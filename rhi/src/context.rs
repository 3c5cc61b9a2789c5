//! Per-frame command-list context.
//!
//! One context exists per frame in flight. Each frame it ties together the
//! primary command list, a fresh descriptor pool (explicit backend) and the
//! acquired swapchain image:
//!
//! 1. `prepare_for_new_frame` — wait on this slot's in-flight fence, reset
//!    the descriptor pool, acquire the next image (recreating the swapchain
//!    and returning early when it is out of date), reset the command list.
//! 2. The renderer records into the command list.
//! 3. `end_recording` closes the list.
//! 4. `submit_commands` waits on image-available, executes, and signals
//!    render-finished plus the in-flight fence.
//! 5. The caller presents.
//!
//! `refresh_command_buffer` resets the list for synchronous intra-frame work
//! without touching the swapchain or the pool.

use std::sync::{Arc, Mutex};

use crate::command::CommandList;
use crate::descriptor::DescriptorPoolShared;
use crate::device::DeviceShared;
use crate::error::RhiResult;
use crate::swapchain::{Swapchain, SwapchainStatus};
use crate::Backend;

pub(crate) struct FrameContext {
    cmd_list: Arc<Mutex<CommandList>>,
    /// Explicit backend only; reset at frame begin.
    descriptor_pool: Option<Arc<DescriptorPoolShared>>,
}

impl FrameContext {
    pub(crate) fn new(
        cmd_list: CommandList,
        descriptor_pool: Option<Arc<DescriptorPoolShared>>,
    ) -> FrameContext {
        FrameContext {
            cmd_list: Arc::new(Mutex::new(cmd_list)),
            descriptor_pool,
        }
    }

    pub(crate) fn command_list(&self) -> Arc<Mutex<CommandList>> {
        Arc::clone(&self.cmd_list)
    }

    pub(crate) fn descriptor_pool(&self) -> Option<&Arc<DescriptorPoolShared>> {
        self.descriptor_pool.as_ref()
    }

    pub(crate) fn prepare_for_new_frame(
        &self,
        device: &Arc<DeviceShared>,
        swapchain: Option<&Arc<Swapchain>>,
    ) -> SwapchainStatus {
        if let Some(sc) = swapchain {
            if let Some(slot) = sc.sync_slot() {
                // CPU reuse of this ring slot is gated on the frame that
                // used it two presents ago.
                slot.in_flight.wait();
            }
        }

        if let Some(pool) = &self.descriptor_pool {
            pool.reset();
        }

        if let Some(sc) = swapchain {
            match sc.acquire_next_image() {
                SwapchainStatus::Ok | SwapchainStatus::Suboptimal => {}
                SwapchainStatus::OutOfDate => {
                    // Skip the frame: drain the GPU, rebuild the ring, and
                    // let the caller retry next frame.
                    device.timeline().drain();
                    sc.recreate();
                    return SwapchainStatus::OutOfDate;
                }
                SwapchainStatus::Error => return SwapchainStatus::Error,
            }
        }

        let mut list = self.cmd_list.lock().unwrap();
        list.reset();
        list.begin();
        SwapchainStatus::Ok
    }

    /// Resets the command list for synchronous intra-frame work; does not
    /// re-acquire an image or touch the descriptor pool.
    pub(crate) fn refresh_command_buffer(&self) {
        let mut list = self.cmd_list.lock().unwrap();
        list.reset();
        list.begin();
    }

    pub(crate) fn end_recording(&self) {
        self.cmd_list.lock().unwrap().end();
    }

    pub(crate) fn submit_commands(
        &self,
        device: &Arc<DeviceShared>,
        swapchain: Option<&Arc<Swapchain>>,
    ) -> RhiResult<u64> {
        let slot = swapchain.and_then(|sc| sc.sync_slot());
        if let Some(slot) = slot {
            // Rendering into the acquired image waits for the display to
            // release it.
            if !slot.image_available.try_consume() {
                log::warn!(
                    target: "gfx-cmd",
                    "submission without a pending image-available signal"
                );
            }
            slot.in_flight.reset();
        }

        let mut list = self.cmd_list.lock().unwrap();
        let result = match device.backend() {
            Backend::Explicit => crate::explicit::submit(device, &mut list),
            Backend::Immediate => crate::immediate::submit(device, &mut list),
        };
        drop(list);

        if let Some(slot) = slot {
            match &result {
                Ok(_) => {
                    slot.render_finished.signal();
                    slot.in_flight.signal();
                }
                Err(_) => {
                    // Nothing reached the queue; unblock the slot so the
                    // next frame does not deadlock on the fence.
                    slot.in_flight.signal();
                }
            }
        }
        result
    }
}
