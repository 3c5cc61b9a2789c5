//! Engine-side rendering services on top of the RHI: the cross-thread
//! render command queue, the async file loader, and the texture streaming
//! manager with its pool.
//!
//! Thread topology: game-thread code enqueues closures on the
//! [`queue::RenderCommandQueue`]; the render thread drains them each frame
//! inside the active command-list context. Streaming ticks on the game
//! thread, does its disk work on the loader's worker pool, and hands
//! uploads to the device's transfer timeline.

pub mod async_io;
pub mod queue;
pub mod streaming;
pub mod texture;

pub use async_io::{AsyncFileIo, DestBuffer, IoStats, ReadRequest, RequestHandle};
pub use queue::{RenderCommandContext, RenderCommandQueue};
pub use streaming::{
    PoolBlock, StreamingConfig, StreamingStats, TexturePool, TextureStreamingManager,
};
pub use texture::{
    build_mip_table, create_black, create_checkerboard, create_flat_normal, create_white,
    MipRecord, StreamedTexture, TextureFileLayout,
};
