//! # GPU swap-chain core
//!
//! Buffer and swap-chain management for a GPU display driver: owns the
//! render targets behind window, pbuffer and pixmap surfaces, rotates them
//! across frames, negotiates buffers with the native window system and
//! arbitrates CPU/GPU access to shared memory through a kernel lock device.
//!
//! ## Architecture
//!
//! Leaves first:
//! - `memory`: buffer names to GPU-addressable memory, secure-id or fd backed
//! - `lock`: kernel lock arbitration around every buffer access window
//! - `backend`: compositor queue, display server and framebuffer swap chains
//! - `lock_surface`: CPU mapping of a surface's back buffer
//! - `display`: the surface manager driving all of the above
//!
//! ## Usage
//!
//! ```rust,no_run
//! use gpu_swapchain::{
//!     NativeTarget, Platform, SurfaceAttributes, SurfaceConfig, SurfaceKind, SurfaceManager,
//!     SwapchainConfig,
//! };
//!
//! fn main() -> anyhow::Result<()> {
//!     let manager = SurfaceManager::from_config(SwapchainConfig::default(), Platform::Compositor);
//!     let id = manager.create(
//!         SurfaceKind::Pbuffer,
//!         &SurfaceConfig::rgb565(),
//!         NativeTarget::None,
//!         &SurfaceAttributes::sized(64, 64),
//!     )?;
//!     let frame = manager.begin_frame(id)?;
//!     frame.target().fill(0);
//!     frame.finish();
//!     manager.present(id, 1)?;
//!     manager.destroy(id)?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod convert;
pub mod display;
pub mod error;
pub mod format;
pub mod jobs;
pub mod lock;
pub mod lock_surface;
pub mod memory;
pub mod native;
pub mod surface;

// Re-export main types for easy access
pub use backend::{FramebufferDisplay, RecoveryState, SwapChain};
pub use config::SwapchainConfig;
pub use display::{
    FrameTarget, NativeTarget, Platform, SurfaceAttribute, SurfaceAttributes, SurfaceManager,
};
pub use error::{Result, SwapchainError};
pub use format::PixelFormat;
pub use lock::{LockCoordinator, LockPolicy};
pub use lock_surface::{LockAttributes, MappedBuffer};
pub use memory::{BufferName, MemoryBridge, MemoryStrategy};
pub use surface::{SurfaceConfig, SurfaceId, SurfaceKind, MAX_BUFFERS};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
