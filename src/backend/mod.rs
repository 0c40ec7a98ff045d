//! Swap-chain backends
//!
//! Every platform implements [`SwapChain`]. The surface manager owns one boxed
//! backend per surface and drives it through a fixed cycle:
//!
//! ```text
//!   create ─▶ [ begin_new_frame ─▶ prepare_frame ─▶ (draw) ─▶ present ]* ─▶ destroy
//!                                     │
//!                    resize ──────────┘ (rebuilds slots between frames)
//! ```
//!
//! Backends keep their platform state private. The only state they share
//! with the rest of the crate is the [`SurfaceState`] passed into each call.

pub mod compositor;
pub mod display_server;
pub mod framebuffer;
mod vsync;

pub use compositor::CompositorSwapChain;
pub use display_server::{AcquireFn, DisplayServerSwapChain};
pub use framebuffer::{FramebufferDisplay, FramebufferPixmapSwapChain, FramebufferSwapChain};
pub use vsync::VsyncTicker;

use crate::config::Orientation;
use crate::error::{Result, SwapchainError};
use crate::lock::LockCoordinator;
use crate::memory::MemoryBridge;
use crate::surface::{RenderTarget, SurfaceState};
use log::debug;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Which platform a backend talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BackendKind {
    Compositor,
    DisplayServer,
    Framebuffer,
    Pbuffer,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Compositor => "compositor",
            BackendKind::DisplayServer => "display-server",
            BackendKind::Framebuffer => "framebuffer",
            BackendKind::Pbuffer => "pbuffer",
        };
        f.write_str(name)
    }
}

/// Resize-recovery state of a surface.
///
/// Only the compositor backend ever leaves `Ok`. A pending recreate is
/// consumed by the next setup cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum RecoveryState {
    #[default]
    Ok,
    RecreateSingle,
    RecreateDouble,
    Oom,
}

impl RecoveryState {
    /// Integer form reported through surface queries.
    pub fn as_raw(&self) -> i64 {
        match self {
            RecoveryState::Ok => 0,
            RecoveryState::RecreateSingle => 1,
            RecoveryState::RecreateDouble => 2,
            RecoveryState::Oom => 3,
        }
    }
}

/// Shared services every backend allocates and arbitrates through.
#[derive(Clone)]
pub struct BackendContext {
    pub bridge: Arc<MemoryBridge>,
    pub locks: Arc<LockCoordinator>,
}

impl BackendContext {
    pub fn new(bridge: Arc<MemoryBridge>, locks: Arc<LockCoordinator>) -> Self {
        Self { bridge, locks }
    }

    /// Render target over a named buffer, reporting its events to the lock coordinator.
    pub(crate) fn shared_target(&self, target: RenderTarget) -> Arc<RenderTarget> {
        Arc::new(target.with_lock_events(Arc::clone(&self.bridge), Arc::clone(&self.locks)))
    }
}

/// Platform swap chain behind one surface.
pub trait SwapChain: Send {
    fn kind(&self) -> BackendKind;

    /// Allocate or acquire the initial buffers. On error nothing is left
    /// allocated and `state` has no slots.
    fn create(&mut self, state: &mut SurfaceState) -> Result<()>;

    /// Called once before each frame starts.
    fn begin_new_frame(&mut self, _state: &mut SurfaceState) {}

    /// Make the current slot renderable, running any pending setup.
    fn prepare_frame(&mut self, state: &mut SurfaceState) -> Result<()>;

    /// Hand the current slot to the display and move to the next one.
    fn present(&mut self, state: &mut SurfaceState, interval: u32) -> Result<()>;

    /// Rebuild buffers for a new size. On error the old buffers stay.
    fn resize(&mut self, state: &mut SurfaceState, width: u32, height: u32) -> Result<()>;

    fn destroy(&mut self, state: &mut SurfaceState);

    /// Target the CPU writes while a lock surface is mapped. `copied` tracks
    /// whether preserved pixels were already brought into the back buffer
    /// this frame.
    fn map_lock_buffer(
        &mut self,
        state: &mut SurfaceState,
        preserve: bool,
        copied: &mut bool,
    ) -> Result<Arc<RenderTarget>> {
        crate::lock_surface::map_current_slot(state, preserve, copied)
    }

    fn unmap_lock_buffer(&mut self, _state: &mut SurfaceState) {}

    fn recovery_state(&self) -> RecoveryState {
        RecoveryState::Ok
    }

    fn orientation(&self) -> Orientation {
        Orientation::Rotate0
    }
}

/// Off-screen surface with one private target, shared by all platforms.
pub struct PbufferSwapChain {
    ctx: BackendContext,
    width: u32,
    height: u32,
}

impl PbufferSwapChain {
    pub fn new(ctx: BackendContext, width: u32, height: u32) -> Self {
        Self {
            ctx,
            width: width.max(1),
            height: height.max(1),
        }
    }

    fn allocate(&self, state: &SurfaceState, width: u32, height: u32) -> Result<Arc<RenderTarget>> {
        let target = RenderTarget::private(&self.ctx.bridge, width, height, state.config.format)?;
        Ok(Arc::new(target))
    }
}

impl SwapChain for PbufferSwapChain {
    fn kind(&self) -> BackendKind {
        BackendKind::Pbuffer
    }

    fn create(&mut self, state: &mut SurfaceState) -> Result<()> {
        let target = self.allocate(state, self.width, self.height)?;
        state.set_targets(vec![Some(target)])?;
        state.width = self.width;
        state.height = self.height;
        debug!("{}: pbuffer {}x{}", state.id, self.width, self.height);
        Ok(())
    }

    fn prepare_frame(&mut self, state: &mut SurfaceState) -> Result<()> {
        if state.current_target().is_none() {
            return Err(SwapchainError::AllocationFailure("pbuffer has no target".into()));
        }
        Ok(())
    }

    fn present(&mut self, _state: &mut SurfaceState, _interval: u32) -> Result<()> {
        Ok(())
    }

    fn resize(&mut self, state: &mut SurfaceState, width: u32, height: u32) -> Result<()> {
        let (width, height) = (width.max(1), height.max(1));
        let target = self.allocate(state, width, height)?;
        state.set_targets(vec![Some(target)])?;
        self.width = width;
        self.height = height;
        state.width = width;
        state.height = height;
        Ok(())
    }

    fn destroy(&mut self, state: &mut SurfaceState) {
        state.clear_slots();
    }
}
