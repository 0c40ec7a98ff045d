//! Display-server buffer exchange backend
//!
//! Buffers are never pre-allocated. Before each frame a one-shot acquire
//! asks the server which buffer to draw into next:
//!
//! ```text
//!   begin_new_frame ─▶ arm acquire
//!   prepare_frame   ─▶ take acquire ─▶ drawable size changed? drop all slots
//!                                  ─▶ get_buffers(attachment)
//!                                  ─▶ known name? reselect slot : wrap into a slot
//!   present         ─▶ swap_buffers
//! ```
//!
//! A recurring name reselects its slot, so two server buffers alternate
//! between two slots without copies.

use super::{BackendContext, BackendKind, SwapChain};
use crate::error::{Result, SwapchainError};
use crate::native::{Attachment, DisplayServer, DrawableBuffer, DrawableId};
use crate::surface::{RenderTarget, SurfaceCaps, SurfaceKind, SurfaceState};
use log::{debug, warn};
use std::sync::Arc;

/// One-shot buffer acquisition armed at the start of a frame.
pub type AcquireFn =
    Box<dyn FnOnce(&mut DisplayServerSwapChain, &mut SurfaceState) -> Result<()> + Send>;

const WINDOW_SLOTS: usize = 2;

pub struct DisplayServerSwapChain {
    ctx: BackendContext,
    server: Arc<dyn DisplayServer>,
    drawable: DrawableId,
    attachment: Attachment,
    descriptors: Vec<Option<DrawableBuffer>>,
    acquire: Option<AcquireFn>,
    swaps: u64,
}

fn rejected(what: &str, error: std::io::Error) -> SwapchainError {
    SwapchainError::PlatformRejection(format!("{}: {}", what, error))
}

impl DisplayServerSwapChain {
    pub fn new(ctx: BackendContext, server: Arc<dyn DisplayServer>, drawable: DrawableId) -> Self {
        Self {
            ctx,
            server,
            drawable,
            attachment: Attachment::BackLeft,
            descriptors: Vec::new(),
            acquire: None,
            swaps: 0,
        }
    }

    pub fn drawable(&self) -> DrawableId {
        self.drawable
    }

    /// Swap count reported by the server on the last present.
    pub fn swaps(&self) -> u64 {
        self.swaps
    }

    /// Arm the acquire for the coming frame, replacing any unconsumed one.
    pub fn arm(&mut self, acquire: AcquireFn) {
        self.acquire = Some(acquire);
    }

    pub fn is_armed(&self) -> bool {
        self.acquire.is_some()
    }

    /// Ask the server for the buffer to draw into and point the current slot at it.
    pub fn acquire_buffer(&mut self, state: &mut SurfaceState) -> Result<()> {
        let (width, height) = self
            .server
            .drawable_size(self.drawable)
            .map_err(|e| rejected("drawable size", e))?;
        if (width, height) != (state.width, state.height) {
            debug!(
                "{}: drawable resized {}x{} -> {}x{}, dropping buffers",
                state.id, state.width, state.height, width, height
            );
            state.clear_slots();
            self.descriptors.iter_mut().for_each(|d| *d = None);
            state.width = width;
            state.height = height;
        }

        let reply = self
            .server
            .get_buffers(self.drawable, self.attachment)
            .map_err(|e| rejected("get buffers", e))?;
        let name = reply.buffer.name;

        if let Some(slot) = self
            .descriptors
            .iter()
            .position(|d| d.map(|d| d.name) == Some(name))
        {
            state.set_current(slot);
            return Ok(());
        }

        let slot = state
            .first_empty_slot()
            .unwrap_or_else(|| (state.current_buffer() + 1) % state.num_buffers().max(1));
        let offset = match state.kind {
            SurfaceKind::Window => reply.buffer.flags as usize,
            _ => 0,
        };
        let handle = self.ctx.bridge.create_handle_from_name(name)?;
        let memory = self.ctx.bridge.create_gpu_memory(&handle, offset)?;
        let target = RenderTarget::new(
            reply.width,
            reply.height,
            reply.buffer.pitch,
            state.config.format,
            memory,
        );
        state.set_slot(slot, Some(self.ctx.shared_target(target)));
        if let Some(descriptor) = self.descriptors.get_mut(slot) {
            *descriptor = Some(reply.buffer);
        }
        state.set_current(slot);
        state.width = reply.width;
        state.height = reply.height;
        debug!("{}: buffer {} wrapped into slot {}", state.id, name, slot);
        Ok(())
    }
}

impl SwapChain for DisplayServerSwapChain {
    fn kind(&self) -> BackendKind {
        BackendKind::DisplayServer
    }

    fn create(&mut self, state: &mut SurfaceState) -> Result<()> {
        let slots = match state.kind {
            SurfaceKind::Pixmap => {
                self.attachment = Attachment::FrontLeft;
                1
            }
            _ => {
                self.attachment = Attachment::BackLeft;
                WINDOW_SLOTS
            }
        };
        self.server
            .create_drawable(self.drawable)
            .map_err(|e| rejected("create drawable", e))?;

        state.set_targets(vec![None; slots])?;
        self.descriptors = vec![None; slots];
        state.caps = SurfaceCaps::DIRECT_RENDERING;

        if state.kind == SurfaceKind::Pixmap {
            if let Err(e) = self.acquire_buffer(state) {
                self.server.destroy_drawable(self.drawable);
                state.set_targets(Vec::new())?;
                return Err(e);
            }
        } else {
            match self.server.drawable_size(self.drawable) {
                Ok((width, height)) => {
                    state.width = width;
                    state.height = height;
                }
                Err(e) => {
                    self.server.destroy_drawable(self.drawable);
                    state.set_targets(Vec::new())?;
                    return Err(rejected("drawable size", e));
                }
            }
        }
        Ok(())
    }

    fn begin_new_frame(&mut self, _state: &mut SurfaceState) {
        self.arm(Box::new(
            |chain: &mut DisplayServerSwapChain, state: &mut SurfaceState| chain.acquire_buffer(state),
        ));
    }

    fn prepare_frame(&mut self, state: &mut SurfaceState) -> Result<()> {
        match self.acquire.take() {
            Some(acquire) => acquire(self, state),
            None => Ok(()),
        }
    }

    fn present(&mut self, state: &mut SurfaceState, _interval: u32) -> Result<()> {
        self.swaps = self
            .server
            .swap_buffers(self.drawable)
            .map_err(|e| rejected("swap buffers", e))?;
        debug!("{}: swap #{}", state.id, self.swaps);
        Ok(())
    }

    fn resize(&mut self, _state: &mut SurfaceState, _width: u32, _height: u32) -> Result<()> {
        // The server owns the drawable size; the next acquire picks it up.
        Ok(())
    }

    fn destroy(&mut self, state: &mut SurfaceState) {
        if self.acquire.take().is_some() {
            warn!("{}: destroyed with an unconsumed acquire", state.id);
        }
        self.server.destroy_drawable(self.drawable);
        state.clear_slots();
        self.descriptors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::context;
    use crate::format::PixelFormat;
    use crate::native::headless::HeadlessDisplayServer;
    use crate::surface::{SurfaceConfig, SurfaceId};

    const WINDOW: DrawableId = DrawableId(7);

    fn setup(kind: SurfaceKind) -> (DisplayServerSwapChain, Arc<HeadlessDisplayServer>, SurfaceState) {
        let ctx = context();
        let server = Arc::new(HeadlessDisplayServer::new(Arc::clone(&ctx.bridge), PixelFormat::ARGB8888));
        server.add_drawable(WINDOW, 8, 4);
        let mut chain = DisplayServerSwapChain::new(ctx, server.clone(), WINDOW);
        let mut state = SurfaceState::new(SurfaceId(1), kind, SurfaceConfig::argb8888());
        chain.create(&mut state).unwrap();
        (chain, server, state)
    }

    fn frame(chain: &mut DisplayServerSwapChain, state: &mut SurfaceState) {
        chain.begin_new_frame(state);
        chain.prepare_frame(state).unwrap();
        chain.present(state, 1).unwrap();
    }

    #[test]
    fn test_window_buffers_fill_two_slots_then_alternate() {
        let (mut chain, server, mut state) = setup(SurfaceKind::Window);
        assert!(server.is_created(WINDOW));
        assert_eq!(state.num_buffers(), 2);
        assert_eq!(state.populated_slots(), 0);

        let mut current = Vec::new();
        for _ in 0..4 {
            frame(&mut chain, &mut state);
            current.push(state.current_buffer());
        }
        assert_eq!(current, vec![0, 1, 0, 1]);
        assert_eq!(state.populated_slots(), 2);
        assert_eq!(chain.swaps(), 4);
        assert_eq!(server.get_buffers_requests(), 4);
    }

    #[test]
    fn test_acquire_is_single_use() {
        let (mut chain, server, mut state) = setup(SurfaceKind::Window);
        chain.begin_new_frame(&mut state);
        assert!(chain.is_armed());
        chain.prepare_frame(&mut state).unwrap();
        assert!(!chain.is_armed());
        chain.prepare_frame(&mut state).unwrap();
        assert_eq!(server.get_buffers_requests(), 1);
    }

    #[test]
    fn test_resized_drawable_resets_slots() {
        let (mut chain, server, mut state) = setup(SurfaceKind::Window);
        frame(&mut chain, &mut state);
        frame(&mut chain, &mut state);
        assert_eq!(state.populated_slots(), 2);

        server.set_drawable_size(WINDOW, 20, 10);
        chain.begin_new_frame(&mut state);
        chain.prepare_frame(&mut state).unwrap();
        assert_eq!(state.populated_slots(), 1);
        assert_eq!(state.current_buffer(), 0);
        assert_eq!((state.width, state.height), (20, 10));
        assert_eq!(state.current_target().unwrap().pitch, 80);
    }

    #[test]
    fn test_rejected_request_keeps_slots() {
        let (mut chain, server, mut state) = setup(SurfaceKind::Window);
        frame(&mut chain, &mut state);
        server.fail_requests(1);
        chain.begin_new_frame(&mut state);
        let err = chain.prepare_frame(&mut state).unwrap_err();
        assert!(matches!(err, SwapchainError::PlatformRejection(_)));
        assert_eq!(state.populated_slots(), 1);
    }

    #[test]
    fn test_pixmap_acquires_front_buffer_at_create() {
        let (mut chain, _server, mut state) = setup(SurfaceKind::Pixmap);
        assert_eq!(state.num_buffers(), 1);
        assert_eq!(state.populated_slots(), 1);
        let first = Arc::clone(state.current_target().unwrap());
        chain.begin_new_frame(&mut state);
        chain.prepare_frame(&mut state).unwrap();
        assert!(Arc::ptr_eq(&first, state.current_target().unwrap()));
    }

    #[test]
    fn test_destroy_releases_drawable() {
        let (mut chain, server, mut state) = setup(SurfaceKind::Window);
        frame(&mut chain, &mut state);
        chain.destroy(&mut state);
        assert!(!server.is_created(WINDOW));
        assert_eq!(state.populated_slots(), 0);
    }
}
