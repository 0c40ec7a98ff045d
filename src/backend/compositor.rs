//! Compositor buffer-queue backend
//!
//! The compositor owns a ring of buffers. Each present queues the buffer the
//! surface rendered into and dequeues the next one, which may be any buffer
//! of the ring at any size. The backend compares what comes back against the
//! last two dequeues and schedules a rebuild when the ring has changed:
//!
//! ```text
//!            same size, one buffer tracked ─────────────▶ RecreateDouble
//!   dequeue  same size, identity not among wrapped ─────▶ RecreateDouble
//!            same size, known identity ─────────────────▶ stable++ (pipelined past limit)
//!            different size ────────────────────────────▶ RecreateSingle
//!            failure ───────────────────────────────────▶ Oom + RecreateSingle
//! ```
//!
//! The rebuild itself runs in the next setup cycle, before the next frame.

use super::{BackendContext, BackendKind, RecoveryState, SwapChain};
use crate::config::CompositorConfig;
use crate::error::{Result, SwapchainError};
use crate::memory::BufferName;
use crate::native::{NativeWindow, QueueBuffer};
use crate::surface::{Presentation, RenderTarget, SurfaceCaps, SurfaceState};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

pub struct CompositorSwapChain {
    ctx: BackendContext,
    window: Box<dyn NativeWindow>,
    config: CompositorConfig,
    /// Buffer currently dequeued for rendering
    client: Option<QueueBuffer>,
    /// Queue identities of the last two dequeues, newest first
    dequeued: [Option<u64>; 2],
    /// Names wrapped into slots 0 and 1
    wrapped: [Option<BufferName>; 2],
    state: RecoveryState,
    stable_count: u32,
    oom: bool,
}

impl CompositorSwapChain {
    pub fn new(ctx: BackendContext, window: Box<dyn NativeWindow>, config: CompositorConfig) -> Self {
        Self {
            ctx,
            window,
            config,
            client: None,
            dequeued: [None, None],
            wrapped: [None, None],
            state: RecoveryState::Ok,
            stable_count: 0,
            oom: false,
        }
    }

    /// Buffer the next frame will render into.
    pub fn client_buffer(&self) -> Option<&QueueBuffer> {
        self.client.as_ref()
    }

    pub fn stable_count(&self) -> u32 {
        self.stable_count
    }

    fn wrap(&self, buffer: &QueueBuffer) -> Result<Arc<RenderTarget>> {
        let handle = self.ctx.bridge.create_handle_from_name(buffer.name)?;
        let memory = self.ctx.bridge.create_gpu_memory(&handle, 0)?;
        let target = RenderTarget::new(buffer.width, buffer.height, buffer.stride, buffer.format, memory);
        Ok(self.ctx.shared_target(target))
    }

    fn remember(&mut self, id: u64) {
        self.dequeued = [Some(id), self.dequeued[0]];
    }

    fn invalidate(&mut self, state: &mut SurfaceState, recovery: RecoveryState) {
        debug!("{}: scheduling {:?}", state.id, recovery);
        self.state = recovery;
        state.force_resize = true;
        state.presentation = Presentation::Immediate;
        self.stable_count = 0;
    }

    fn out_of_memory(&mut self, state: &mut SurfaceState, error: std::io::Error) {
        warn!("⚠️ {}: dequeue failed ({}), surface out of memory", state.id, error);
        self.oom = true;
        self.client = None;
        self.invalidate(state, RecoveryState::RecreateSingle);
    }

    /// Consume a pending recreate. On error the old slots stay in place and
    /// the recreate stays pending.
    fn setup(&mut self, state: &mut SurfaceState) -> Result<()> {
        let client = match self.client.clone() {
            Some(buffer) => buffer,
            None => {
                let buffer = self.window.dequeue_buffer().map_err(|e| {
                    SwapchainError::AllocationFailure(format!("dequeue during setup: {}", e))
                })?;
                if self.oom {
                    debug!("{}: recovered from out-of-memory", state.id);
                }
                self.oom = false;
                self.remember(buffer.id);
                self.client = Some(buffer.clone());
                buffer
            }
        };

        let target = self.wrap(&client)?;
        let previous = state.target(0).cloned();
        match (self.state, previous) {
            (RecoveryState::RecreateDouble, Some(previous)) => {
                state.set_targets(vec![Some(target), Some(previous)])?;
                self.wrapped = [Some(client.name), self.wrapped[0]];
            }
            _ => {
                state.set_targets(vec![Some(target)])?;
                self.wrapped = [Some(client.name), None];
                self.dequeued = [Some(client.id), None];
            }
        }

        debug!(
            "{}: rebuilt {} slot(s) at {}x{}",
            state.id,
            state.num_buffers(),
            client.width,
            client.height
        );
        self.state = RecoveryState::Ok;
        state.force_resize = false;
        state.width = client.width;
        state.height = client.height;
        Ok(())
    }
}

impl SwapChain for CompositorSwapChain {
    fn kind(&self) -> BackendKind {
        BackendKind::Compositor
    }

    fn create(&mut self, state: &mut SurfaceState) -> Result<()> {
        if self.config.settle_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.config.settle_delay_ms));
        }

        let buffer = self
            .window
            .dequeue_buffer()
            .map_err(|e| SwapchainError::AllocationFailure(format!("initial dequeue: {}", e)))?;
        let target = match self.wrap(&buffer) {
            Ok(target) => target,
            Err(e) => {
                if let Err(cancel) = self.window.cancel_buffer(&buffer) {
                    warn!("cancel after failed wrap: {}", cancel);
                }
                return Err(e);
            }
        };
        state.set_targets(vec![Some(target)])?;

        let (width, height) = self.window.size();
        state.width = width;
        state.height = height;
        state.caps = SurfaceCaps::DIRECT_RENDERING;
        state.presentation = Presentation::Immediate;

        self.dequeued = [Some(buffer.id), None];
        self.wrapped = [Some(buffer.name), None];
        self.client = Some(buffer);
        self.state = RecoveryState::Ok;
        Ok(())
    }

    fn prepare_frame(&mut self, state: &mut SurfaceState) -> Result<()> {
        if self.state == RecoveryState::Ok && !state.force_resize && self.client.is_some() {
            return Ok(());
        }
        self.setup(state)
    }

    fn present(&mut self, state: &mut SurfaceState, _interval: u32) -> Result<()> {
        if self.oom {
            self.invalidate(state, RecoveryState::RecreateSingle);
            return Ok(());
        }

        if state.force_resize {
            // A rebuild is pending: swap the held buffer for a fresh one
            // without queueing the stale frame.
            if let Some(buffer) = self.client.take() {
                if let Err(e) = self.window.cancel_buffer(&buffer) {
                    warn!("{}: cancel buffer failed: {}", state.id, e);
                }
            }
            match self.window.dequeue_buffer() {
                Ok(buffer) => {
                    self.remember(buffer.id);
                    self.client = Some(buffer);
                }
                Err(e) => self.out_of_memory(state, e),
            }
            return Ok(());
        }

        let Some(presented) = self.client.take() else {
            self.invalidate(state, RecoveryState::RecreateSingle);
            return Ok(());
        };
        if let Err(e) = self.window.queue_buffer(&presented) {
            warn!("{}: queue buffer failed: {}", state.id, e);
        }

        let next = match self.window.dequeue_buffer() {
            Ok(buffer) => buffer,
            Err(e) => {
                self.out_of_memory(state, e);
                return Ok(());
            }
        };

        if (next.width, next.height) == (presented.width, presented.height) {
            if self.dequeued[1].is_none() && self.wrapped[1].is_none() {
                self.invalidate(state, RecoveryState::RecreateDouble);
            } else {
                if !self.wrapped.contains(&Some(next.name)) {
                    self.invalidate(state, RecoveryState::RecreateDouble);
                }
                if self.stable_count > self.config.stable_sequence_limit {
                    if state.presentation != Presentation::Pipelined {
                        debug!("{}: buffer sequence stable, pipelining", state.id);
                    }
                    state.presentation = Presentation::Pipelined;
                } else {
                    state.presentation = Presentation::Immediate;
                    self.stable_count += 1;
                }
            }
        } else {
            debug!(
                "{}: window resized to {}x{}",
                state.id, next.width, next.height
            );
            self.invalidate(state, RecoveryState::RecreateSingle);
        }

        self.remember(next.id);
        if let Some(slot) = self.wrapped.iter().position(|w| *w == Some(next.name)) {
            state.set_current(slot);
        }
        self.client = Some(next);
        Ok(())
    }

    fn resize(&mut self, state: &mut SurfaceState, _width: u32, _height: u32) -> Result<()> {
        // The compositor decides the size; only pending recovery work runs here.
        if self.state != RecoveryState::Ok || self.oom {
            self.setup(state)?;
        }
        Ok(())
    }

    fn destroy(&mut self, state: &mut SurfaceState) {
        if let Some(buffer) = self.client.take() {
            if let Err(e) = self.window.cancel_buffer(&buffer) {
                warn!("{}: cancel on destroy failed: {}", state.id, e);
            }
        }
        state.clear_slots();
    }

    fn recovery_state(&self) -> RecoveryState {
        if self.oom {
            RecoveryState::Oom
        } else {
            self.state
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::context;
    use crate::format::PixelFormat;
    use crate::native::headless::HeadlessWindow;
    use crate::surface::{SurfaceConfig, SurfaceId, SurfaceKind};

    fn config() -> CompositorConfig {
        CompositorConfig {
            settle_delay_ms: 0,
            ..CompositorConfig::default()
        }
    }

    fn setup(ring: usize) -> (CompositorSwapChain, HeadlessWindow, SurfaceState) {
        let ctx = context();
        let window = HeadlessWindow::new(Arc::clone(&ctx.bridge), 16, 8, PixelFormat::RGB565, ring).unwrap();
        let mut chain = CompositorSwapChain::new(ctx, Box::new(window.clone()), config());
        let mut state = SurfaceState::new(SurfaceId(1), SurfaceKind::Window, SurfaceConfig::rgb565());
        chain.create(&mut state).unwrap();
        (chain, window, state)
    }

    #[test]
    fn test_create_tracks_one_buffer() {
        let (chain, _window, state) = setup(2);
        assert_eq!(state.num_buffers(), 1);
        assert_eq!((state.width, state.height), (16, 8));
        assert!(state.caps.contains(SurfaceCaps::DIRECT_RENDERING));
        assert_eq!(chain.recovery_state(), RecoveryState::Ok);
    }

    #[test]
    fn test_second_buffer_schedules_double_then_rebuilds() {
        let (mut chain, _window, mut state) = setup(2);
        chain.present(&mut state, 1).unwrap();
        assert_eq!(chain.recovery_state(), RecoveryState::RecreateDouble);
        assert!(state.force_resize);

        chain.prepare_frame(&mut state).unwrap();
        assert_eq!(chain.recovery_state(), RecoveryState::Ok);
        assert_eq!(state.num_buffers(), 2);
        assert_eq!(state.populated_slots(), 2);
        assert_eq!(state.current_buffer(), 0);
    }

    #[test]
    fn test_steady_state_alternates_slots() {
        let (mut chain, window, mut state) = setup(2);
        chain.present(&mut state, 1).unwrap();
        chain.prepare_frame(&mut state).unwrap();

        let mut seen = Vec::new();
        for _ in 0..4 {
            chain.present(&mut state, 1).unwrap();
            chain.prepare_frame(&mut state).unwrap();
            assert_eq!(chain.recovery_state(), RecoveryState::Ok);
            seen.push(state.current_buffer());
        }
        assert_eq!(seen, vec![1, 0, 1, 0]);
        assert_eq!(window.queued().len(), 5);
    }

    #[test]
    fn test_stable_sequence_switches_to_pipelined() {
        let (mut chain, _window, mut state) = setup(2);
        chain.present(&mut state, 1).unwrap();
        chain.prepare_frame(&mut state).unwrap();

        for _ in 0..5 {
            chain.present(&mut state, 1).unwrap();
            assert_eq!(state.presentation, Presentation::Immediate);
        }
        chain.present(&mut state, 1).unwrap();
        assert_eq!(state.presentation, Presentation::Pipelined);
    }

    #[test]
    fn test_resized_window_schedules_single() {
        let (mut chain, window, mut state) = setup(2);
        chain.present(&mut state, 1).unwrap();
        chain.prepare_frame(&mut state).unwrap();

        window.resize(32, 4);
        chain.present(&mut state, 1).unwrap();
        assert_eq!(chain.recovery_state(), RecoveryState::RecreateSingle);
        assert_eq!(state.num_buffers(), 2);

        chain.prepare_frame(&mut state).unwrap();
        assert_eq!(state.num_buffers(), 1);
        assert_eq!((state.width, state.height), (32, 4));
        assert_eq!(state.presentation, Presentation::Immediate);
    }

    #[test]
    fn test_dequeue_failure_degrades_then_recovers() {
        let (mut chain, window, mut state) = setup(2);
        window.fail_dequeues(1);
        chain.present(&mut state, 1).unwrap();
        assert_eq!(chain.recovery_state(), RecoveryState::Oom);
        assert!(chain.client_buffer().is_none());

        // presenting while degraded only reschedules
        chain.present(&mut state, 1).unwrap();
        assert_eq!(chain.recovery_state(), RecoveryState::Oom);

        chain.prepare_frame(&mut state).unwrap();
        assert_eq!(chain.recovery_state(), RecoveryState::Ok);
        assert_eq!(state.num_buffers(), 1);
        assert!(state.current_buffer() < state.num_buffers());
    }

    #[test]
    fn test_failed_setup_keeps_old_slots() {
        let (mut chain, window, mut state) = setup(2);
        window.fail_dequeues(2);
        chain.present(&mut state, 1).unwrap();
        let err = chain.prepare_frame(&mut state).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(state.num_buffers(), 1);
        assert_eq!(chain.recovery_state(), RecoveryState::Oom);
    }

    #[test]
    fn test_destroy_cancels_held_buffer() {
        let (mut chain, window, mut state) = setup(2);
        chain.destroy(&mut state);
        assert_eq!(window.cancelled(), 1);
        assert_eq!(state.populated_slots(), 0);
    }
}
