//! Surface lifecycle manager
//!
//! [`SurfaceManager`] is the display context every surface entry point goes
//! through. It picks a swap-chain backend per surface from the configured
//! [`Platform`], owns the surface table and brackets each frame:
//!
//! ```text
//!   begin_frame ──▶ arm + prepare backend ──▶ wait for the slot's previous frame
//!               ──▶ FrameTarget { GpuWrite ... drop: GpuWriteDone }
//!   present     ──▶ backend.present
//!   destroy     ──▶ last reference: wait for outstanding frames, then tear down
//! ```
//!
//! Each surface sits behind its own mutex. Waiting for frames always
//! happens with that mutex released, so a frame finishing on another thread
//! never contends with the caller.

use crate::backend::framebuffer::FramebufferPixmap;
use crate::backend::{
    BackendContext, BackendKind, CompositorSwapChain, DisplayServerSwapChain, FramebufferDisplay,
    FramebufferPixmapSwapChain, FramebufferSwapChain, PbufferSwapChain, RecoveryState, SwapChain,
};
use crate::config::SwapchainConfig;
use crate::error::{Result, SwapchainError};
use crate::jobs::{JobGuard, JobTracker};
use crate::lock::{LockCoordinator, SurfaceEvent};
use crate::lock_surface::{LockAttributes, LockState, LockSurfaceState, MappedBuffer};
use crate::memory::MemoryBridge;
use crate::native::{DisplayServer, DrawableId, NativeWindow};
use crate::surface::{
    Presentation, RenderBuffer, RenderTarget, SurfaceCaps, SurfaceConfig, SurfaceId, SurfaceKind,
    SurfaceState, SurfaceTypeFlags,
};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Window system the manager drives.
pub enum Platform {
    Compositor,
    DisplayServer(Arc<dyn DisplayServer>),
    Framebuffer(Arc<FramebufferDisplay>),
}

impl Platform {
    fn name(&self) -> &'static str {
        match self {
            Platform::Compositor => "compositor",
            Platform::DisplayServer(_) => "display-server",
            Platform::Framebuffer(_) => "framebuffer",
        }
    }
}

/// Native object a surface is created against.
pub enum NativeTarget {
    /// Pbuffers have none
    None,
    QueueWindow(Box<dyn NativeWindow>),
    Drawable(DrawableId),
    DrawablePixmap(DrawableId),
    FramebufferWindow { width: u32, height: u32 },
    FramebufferPixmap(FramebufferPixmap),
}

impl NativeTarget {
    fn describe(&self) -> &'static str {
        match self {
            NativeTarget::None => "no native target",
            NativeTarget::QueueWindow(_) => "queue window",
            NativeTarget::Drawable(_) => "drawable",
            NativeTarget::DrawablePixmap(_) => "drawable pixmap",
            NativeTarget::FramebufferWindow { .. } => "framebuffer window",
            NativeTarget::FramebufferPixmap(_) => "framebuffer pixmap",
        }
    }
}

/// Creation attributes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SurfaceAttributes {
    /// Pbuffer size
    pub width: u32,
    pub height: u32,
    /// Overrides the config's render buffer
    pub render_buffer: Option<RenderBuffer>,
}

impl SurfaceAttributes {
    pub fn sized(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            render_buffer: None,
        }
    }
}

/// Queryable surface attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceAttribute {
    Width,
    Height,
    NumBuffers,
    CurrentBuffer,
    DirectRendering,
    WritebackConversion,
    Presentation,
    Orientation,
    RecoveryState,
    LockState,
    /// Maps the surface
    BitmapPointer,
    /// Maps the surface
    BitmapPitch,
    BitmapPixelSize,
    RedOffset,
    GreenOffset,
    BlueOffset,
    AlphaOffset,
}

/// Snapshot of one surface for reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SurfaceInfo {
    pub id: u64,
    pub kind: String,
    pub backend: BackendKind,
    pub width: u32,
    pub height: u32,
    pub num_buffers: usize,
    pub current_buffer: usize,
    pub pipelined: bool,
    pub recovery: RecoveryState,
    pub references: u32,
}

struct Surface {
    state: SurfaceState,
    backend: Box<dyn SwapChain>,
    references: u32,
    jobs: Arc<JobTracker>,
    lock: LockSurfaceState,
    current: bool,
    bound: bool,
}

/// The render target of one in-flight frame.
///
/// Holding it keeps the surface and the slot busy. Dropping it, on any
/// thread, signals the end of the GPU write and completes the jobs.
pub struct FrameTarget {
    surface: SurfaceId,
    target: Arc<RenderTarget>,
    _slot_job: JobGuard,
    _surface_job: JobGuard,
}

impl FrameTarget {
    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    pub fn target(&self) -> &Arc<RenderTarget> {
        &self.target
    }

    /// End the frame.
    pub fn finish(self) {}
}

impl Drop for FrameTarget {
    fn drop(&mut self) {
        self.target.notify(SurfaceEvent::GpuWriteDone);
    }
}

pub struct SurfaceManager {
    config: SwapchainConfig,
    platform: Platform,
    ctx: BackendContext,
    surfaces: RwLock<HashMap<SurfaceId, Arc<Mutex<Surface>>>>,
    next_id: AtomicU64,
}

impl SurfaceManager {
    pub fn new(
        config: SwapchainConfig,
        platform: Platform,
        bridge: Arc<MemoryBridge>,
        locks: Arc<LockCoordinator>,
    ) -> Self {
        info!("🚀 Surface manager on {} platform", platform.name());
        Self {
            config,
            platform,
            ctx: BackendContext::new(bridge, locks),
            surfaces: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Build the bridge and lock coordinator the configuration asks for.
    pub fn from_config(config: SwapchainConfig, platform: Platform) -> Self {
        let bridge = Arc::new(MemoryBridge::with_strategy(config.memory.strategy));
        let locks = Arc::new(LockCoordinator::from_config(&config.lock));
        Self::new(config, platform, bridge, locks)
    }

    pub fn bridge(&self) -> &Arc<MemoryBridge> {
        &self.ctx.bridge
    }

    pub fn locks(&self) -> &Arc<LockCoordinator> {
        &self.ctx.locks
    }

    pub fn config(&self) -> &SwapchainConfig {
        &self.config
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.read().len()
    }

    pub fn surface_ids(&self) -> Vec<SurfaceId> {
        let mut ids: Vec<_> = self.surfaces.read().keys().copied().collect();
        ids.sort();
        ids
    }

    fn get(&self, id: SurfaceId) -> Result<Arc<Mutex<Surface>>> {
        self.surfaces
            .read()
            .get(&id)
            .cloned()
            .ok_or(SwapchainError::BadSurface(id.0))
    }

    fn select_backend(
        &self,
        kind: SurfaceKind,
        config: &SurfaceConfig,
        target: NativeTarget,
        attrs: &SurfaceAttributes,
    ) -> Result<Box<dyn SwapChain>> {
        let ctx = self.ctx.clone();
        let what = target.describe();
        let backend: Box<dyn SwapChain> = match (kind, &self.platform, target) {
            (SurfaceKind::Pbuffer, _, NativeTarget::None) => {
                Box::new(PbufferSwapChain::new(ctx, attrs.width, attrs.height))
            }
            (SurfaceKind::Window, Platform::Compositor, NativeTarget::QueueWindow(window)) => {
                Box::new(CompositorSwapChain::new(ctx, window, self.config.compositor.clone()))
            }
            (SurfaceKind::Pixmap, Platform::Compositor, _) => {
                return Err(SwapchainError::BadNativeTarget(
                    "compositor platform has no pixmap surfaces".into(),
                ))
            }
            (SurfaceKind::Window, Platform::DisplayServer(server), NativeTarget::Drawable(drawable))
            | (
                SurfaceKind::Pixmap,
                Platform::DisplayServer(server),
                NativeTarget::DrawablePixmap(drawable),
            ) => Box::new(DisplayServerSwapChain::new(ctx, Arc::clone(server), drawable)),
            (
                SurfaceKind::Window,
                Platform::Framebuffer(display),
                NativeTarget::FramebufferWindow { width, height },
            ) => Box::new(FramebufferSwapChain::new(
                ctx,
                Arc::clone(display),
                width,
                height,
                attrs.render_buffer.unwrap_or(config.render_buffer),
            )),
            (SurfaceKind::Pixmap, Platform::Framebuffer(_), NativeTarget::FramebufferPixmap(pixmap)) => {
                Box::new(FramebufferPixmapSwapChain::new(pixmap))
            }
            _ => {
                return Err(SwapchainError::BadNativeTarget(format!(
                    "{} cannot back a {:?} surface on the {} platform",
                    what,
                    kind,
                    self.platform.name()
                )))
            }
        };
        Ok(backend)
    }

    /// Create a surface holding one reference.
    pub fn create(
        &self,
        kind: SurfaceKind,
        config: &SurfaceConfig,
        target: NativeTarget,
        attrs: &SurfaceAttributes,
    ) -> Result<SurfaceId> {
        if !config.surface_type.contains(SurfaceTypeFlags::for_kind(kind)) {
            return Err(SwapchainError::BadConfig(format!(
                "config does not support {:?} surfaces",
                kind
            )));
        }

        let mut backend = self.select_backend(kind, config, target, attrs)?;
        let id = SurfaceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = SurfaceState::new(id, kind, config.clone());
        if let Some(render_buffer) = attrs.render_buffer {
            state.config.render_buffer = render_buffer;
        }
        backend.create(&mut state)?;

        info!(
            "✨ Created {} {:?} on {} backend: {}x{}, {} buffer(s)",
            id,
            kind,
            backend.kind(),
            state.width,
            state.height,
            state.num_buffers()
        );
        let surface = Surface {
            state,
            backend,
            references: 1,
            jobs: JobTracker::new(),
            lock: LockSurfaceState::new(),
            current: false,
            bound: false,
        };
        self.surfaces.write().insert(id, Arc::new(Mutex::new(surface)));
        Ok(id)
    }

    pub fn retain(&self, id: SurfaceId) -> Result<()> {
        self.get(id)?.lock().references += 1;
        Ok(())
    }

    /// Drop one reference. The last one waits for outstanding frames and
    /// tears the surface down.
    pub fn destroy(&self, id: SurfaceId) -> Result<()> {
        let surface = self.get(id)?;
        let jobs = {
            let mut guard = surface.lock();
            guard.references = guard.references.saturating_sub(1);
            if guard.references > 0 {
                debug!("{}: {} reference(s) left", id, guard.references);
                return Ok(());
            }
            Arc::clone(&guard.jobs)
        };

        self.surfaces.write().remove(&id);
        if jobs.outstanding() > 0 {
            debug!("{}: waiting for {} frame(s)", id, jobs.outstanding());
        }
        jobs.wait_idle();

        Self::teardown(id, &surface);
        Ok(())
    }

    fn teardown(id: SurfaceId, surface: &Mutex<Surface>) {
        let mut guard = surface.lock();
        let surface = &mut *guard;
        surface.lock.unmap(surface.backend.as_mut(), &mut surface.state);
        surface.backend.destroy(&mut surface.state);
        info!("🗑️ Destroyed {}", id);
    }

    /// Rebuild buffers for a new size. Failure keeps the old buffers and
    /// returns false.
    pub fn resize(&self, id: SurfaceId, width: u32, height: u32) -> Result<bool> {
        let surface = self.get(id)?;
        let mut guard = surface.lock();
        let surface = &mut *guard;
        match surface.backend.resize(&mut surface.state, width, height) {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("⚠️ {}: resize to {}x{} failed: {}", id, width, height, e);
                Ok(false)
            }
        }
    }

    pub fn present(&self, id: SurfaceId, interval: u32) -> Result<()> {
        let surface = self.get(id)?;
        let mut guard = surface.lock();
        let surface = &mut *guard;
        surface.lock.check_present()?;
        surface.backend.present(&mut surface.state, interval)?;
        surface.lock.frame_presented();
        Ok(())
    }

    /// Start drawing a frame into the current slot.
    ///
    /// Blocks until the previous frame drawn into that slot has finished, so
    /// a frame target of a single-buffered surface must be dropped before the
    /// next frame begins.
    pub fn begin_frame(&self, id: SurfaceId) -> Result<FrameTarget> {
        let surface = self.get(id)?;
        let (target, surface_job) = {
            let mut guard = surface.lock();
            let surface = &mut *guard;
            if surface.lock.is_locked() {
                return Err(SwapchainError::AccessDenied("surface is locked"));
            }
            surface.backend.begin_new_frame(&mut surface.state);
            if let Err(e) = surface.backend.prepare_frame(&mut surface.state) {
                if surface.state.current_target().is_none() {
                    return Err(e);
                }
                warn!("⚠️ {}: frame setup failed ({}), drawing into previous buffer", id, e);
            }
            let target = surface
                .state
                .current_target()
                .cloned()
                .ok_or_else(|| SwapchainError::AllocationFailure(format!("{} has no render target", id)))?;
            (target, surface.jobs.start())
        };

        let slot_job = target.jobs().start_when_idle();
        target.notify(SurfaceEvent::GpuWrite);
        Ok(FrameTarget {
            surface: id,
            target,
            _slot_job: slot_job,
            _surface_job: surface_job,
        })
    }

    pub fn lock(&self, id: SurfaceId, attrs: &LockAttributes) -> Result<()> {
        let surface = self.get(id)?;
        let mut guard = surface.lock();
        let surface = &mut *guard;
        surface
            .lock
            .lock(&surface.state.config, *attrs, surface.current, surface.bound)?;
        debug!("{}: locked", id);
        Ok(())
    }

    pub fn unlock(&self, id: SurfaceId) -> Result<()> {
        let surface = self.get(id)?;
        let mut guard = surface.lock();
        let surface = &mut *guard;
        surface.lock.unlock(surface.backend.as_mut(), &mut surface.state)?;
        debug!("{}: unlocked", id);
        Ok(())
    }

    pub fn map(&self, id: SurfaceId, preserve: bool) -> Result<MappedBuffer> {
        let surface = self.get(id)?;
        let mut guard = surface.lock();
        let surface = &mut *guard;
        surface
            .lock
            .map(surface.backend.as_mut(), &mut surface.state, preserve)
    }

    pub fn query(&self, id: SurfaceId, attribute: SurfaceAttribute) -> Result<i64> {
        let surface = self.get(id)?;
        let mut guard = surface.lock();
        let surface = &mut *guard;
        let state = &surface.state;
        let format = state.config.format;
        let flag = |cap: SurfaceCaps| i64::from(state.caps.contains(cap));

        let value = match attribute {
            SurfaceAttribute::Width => i64::from(state.width),
            SurfaceAttribute::Height => i64::from(state.height),
            SurfaceAttribute::NumBuffers => state.num_buffers() as i64,
            SurfaceAttribute::CurrentBuffer => state.current_buffer() as i64,
            SurfaceAttribute::DirectRendering => flag(SurfaceCaps::DIRECT_RENDERING),
            SurfaceAttribute::WritebackConversion => flag(SurfaceCaps::WRITEBACK_CONVERSION),
            SurfaceAttribute::Presentation => match state.presentation {
                Presentation::Immediate => 0,
                Presentation::Pipelined => 1,
            },
            SurfaceAttribute::Orientation => i64::from(surface.backend.orientation().degrees()),
            SurfaceAttribute::RecoveryState => surface.backend.recovery_state().as_raw(),
            SurfaceAttribute::LockState => surface.lock.state().as_raw(),
            SurfaceAttribute::BitmapPixelSize => i64::from(format.bits_per_pixel),
            SurfaceAttribute::RedOffset => i64::from(format.red.offset),
            SurfaceAttribute::GreenOffset => i64::from(format.green.offset),
            SurfaceAttribute::BlueOffset => i64::from(format.blue.offset),
            SurfaceAttribute::AlphaOffset => i64::from(format.alpha.offset),
            SurfaceAttribute::BitmapPointer | SurfaceAttribute::BitmapPitch => {
                let mapping = surface
                    .lock
                    .map(surface.backend.as_mut(), &mut surface.state, false)?;
                if attribute == SurfaceAttribute::BitmapPointer {
                    mapping.as_ptr() as i64
                } else {
                    i64::from(mapping.pitch())
                }
            }
        };
        Ok(value)
    }

    pub fn recovery_state(&self, id: SurfaceId) -> Result<RecoveryState> {
        Ok(self.get(id)?.lock().backend.recovery_state())
    }

    pub fn lock_state(&self, id: SurfaceId) -> Result<LockState> {
        Ok(self.get(id)?.lock().lock.state())
    }

    /// Mark the surface current to a client API. Current surfaces cannot be locked.
    pub fn set_current(&self, id: SurfaceId, current: bool) -> Result<()> {
        self.get(id)?.lock().current = current;
        Ok(())
    }

    /// Mark the surface bound as a texture. Bound surfaces cannot be locked.
    pub fn set_bound(&self, id: SurfaceId, bound: bool) -> Result<()> {
        self.get(id)?.lock().bound = bound;
        Ok(())
    }

    /// Frames still drawing into the surface.
    pub fn outstanding_frames(&self, id: SurfaceId) -> Result<usize> {
        let jobs = Arc::clone(&self.get(id)?.lock().jobs);
        Ok(jobs.outstanding())
    }

    pub fn info(&self, id: SurfaceId) -> Result<SurfaceInfo> {
        let surface = self.get(id)?;
        let guard = surface.lock();
        let state = &guard.state;
        Ok(SurfaceInfo {
            id: id.0,
            kind: format!("{:?}", state.kind),
            backend: guard.backend.kind(),
            width: state.width,
            height: state.height,
            num_buffers: state.num_buffers(),
            current_buffer: state.current_buffer(),
            pipelined: state.presentation == Presentation::Pipelined,
            recovery: guard.backend.recovery_state(),
            references: guard.references,
        })
    }

    /// Tear down every surface regardless of references.
    pub fn terminate(&self) {
        let surfaces: Vec<_> = self.surfaces.write().drain().collect();
        if surfaces.is_empty() {
            return;
        }
        info!("🛑 Terminating {} surface(s)", surfaces.len());
        for (id, surface) in surfaces {
            let jobs = Arc::clone(&surface.lock().jobs);
            jobs.wait_idle();
            Self::teardown(id, &surface);
        }
    }
}

impl Drop for SurfaceManager {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;
    use crate::memory::MemoryStrategy;
    use crate::native::headless::HeadlessWindow;
    use crate::surface::MatchFormat;
    use proptest::prelude::*;

    fn manager() -> SurfaceManager {
        let mut config = SwapchainConfig::default();
        config.compositor.settle_delay_ms = 0;
        SurfaceManager::new(
            config,
            Platform::Compositor,
            Arc::new(MemoryBridge::with_strategy(MemoryStrategy::SecureId)),
            Arc::new(LockCoordinator::unarbitrated()),
        )
    }

    fn window(manager: &SurfaceManager, ring: usize) -> (SurfaceId, HeadlessWindow) {
        let window =
            HeadlessWindow::new(Arc::clone(manager.bridge()), 16, 16, PixelFormat::RGB565, ring).unwrap();
        let id = manager
            .create(
                SurfaceKind::Window,
                &SurfaceConfig::rgb565(),
                NativeTarget::QueueWindow(Box::new(window.clone())),
                &SurfaceAttributes::default(),
            )
            .unwrap();
        (id, window)
    }

    #[test]
    fn test_unknown_surface() {
        let manager = manager();
        let err = manager.present(SurfaceId(99), 1).unwrap_err();
        assert!(matches!(err, SwapchainError::BadSurface(99)));
    }

    #[test]
    fn test_compositor_pixmap_rejected() {
        let manager = manager();
        let err = manager
            .create(
                SurfaceKind::Pixmap,
                &SurfaceConfig::rgb565(),
                NativeTarget::None,
                &SurfaceAttributes::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SwapchainError::BadNativeTarget(_)));
    }

    #[test]
    fn test_config_must_support_kind() {
        let manager = manager();
        let mut config = SurfaceConfig::rgb565();
        config.surface_type = SurfaceTypeFlags::WINDOW;
        let err = manager
            .create(SurfaceKind::Pbuffer, &config, NativeTarget::None, &SurfaceAttributes::sized(4, 4))
            .unwrap_err();
        assert!(matches!(err, SwapchainError::BadConfig(_)));
    }

    #[test]
    fn test_references_delay_destroy() {
        let manager = manager();
        let (id, _window) = window(&manager, 2);
        manager.retain(id).unwrap();
        manager.destroy(id).unwrap();
        assert_eq!(manager.surface_count(), 1);
        manager.destroy(id).unwrap();
        assert_eq!(manager.surface_count(), 0);
        assert!(manager.destroy(id).is_err());
    }

    #[test]
    fn test_frame_cycle_rebuilds_double_buffering() {
        let manager = manager();
        let (id, window) = window(&manager, 2);
        assert_eq!(manager.query(id, SurfaceAttribute::NumBuffers).unwrap(), 1);

        let frame = manager.begin_frame(id).unwrap();
        frame.target().fill(0x3C);
        frame.finish();
        manager.present(id, 1).unwrap();
        assert_eq!(manager.recovery_state(id).unwrap(), RecoveryState::RecreateDouble);

        let frame = manager.begin_frame(id).unwrap();
        assert_eq!(manager.query(id, SurfaceAttribute::NumBuffers).unwrap(), 2);
        assert_eq!(manager.outstanding_frames(id).unwrap(), 1);
        drop(frame);
        assert_eq!(manager.outstanding_frames(id).unwrap(), 0);

        let first = window.queued()[0];
        assert!(window.read_buffer(first).unwrap().iter().all(|&b| b == 0x3C));
    }

    #[test]
    fn test_lockable_surface_map_and_query() {
        let manager = manager();
        let config = SurfaceConfig::lockable(PixelFormat::RGB565, MatchFormat::Rgb565Exact);
        let id = manager
            .create(SurfaceKind::Pbuffer, &config, NativeTarget::None, &SurfaceAttributes::sized(8, 2))
            .unwrap();

        assert!(manager.query(id, SurfaceAttribute::BitmapPointer).is_err());
        manager.lock(id, &LockAttributes::default()).unwrap();
        assert!(manager.present(id, 1).is_err());
        assert!(manager.begin_frame(id).is_err());

        let mapped = manager.map(id, false).unwrap();
        assert_eq!(
            manager.query(id, SurfaceAttribute::BitmapPointer).unwrap(),
            mapped.as_ptr() as i64
        );
        assert_eq!(manager.query(id, SurfaceAttribute::BitmapPitch).unwrap(), 16);
        assert_eq!(manager.query(id, SurfaceAttribute::RedOffset).unwrap(), 11);
        assert_eq!(
            manager.query(id, SurfaceAttribute::LockState).unwrap(),
            LockState::Mapped.as_raw()
        );

        manager.unlock(id).unwrap();
        manager.present(id, 1).unwrap();
    }

    #[test]
    fn test_current_or_bound_surface_cannot_lock() {
        let manager = manager();
        let config = SurfaceConfig::lockable(PixelFormat::RGB565, MatchFormat::Rgb565Exact);
        let id = manager
            .create(SurfaceKind::Pbuffer, &config, NativeTarget::None, &SurfaceAttributes::sized(2, 2))
            .unwrap();
        manager.set_current(id, true).unwrap();
        assert!(manager.lock(id, &LockAttributes::default()).is_err());
        manager.set_current(id, false).unwrap();
        manager.set_bound(id, true).unwrap();
        assert!(manager.lock(id, &LockAttributes::default()).is_err());
        assert_eq!(manager.lock_state(id).unwrap(), LockState::Unlocked);
    }

    #[test]
    fn test_terminate_destroys_everything() {
        let manager = manager();
        let (_a, window) = window(&manager, 2);
        let (_b, _) = self::window(&manager, 2);
        manager.terminate();
        assert_eq!(manager.surface_count(), 0);
        assert_eq!(window.cancelled(), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Present,
        Frame,
        Resize(u32, u32),
        WindowResize(u32, u32),
        FailDequeue,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => Just(Op::Present),
            4 => Just(Op::Frame),
            1 => (1u32..64, 1u32..64).prop_map(|(w, h)| Op::Resize(w, h)),
            1 => (1u32..64, 1u32..64).prop_map(|(w, h)| Op::WindowResize(w, h)),
            1 => Just(Op::FailDequeue),
        ]
    }

    proptest! {
        #[test]
        fn prop_current_buffer_in_range(ops in prop::collection::vec(op(), 1..40)) {
            let manager = manager();
            let (id, window) = window(&manager, 3);
            for op in ops {
                match op {
                    Op::Present => manager.present(id, 1).unwrap(),
                    Op::Frame => {
                        let _ = manager.begin_frame(id);
                    }
                    Op::Resize(w, h) => {
                        manager.resize(id, w, h).unwrap();
                    }
                    Op::WindowResize(w, h) => window.resize(w, h),
                    Op::FailDequeue => window.fail_dequeues(1),
                }
                let num = manager.query(id, SurfaceAttribute::NumBuffers).unwrap();
                let current = manager.query(id, SurfaceAttribute::CurrentBuffer).unwrap();
                prop_assert!(num >= 1 && num <= crate::surface::MAX_BUFFERS as i64);
                prop_assert!(current < num);
            }
        }
    }
}
