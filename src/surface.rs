//! Surface records, buffer slots and render targets.
//!
//! [`SurfaceState`] is the part of a surface every backend sees: geometry,
//! capability flags and the ordered slot array. Platform-private state lives
//! inside each backend, never here.

use crate::error::{Result, SwapchainError};
use crate::format::PixelFormat;
use crate::jobs::JobTracker;
use crate::lock::{LockCoordinator, SurfaceEvent};
use crate::memory::{BufferName, GpuMemory, MemoryBridge};
use bitflags::bitflags;
use log::debug;
use std::fmt;
use std::sync::Arc;

/// Most buffer slots a surface can own.
pub const MAX_BUFFERS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub u64);

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "surface#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceKind {
    Window,
    Pbuffer,
    Pixmap,
}

bitflags! {
    /// Capabilities chosen by the backend at creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SurfaceCaps: u32 {
        const DIRECT_RENDERING = 1 << 0;
        const WRITEBACK_CONVERSION = 1 << 1;
    }
}

bitflags! {
    /// Surface kinds and extensions a config supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SurfaceTypeFlags: u32 {
        const WINDOW = 1 << 0;
        const PBUFFER = 1 << 1;
        const PIXMAP = 1 << 2;
        const LOCK_SURFACE = 1 << 3;
        const OPTIMAL_FORMAT = 1 << 4;
    }
}

impl SurfaceTypeFlags {
    pub fn for_kind(kind: SurfaceKind) -> Self {
        match kind {
            SurfaceKind::Window => SurfaceTypeFlags::WINDOW,
            SurfaceKind::Pbuffer => SurfaceTypeFlags::PBUFFER,
            SurfaceKind::Pixmap => SurfaceTypeFlags::PIXMAP,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderBuffer {
    #[default]
    Back,
    Single,
}

/// Exact channel layouts a lockable config may demand of the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchFormat {
    /// R5 G6 B5, MSB to LSB
    Rgb565Exact,
    /// A1 R5 G5 B5, MSB to LSB
    Rgb565,
    /// B, G, R, A byte order
    Rgba8888Exact,
    /// A, R, G, B byte order
    Rgba8888,
}

impl MatchFormat {
    pub fn matches(&self, display: &PixelFormat) -> bool {
        let layout = |r: (u32, u32), g: (u32, u32), b: (u32, u32)| {
            (display.red.length, display.red.offset) == r
                && (display.green.length, display.green.offset) == g
                && (display.blue.length, display.blue.offset) == b
        };
        match self {
            MatchFormat::Rgb565Exact => layout((5, 11), (6, 5), (5, 0)),
            MatchFormat::Rgb565 => layout((5, 10), (5, 5), (5, 0)),
            MatchFormat::Rgba8888Exact => layout((8, 8), (8, 16), (8, 24)),
            MatchFormat::Rgba8888 => layout((8, 16), (8, 8), (8, 0)),
        }
    }
}

/// Frame-buffer configuration a surface is created against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceConfig {
    pub format: PixelFormat,
    pub surface_type: SurfaceTypeFlags,
    pub render_buffer: RenderBuffer,
    pub match_format: Option<MatchFormat>,
}

impl SurfaceConfig {
    pub fn new(format: PixelFormat) -> Self {
        Self {
            format,
            surface_type: SurfaceTypeFlags::WINDOW | SurfaceTypeFlags::PBUFFER | SurfaceTypeFlags::PIXMAP,
            render_buffer: RenderBuffer::Back,
            match_format: None,
        }
    }

    pub fn rgb565() -> Self {
        Self::new(PixelFormat::RGB565)
    }

    pub fn argb8888() -> Self {
        Self::new(PixelFormat::ARGB8888)
    }

    /// Window config that also supports the lock-surface extension.
    pub fn lockable(format: PixelFormat, match_format: MatchFormat) -> Self {
        let mut config = Self::new(format);
        config.surface_type |= SurfaceTypeFlags::LOCK_SURFACE;
        config.match_format = Some(match_format);
        if crate::lock_surface::is_optimal_format(&format) {
            config.surface_type |= SurfaceTypeFlags::OPTIMAL_FORMAT;
        }
        config
    }

    pub fn is_lockable(&self) -> bool {
        self.surface_type.contains(SurfaceTypeFlags::LOCK_SURFACE)
    }

    /// Colour channel sizes differ from `display`, so the GPU must convert on write-back.
    pub fn needs_conversion(&self, display: &PixelFormat) -> bool {
        self.format.red.length != display.red.length
            || self.format.green.length != display.green.length
            || self.format.blue.length != display.blue.length
    }
}

/// Presentation mode picked by the compositor backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Presentation {
    /// Each frame is flushed as soon as it is drawn
    #[default]
    Immediate,
    /// Frames are deferred behind a stable buffer sequence
    Pipelined,
}

#[derive(Clone)]
struct LockHook {
    bridge: Arc<MemoryBridge>,
    locks: Arc<LockCoordinator>,
}

/// GPU-addressable memory one buffer slot renders into.
pub struct RenderTarget {
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub pitch: u32,
    pub format: PixelFormat,
    memory: GpuMemory,
    hook: Option<LockHook>,
    jobs: Arc<JobTracker>,
}

impl RenderTarget {
    pub fn new(width: u32, height: u32, pitch: u32, format: PixelFormat, memory: GpuMemory) -> Self {
        Self {
            width,
            height,
            pitch,
            format,
            memory,
            hook: None,
            jobs: JobTracker::new(),
        }
    }

    /// Allocate private memory for a `width` x `height` target.
    pub fn private(bridge: &MemoryBridge, width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        let too_large = || {
            SwapchainError::AllocationFailure(format!("{}x{} {} target too large", width, height, format))
        };
        let pitch = u32::try_from(format.bytes_per_pixel())
            .ok()
            .and_then(|bpp| width.checked_mul(bpp))
            .ok_or_else(too_large)?;
        let size = (pitch as usize)
            .checked_mul(height.max(1) as usize)
            .ok_or_else(too_large)?;
        let memory = bridge.allocate_private(size)?;
        Ok(Self::new(width, height, pitch, format, memory))
    }

    /// Forward buffer events to the lock coordinator.
    pub fn with_lock_events(mut self, bridge: Arc<MemoryBridge>, locks: Arc<LockCoordinator>) -> Self {
        self.hook = Some(LockHook { bridge, locks });
        self
    }

    pub fn memory(&self) -> &GpuMemory {
        &self.memory
    }

    /// Jobs currently writing this target.
    pub fn jobs(&self) -> &Arc<JobTracker> {
        &self.jobs
    }

    /// Shareable name of the backing memory, if it has one.
    pub fn buffer_name(&self) -> Option<BufferName> {
        let hook = self.hook.as_ref()?;
        let handle = hook.bridge.get_handle_from_gpu_memory(&self.memory)?;
        hook.bridge.get_name_from_handle(&handle).ok()
    }

    /// Report a state transition. Targets without a shareable name have
    /// nothing to arbitrate.
    pub fn notify(&self, event: SurfaceEvent) {
        let Some(hook) = &self.hook else {
            return;
        };
        let Some(handle) = hook.bridge.get_handle_from_gpu_memory(&self.memory) else {
            return;
        };
        let Ok(name) = hook.bridge.get_name_from_handle(&handle) else {
            return;
        };
        hook.locks.dispatch(event, name);
    }

    /// Bracket sampling this target as a texture.
    pub fn begin_gpu_read(&self) {
        self.notify(SurfaceEvent::GpuRead);
    }

    pub fn end_gpu_read(&self) {
        self.notify(SurfaceEvent::GpuReadDone);
    }

    pub fn byte_len(&self) -> usize {
        self.pitch as usize * self.height as usize
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let len = self.byte_len().min(self.memory.len());
        self.memory.with_bytes(|bytes| f(&mut bytes[..len]))
    }

    pub fn fill(&self, value: u8) {
        self.with_bytes(|bytes| bytes.fill(value));
    }
}

impl fmt::Debug for RenderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderTarget")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pitch", &self.pitch)
            .field("format", &self.format)
            .finish()
    }
}

/// One render target in a surface's swap chain.
#[derive(Debug, Clone)]
pub struct BufferSlot {
    pub id: usize,
    pub render_target: Option<Arc<RenderTarget>>,
}

/// Backend-visible surface state.
#[derive(Debug)]
pub struct SurfaceState {
    pub id: SurfaceId,
    pub kind: SurfaceKind,
    pub config: SurfaceConfig,
    pub width: u32,
    pub height: u32,
    pub caps: SurfaceCaps,
    slots: Vec<BufferSlot>,
    current_buffer: usize,
    pub presentation: Presentation,
    /// A rebuild is pending before the next frame
    pub force_resize: bool,
}

impl SurfaceState {
    pub fn new(id: SurfaceId, kind: SurfaceKind, config: SurfaceConfig) -> Self {
        Self {
            id,
            kind,
            config,
            width: 0,
            height: 0,
            caps: SurfaceCaps::empty(),
            slots: Vec::new(),
            current_buffer: 0,
            presentation: Presentation::Immediate,
            force_resize: false,
        }
    }

    pub fn num_buffers(&self) -> usize {
        self.slots.len()
    }

    pub fn current_buffer(&self) -> usize {
        self.current_buffer
    }

    pub fn slots(&self) -> &[BufferSlot] {
        &self.slots
    }

    /// Replace every slot. Old targets are dropped once no frame holds them.
    pub fn set_targets(&mut self, targets: Vec<Option<Arc<RenderTarget>>>) -> Result<()> {
        if targets.len() > MAX_BUFFERS {
            return Err(SwapchainError::AllocationFailure(format!(
                "{} buffers requested, at most {} supported",
                targets.len(),
                MAX_BUFFERS
            )));
        }
        self.slots = targets
            .into_iter()
            .enumerate()
            .map(|(id, render_target)| BufferSlot { id, render_target })
            .collect();
        self.current_buffer = 0;
        debug!("{}: {} buffer slot(s)", self.id, self.slots.len());
        Ok(())
    }

    pub fn set_slot(&mut self, index: usize, target: Option<Arc<RenderTarget>>) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.render_target = target;
        }
    }

    pub fn clear_slots(&mut self) {
        for slot in &mut self.slots {
            slot.render_target = None;
        }
        self.current_buffer = 0;
    }

    pub fn set_current(&mut self, index: usize) {
        if index < self.slots.len() {
            self.current_buffer = index;
        }
    }

    /// Move to the next slot in rotation.
    pub fn advance(&mut self) {
        if !self.slots.is_empty() {
            self.current_buffer = (self.current_buffer + 1) % self.slots.len();
        }
    }

    pub fn target(&self, index: usize) -> Option<&Arc<RenderTarget>> {
        self.slots.get(index).and_then(|s| s.render_target.as_ref())
    }

    pub fn current_target(&self) -> Option<&Arc<RenderTarget>> {
        self.target(self.current_buffer)
    }

    pub fn populated_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.render_target.is_some()).count()
    }

    pub fn first_empty_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.render_target.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStrategy;

    fn target(bridge: &MemoryBridge) -> Arc<RenderTarget> {
        Arc::new(RenderTarget::private(bridge, 4, 4, PixelFormat::RGB565).unwrap())
    }

    #[test]
    fn test_private_target_rejects_overflowing_pitch() {
        let bridge = MemoryBridge::with_strategy(MemoryStrategy::SecureId);
        let result = RenderTarget::private(&bridge, u32::MAX / 2 + 7, 1, PixelFormat::RGB565);
        assert!(matches!(result, Err(SwapchainError::AllocationFailure(_))));
        let result = RenderTarget::private(&bridge, u32::MAX / 4 + 1, 1, PixelFormat::ARGB8888);
        assert!(matches!(result, Err(SwapchainError::AllocationFailure(_))));
    }

    #[test]
    fn test_slot_rotation_keeps_index_in_range() {
        let bridge = MemoryBridge::with_strategy(MemoryStrategy::SecureId);
        let mut state = SurfaceState::new(SurfaceId(1), SurfaceKind::Window, SurfaceConfig::rgb565());
        state.advance();
        assert_eq!(state.current_buffer(), 0);

        state
            .set_targets(vec![Some(target(&bridge)), Some(target(&bridge)), None])
            .unwrap();
        for _ in 0..7 {
            state.advance();
            assert!(state.current_buffer() < state.num_buffers());
        }
        assert_eq!(state.current_buffer(), 1);
        assert_eq!(state.populated_slots(), 2);
        assert_eq!(state.first_empty_slot(), Some(2));

        state.set_current(9);
        assert_eq!(state.current_buffer(), 1);
    }

    #[test]
    fn test_too_many_slots_rejected() {
        let mut state = SurfaceState::new(SurfaceId(1), SurfaceKind::Window, SurfaceConfig::rgb565());
        assert!(state.set_targets(vec![None; MAX_BUFFERS + 1]).is_err());
        assert_eq!(state.num_buffers(), 0);
    }

    #[test]
    fn test_match_formats() {
        assert!(MatchFormat::Rgb565Exact.matches(&PixelFormat::RGB565));
        assert!(!MatchFormat::Rgb565Exact.matches(&PixelFormat::ARGB1555));
        assert!(MatchFormat::Rgb565.matches(&PixelFormat::ARGB1555));
        assert!(MatchFormat::Rgba8888.matches(&PixelFormat::ARGB8888));
        assert!(MatchFormat::Rgba8888Exact.matches(&PixelFormat::BGRA8888));
    }

    #[test]
    fn test_needs_conversion() {
        let config = SurfaceConfig::argb8888();
        assert!(config.needs_conversion(&PixelFormat::RGB565));
        assert!(!config.needs_conversion(&PixelFormat::ABGR8888));
    }

    #[test]
    fn test_private_target_has_no_name() {
        let bridge = MemoryBridge::with_strategy(MemoryStrategy::SecureId);
        let t = RenderTarget::private(&bridge, 8, 2, PixelFormat::ARGB8888).unwrap();
        assert_eq!(t.pitch, 32);
        assert_eq!(t.byte_len(), 64);
        assert_eq!(t.buffer_name(), None);
        t.fill(0xAB);
        assert!(t.with_bytes(|b| b.iter().all(|&v| v == 0xAB)));
    }
}
