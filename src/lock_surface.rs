//! Lock-surface extension
//!
//! Gives the CPU a raw pointer into a surface's back buffer.
//!
//! ```text
//!   Unlocked ──lock──▶ Locked ──map──▶ Mapped ──unmap──▶ Locked
//!      ▲                  │               │
//!      └──────unlock──────┴────unlock─────┘   (unlock unmaps first)
//! ```
//!
//! `map` is idempotent while mapped: repeated calls hand back the same
//! pointer and pitch. Every map fires a `CpuAccess` lock event on the mapped
//! buffer, every unmap the matching `CpuAccessDone`.

use crate::backend::SwapChain;
use crate::error::{Result, SwapchainError};
use crate::format::PixelFormat;
use crate::lock::SurfaceEvent;
use crate::surface::{RenderTarget, SurfaceConfig, SurfaceState};
use bitflags::bitflags;
use log::debug;
use std::ptr::NonNull;
use std::sync::Arc;

bitflags! {
    /// How the client intends to touch mapped pixels.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LockUsageHint: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// Attribute keys accepted by [`LockAttributes::from_pairs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttribute {
    PreservePixels,
    UsageHint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockAttributes {
    pub preserve_pixels: bool,
    pub usage_hint: LockUsageHint,
}

impl Default for LockAttributes {
    fn default() -> Self {
        Self {
            preserve_pixels: false,
            usage_hint: LockUsageHint::READ | LockUsageHint::WRITE,
        }
    }
}

impl LockAttributes {
    /// Build from raw attribute/value pairs, rejecting out-of-range values.
    pub fn from_pairs(pairs: &[(LockAttribute, u32)]) -> Result<Self> {
        let mut attrs = Self::default();
        for &(attribute, value) in pairs {
            match attribute {
                LockAttribute::PreservePixels => {
                    attrs.preserve_pixels = match value {
                        0 => false,
                        1 => true,
                        _ => {
                            return Err(SwapchainError::BadAttribute(format!(
                                "preserve pixels must be 0 or 1, got {}",
                                value
                            )))
                        }
                    };
                }
                LockAttribute::UsageHint => {
                    attrs.usage_hint = LockUsageHint::from_bits(value)
                        .filter(|hint| !hint.is_empty())
                        .ok_or_else(|| {
                            SwapchainError::BadAttribute(format!("usage hint {:#x}", value))
                        })?;
                }
            }
        }
        Ok(attrs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockState {
    #[default]
    Unlocked,
    Locked,
    Mapped,
}

impl LockState {
    pub fn as_raw(&self) -> i64 {
        match self {
            LockState::Unlocked => 0,
            LockState::Locked => 1,
            LockState::Mapped => 2,
        }
    }
}

/// CPU view of a mapped back buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedBuffer {
    ptr: NonNull<u8>,
    pitch: u32,
    len: usize,
}

// The pointer targets a mapping that outlives the map/unmap window and is
// only written by the thread holding the lock.
unsafe impl Send for MappedBuffer {}
unsafe impl Sync for MappedBuffer {}

impl MappedBuffer {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Bytes per row.
    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Formats the CPU can write without swizzling.
pub fn is_optimal_format(format: &PixelFormat) -> bool {
    let offsets = (format.red.offset, format.green.offset, format.blue.offset);
    match format.bits_per_pixel {
        16 => format.channel_sizes()[..3] == [5, 6, 5] && offsets == (11, 5, 0),
        32 => format.channel_sizes()[..3] == [8, 8, 8] && offsets == (8, 16, 24),
        _ => false,
    }
}

fn copy_target(src: &RenderTarget, dst: &RenderTarget) {
    let len = src.byte_len().min(dst.byte_len());
    let (from, to) = (src.memory(), dst.memory());
    if Arc::ptr_eq(from.region(), to.region()) {
        let (src_at, dst_at) = (from.offset(), to.offset());
        from.region()
            .with_bytes(|bytes| bytes.copy_within(src_at..src_at + len, dst_at));
    } else {
        src.with_bytes(|s| dst.with_bytes(|d| d[..len].copy_from_slice(&s[..len])));
    }
}

/// Map the current slot, bringing the previous slot's pixels forward once
/// per frame when asked to preserve.
pub(crate) fn map_current_slot(
    state: &mut SurfaceState,
    preserve: bool,
    copied: &mut bool,
) -> Result<Arc<RenderTarget>> {
    let target = state
        .current_target()
        .cloned()
        .ok_or(SwapchainError::AccessDenied("no buffer to map"))?;
    if preserve && !*copied {
        let n = state.num_buffers();
        if n > 1 {
            let previous = (state.current_buffer() + n - 1) % n;
            if let Some(source) = state.target(previous) {
                if !Arc::ptr_eq(source, &target) {
                    copy_target(source, &target);
                    debug!("{}: preserved slot {} into back buffer", state.id, previous);
                }
            }
        }
        *copied = true;
    }
    Ok(target)
}

/// Lock bookkeeping for one surface.
#[derive(Debug, Default)]
pub struct LockSurfaceState {
    attrs: LockAttributes,
    state: LockState,
    mapping: Option<MappedBuffer>,
    mapped_target: Option<Arc<RenderTarget>>,
    previous_frame_copied: bool,
}

impl LockSurfaceState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn attributes(&self) -> LockAttributes {
        self.attrs
    }

    pub fn is_locked(&self) -> bool {
        self.state != LockState::Unlocked
    }

    pub fn lock(
        &mut self,
        config: &SurfaceConfig,
        attrs: LockAttributes,
        current: bool,
        bound: bool,
    ) -> Result<()> {
        if !config.is_lockable() {
            return Err(SwapchainError::AccessDenied("surface config is not lockable"));
        }
        if self.state != LockState::Unlocked {
            return Err(SwapchainError::AccessDenied("surface already locked"));
        }
        if current {
            return Err(SwapchainError::AccessDenied("surface is current to a client API"));
        }
        if bound {
            return Err(SwapchainError::AccessDenied("surface is bound as a texture"));
        }
        self.attrs = attrs;
        self.state = LockState::Locked;
        Ok(())
    }

    pub fn map(
        &mut self,
        backend: &mut dyn SwapChain,
        surface: &mut SurfaceState,
        preserve: bool,
    ) -> Result<MappedBuffer> {
        match (self.state, self.mapping) {
            (LockState::Unlocked, _) => return Err(SwapchainError::AccessDenied("surface not locked")),
            (LockState::Mapped, Some(mapping)) => return Ok(mapping),
            _ => {}
        }

        let preserve = preserve || self.attrs.preserve_pixels;
        let target = backend.map_lock_buffer(surface, preserve, &mut self.previous_frame_copied)?;
        let ptr = NonNull::new(target.memory().as_mut_ptr())
            .ok_or(SwapchainError::AccessDenied("back buffer has no mapping"))?;
        target.notify(SurfaceEvent::CpuAccess);

        let mapping = MappedBuffer {
            ptr,
            pitch: target.pitch,
            len: target.byte_len().min(target.memory().len()),
        };
        debug!("{}: mapped {} bytes, pitch {}", surface.id, mapping.len, mapping.pitch);
        self.mapping = Some(mapping);
        self.mapped_target = Some(target);
        self.state = LockState::Mapped;
        Ok(mapping)
    }

    pub fn unmap(&mut self, backend: &mut dyn SwapChain, surface: &mut SurfaceState) {
        if self.state != LockState::Mapped {
            return;
        }
        if let Some(target) = self.mapped_target.take() {
            target.notify(SurfaceEvent::CpuAccessDone);
        }
        backend.unmap_lock_buffer(surface);
        self.mapping = None;
        self.state = LockState::Locked;
    }

    pub fn unlock(&mut self, backend: &mut dyn SwapChain, surface: &mut SurfaceState) -> Result<()> {
        if self.state == LockState::Unlocked {
            return Err(SwapchainError::AccessDenied("surface not locked"));
        }
        self.unmap(backend, surface);
        self.state = LockState::Unlocked;
        Ok(())
    }

    /// A locked surface cannot be presented.
    pub fn check_present(&self) -> Result<()> {
        if self.is_locked() {
            return Err(SwapchainError::AccessDenied("surface is locked"));
        }
        Ok(())
    }

    /// Preserved pixels must be copied again for the next frame.
    pub fn frame_presented(&mut self) {
        self.previous_frame_copied = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendContext, PbufferSwapChain};
    use crate::lock::LockCoordinator;
    use crate::memory::{MemoryBridge, MemoryStrategy};
    use crate::surface::{MatchFormat, SurfaceId, SurfaceKind};

    fn lockable_pbuffer() -> (PbufferSwapChain, SurfaceState) {
        let ctx = BackendContext::new(
            Arc::new(MemoryBridge::with_strategy(MemoryStrategy::SecureId)),
            Arc::new(LockCoordinator::unarbitrated()),
        );
        let mut chain = PbufferSwapChain::new(ctx, 4, 4);
        let config = SurfaceConfig::lockable(PixelFormat::RGB565, MatchFormat::Rgb565Exact);
        let mut state = SurfaceState::new(SurfaceId(1), SurfaceKind::Pbuffer, config);
        chain.create(&mut state).unwrap();
        (chain, state)
    }

    #[test]
    fn test_attribute_validation() {
        let attrs = LockAttributes::from_pairs(&[
            (LockAttribute::PreservePixels, 1),
            (LockAttribute::UsageHint, LockUsageHint::WRITE.bits()),
        ])
        .unwrap();
        assert!(attrs.preserve_pixels);
        assert_eq!(attrs.usage_hint, LockUsageHint::WRITE);

        assert!(LockAttributes::from_pairs(&[(LockAttribute::PreservePixels, 2)]).is_err());
        assert!(LockAttributes::from_pairs(&[(LockAttribute::UsageHint, 0)]).is_err());
        assert!(LockAttributes::from_pairs(&[(LockAttribute::UsageHint, 4)]).is_err());
    }

    #[test]
    fn test_map_requires_lock_and_is_idempotent() {
        let (mut chain, mut surface) = lockable_pbuffer();
        let mut lock = LockSurfaceState::new();
        assert!(lock.map(&mut chain, &mut surface, false).is_err());

        lock.lock(&surface.config, LockAttributes::default(), false, false)
            .unwrap();
        let first = lock.map(&mut chain, &mut surface, false).unwrap();
        let second = lock.map(&mut chain, &mut surface, false).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.pitch(), 8);
        assert_eq!(lock.state(), LockState::Mapped);

        lock.unlock(&mut chain, &mut surface).unwrap();
        assert_eq!(lock.state(), LockState::Unlocked);
        assert!(lock.unlock(&mut chain, &mut surface).is_err());
    }

    #[test]
    fn test_lock_refusals_leave_state_unchanged() {
        let (_chain, surface) = lockable_pbuffer();
        let mut lock = LockSurfaceState::new();
        assert!(lock.lock(&surface.config, LockAttributes::default(), true, false).is_err());
        assert!(lock.lock(&surface.config, LockAttributes::default(), false, true).is_err());
        assert_eq!(lock.state(), LockState::Unlocked);

        lock.lock(&surface.config, LockAttributes::default(), false, false)
            .unwrap();
        let again = lock.lock(&surface.config, LockAttributes::default(), false, false);
        assert!(matches!(again, Err(SwapchainError::AccessDenied(_))));
        assert_eq!(lock.state(), LockState::Locked);
        assert!(lock.check_present().is_err());
    }

    #[test]
    fn test_unlockable_config_denied() {
        let mut lock = LockSurfaceState::new();
        let err = lock
            .lock(&SurfaceConfig::rgb565(), LockAttributes::default(), false, false)
            .unwrap_err();
        assert!(matches!(err, SwapchainError::AccessDenied(_)));
    }

    #[test]
    fn test_optimal_formats() {
        assert!(is_optimal_format(&PixelFormat::RGB565));
        assert!(is_optimal_format(&PixelFormat::BGRA8888));
        assert!(!is_optimal_format(&PixelFormat::ARGB8888));
        assert!(!is_optimal_format(&PixelFormat::ARGB1555));
    }
}
