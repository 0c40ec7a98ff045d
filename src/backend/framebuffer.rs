//! Raw framebuffer backend
//!
//! A [`FramebufferDisplay`] is opened once per device and shared by every
//! surface on it. At creation each window surface picks the cheapest mode
//! the display allows:
//!
//! ```text
//!   back-buffered, >= 2 virtual pages, fits ──▶ DirectMulti   (render into pages, pan-flip)
//!   single-buffered, format matches, fits  ──▶ DirectSingle  (render into page 0)
//!   anything else                          ──▶ Blit          (private target, copy/convert on present)
//! ```
//!
//! Slot `i` of a direct surface renders into page `(i + 1) % n`, so the
//! slot being drawn is never the page being scanned out.
//!
//! Lockable surfaces get their own two modes: page flipping between pages 0
//! and 1 when two pages exist, otherwise a private staging buffer copied to
//! page 0 on every present.

use super::vsync::VsyncTicker;
use super::{BackendContext, BackendKind, SwapChain};
use crate::config::{FramebufferConfig, Orientation, WindowPlacement};
use crate::convert::{self, Plane};
use crate::error::{Result, SwapchainError};
use crate::format::PixelFormat;
use crate::memory::{GpuMemory, Region};
use crate::native::{FramebufferDevice, LinuxFramebuffer, VarScreenInfo};
use crate::surface::{RenderBuffer, RenderTarget, SurfaceCaps, SurfaceState};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// Window offsets snap down to this many pixels.
const WINDOW_ALIGN: u32 = 64;

fn align_down(value: u32) -> u32 {
    value & !(WINDOW_ALIGN - 1)
}

/// An opened framebuffer with its scanout memory mapped.
pub struct FramebufferDisplay {
    device: Mutex<Box<dyn FramebufferDevice>>,
    var: Mutex<VarScreenInfo>,
    line_length: u32,
    scanout: Arc<Region>,
    num_buffers: usize,
    x_ofs: u32,
    y_ofs: u32,
    orientation: Orientation,
    single_buffer: bool,
    vsync: Option<VsyncTicker>,
}

impl FramebufferDisplay {
    /// Open the configured device node.
    pub fn open(config: &FramebufferConfig) -> Result<Self> {
        let device = LinuxFramebuffer::open(&config.device)?;
        Self::new(Box::new(device), config)
    }

    pub fn new(mut device: Box<dyn FramebufferDevice>, config: &FramebufferConfig) -> Result<Self> {
        let var = device.var_screen_info()?;
        let fix = device.fix_screen_info()?;
        if var.xres == 0 || var.yres == 0 || fix.line_length == 0 {
            return Err(SwapchainError::BadConfig(format!(
                "framebuffer reports {}x{} with line length {}",
                var.xres, var.yres, fix.line_length
            )));
        }

        let page_len = fix.line_length as usize * var.yres as usize;
        let fitting = fix.smem_len as usize / page_len;
        if fitting == 0 {
            return Err(SwapchainError::BadConfig(format!(
                "framebuffer memory of {} bytes holds no {}x{} page",
                fix.smem_len, var.xres, var.yres
            )));
        }
        let num_buffers = config
            .window_buffers()
            .min(var.virtual_pages() as usize)
            .min(fitting)
            .max(1);

        let scanout = device.map_scanout(fix.smem_len as usize)?;

        let (mut x_ofs, mut y_ofs, mut orientation) = (0, 0, Orientation::Rotate0);
        match config.placement() {
            Some(WindowPlacement::Quadrant(q)) => {
                x_ofs = align_down((q % 2) * (var.xres / 2));
                y_ofs = align_down((q / 2) * (var.yres / 2));
            }
            Some(WindowPlacement::Rotation(o)) => orientation = o,
            None => {}
        }

        if !config.no_clear {
            scanout.with_bytes(|bytes| bytes.fill(0));
        }

        let vsync = if config.vsync_hz > 0 {
            Some(VsyncTicker::start(config.vsync_hz)?)
        } else {
            None
        };

        info!(
            "🖥️ Framebuffer {}x{} {}bpp, {} page(s), {} direct buffer(s)",
            var.xres,
            var.yres,
            var.bits_per_pixel,
            var.virtual_pages(),
            num_buffers
        );

        Ok(Self {
            device: Mutex::new(device),
            var: Mutex::new(var),
            line_length: fix.line_length,
            scanout,
            num_buffers,
            x_ofs,
            y_ofs,
            orientation,
            single_buffer: config.single_buffer,
            vsync,
        })
    }

    pub fn format(&self) -> PixelFormat {
        self.var.lock().format()
    }

    pub fn resolution(&self) -> (u32, u32) {
        let var = self.var.lock();
        (var.xres, var.yres)
    }

    pub fn line_length(&self) -> u32 {
        self.line_length
    }

    /// Pages available for direct rendering.
    pub fn num_buffers(&self) -> usize {
        self.num_buffers
    }

    pub fn window_offset(&self) -> (u32, u32) {
        (self.x_ofs, self.y_ofs)
    }

    /// Largest window that fits at the window offset.
    pub fn area(&self) -> (u32, u32) {
        let (xres, yres) = self.resolution();
        (xres - self.x_ofs, yres - self.y_ofs)
    }

    pub fn orientation(&self) -> Orientation {
        self.orientation
    }

    pub fn single_buffer(&self) -> bool {
        self.single_buffer
    }

    pub fn yoffset(&self) -> u32 {
        self.var.lock().yoffset
    }

    fn page_len(&self) -> usize {
        let (_, yres) = self.resolution();
        self.line_length as usize * yres as usize
    }

    fn window_byte_offset(&self) -> usize {
        self.y_ofs as usize * self.line_length as usize
            + self.x_ofs as usize * self.format().bytes_per_pixel()
    }

    fn page_memory(&self, page: usize) -> Result<GpuMemory> {
        let start = page * self.page_len() + self.window_byte_offset();
        GpuMemory::from_region(
            Arc::clone(&self.scanout),
            start,
            self.page_len() - self.window_byte_offset(),
        )
    }

    /// Render target drawing straight into scanout page `page`.
    fn page_target(&self, page: usize, width: u32, height: u32) -> Result<Arc<RenderTarget>> {
        let memory = self.page_memory(page)?;
        Ok(Arc::new(RenderTarget::new(
            width,
            height,
            self.line_length,
            self.format(),
            memory,
        )))
    }

    /// Scan out from `yoffset`.
    pub fn pan_to(&self, yoffset: u32) -> Result<()> {
        let mut var = self.var.lock();
        let mut request = *var;
        request.yoffset = yoffset;
        self.device
            .lock()
            .pan_display(&request)
            .map_err(|e| SwapchainError::PlatformRejection(format!("pan to {}: {}", yoffset, e)))?;
        var.yoffset = yoffset;
        debug!("panned to yoffset {}", yoffset);
        Ok(())
    }

    pub fn wait_vsync(&self, interval: u32) {
        if let Some(vsync) = &self.vsync {
            vsync.wait(interval);
        }
    }

    /// Copy a whole page onto another.
    fn copy_page(&self, from: usize, to: usize) {
        let len = self.page_len();
        self.scanout
            .with_bytes(|bytes| bytes.copy_within(from * len..(from + 1) * len, to * len));
    }

    /// Zero a rectangle of a page, in window coordinates.
    fn clear_rect(&self, page: usize, x: u32, y: u32, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        let bpp = self.format().bytes_per_pixel();
        let line = self.line_length as usize;
        let base = page * self.page_len() + self.window_byte_offset();
        self.scanout.with_bytes(|bytes| {
            for row in y..y + height {
                let start = base + row as usize * line + x as usize * bpp;
                bytes[start..start + width as usize * bpp].fill(0);
            }
        });
    }

    /// Copy a private target onto page 0 at the window offset, converting
    /// when the layouts differ. The copy is clamped to the visible area.
    fn blit(&self, target: &RenderTarget) -> Result<()> {
        let (area_w, area_h) = self.area();
        let width = target.width.min(area_w) as usize;
        let height = target.height.min(area_h) as usize;
        let dst_plane = Plane {
            format: self.format(),
            pitch: self.line_length as usize,
        };
        let src_plane = Plane {
            format: target.format,
            pitch: target.pitch as usize,
        };
        let offset = self.window_byte_offset();
        self.scanout.with_bytes(|scanout| {
            target.with_bytes(|src| {
                convert::convert(src, src_plane, &mut scanout[offset..], dst_plane, width, height)
            })
        })
    }
}

/// How a framebuffer surface reaches the screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferMode {
    DirectMulti,
    DirectSingle,
    Blit,
    /// Lockable, flipping between pages 0 and 1
    LockablePages,
    /// Lockable, private staging buffer copied to page 0
    LockableStaging,
}

pub struct FramebufferSwapChain {
    ctx: BackendContext,
    display: Arc<FramebufferDisplay>,
    width: u32,
    height: u32,
    render_buffer: RenderBuffer,
    mode: FramebufferMode,
    /// Page on screen, lockable page flipping only
    visible: usize,
}

impl std::fmt::Debug for FramebufferSwapChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramebufferSwapChain")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("render_buffer", &self.render_buffer)
            .field("mode", &self.mode)
            .field("visible", &self.visible)
            .finish_non_exhaustive()
    }
}

impl FramebufferSwapChain {
    pub fn new(
        ctx: BackendContext,
        display: Arc<FramebufferDisplay>,
        width: u32,
        height: u32,
        render_buffer: RenderBuffer,
    ) -> Self {
        Self {
            ctx,
            display,
            width,
            height,
            render_buffer,
            mode: FramebufferMode::Blit,
            visible: 0,
        }
    }

    pub fn mode(&self) -> FramebufferMode {
        self.mode
    }

    fn choose_mode(&self, state: &SurfaceState) -> Result<FramebufferMode> {
        let display_format = self.display.format();
        let single = self.render_buffer == RenderBuffer::Single || self.display.single_buffer();

        if state.config.is_lockable() {
            let matches = match state.config.match_format {
                Some(wanted) => wanted.matches(&display_format),
                None => state.config.format.same_color_layout(&display_format),
            };
            if !matches {
                return Err(SwapchainError::BadConfig(format!(
                    "lockable config does not match display format {}",
                    display_format
                )));
            }
            return Ok(if single || self.display.num_buffers() < 2 {
                FramebufferMode::LockableStaging
            } else {
                FramebufferMode::LockablePages
            });
        }

        let (area_w, area_h) = self.display.area();
        let fits = self.width <= area_w && self.height <= area_h;
        let direct_format = state.config.format.same_color_layout(&display_format)
            || state.caps.contains(SurfaceCaps::WRITEBACK_CONVERSION);

        Ok(if !single && self.display.num_buffers() >= 2 && fits && direct_format {
            FramebufferMode::DirectMulti
        } else if single && fits && direct_format {
            FramebufferMode::DirectSingle
        } else {
            FramebufferMode::Blit
        })
    }

    fn pages(&self) -> Vec<usize> {
        match self.mode {
            FramebufferMode::DirectMulti => (0..self.display.num_buffers()).collect(),
            FramebufferMode::DirectSingle => vec![0],
            FramebufferMode::LockablePages => vec![0, 1],
            FramebufferMode::Blit | FramebufferMode::LockableStaging => Vec::new(),
        }
    }

    fn build(
        &self,
        state: &SurfaceState,
        mode: FramebufferMode,
        width: u32,
        height: u32,
    ) -> Result<Vec<Option<Arc<RenderTarget>>>> {
        let display = &self.display;
        match mode {
            FramebufferMode::DirectMulti => {
                let n = display.num_buffers();
                (0..n)
                    .map(|slot| display.page_target((slot + 1) % n, width, height).map(Some))
                    .collect()
            }
            FramebufferMode::DirectSingle => Ok(vec![Some(display.page_target(0, width, height)?)]),
            FramebufferMode::LockablePages => Ok(vec![
                Some(display.page_target(0, width, height)?),
                Some(display.page_target(1, width, height)?),
            ]),
            FramebufferMode::Blit | FramebufferMode::LockableStaging => {
                let target = RenderTarget::private(&self.ctx.bridge, width, height, state.config.format)?;
                Ok(vec![Some(Arc::new(target))])
            }
        }
    }

    fn is_private(mode: FramebufferMode) -> bool {
        matches!(mode, FramebufferMode::Blit | FramebufferMode::LockableStaging)
    }

    fn geometry(&self, mode: FramebufferMode, width: u32, height: u32) -> (u32, u32) {
        if Self::is_private(mode) {
            (width.max(1), height.max(1))
        } else {
            let (area_w, area_h) = self.display.area();
            (width.clamp(1, area_w), height.clamp(1, area_h))
        }
    }

    fn blit_current(&self, state: &SurfaceState) -> Result<()> {
        if self.display.yoffset() != 0 {
            self.display.pan_to(0)?;
        }
        let target = state
            .current_target()
            .ok_or_else(|| SwapchainError::AllocationFailure("no blit source".into()))?;
        self.display.blit(target)
    }
}

impl SwapChain for FramebufferSwapChain {
    fn kind(&self) -> BackendKind {
        BackendKind::Framebuffer
    }

    fn create(&mut self, state: &mut SurfaceState) -> Result<()> {
        let display_format = self.display.format();
        let mut caps = SurfaceCaps::empty();
        if state.config.needs_conversion(&display_format) {
            if PixelFormat::matching_display_format(&display_format).is_none() {
                return Err(SwapchainError::BadConfig(format!(
                    "no renderable format matches display {}",
                    display_format
                )));
            }
            caps |= SurfaceCaps::WRITEBACK_CONVERSION;
        }
        state.caps = caps;

        let mode = self.choose_mode(state)?;
        let (width, height) = self.geometry(mode, self.width, self.height);
        let targets = self.build(state, mode, width, height)?;

        if mode == FramebufferMode::DirectMulti {
            self.display.pan_to(0)?;
        }
        state.set_targets(targets)?;

        match mode {
            FramebufferMode::DirectMulti | FramebufferMode::DirectSingle => {
                state.caps |= SurfaceCaps::DIRECT_RENDERING;
            }
            FramebufferMode::LockablePages => {
                self.visible = if self.display.yoffset() == 0 { 0 } else { 1 };
                state.set_current(1 - self.visible);
                state.caps |= SurfaceCaps::DIRECT_RENDERING;
            }
            FramebufferMode::Blit => {
                warn!(
                    "⚠️ {}: {}x{} window cannot render directly, using blit",
                    state.id, self.width, self.height
                );
                state.caps = SurfaceCaps::empty();
            }
            FramebufferMode::LockableStaging => state.caps = SurfaceCaps::empty(),
        }

        self.mode = mode;
        state.width = width;
        state.height = height;
        debug!("{}: framebuffer mode {:?}, {} slot(s)", state.id, mode, state.num_buffers());
        Ok(())
    }

    fn prepare_frame(&mut self, state: &mut SurfaceState) -> Result<()> {
        if state.current_target().is_none() {
            return Err(SwapchainError::AllocationFailure("framebuffer surface has no target".into()));
        }
        Ok(())
    }

    fn present(&mut self, state: &mut SurfaceState, interval: u32) -> Result<()> {
        match self.mode {
            FramebufferMode::DirectMulti => {
                if interval > 0 {
                    self.display.wait_vsync(interval);
                }
                let (_, yres) = self.display.resolution();
                let pages = state.num_buffers() as u32;
                let yoffset = (self.display.yoffset() + yres) % (yres * pages);
                self.display.pan_to(yoffset)?;
                state.advance();
            }
            FramebufferMode::DirectSingle => {
                if interval > 0 {
                    self.display.wait_vsync(interval);
                }
            }
            FramebufferMode::Blit | FramebufferMode::LockableStaging => self.blit_current(state)?,
            FramebufferMode::LockablePages => {
                let (_, yres) = self.display.resolution();
                let visible = 1 - self.visible;
                self.display.pan_to(yres * visible as u32)?;
                self.visible = visible;
                state.set_current(1 - visible);
            }
        }
        Ok(())
    }

    fn resize(&mut self, state: &mut SurfaceState, width: u32, height: u32) -> Result<()> {
        let (width, height) = self.geometry(self.mode, width, height);
        let targets = self.build(state, self.mode, width, height)?;

        let (old_w, old_h) = (state.width, state.height);
        for page in self.pages() {
            if width < old_w {
                self.display.clear_rect(page, width, 0, old_w - width, old_h);
            }
            if height < old_h {
                self.display.clear_rect(page, 0, height, width.min(old_w), old_h - height);
            }
        }

        if self.mode == FramebufferMode::DirectMulti && self.display.yoffset() != 0 {
            self.display.pan_to(0)?;
        }
        state.set_targets(targets)?;
        if self.mode == FramebufferMode::LockablePages {
            state.set_current(1 - self.visible);
        }

        self.width = width;
        self.height = height;
        state.width = width;
        state.height = height;
        debug!("{}: framebuffer surface resized to {}x{}", state.id, width, height);
        Ok(())
    }

    fn destroy(&mut self, state: &mut SurfaceState) {
        state.clear_slots();
    }

    fn map_lock_buffer(
        &mut self,
        state: &mut SurfaceState,
        preserve: bool,
        copied: &mut bool,
    ) -> Result<Arc<RenderTarget>> {
        match self.mode {
            FramebufferMode::LockablePages => {
                if preserve && !*copied {
                    self.display.copy_page(self.visible, 1 - self.visible);
                    *copied = true;
                }
                state
                    .current_target()
                    .cloned()
                    .ok_or(SwapchainError::AccessDenied("no back buffer to map"))
            }
            FramebufferMode::LockableStaging => {
                // the staging buffer keeps its contents between frames
                *copied = true;
                state
                    .current_target()
                    .cloned()
                    .ok_or(SwapchainError::AccessDenied("no staging buffer to map"))
            }
            _ => crate::lock_surface::map_current_slot(state, preserve, copied),
        }
    }

    fn orientation(&self) -> Orientation {
        self.display.orientation()
    }
}

/// Client memory rendered into as a framebuffer pixmap.
#[derive(Debug, Clone)]
pub struct FramebufferPixmap {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub format: PixelFormat,
    pub memory: GpuMemory,
}

/// Pixmap surface over client-supplied memory.
pub struct FramebufferPixmapSwapChain {
    pixmap: FramebufferPixmap,
}

impl FramebufferPixmapSwapChain {
    pub fn new(pixmap: FramebufferPixmap) -> Self {
        Self { pixmap }
    }
}

impl SwapChain for FramebufferPixmapSwapChain {
    fn kind(&self) -> BackendKind {
        BackendKind::Framebuffer
    }

    fn create(&mut self, state: &mut SurfaceState) -> Result<()> {
        let pixmap = &self.pixmap;
        if pixmap.format.bits_per_pixel != state.config.format.bits_per_pixel {
            return Err(SwapchainError::BadNativeTarget(format!(
                "{}bpp pixmap for a {}bpp config",
                pixmap.format.bits_per_pixel, state.config.format.bits_per_pixel
            )));
        }
        let needed = pixmap.pitch as usize * pixmap.height as usize;
        if pixmap.memory.len() < needed {
            return Err(SwapchainError::BadNativeTarget(format!(
                "pixmap memory of {} bytes, {} needed",
                pixmap.memory.len(),
                needed
            )));
        }
        let target = RenderTarget::new(
            pixmap.width,
            pixmap.height,
            pixmap.pitch,
            pixmap.format,
            pixmap.memory.clone(),
        );
        state.set_targets(vec![Some(Arc::new(target))])?;
        state.width = pixmap.width;
        state.height = pixmap.height;
        state.caps = SurfaceCaps::DIRECT_RENDERING;
        Ok(())
    }

    fn prepare_frame(&mut self, _state: &mut SurfaceState) -> Result<()> {
        Ok(())
    }

    fn present(&mut self, _state: &mut SurfaceState, _interval: u32) -> Result<()> {
        Ok(())
    }

    fn resize(&mut self, _state: &mut SurfaceState, _width: u32, _height: u32) -> Result<()> {
        Err(SwapchainError::PlatformRejection("pixmaps cannot be resized".into()))
    }

    fn destroy(&mut self, state: &mut SurfaceState) {
        state.clear_slots();
    }
}
