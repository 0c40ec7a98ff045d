//! Native window-system interfaces consumed by the swap-chain backends.
//!
//! Three buffer-exchange patterns are supported:
//!
//! - [`NativeWindow`]: a compositor buffer queue (dequeue / queue / cancel)
//! - [`DisplayServer`]: a display server handing out named buffers per drawable
//! - [`FramebufferDevice`]: a raw framebuffer with panning
//!
//! All calls may block for up to a display frame.

pub mod fbdev;
pub mod headless;

pub use fbdev::LinuxFramebuffer;

use crate::format::{Channel, PixelFormat};
use crate::memory::{BufferName, Region};
use std::io;
use std::sync::Arc;

/// A buffer handed out by a compositor queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBuffer {
    /// Identity of the buffer object within the queue
    pub id: u64,
    /// Shareable name of the backing memory
    pub name: BufferName,
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
    pub format: PixelFormat,
}

/// Compositor buffer queue.
pub trait NativeWindow: Send {
    fn dequeue_buffer(&mut self) -> io::Result<QueueBuffer>;
    fn queue_buffer(&mut self, buffer: &QueueBuffer) -> io::Result<()>;
    fn cancel_buffer(&mut self, buffer: &QueueBuffer) -> io::Result<()>;
    fn size(&self) -> (u32, u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrawableId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    FrontLeft,
    BackLeft,
}

/// Descriptor of one drawable buffer, as returned by get-buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawableBuffer {
    pub attachment: Attachment,
    pub name: BufferName,
    pub pitch: u32,
    pub cpp: u32,
    /// Byte offset of the pixels within the named object
    pub flags: u32,
}

/// Reply to a get-buffers request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuffersReply {
    pub width: u32,
    pub height: u32,
    pub buffer: DrawableBuffer,
}

/// Display-server buffer exchange. One connection serves every surface.
pub trait DisplayServer: Send + Sync {
    fn create_drawable(&self, drawable: DrawableId) -> io::Result<()>;
    fn destroy_drawable(&self, drawable: DrawableId);
    fn drawable_size(&self, drawable: DrawableId) -> io::Result<(u32, u32)>;
    fn get_buffers(&self, drawable: DrawableId, attachment: Attachment) -> io::Result<BuffersReply>;
    /// Returns the server's swap count for the drawable.
    fn swap_buffers(&self, drawable: DrawableId) -> io::Result<u64>;
}

/// Variable screen information, the subset the backend uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarScreenInfo {
    pub xres: u32,
    pub yres: u32,
    pub xres_virtual: u32,
    pub yres_virtual: u32,
    pub xoffset: u32,
    pub yoffset: u32,
    pub bits_per_pixel: u32,
    pub red: Channel,
    pub green: Channel,
    pub blue: Channel,
    pub transp: Channel,
}

impl VarScreenInfo {
    pub fn format(&self) -> PixelFormat {
        PixelFormat {
            bits_per_pixel: self.bits_per_pixel,
            red: self.red,
            green: self.green,
            blue: self.blue,
            alpha: self.transp,
        }
    }

    /// Screen-sized pages available in the virtual resolution.
    pub fn virtual_pages(&self) -> u32 {
        if self.yres == 0 {
            return 0;
        }
        self.yres_virtual / self.yres
    }
}

/// Fixed screen information, the subset the backend uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixScreenInfo {
    pub smem_len: u32,
    pub line_length: u32,
}

/// Raw framebuffer device.
pub trait FramebufferDevice: Send {
    fn var_screen_info(&mut self) -> io::Result<VarScreenInfo>;
    fn fix_screen_info(&mut self) -> io::Result<FixScreenInfo>;
    fn pan_display(&mut self, info: &VarScreenInfo) -> io::Result<()>;
    fn map_scanout(&mut self, len: usize) -> io::Result<Arc<Region>>;
}
