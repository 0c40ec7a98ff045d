//! In-process implementations of every native interface.
//!
//! These back the simulator binary and the test suites. Each one is a cheap
//! clonable handle, so a caller can keep a probe after handing the
//! interface to the surface manager.

use super::{
    Attachment, BuffersReply, DisplayServer, DrawableBuffer, DrawableId, FixScreenInfo,
    FramebufferDevice, NativeWindow, QueueBuffer, VarScreenInfo,
};
use crate::error::Result;
use crate::format::PixelFormat;
use crate::lock::{LockArbiter, LockItem};
use crate::memory::{BufferName, MemoryBridge, MemoryHandle, Region};
use log::debug;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

fn busy(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::WouldBlock, what.to_string())
}

struct QueuedSlot {
    buffer: QueueBuffer,
    memory: MemoryHandle,
}

struct WindowInner {
    bridge: Arc<MemoryBridge>,
    format: PixelFormat,
    width: u32,
    height: u32,
    slots: Vec<QueuedSlot>,
    free: VecDeque<usize>,
    failing_dequeues: u32,
    queued: Vec<BufferName>,
    cancelled: usize,
    next_id: u64,
}

impl WindowInner {
    fn allocate(&mut self) -> Result<QueuedSlot> {
        let stride = self.width * self.format.bytes_per_pixel() as u32;
        let memory = self
            .bridge
            .allocate_shared(stride as usize * self.height.max(1) as usize)?;
        let name = self.bridge.get_name_from_handle(&memory)?;
        self.next_id += 1;
        Ok(QueuedSlot {
            buffer: QueueBuffer {
                id: self.next_id,
                name,
                width: self.width,
                height: self.height,
                stride,
                format: self.format,
            },
            memory,
        })
    }
}

/// Compositor buffer queue backed by shared memory.
///
/// Dequeue takes the oldest free buffer; cancel returns a buffer to the
/// front of the queue, so the next dequeue hands it straight back.
#[derive(Clone)]
pub struct HeadlessWindow {
    inner: Arc<Mutex<WindowInner>>,
}

impl HeadlessWindow {
    pub fn new(
        bridge: Arc<MemoryBridge>,
        width: u32,
        height: u32,
        format: PixelFormat,
        ring: usize,
    ) -> Result<Self> {
        let mut inner = WindowInner {
            bridge,
            format,
            width,
            height,
            slots: Vec::new(),
            free: VecDeque::new(),
            failing_dequeues: 0,
            queued: Vec::new(),
            cancelled: 0,
            next_id: 0,
        };
        for i in 0..ring.max(1) {
            let slot = inner.allocate()?;
            inner.slots.push(slot);
            inner.free.push_back(i);
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Change the window size. Buffers are reallocated as they are dequeued.
    pub fn resize(&self, width: u32, height: u32) {
        let mut inner = self.inner.lock();
        inner.width = width;
        inner.height = height;
    }

    /// Make the next `count` dequeues fail.
    pub fn fail_dequeues(&self, count: u32) {
        self.inner.lock().failing_dequeues = count;
    }

    /// Names of queued buffers, oldest first.
    pub fn queued(&self) -> Vec<BufferName> {
        self.inner.lock().queued.clone()
    }

    pub fn cancelled(&self) -> usize {
        self.inner.lock().cancelled
    }

    pub fn buffer_names(&self) -> Vec<BufferName> {
        self.inner.lock().slots.iter().map(|s| s.buffer.name).collect()
    }

    /// Read the contents of a buffer the queue owns.
    pub fn read_buffer(&self, name: BufferName) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        let slot = inner.slots.iter().find(|s| s.buffer.name == name)?;
        let memory = inner.bridge.create_gpu_memory(&slot.memory, 0).ok()?;
        Some(memory.with_bytes(|bytes| bytes.to_vec()))
    }
}

impl NativeWindow for HeadlessWindow {
    fn dequeue_buffer(&mut self) -> io::Result<QueueBuffer> {
        let mut inner = self.inner.lock();
        if inner.failing_dequeues > 0 {
            inner.failing_dequeues -= 1;
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        let index = inner.free.pop_front().ok_or_else(|| busy("no free buffers"))?;
        let stale = {
            let b = &inner.slots[index].buffer;
            b.width != inner.width || b.height != inner.height
        };
        if stale {
            let fresh = inner
                .allocate()
                .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e.to_string()))?;
            debug!("queue buffer {} reallocated as {}", index, fresh.buffer.name);
            inner.slots[index] = fresh;
        }
        Ok(inner.slots[index].buffer.clone())
    }

    fn queue_buffer(&mut self, buffer: &QueueBuffer) -> io::Result<()> {
        let mut inner = self.inner.lock();
        let index = inner
            .slots
            .iter()
            .position(|s| s.buffer.id == buffer.id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unknown buffer"))?;
        inner.free.push_back(index);
        inner.queued.push(buffer.name);
        Ok(())
    }

    fn cancel_buffer(&mut self, buffer: &QueueBuffer) -> io::Result<()> {
        let mut inner = self.inner.lock();
        let index = inner
            .slots
            .iter()
            .position(|s| s.buffer.id == buffer.id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unknown buffer"))?;
        inner.free.push_front(index);
        inner.cancelled += 1;
        Ok(())
    }

    fn size(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        (inner.width, inner.height)
    }
}

struct ServerBuffer {
    descriptor: DrawableBuffer,
    width: u32,
    height: u32,
    _memory: MemoryHandle,
}

struct DrawableState {
    width: u32,
    height: u32,
    created: bool,
    back: [Option<ServerBuffer>; 2],
    front: Option<ServerBuffer>,
    back_index: usize,
    swaps: u64,
}

/// Display server that owns two back buffers per drawable and flips them on swap.
pub struct HeadlessDisplayServer {
    bridge: Arc<MemoryBridge>,
    format: PixelFormat,
    drawables: Mutex<HashMap<DrawableId, DrawableState>>,
    failing_requests: AtomicU32,
    requests: AtomicU64,
}

impl HeadlessDisplayServer {
    pub fn new(bridge: Arc<MemoryBridge>, format: PixelFormat) -> Self {
        Self {
            bridge,
            format,
            drawables: Mutex::new(HashMap::new()),
            failing_requests: AtomicU32::new(0),
            requests: AtomicU64::new(0),
        }
    }

    /// Map a native window or pixmap on the server side.
    pub fn add_drawable(&self, drawable: DrawableId, width: u32, height: u32) {
        self.drawables.lock().insert(
            drawable,
            DrawableState {
                width,
                height,
                created: false,
                back: [None, None],
                front: None,
                back_index: 0,
                swaps: 0,
            },
        );
    }

    pub fn set_drawable_size(&self, drawable: DrawableId, width: u32, height: u32) {
        if let Some(state) = self.drawables.lock().get_mut(&drawable) {
            state.width = width;
            state.height = height;
        }
    }

    /// Make the next `count` get-buffers requests fail.
    pub fn fail_requests(&self, count: u32) {
        self.failing_requests.store(count, Ordering::SeqCst);
    }

    pub fn swap_count(&self, drawable: DrawableId) -> u64 {
        self.drawables.lock().get(&drawable).map_or(0, |s| s.swaps)
    }

    pub fn get_buffers_requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn is_created(&self, drawable: DrawableId) -> bool {
        self.drawables.lock().get(&drawable).is_some_and(|s| s.created)
    }

    fn allocate(&self, attachment: Attachment, width: u32, height: u32) -> io::Result<ServerBuffer> {
        let cpp = self.format.bytes_per_pixel() as u32;
        let pitch = width * cpp;
        let to_io = |e: crate::error::SwapchainError| io::Error::new(io::ErrorKind::OutOfMemory, e.to_string());
        let memory = self
            .bridge
            .allocate_shared(pitch as usize * height.max(1) as usize)
            .map_err(to_io)?;
        let name = self.bridge.get_name_from_handle(&memory).map_err(to_io)?;
        Ok(ServerBuffer {
            descriptor: DrawableBuffer {
                attachment,
                name,
                pitch,
                cpp,
                flags: 0,
            },
            width,
            height,
            _memory: memory,
        })
    }
}

impl DisplayServer for HeadlessDisplayServer {
    fn create_drawable(&self, drawable: DrawableId) -> io::Result<()> {
        let mut drawables = self.drawables.lock();
        let state = drawables
            .get_mut(&drawable)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "bad drawable"))?;
        state.created = true;
        Ok(())
    }

    fn destroy_drawable(&self, drawable: DrawableId) {
        if let Some(state) = self.drawables.lock().get_mut(&drawable) {
            state.created = false;
        }
    }

    fn drawable_size(&self, drawable: DrawableId) -> io::Result<(u32, u32)> {
        self.drawables
            .lock()
            .get(&drawable)
            .map(|s| (s.width, s.height))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "bad drawable"))
    }

    fn get_buffers(&self, drawable: DrawableId, attachment: Attachment) -> io::Result<BuffersReply> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(busy("get-buffers refused"));
        }

        let mut drawables = self.drawables.lock();
        let state = drawables
            .get_mut(&drawable)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "bad drawable"))?;
        if !state.created {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "drawable not created"));
        }
        let (width, height) = (state.width, state.height);
        let slot = match attachment {
            Attachment::BackLeft => &mut state.back[state.back_index],
            Attachment::FrontLeft => &mut state.front,
        };
        let stale = slot
            .as_ref()
            .map_or(true, |b| b.width != width || b.height != height);
        if stale {
            *slot = Some(self.allocate(attachment, width, height)?);
        }
        let buffer = slot
            .as_ref()
            .map(|b| b.descriptor)
            .ok_or_else(|| busy("no buffer"))?;
        Ok(BuffersReply {
            width,
            height,
            buffer,
        })
    }

    fn swap_buffers(&self, drawable: DrawableId) -> io::Result<u64> {
        let mut drawables = self.drawables.lock();
        let state = drawables
            .get_mut(&drawable)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "bad drawable"))?;
        state.back_index ^= 1;
        state.swaps += 1;
        Ok(state.swaps)
    }
}

struct FramebufferInner {
    var: VarScreenInfo,
    line_length: u32,
    scanout: Arc<Region>,
    pans: Vec<u32>,
    failing_pans: u32,
}

/// Framebuffer with `pages` screens of virtual resolution in anonymous memory.
#[derive(Clone)]
pub struct HeadlessFramebuffer {
    inner: Arc<Mutex<FramebufferInner>>,
}

impl HeadlessFramebuffer {
    pub fn new(xres: u32, yres: u32, pages: u32, format: PixelFormat) -> io::Result<Self> {
        let line_length = xres * format.bytes_per_pixel() as u32;
        let scanout = Region::anonymous((line_length * yres * pages.max(1)) as usize)?;
        let var = VarScreenInfo {
            xres,
            yres,
            xres_virtual: xres,
            yres_virtual: yres * pages.max(1),
            xoffset: 0,
            yoffset: 0,
            bits_per_pixel: format.bits_per_pixel,
            red: format.red,
            green: format.green,
            blue: format.blue,
            transp: format.alpha,
        };
        Ok(Self {
            inner: Arc::new(Mutex::new(FramebufferInner {
                var,
                line_length,
                scanout,
                pans: Vec::new(),
                failing_pans: 0,
            })),
        })
    }

    /// Every yoffset the display was panned to, in order.
    pub fn pans(&self) -> Vec<u32> {
        self.inner.lock().pans.clone()
    }

    pub fn yoffset(&self) -> u32 {
        self.inner.lock().var.yoffset
    }

    pub fn fail_pans(&self, count: u32) {
        self.inner.lock().failing_pans = count;
    }

    pub fn line_length(&self) -> u32 {
        self.inner.lock().line_length
    }

    /// Copy of one screen page.
    pub fn read_page(&self, page: u32) -> Vec<u8> {
        let inner = self.inner.lock();
        let page_len = (inner.line_length * inner.var.yres) as usize;
        let start = page as usize * page_len;
        inner
            .scanout
            .with_bytes(|bytes| bytes[start..start + page_len].to_vec())
    }

    pub fn fill_page(&self, page: u32, value: u8) {
        let inner = self.inner.lock();
        let page_len = (inner.line_length * inner.var.yres) as usize;
        let start = page as usize * page_len;
        inner
            .scanout
            .with_bytes(|bytes| bytes[start..start + page_len].fill(value));
    }
}

impl FramebufferDevice for HeadlessFramebuffer {
    fn var_screen_info(&mut self) -> io::Result<VarScreenInfo> {
        Ok(self.inner.lock().var)
    }

    fn fix_screen_info(&mut self) -> io::Result<FixScreenInfo> {
        let inner = self.inner.lock();
        Ok(FixScreenInfo {
            smem_len: inner.scanout.len() as u32,
            line_length: inner.line_length,
        })
    }

    fn pan_display(&mut self, info: &VarScreenInfo) -> io::Result<()> {
        let mut inner = self.inner.lock();
        if inner.failing_pans > 0 {
            inner.failing_pans -= 1;
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        inner.var.yoffset = info.yoffset;
        inner.var.xoffset = info.xoffset;
        inner.pans.push(info.yoffset);
        Ok(())
    }

    fn map_scanout(&mut self, len: usize) -> io::Result<Arc<Region>> {
        let inner = self.inner.lock();
        if len > inner.scanout.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "mapping past scanout"));
        }
        Ok(Arc::clone(&inner.scanout))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterOp {
    Create,
    Process,
    Release,
}

/// Lock arbiter that refuses the first `n` PROCESS calls and logs every call.
#[derive(Default)]
pub struct ScriptedArbiter {
    refusals_left: AtomicU32,
    log: Mutex<Vec<(ArbiterOp, LockItem)>>,
}

impl ScriptedArbiter {
    pub fn new(refusals: u32) -> Arc<Self> {
        Arc::new(Self {
            refusals_left: AtomicU32::new(refusals),
            log: Mutex::new(Vec::new()),
        })
    }

    pub fn refuse(&self, count: u32) {
        self.refusals_left.store(count, Ordering::SeqCst);
    }

    pub fn log(&self) -> Vec<(ArbiterOp, LockItem)> {
        self.log.lock().clone()
    }

    pub fn count(&self, op: ArbiterOp) -> usize {
        self.log.lock().iter().filter(|(o, _)| *o == op).count()
    }
}

impl LockArbiter for ScriptedArbiter {
    fn create(&self, item: &LockItem) -> io::Result<()> {
        self.log.lock().push((ArbiterOp::Create, *item));
        Ok(())
    }

    fn process(&self, item: &LockItem) -> io::Result<()> {
        self.log.lock().push((ArbiterOp::Process, *item));
        if self
            .refusals_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        Ok(())
    }

    fn release(&self, item: &LockItem) -> io::Result<()> {
        self.log.lock().push((ArbiterOp::Release, *item));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStrategy;

    fn bridge() -> Arc<MemoryBridge> {
        Arc::new(MemoryBridge::with_strategy(MemoryStrategy::SecureId))
    }

    #[test]
    fn test_window_ring_rotates() {
        let mut window = HeadlessWindow::new(bridge(), 8, 8, PixelFormat::RGB565, 2).unwrap();
        let a = window.dequeue_buffer().unwrap();
        window.queue_buffer(&a).unwrap();
        let b = window.dequeue_buffer().unwrap();
        assert_ne!(a.name, b.name);
        window.queue_buffer(&b).unwrap();
        assert_eq!(window.dequeue_buffer().unwrap().name, a.name);
        assert_eq!(window.queued(), vec![a.name, b.name]);
    }

    #[test]
    fn test_window_cancel_hands_buffer_back() {
        let mut window = HeadlessWindow::new(bridge(), 8, 8, PixelFormat::RGB565, 2).unwrap();
        let a = window.dequeue_buffer().unwrap();
        window.cancel_buffer(&a).unwrap();
        assert_eq!(window.dequeue_buffer().unwrap().id, a.id);
        assert_eq!(window.cancelled(), 1);
    }

    #[test]
    fn test_window_resize_reallocates() {
        let mut window = HeadlessWindow::new(bridge(), 8, 8, PixelFormat::RGB565, 1).unwrap();
        let a = window.dequeue_buffer().unwrap();
        window.queue_buffer(&a).unwrap();
        window.resize(16, 4);
        let b = window.dequeue_buffer().unwrap();
        assert_eq!((b.width, b.height, b.stride), (16, 4, 32));
        assert_ne!(a.name, b.name);
    }

    #[test]
    fn test_window_dequeue_failures() {
        let mut window = HeadlessWindow::new(bridge(), 8, 8, PixelFormat::RGB565, 2).unwrap();
        window.fail_dequeues(1);
        assert!(window.dequeue_buffer().is_err());
        assert!(window.dequeue_buffer().is_ok());
    }

    #[test]
    fn test_server_flips_back_buffers() {
        let server = HeadlessDisplayServer::new(bridge(), PixelFormat::ARGB8888);
        let d = DrawableId(3);
        server.add_drawable(d, 4, 4);
        assert!(server.get_buffers(d, Attachment::BackLeft).is_err());
        server.create_drawable(d).unwrap();

        let first = server.get_buffers(d, Attachment::BackLeft).unwrap();
        assert_eq!(first.buffer.pitch, 16);
        assert_eq!(
            server.get_buffers(d, Attachment::BackLeft).unwrap().buffer.name,
            first.buffer.name
        );
        server.swap_buffers(d).unwrap();
        let second = server.get_buffers(d, Attachment::BackLeft).unwrap();
        assert_ne!(second.buffer.name, first.buffer.name);
        server.swap_buffers(d).unwrap();
        assert_eq!(
            server.get_buffers(d, Attachment::BackLeft).unwrap().buffer.name,
            first.buffer.name
        );
        assert_eq!(server.swap_count(d), 2);
    }

    #[test]
    fn test_framebuffer_records_pans() {
        let mut fb = HeadlessFramebuffer::new(4, 2, 3, PixelFormat::RGB565).unwrap();
        let mut var = fb.var_screen_info().unwrap();
        assert_eq!(var.virtual_pages(), 3);
        var.yoffset = 2;
        fb.pan_display(&var).unwrap();
        assert_eq!(fb.pans(), vec![2]);
        assert_eq!(fb.fix_screen_info().unwrap().smem_len, 48);
    }

    #[test]
    fn test_scripted_arbiter_refusals() {
        let arbiter = ScriptedArbiter::new(2);
        let item = LockItem::new(BufferName(1), crate::lock::LockUsage::Texture);
        assert!(arbiter.process(&item).is_err());
        assert!(arbiter.process(&item).is_err());
        assert!(arbiter.process(&item).is_ok());
        assert_eq!(arbiter.count(ArbiterOp::Process), 3);
    }
}
