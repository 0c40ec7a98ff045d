// Resource lifecycle integration tests
//
// Tests that surfaces release every buffer reference they take, that
// teardown waits for frames still in flight, and that failed creation
// leaves nothing behind.

use gpu_swapchain::display::SurfaceAttribute;
use gpu_swapchain::memory::SecureIdDevice;
use gpu_swapchain::native::headless::{HeadlessDisplayServer, HeadlessFramebuffer, HeadlessWindow};
use gpu_swapchain::native::DrawableId;
use gpu_swapchain::{
    FramebufferDisplay, LockCoordinator, MemoryBridge, MemoryStrategy, NativeTarget, PixelFormat,
    Platform, SurfaceAttributes, SurfaceConfig, SurfaceKind, SurfaceManager, SwapchainConfig,
    SwapchainError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn config() -> SwapchainConfig {
    let mut config = SwapchainConfig::default();
    config.compositor.settle_delay_ms = 0;
    config.lock.enabled = false;
    config
}

fn manager_with(bridge: Arc<MemoryBridge>, platform: Platform) -> SurfaceManager {
    SurfaceManager::new(config(), platform, bridge, Arc::new(LockCoordinator::unarbitrated()))
}

fn queue_window(manager: &SurfaceManager, window: &HeadlessWindow) -> gpu_swapchain::SurfaceId {
    manager
        .create(
            SurfaceKind::Window,
            &SurfaceConfig::rgb565(),
            NativeTarget::QueueWindow(Box::new(window.clone())),
            &SurfaceAttributes::default(),
        )
        .unwrap()
}

#[test]
fn test_destroy_waits_for_frame_on_other_thread() {
    let bridge = Arc::new(MemoryBridge::with_strategy(MemoryStrategy::SecureId));
    let manager = manager_with(Arc::clone(&bridge), Platform::Compositor);
    let window = HeadlessWindow::new(bridge, 8, 8, PixelFormat::RGB565, 2).unwrap();
    let id = queue_window(&manager, &window);

    let frame = manager.begin_frame(id).unwrap();
    let finished = Arc::new(AtomicBool::new(false));
    let renderer = {
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            frame.target().fill(0xEE);
            thread::sleep(Duration::from_millis(50));
            finished.store(true, Ordering::SeqCst);
            frame.finish();
        })
    };

    assert_eq!(manager.outstanding_frames(id).unwrap(), 1);
    manager.destroy(id).unwrap();
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(manager.surface_count(), 0);
    renderer.join().unwrap();
}

#[test]
fn test_buffer_references_released_after_destroy() {
    let device = Arc::new(SecureIdDevice::new());
    let bridge = Arc::new(MemoryBridge::new(device.clone()));
    let manager = manager_with(Arc::clone(&bridge), Platform::Compositor);
    let window = HeadlessWindow::new(bridge, 8, 8, PixelFormat::RGB565, 3).unwrap();
    let names = window.buffer_names();
    assert_eq!(device.live_ids(), 3);

    let id = queue_window(&manager, &window);
    for _ in 0..6 {
        let frame = manager.begin_frame(id).unwrap();
        frame.finish();
        manager.present(id, 1).unwrap();
    }
    assert!(names.iter().any(|&name| device.ref_count(name) > 1));

    manager.destroy(id).unwrap();
    for &name in &names {
        assert_eq!(device.ref_count(name), 1, "buffer {} still imported", name);
    }

    drop(window);
    assert_eq!(device.live_ids(), 0);
}

#[test]
fn test_retained_surface_survives_first_destroy() {
    let bridge = Arc::new(MemoryBridge::with_strategy(MemoryStrategy::SecureId));
    let manager = manager_with(Arc::clone(&bridge), Platform::Compositor);
    let window = HeadlessWindow::new(bridge, 8, 8, PixelFormat::RGB565, 2).unwrap();
    let id = queue_window(&manager, &window);

    manager.retain(id).unwrap();
    manager.destroy(id).unwrap();
    assert_eq!(manager.info(id).unwrap().references, 1);
    let frame = manager.begin_frame(id).unwrap();
    frame.finish();
    manager.present(id, 1).unwrap();

    manager.destroy(id).unwrap();
    assert!(matches!(manager.info(id), Err(SwapchainError::BadSurface(_))));
}

#[test]
fn test_failed_compositor_create_leaves_nothing() {
    let bridge = Arc::new(MemoryBridge::with_strategy(MemoryStrategy::SecureId));
    let manager = manager_with(Arc::clone(&bridge), Platform::Compositor);
    let window = HeadlessWindow::new(bridge, 8, 8, PixelFormat::RGB565, 2).unwrap();

    window.fail_dequeues(1);
    let err = manager
        .create(
            SurfaceKind::Window,
            &SurfaceConfig::rgb565(),
            NativeTarget::QueueWindow(Box::new(window.clone())),
            &SurfaceAttributes::default(),
        )
        .unwrap_err();
    assert!(matches!(err, SwapchainError::AllocationFailure(_)));
    assert_eq!(manager.surface_count(), 0);
    assert_eq!(window.cancelled(), 0);
}

#[test]
fn test_failed_pixmap_create_destroys_drawable() {
    const PIXMAP: DrawableId = DrawableId(9);
    let bridge = Arc::new(MemoryBridge::with_strategy(MemoryStrategy::Fd));
    let server = Arc::new(HeadlessDisplayServer::new(Arc::clone(&bridge), PixelFormat::RGB565));
    server.add_drawable(PIXMAP, 8, 8);
    let manager = manager_with(bridge, Platform::DisplayServer(server.clone()));

    server.fail_requests(1);
    let err = manager
        .create(
            SurfaceKind::Pixmap,
            &SurfaceConfig::rgb565(),
            NativeTarget::DrawablePixmap(PIXMAP),
            &SurfaceAttributes::default(),
        )
        .unwrap_err();
    assert!(matches!(err, SwapchainError::PlatformRejection(_)));
    assert!(!server.is_created(PIXMAP));
    assert_eq!(manager.surface_count(), 0);

    let id = manager
        .create(
            SurfaceKind::Pixmap,
            &SurfaceConfig::rgb565(),
            NativeTarget::DrawablePixmap(PIXMAP),
            &SurfaceAttributes::default(),
        )
        .unwrap();
    assert_eq!(manager.query(id, SurfaceAttribute::NumBuffers).unwrap(), 1);
    assert!(server.is_created(PIXMAP));
}

#[test]
fn test_dropping_manager_terminates_surfaces() {
    let bridge = Arc::new(MemoryBridge::with_strategy(MemoryStrategy::SecureId));
    let manager = manager_with(Arc::clone(&bridge), Platform::Compositor);
    let window = HeadlessWindow::new(bridge, 8, 8, PixelFormat::RGB565, 2).unwrap();
    queue_window(&manager, &window);
    queue_window(&manager, &window);

    drop(manager);
    assert_eq!(window.cancelled(), 2);
}

#[test]
fn test_saved_config_sizes_framebuffer_ring() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("swapchain.toml");
    let mut config = config();
    config.framebuffer.max_window_buffers = 3;
    config.framebuffer.no_clear = true;
    config.save(&path).unwrap();

    let loaded = SwapchainConfig::load(&path).unwrap();
    assert_eq!(loaded, config);

    let fb = HeadlessFramebuffer::new(16, 4, 4, PixelFormat::RGB565).unwrap();
    fb.fill_page(0, 0x99);
    let display = FramebufferDisplay::new(Box::new(fb.clone()), &loaded.framebuffer).unwrap();
    assert_eq!(display.num_buffers(), 3);
    assert!(fb.read_page(0).iter().all(|&b| b == 0x99));

    let manager = SurfaceManager::new(
        loaded,
        Platform::Framebuffer(Arc::new(display)),
        Arc::new(MemoryBridge::with_strategy(MemoryStrategy::SecureId)),
        Arc::new(LockCoordinator::unarbitrated()),
    );
    let id = manager
        .create(
            SurfaceKind::Window,
            &SurfaceConfig::rgb565(),
            NativeTarget::FramebufferWindow { width: 16, height: 4 },
            &SurfaceAttributes::default(),
        )
        .unwrap();
    assert_eq!(manager.query(id, SurfaceAttribute::NumBuffers).unwrap(), 3);
    manager.destroy(id).unwrap();
}
