//! # swapchain-sim
//!
//! Drives one surface through the swap-chain core for a number of frames on
//! a headless platform (or a real framebuffer device) and reports surface
//! and lock statistics.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use gpu_swapchain::backend::FramebufferDisplay;
use gpu_swapchain::display::SurfaceInfo;
use gpu_swapchain::lock::LockStatsSnapshot;
use gpu_swapchain::native::headless::{HeadlessDisplayServer, HeadlessFramebuffer, HeadlessWindow};
use gpu_swapchain::native::DrawableId;
use gpu_swapchain::{
    LockCoordinator, MemoryBridge, NativeTarget, PixelFormat, Platform, SurfaceAttributes,
    SurfaceConfig, SurfaceKind, SurfaceManager, SwapchainConfig,
};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
enum PlatformArg {
    Compositor,
    DisplayServer,
    Framebuffer,
    Pbuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FormatArg {
    Rgb565,
    Argb8888,
}

impl FormatArg {
    fn format(self) -> PixelFormat {
        match self {
            FormatArg::Rgb565 => PixelFormat::RGB565,
            FormatArg::Argb8888 => PixelFormat::ARGB8888,
        }
    }
}

#[derive(Parser)]
#[command(name = "swapchain-sim")]
#[command(about = "Drive the GPU swap-chain core against a simulated window system")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/gpu-swapchain/swapchain.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Window system to simulate
    #[arg(short, long, value_enum, default_value_t = PlatformArg::Compositor)]
    platform: PlatformArg,

    /// Frames to render and present
    #[arg(short, long, default_value_t = 120)]
    frames: u32,

    /// Surface width
    #[arg(long, default_value_t = 320)]
    width: u32,

    /// Surface height
    #[arg(long, default_value_t = 240)]
    height: u32,

    /// Pixel format of the surface config
    #[arg(long, value_enum, default_value_t = FormatArg::Rgb565)]
    format: FormatArg,

    /// Swap interval passed to every present
    #[arg(long, default_value_t = 1)]
    interval: u32,

    /// Buffers in the simulated compositor queue
    #[arg(long, default_value_t = 3)]
    ring: usize,

    /// Virtual pages of the simulated framebuffer
    #[arg(long, default_value_t = 2)]
    pages: u32,

    /// Use the configured framebuffer device instead of a simulated one
    #[arg(long)]
    real_fb: bool,

    /// Halve the window size at this frame
    #[arg(long)]
    resize_at: Option<u32>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

/// What the simulator does to the native side when asked to resize.
enum Resizer {
    Window(HeadlessWindow),
    Drawable(Arc<HeadlessDisplayServer>, DrawableId),
    Surface,
}

#[derive(Serialize)]
struct Report {
    platform: PlatformArg,
    frames: u32,
    elapsed_ms: f64,
    fps: f64,
    surface: SurfaceInfo,
    locks: LockStatsSnapshot,
}

fn build(
    cli: &Cli,
    config: &SwapchainConfig,
    bridge: &Arc<MemoryBridge>,
) -> Result<(Platform, SurfaceKind, NativeTarget, Resizer)> {
    let format = cli.format.format();
    Ok(match cli.platform {
        PlatformArg::Compositor => {
            let window = HeadlessWindow::new(Arc::clone(bridge), cli.width, cli.height, format, cli.ring)
                .context("Failed to create simulated compositor window")?;
            (
                Platform::Compositor,
                SurfaceKind::Window,
                NativeTarget::QueueWindow(Box::new(window.clone())),
                Resizer::Window(window),
            )
        }
        PlatformArg::DisplayServer => {
            let server = Arc::new(HeadlessDisplayServer::new(Arc::clone(bridge), format));
            let drawable = DrawableId(1);
            server.add_drawable(drawable, cli.width, cli.height);
            (
                Platform::DisplayServer(server.clone()),
                SurfaceKind::Window,
                NativeTarget::Drawable(drawable),
                Resizer::Drawable(server, drawable),
            )
        }
        PlatformArg::Framebuffer => {
            let display = if cli.real_fb {
                FramebufferDisplay::open(&config.framebuffer).with_context(|| {
                    format!("Failed to open framebuffer {}", config.framebuffer.device)
                })?
            } else {
                let fb = HeadlessFramebuffer::new(cli.width, cli.height, cli.pages, format)
                    .context("Failed to create simulated framebuffer")?;
                FramebufferDisplay::new(Box::new(fb), &config.framebuffer)?
            };
            (
                Platform::Framebuffer(Arc::new(display)),
                SurfaceKind::Window,
                NativeTarget::FramebufferWindow {
                    width: cli.width,
                    height: cli.height,
                },
                Resizer::Surface,
            )
        }
        PlatformArg::Pbuffer => (
            Platform::Compositor,
            SurfaceKind::Pbuffer,
            NativeTarget::None,
            Resizer::Surface,
        ),
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("🚀 Starting swapchain-sim");
    info!(
        "📄 Version: {} ({}, {}, built {})",
        gpu_swapchain::VERSION,
        env!("SWAPCHAIN_GIT_COMMIT"),
        env!("SWAPCHAIN_TARGET"),
        env!("SWAPCHAIN_BUILD_DATE")
    );

    // Load configuration
    let mut config = match SwapchainConfig::load(&cli.config) {
        Ok(config) => {
            info!("✅ Configuration loaded from: {}", cli.config);
            config
        }
        Err(e) => {
            error!("❌ Failed to load configuration: {}", e);
            info!("📝 Using default configuration");
            SwapchainConfig::default()
        }
    };
    config.apply_env();
    config.validate()?;

    let bridge = Arc::new(MemoryBridge::with_strategy(config.memory.strategy));
    let locks = Arc::new(LockCoordinator::from_config(&config.lock));
    let (platform, kind, target, resizer) = build(&cli, &config, &bridge)?;
    let manager = SurfaceManager::new(config, platform, bridge, locks);

    let surface_config = SurfaceConfig::new(cli.format.format());
    let id = manager
        .create(
            kind,
            &surface_config,
            target,
            &SurfaceAttributes::sized(cli.width, cli.height),
        )
        .context("Failed to create surface")?;

    let start = Instant::now();
    for frame in 0..cli.frames {
        if cli.resize_at == Some(frame) {
            let (w, h) = ((cli.width / 2).max(1), (cli.height / 2).max(1));
            info!("📐 Resizing to {}x{} at frame {}", w, h, frame);
            match &resizer {
                Resizer::Window(window) => window.resize(w, h),
                Resizer::Drawable(server, drawable) => server.set_drawable_size(*drawable, w, h),
                Resizer::Surface => {
                    if !manager.resize(id, w, h)? {
                        warn!("⚠️ Resize refused, keeping {}x{}", cli.width, cli.height);
                    }
                }
            }
        }

        let target = manager.begin_frame(id).context("Failed to begin frame")?;
        target.target().fill(frame as u8);
        target.finish();
        manager.present(id, cli.interval).context("Failed to present")?;
    }
    let elapsed = start.elapsed();

    let report = Report {
        platform: cli.platform,
        frames: cli.frames,
        elapsed_ms: elapsed.as_secs_f64() * 1000.0,
        fps: if elapsed.as_secs_f64() > 0.0 {
            f64::from(cli.frames) / elapsed.as_secs_f64()
        } else {
            0.0
        },
        surface: manager.info(id)?,
        locks: manager.locks().stats(),
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let s = &report.surface;
        println!("platform:  {:?} ({} backend)", report.platform, s.backend);
        println!("frames:    {} in {:.1} ms ({:.0} fps)", report.frames, report.elapsed_ms, report.fps);
        println!("surface:   {}x{}, {} buffer(s), current {}", s.width, s.height, s.num_buffers, s.current_buffer);
        println!("recovery:  {:?}, pipelined: {}", s.recovery, s.pipelined);
        println!(
            "locks:     {} granted, {} retries, {} timeouts, {} released",
            report.locks.granted, report.locks.retries, report.locks.timeouts, report.locks.released
        );
    }

    manager.destroy(id)?;
    info!("👋 swapchain-sim finished");
    Ok(())
}
