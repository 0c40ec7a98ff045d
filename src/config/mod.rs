//! Configuration management
//!
//! Settings are loaded from a TOML file, every section falling back to its
//! defaults, and then overlaid with the `SWAPCHAIN_*` environment variables
//! the framebuffer backend honours.

use crate::memory::MemoryStrategy;
use crate::surface::MAX_BUFFERS;
use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::lock::LockPolicy;

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SwapchainConfig {
    /// Kernel lock arbitration
    #[serde(default)]
    pub lock: LockConfig,

    /// Compositor buffer-queue backend
    #[serde(default)]
    pub compositor: CompositorConfig,

    /// Raw framebuffer backend
    #[serde(default)]
    pub framebuffer: FramebufferConfig,

    /// Memory handle strategy
    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    /// Use the kernel lock device at all
    pub enabled: bool,

    /// Lock device node
    pub device: String,

    /// Retries after the first refused PROCESS
    pub max_retries: u32,

    /// Sleep between retries (milliseconds)
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompositorConfig {
    /// Consecutive stable dequeues before leaving immediate mode
    pub stable_sequence_limit: u32,

    /// Delay before the first dequeue, letting the window settle its size (milliseconds)
    pub settle_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FramebufferConfig {
    /// Framebuffer device node
    pub device: String,

    /// Direct-rendering buffers to use, clamped to [2, MAX_BUFFERS]
    pub max_window_buffers: u32,

    /// Force single-buffered direct rendering
    pub single_buffer: bool,

    /// Leave scanout memory as-is when the display opens
    pub no_clear: bool,

    /// Window placement: "Q1".."Q4" selects a quadrant, "R0".."R3" a rotation
    pub window: Option<String>,

    /// Software vsync rate in Hz (0 = disabled)
    pub vsync_hz: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryConfig {
    pub strategy: MemoryStrategy,
}

/// Screen rotation reported for framebuffer windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Rotate0,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Orientation {
    pub fn degrees(&self) -> u32 {
        match self {
            Orientation::Rotate0 => 0,
            Orientation::Rotate90 => 90,
            Orientation::Rotate180 => 180,
            Orientation::Rotate270 => 270,
        }
    }
}

/// Parsed form of [`FramebufferConfig::window`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPlacement {
    /// Quadrant 0..=3, left to right then top to bottom
    Quadrant(u32),
    Rotation(Orientation),
}

impl WindowPlacement {
    pub fn parse(value: &str) -> Option<Self> {
        let mut chars = value.chars();
        let kind = chars.next()?;
        let digit = chars.next()?.to_digit(10)?;
        if chars.next().is_some() {
            return None;
        }
        match kind {
            'Q' if (1..=4).contains(&digit) => Some(WindowPlacement::Quadrant(digit - 1)),
            'R' => match digit {
                0 => Some(WindowPlacement::Rotation(Orientation::Rotate0)),
                1 => Some(WindowPlacement::Rotation(Orientation::Rotate90)),
                2 => Some(WindowPlacement::Rotation(Orientation::Rotate180)),
                3 => Some(WindowPlacement::Rotation(Orientation::Rotate270)),
                _ => None,
            },
            _ => None,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: "/dev/umplock".to_string(),
            max_retries: 5,
            backoff_ms: 2,
        }
    }
}

impl LockConfig {
    pub fn policy(&self) -> LockPolicy {
        LockPolicy {
            max_retries: self.max_retries,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            stable_sequence_limit: 4,
            settle_delay_ms: 50,
        }
    }
}

impl Default for FramebufferConfig {
    fn default() -> Self {
        Self {
            device: "/dev/fb0".to_string(),
            max_window_buffers: 2,
            single_buffer: false,
            no_clear: false,
            window: None,
            vsync_hz: 0,
        }
    }
}

impl FramebufferConfig {
    /// Requested direct-rendering buffer count, clamped to what a surface can hold.
    pub fn window_buffers(&self) -> usize {
        (self.max_window_buffers as usize).clamp(2, MAX_BUFFERS)
    }

    pub fn placement(&self) -> Option<WindowPlacement> {
        self.window.as_deref().and_then(WindowPlacement::parse)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            strategy: MemoryStrategy::SecureId,
        }
    }
}

impl SwapchainConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Expand ~ to home directory
        let expanded_path = if path.to_string_lossy().starts_with('~') {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            Path::new(&home).join(path.strip_prefix("~").unwrap_or(path))
        } else {
            path.to_path_buf()
        };

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: SwapchainConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.lock.max_retries > 100 {
            anyhow::bail!("Invalid lock.max_retries: must be at most 100");
        }

        if self.lock.backoff_ms > 1000 {
            anyhow::bail!("Invalid lock.backoff_ms: must be at most 1000");
        }

        if self.compositor.stable_sequence_limit == 0 {
            anyhow::bail!("Invalid compositor.stable_sequence_limit: must be positive");
        }

        if let Some(window) = &self.framebuffer.window {
            if WindowPlacement::parse(window).is_none() {
                anyhow::bail!("Invalid framebuffer.window: {} (expected Q1-Q4 or R0-R3)", window);
            }
        }

        if self.framebuffer.vsync_hz > 1000 {
            anyhow::bail!("Invalid framebuffer.vsync_hz: must be at most 1000");
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }

    /// Overlay the framebuffer environment variables.
    ///
    /// Values that fail to parse are ignored, keeping the file setting.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_from<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        let fb = &mut self.framebuffer;

        if let Some(device) = lookup("SWAPCHAIN_FB_DEVICE") {
            debug!("framebuffer device from environment: {}", device);
            fb.device = device;
        }

        if let Some(count) = lookup("SWAPCHAIN_MAX_WINDOW_BUFFERS").and_then(|v| v.trim().parse::<i64>().ok()) {
            fb.max_window_buffers = count.clamp(2, MAX_BUFFERS as i64) as u32;
        }

        if let Some(value) = lookup("SWAPCHAIN_SINGLEBUFFER") {
            fb.single_buffer = !value.starts_with('0');
        }

        if let Some(value) = lookup("SWAPCHAIN_NOCLEAR") {
            fb.no_clear = !value.starts_with('0');
        }

        if let Some(window) = lookup("SWAPCHAIN_FB_WINDOW") {
            if WindowPlacement::parse(&window).is_some() {
                fb.window = Some(window);
            }
        }
    }
}
