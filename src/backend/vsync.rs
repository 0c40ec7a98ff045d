//! Software vsync for framebuffers without a vblank interrupt.

use log::debug;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Default)]
struct Ticks {
    count: u64,
    running: bool,
}

#[derive(Debug, Default)]
struct Shared {
    ticks: Mutex<Ticks>,
    tick: Condvar,
}

/// Background thread that ticks at a fixed rate.
pub struct VsyncTicker {
    shared: Arc<Shared>,
    period: Duration,
    handle: Option<JoinHandle<()>>,
}

impl VsyncTicker {
    pub fn start(hz: u32) -> io::Result<Self> {
        let period = Duration::from_micros(1_000_000 / u64::from(hz.max(1)));
        let shared = Arc::new(Shared::default());
        shared.ticks.lock().running = true;

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("swapchain-vsync".to_string())
            .spawn(move || loop {
                thread::sleep(period);
                let mut ticks = worker.ticks.lock();
                if !ticks.running {
                    break;
                }
                ticks.count += 1;
                worker.tick.notify_all();
            })?;
        debug!("vsync ticker started at {} Hz", hz);

        Ok(Self {
            shared,
            period,
            handle: Some(handle),
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn ticks(&self) -> u64 {
        self.shared.ticks.lock().count
    }

    /// Block for `interval` ticks. Returns at once when stopped.
    pub fn wait(&self, interval: u32) {
        let mut ticks = self.shared.ticks.lock();
        let target = ticks.count + u64::from(interval);
        while ticks.running && ticks.count < target {
            self.shared.tick.wait(&mut ticks);
        }
    }

    pub fn stop(&mut self) {
        {
            let mut ticks = self.shared.ticks.lock();
            ticks.running = false;
            self.shared.tick.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
            debug!("vsync ticker stopped");
        }
    }
}

impl Drop for VsyncTicker {
    fn drop(&mut self) {
        self.stop();
    }
}
