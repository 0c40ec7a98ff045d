//! Buffer lock coordination
//!
//! Arbitrates CPU, GPU and display access to shared buffers through a kernel
//! lock device. Every access window is bracketed:
//!
//! ```text
//!   register(item) ─▶ process(item) ─▶ ... access ... ─▶ release(item)
//! ```
//!
//! `process` retries with a fixed backoff and gives up after the configured
//! number of retries; a refused lock is logged and the access proceeds
//! unarbitrated. The coordinator is `Send + Sync` and holds no locks of its
//! own, so buffer events may be dispatched from any driver thread.

mod umplock;

pub use umplock::UmpLockDevice;

use crate::config::LockConfig;
use crate::error::{Result, SwapchainError};
use crate::memory::BufferName;
use log::{debug, info, warn};
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Access class of a lock request. Values match the kernel ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u32)]
pub enum LockUsage {
    Renderable = 1,
    Texture = 2,
    CpuWrite = 3,
}

/// One arbitration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockItem {
    pub name: BufferName,
    pub usage: LockUsage,
}

impl LockItem {
    pub fn new(name: BufferName, usage: LockUsage) -> Self {
        Self { name, usage }
    }
}

/// Buffer state transitions reported by render targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceEvent {
    GpuWrite,
    GpuWriteDone,
    GpuRead,
    GpuReadDone,
    CpuAccess,
    CpuAccessDone,
}

/// Kernel lock device: CREATE, PROCESS and RELEASE keyed by item.
#[cfg_attr(test, mockall::automock)]
pub trait LockArbiter: Send + Sync {
    fn create(&self, item: &LockItem) -> io::Result<()>;
    fn process(&self, item: &LockItem) -> io::Result<()>;
    fn release(&self, item: &LockItem) -> io::Result<()>;
}

impl<T: LockArbiter + ?Sized> LockArbiter for std::sync::Arc<T> {
    fn create(&self, item: &LockItem) -> io::Result<()> {
        (**self).create(item)
    }

    fn process(&self, item: &LockItem) -> io::Result<()> {
        (**self).process(item)
    }

    fn release(&self, item: &LockItem) -> io::Result<()> {
        (**self).release(item)
    }
}

/// Arbiter used when no lock device is present. Grants everything.
#[derive(Debug, Default)]
pub struct NullArbiter;

impl LockArbiter for NullArbiter {
    fn create(&self, _item: &LockItem) -> io::Result<()> {
        Ok(())
    }

    fn process(&self, _item: &LockItem) -> io::Result<()> {
        Ok(())
    }

    fn release(&self, _item: &LockItem) -> io::Result<()> {
        Ok(())
    }
}

/// Retry policy for `process`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Duration::from_millis(2),
        }
    }
}

impl LockPolicy {
    /// Upper bound on the time spent sleeping in one `process` call.
    pub fn max_wait(&self) -> Duration {
        self.backoff * self.max_retries
    }
}

#[derive(Debug, Default)]
struct LockStats {
    registered: AtomicU64,
    granted: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    released: AtomicU64,
    failures: AtomicU64,
}

/// Point-in-time copy of the coordinator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockStatsSnapshot {
    pub registered: u64,
    pub granted: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub released: u64,
    pub failures: u64,
}

pub struct LockCoordinator {
    arbiter: Box<dyn LockArbiter>,
    policy: LockPolicy,
    stats: LockStats,
}

impl LockCoordinator {
    pub fn new(arbiter: Box<dyn LockArbiter>, policy: LockPolicy) -> Self {
        Self {
            arbiter,
            policy,
            stats: LockStats::default(),
        }
    }

    /// Coordinator that grants everything without a kernel device.
    pub fn unarbitrated() -> Self {
        Self::new(Box::new(NullArbiter), LockPolicy::default())
    }

    /// Open the configured device. A missing device is not an error: buffer
    /// access then simply runs unarbitrated.
    pub fn from_config(config: &LockConfig) -> Self {
        let policy = config.policy();
        if !config.enabled {
            info!("🔓 Buffer lock arbitration disabled");
            return Self::new(Box::new(NullArbiter), policy);
        }
        match UmpLockDevice::open(&config.device) {
            Ok(device) => {
                info!("🔒 Buffer lock device opened: {}", config.device);
                Self::new(Box::new(device), policy)
            }
            Err(e) => {
                warn!(
                    "⚠️ Lock device {} unavailable ({}), running unarbitrated",
                    config.device, e
                );
                Self::new(Box::new(NullArbiter), policy)
            }
        }
    }

    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// Declare intent to access a buffer.
    pub fn register(&self, item: LockItem) -> Result<()> {
        self.stats.registered.fetch_add(1, Ordering::Relaxed);
        self.arbiter.create(&item).map_err(|e| {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            warn!("lock CREATE {} ({:?}) failed: {}", item.name, item.usage, e);
            SwapchainError::Io(e)
        })
    }

    /// Wait for the arbiter to grant access. Returns the number of attempts.
    ///
    /// Never sleeps longer than `max_retries * backoff`.
    pub fn process(&self, item: LockItem) -> Result<u32> {
        let mut attempts = 1;
        if self.arbiter.process(&item).is_err() {
            debug!("lock {} ({:?}) busy, throttling", item.name, item.usage);
            let mut retries = self.policy.max_retries;
            loop {
                if retries == 0 {
                    self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(SwapchainError::TransientLockTimeout {
                        name: item.name,
                        usage: item.usage,
                        attempts,
                    });
                }
                std::thread::sleep(self.policy.backoff);
                retries -= 1;
                attempts += 1;
                self.stats.retries.fetch_add(1, Ordering::Relaxed);
                if self.arbiter.process(&item).is_ok() {
                    break;
                }
            }
        }
        self.stats.granted.fetch_add(1, Ordering::Relaxed);
        debug!("lock {} ({:?}) granted after {} attempt(s)", item.name, item.usage, attempts);
        Ok(attempts)
    }

    /// Signal that the access window is over.
    pub fn release(&self, item: LockItem) -> Result<()> {
        self.stats.released.fetch_add(1, Ordering::Relaxed);
        self.arbiter.release(&item).map_err(|e| {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            warn!("lock RELEASE {} ({:?}) failed: {}", item.name, item.usage, e);
            SwapchainError::Io(e)
        })
    }

    /// Translate a buffer event into lock traffic. Failures are logged and
    /// swallowed; the access goes ahead either way.
    pub fn dispatch(&self, event: SurfaceEvent, name: BufferName) {
        let (usage, acquire) = match event {
            SurfaceEvent::GpuWrite => (LockUsage::Renderable, true),
            SurfaceEvent::GpuWriteDone => (LockUsage::Renderable, false),
            SurfaceEvent::GpuRead => (LockUsage::Texture, true),
            SurfaceEvent::GpuReadDone => (LockUsage::Texture, false),
            SurfaceEvent::CpuAccess => (LockUsage::CpuWrite, true),
            SurfaceEvent::CpuAccessDone => (LockUsage::CpuWrite, false),
        };
        let item = LockItem::new(name, usage);
        if acquire {
            if self.register(item).is_err() {
                return;
            }
            if let Err(e) = self.process(item) {
                warn!("⚠️ {}, proceeding unarbitrated", e);
            }
        } else {
            let _ = self.release(item);
        }
    }

    pub fn stats(&self) -> LockStatsSnapshot {
        LockStatsSnapshot {
            registered: self.stats.registered.load(Ordering::Relaxed),
            granted: self.stats.granted.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            timeouts: self.stats.timeouts.load(Ordering::Relaxed),
            released: self.stats.released.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::*;
    use mockall::Sequence;
    use std::time::Instant;

    fn item() -> LockItem {
        LockItem::new(BufferName(42), LockUsage::Renderable)
    }

    fn fast_policy() -> LockPolicy {
        LockPolicy {
            max_retries: 5,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_process_granted_first_try() {
        let mut arbiter = MockLockArbiter::new();
        arbiter.expect_process().times(1).returning(|_| Ok(()));
        let locks = LockCoordinator::new(Box::new(arbiter), fast_policy());
        assert_eq!(locks.process(item()).unwrap(), 1);
        assert_eq!(locks.stats().retries, 0);
    }

    #[test]
    fn test_process_succeeds_on_fourth_attempt() {
        let mut arbiter = MockLockArbiter::new();
        let mut seq = Sequence::new();
        arbiter
            .expect_process()
            .times(3)
            .in_sequence(&mut seq)
            .returning(|_| Err(io::Error::from_raw_os_error(libc::EBUSY)));
        arbiter
            .expect_process()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let policy = fast_policy();
        let locks = LockCoordinator::new(Box::new(arbiter), policy);
        let start = Instant::now();
        let attempts = locks.process(item()).unwrap();
        assert_eq!(attempts, 4);
        assert!(attempts - 1 <= policy.max_retries);
        assert_eq!(locks.stats().retries, 3);
        assert!(start.elapsed() >= policy.backoff * 3);
    }

    #[test]
    fn test_process_gives_up_after_retry_ceiling() {
        let mut arbiter = MockLockArbiter::new();
        arbiter
            .expect_process()
            .times(6)
            .returning(|_| Err(io::Error::from_raw_os_error(libc::EBUSY)));
        let locks = LockCoordinator::new(Box::new(arbiter), fast_policy());

        match locks.process(item()) {
            Err(SwapchainError::TransientLockTimeout { attempts, .. }) => assert_eq!(attempts, 6),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(locks.stats().timeouts, 1);
    }

    #[test]
    fn test_dispatch_maps_events_to_usage() {
        let mut arbiter = MockLockArbiter::new();
        arbiter
            .expect_create()
            .with(eq(LockItem::new(BufferName(9), LockUsage::CpuWrite)))
            .times(1)
            .returning(|_| Ok(()));
        arbiter
            .expect_process()
            .with(eq(LockItem::new(BufferName(9), LockUsage::CpuWrite)))
            .times(1)
            .returning(|_| Ok(()));
        arbiter
            .expect_release()
            .with(eq(LockItem::new(BufferName(9), LockUsage::CpuWrite)))
            .times(1)
            .returning(|_| Ok(()));
        arbiter
            .expect_create()
            .with(eq(LockItem::new(BufferName(9), LockUsage::Texture)))
            .times(1)
            .returning(|_| Ok(()));
        arbiter
            .expect_process()
            .with(eq(LockItem::new(BufferName(9), LockUsage::Texture)))
            .times(1)
            .returning(|_| Ok(()));

        let locks = LockCoordinator::new(Box::new(arbiter), fast_policy());
        locks.dispatch(SurfaceEvent::CpuAccess, BufferName(9));
        locks.dispatch(SurfaceEvent::CpuAccessDone, BufferName(9));
        locks.dispatch(SurfaceEvent::GpuRead, BufferName(9));
        assert_eq!(locks.stats().granted, 2);
        assert_eq!(locks.stats().released, 1);
    }

    #[test]
    fn test_dispatch_skips_process_when_create_fails() {
        let mut arbiter = MockLockArbiter::new();
        arbiter
            .expect_create()
            .times(1)
            .returning(|_| Err(io::Error::from_raw_os_error(libc::ENOMEM)));
        arbiter.expect_process().times(0);
        let locks = LockCoordinator::new(Box::new(arbiter), fast_policy());
        locks.dispatch(SurfaceEvent::GpuWrite, BufferName(1));
        assert_eq!(locks.stats().failures, 1);
    }

    #[test]
    fn test_policy_max_wait() {
        assert_eq!(LockPolicy::default().max_wait(), Duration::from_millis(10));
    }
}
