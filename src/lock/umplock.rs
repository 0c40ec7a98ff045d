use super::{LockArbiter, LockItem};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

const LOCK_IOCTL_GROUP: u32 = 0x91;
const LOCK_IOCTL_CREATE_CMD: u32 = 0;
const LOCK_IOCTL_PROCESS_CMD: u32 = 1;
const LOCK_IOCTL_RELEASE_CMD: u32 = 2;

#[repr(C)]
struct RawLockItem {
    secure_id: u32,
    usage: u32,
}

/// `_IOW(group, nr, RawLockItem)` on the generic Linux encoding.
const fn iow(nr: u32) -> u32 {
    const IOC_WRITE: u32 = 1;
    let size = std::mem::size_of::<RawLockItem>() as u32;
    (IOC_WRITE << 30) | (size << 16) | (LOCK_IOCTL_GROUP << 8) | nr
}

/// Kernel lock device (`/dev/umplock`).
pub struct UmpLockDevice {
    file: File,
}

impl UmpLockDevice {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    fn ioctl(&self, cmd: u32, item: &LockItem) -> io::Result<()> {
        let mut raw = RawLockItem {
            secure_id: item.name.0,
            usage: item.usage as u32,
        };
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                iow(cmd) as _,
                &mut raw as *mut RawLockItem,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl LockArbiter for UmpLockDevice {
    fn create(&self, item: &LockItem) -> io::Result<()> {
        self.ioctl(LOCK_IOCTL_CREATE_CMD, item)
    }

    fn process(&self, item: &LockItem) -> io::Result<()> {
        self.ioctl(LOCK_IOCTL_PROCESS_CMD, item)
    }

    fn release(&self, item: &LockItem) -> io::Result<()> {
        self.ioctl(LOCK_IOCTL_RELEASE_CMD, item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_numbers() {
        assert_eq!(iow(LOCK_IOCTL_CREATE_CMD), 0x4008_9100);
        assert_eq!(iow(LOCK_IOCTL_PROCESS_CMD), 0x4008_9101);
        assert_eq!(iow(LOCK_IOCTL_RELEASE_CMD), 0x4008_9102);
    }

    #[test]
    fn test_missing_device_fails_to_open() {
        assert!(UmpLockDevice::open("/nonexistent/umplock").is_err());
    }
}
