use super::{BufferName, MemoryDevice, MemoryStrategy, NativeObject, Region};
use log::debug;
use memmap2::MmapOptions;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::FromRawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct GlobalName {
    file: File,
    ident: (u64, u64),
    opens: usize,
}

/// File-descriptor buffers with a flink-style global name table.
///
/// Importing a name duplicates the descriptor. Looking up the name of a
/// descriptor goes back through the table by (device, inode).
pub struct FdDevice {
    names: Mutex<HashMap<u32, GlobalName>>,
    next_name: AtomicU32,
}

fn identity(file: &File) -> io::Result<(u64, u64)> {
    let meta = file.metadata()?;
    Ok((meta.dev(), meta.ino()))
}

fn create_memfd(size: usize) -> io::Result<File> {
    let name = CString::new("gpu-swapchain-buffer")
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let file = unsafe { File::from_raw_fd(fd) };
    file.set_len(size.max(1) as u64)?;
    Ok(file)
}

impl FdDevice {
    pub fn new() -> Self {
        Self {
            names: Mutex::new(HashMap::new()),
            next_name: AtomicU32::new(1),
        }
    }

    pub fn open_count(&self, name: BufferName) -> usize {
        self.names.lock().get(&name.0).map_or(0, |n| n.opens)
    }

    fn file_of(object: &NativeObject) -> io::Result<&File> {
        match object {
            NativeObject::File(file) => Ok(file),
            NativeObject::SecureId(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "secure id passed to fd device",
            )),
        }
    }
}

impl Default for FdDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDevice for FdDevice {
    fn strategy(&self) -> MemoryStrategy {
        MemoryStrategy::Fd
    }

    fn allocate(&self, size: usize) -> io::Result<NativeObject> {
        let file = create_memfd(size)?;
        let ident = identity(&file)?;
        let handed_out = file.try_clone()?;
        let name = self.next_name.fetch_add(1, Ordering::Relaxed);
        self.names.lock().insert(
            name,
            GlobalName {
                file,
                ident,
                opens: 1,
            },
        );
        debug!("fd buffer named {} ({} bytes)", name, size);
        Ok(NativeObject::File(handed_out))
    }

    fn open(&self, name: BufferName) -> io::Result<NativeObject> {
        let mut names = self.names.lock();
        let entry = names.get_mut(&name.0).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no buffer named {}", name))
        })?;
        let dup = entry.file.try_clone()?;
        entry.opens += 1;
        Ok(NativeObject::File(dup))
    }

    fn name_of(&self, object: &NativeObject) -> io::Result<BufferName> {
        let ident = identity(Self::file_of(object)?)?;
        self.names
            .lock()
            .iter()
            .find(|(_, n)| n.ident == ident)
            .map(|(name, _)| BufferName(*name))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "descriptor has no global name"))
    }

    fn map(&self, object: &NativeObject) -> io::Result<Arc<Region>> {
        let file = Self::file_of(object)?;
        let map = unsafe { MmapOptions::new().map_mut(file)? };
        Ok(Region::from_map(map))
    }

    fn close(&self, object: &NativeObject) {
        let Ok(ident) = Self::file_of(object).and_then(identity) else {
            return;
        };
        let mut names = self.names.lock();
        let name = names
            .iter()
            .find(|(_, n)| n.ident == ident)
            .map(|(name, _)| *name);
        if let Some(name) = name {
            if let Some(entry) = names.get_mut(&name) {
                entry.opens -= 1;
                if entry.opens == 0 {
                    names.remove(&name);
                    debug!("fd buffer {} closed", name);
                }
            }
        }
    }
}
