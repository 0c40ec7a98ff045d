use super::{BufferName, MemoryDevice, MemoryStrategy, NativeObject, Region};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

struct Entry {
    region: Arc<Region>,
    refs: usize,
}

/// Secure-id registry. Every open takes a reference; the id disappears
/// when the last reference closes.
pub struct SecureIdDevice {
    entries: Mutex<HashMap<u32, Entry>>,
    next_id: AtomicU32,
}

impl SecureIdDevice {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// References held on `name`, zero if it no longer exists.
    pub fn ref_count(&self, name: BufferName) -> usize {
        self.entries.lock().get(&name.0).map_or(0, |e| e.refs)
    }

    pub fn live_ids(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for SecureIdDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDevice for SecureIdDevice {
    fn strategy(&self) -> MemoryStrategy {
        MemoryStrategy::SecureId
    }

    fn allocate(&self, size: usize) -> io::Result<NativeObject> {
        let region = Region::anonymous(size)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(id, Entry { region, refs: 1 });
        debug!("secure id {} allocated ({} bytes)", id, size);
        Ok(NativeObject::SecureId(BufferName(id)))
    }

    fn open(&self, name: BufferName) -> io::Result<NativeObject> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&name.0).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("secure id {} not found", name))
        })?;
        entry.refs += 1;
        Ok(NativeObject::SecureId(name))
    }

    fn name_of(&self, object: &NativeObject) -> io::Result<BufferName> {
        match object {
            NativeObject::SecureId(name) => Ok(*name),
            NativeObject::File(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "file object passed to secure id device",
            )),
        }
    }

    fn map(&self, object: &NativeObject) -> io::Result<Arc<Region>> {
        let name = self.name_of(object)?;
        self.entries
            .lock()
            .get(&name.0)
            .map(|e| Arc::clone(&e.region))
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "secure id released"))
    }

    fn close(&self, object: &NativeObject) {
        let NativeObject::SecureId(name) = object else {
            return;
        };
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&name.0) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(&name.0);
                debug!("secure id {} released", name);
            }
        }
    }
}
