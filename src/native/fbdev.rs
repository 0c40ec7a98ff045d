//! Linux fbdev device via `FBIOGET_*SCREENINFO` / `FBIOPAN_DISPLAY`.

use super::{FixScreenInfo, FramebufferDevice, VarScreenInfo};
use crate::format::Channel;
use crate::memory::Region;
use log::debug;
use memmap2::MmapOptions;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;

const FBIOGET_VSCREENINFO: u32 = 0x4600;
const FBIOGET_FSCREENINFO: u32 = 0x4602;
const FBIOPAN_DISPLAY: u32 = 0x4606;

#[repr(C)]
#[derive(Clone, Copy, Default)]
#[allow(dead_code)]
struct FbBitfield {
    offset: u32,
    length: u32,
    msb_right: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
#[allow(dead_code)]
struct FbVarScreeninfo {
    xres: u32,
    yres: u32,
    xres_virtual: u32,
    yres_virtual: u32,
    xoffset: u32,
    yoffset: u32,
    bits_per_pixel: u32,
    grayscale: u32,
    red: FbBitfield,
    green: FbBitfield,
    blue: FbBitfield,
    transp: FbBitfield,
    nonstd: u32,
    activate: u32,
    height: u32,
    width: u32,
    accel_flags: u32,
    pixclock: u32,
    left_margin: u32,
    right_margin: u32,
    upper_margin: u32,
    lower_margin: u32,
    hsync_len: u32,
    vsync_len: u32,
    sync: u32,
    vmode: u32,
    rotate: u32,
    colorspace: u32,
    reserved: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct FbFixScreeninfo {
    id: [u8; 16],
    smem_start: libc::c_ulong,
    smem_len: u32,
    type_: u32,
    type_aux: u32,
    visual: u32,
    xpanstep: u16,
    ypanstep: u16,
    ywrapstep: u16,
    line_length: u32,
    mmio_start: libc::c_ulong,
    mmio_len: u32,
    accel: u32,
    capabilities: u16,
    reserved: [u16; 2],
}

fn channel(field: &FbBitfield) -> Channel {
    Channel::new(field.offset, field.length)
}

/// An opened `/dev/fbN` node.
pub struct LinuxFramebuffer {
    file: File,
    // last full var info read, so pans round-trip fields we don't model
    raw_var: FbVarScreeninfo,
}

impl LinuxFramebuffer {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        debug!("opened framebuffer {}", path.as_ref().display());
        Ok(Self {
            file,
            raw_var: FbVarScreeninfo::default(),
        })
    }

    fn ioctl<T>(&self, request: u32, arg: &mut T) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, arg as *mut T) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl FramebufferDevice for LinuxFramebuffer {
    fn var_screen_info(&mut self) -> io::Result<VarScreenInfo> {
        let mut raw = FbVarScreeninfo::default();
        self.ioctl(FBIOGET_VSCREENINFO, &mut raw)?;
        self.raw_var = raw;
        Ok(VarScreenInfo {
            xres: raw.xres,
            yres: raw.yres,
            xres_virtual: raw.xres_virtual,
            yres_virtual: raw.yres_virtual,
            xoffset: raw.xoffset,
            yoffset: raw.yoffset,
            bits_per_pixel: raw.bits_per_pixel,
            red: channel(&raw.red),
            green: channel(&raw.green),
            blue: channel(&raw.blue),
            transp: channel(&raw.transp),
        })
    }

    fn fix_screen_info(&mut self) -> io::Result<FixScreenInfo> {
        let mut raw = FbFixScreeninfo {
            id: [0; 16],
            smem_start: 0,
            smem_len: 0,
            type_: 0,
            type_aux: 0,
            visual: 0,
            xpanstep: 0,
            ypanstep: 0,
            ywrapstep: 0,
            line_length: 0,
            mmio_start: 0,
            mmio_len: 0,
            accel: 0,
            capabilities: 0,
            reserved: [0; 2],
        };
        self.ioctl(FBIOGET_FSCREENINFO, &mut raw)?;
        Ok(FixScreenInfo {
            smem_len: raw.smem_len,
            line_length: raw.line_length,
        })
    }

    fn pan_display(&mut self, info: &VarScreenInfo) -> io::Result<()> {
        let mut raw = self.raw_var;
        raw.xoffset = info.xoffset;
        raw.yoffset = info.yoffset;
        self.ioctl(FBIOPAN_DISPLAY, &mut raw)?;
        self.raw_var = raw;
        Ok(())
    }

    fn map_scanout(&mut self, len: usize) -> io::Result<Arc<Region>> {
        let map = unsafe { MmapOptions::new().len(len).map_mut(&self.file)? };
        Ok(Region::from_map(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_screeninfo_layout() {
        // 40 u32 fields in the kernel ABI
        assert_eq!(std::mem::size_of::<FbVarScreeninfo>(), 160);
    }

    #[test]
    fn test_open_missing_device() {
        assert!(LinuxFramebuffer::open("/nonexistent/fb0").is_err());
    }
}
