//! Fixed pixel conversion kernels used by the framebuffer blit path.
//!
//! Four kernels exist, one per combination of 32/16-bit source and
//! destination. Each is driven by per-channel shift and size tables built
//! from the two formats. Destination alpha is always zeroed, scanout does
//! not carry it.

use crate::error::{Result, SwapchainError};
use crate::format::PixelFormat;

/// Per-channel bit positions for one conversion, in r, g, b, a order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionTables {
    pub src_shift: [u32; 4],
    pub src_size: [u32; 4],
    pub dst_shift: [u32; 4],
    pub dst_size: [u32; 4],
}

impl ConversionTables {
    pub fn new(src: &PixelFormat, dst: &PixelFormat) -> Self {
        let mut dst_shift = dst.channel_shifts();
        let mut dst_size = dst.channel_sizes();
        dst_shift[3] = 0;
        dst_size[3] = 0;
        Self {
            src_shift: src.channel_shifts(),
            src_size: src.channel_sizes(),
            dst_shift,
            dst_size,
        }
    }

    #[inline]
    fn convert_pixel(&self, word: u32) -> u32 {
        let mut out = 0u32;
        for i in 0..4 {
            let (ss, sz) = (self.src_shift[i], self.src_size[i]);
            let (ds, dz) = (self.dst_shift[i], self.dst_size[i]);
            if dz == 0 || sz == 0 {
                continue;
            }
            let v = (word >> ss) & ((1u32 << sz) - 1);
            // widen to 8 bits by shifting, then narrow to the destination
            let v8 = if sz >= 8 { v >> (sz - 8) } else { v << (8 - sz) };
            let packed = if dz >= 8 { v8 << (dz - 8) } else { v8 >> (8 - dz) };
            out |= packed << ds;
        }
        out
    }
}

/// Which of the four kernels handles a format pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    Convert32To32,
    Convert32To16,
    Convert16To32,
    Convert16To16,
}

impl Kernel {
    pub fn select(src: &PixelFormat, dst: &PixelFormat) -> Option<Kernel> {
        match (src.bits_per_pixel, dst.bits_per_pixel) {
            (32, 32) => Some(Kernel::Convert32To32),
            (32, 16) => Some(Kernel::Convert32To16),
            (16, 32) => Some(Kernel::Convert16To32),
            (16, 16) => Some(Kernel::Convert16To16),
            _ => None,
        }
    }

    /// Convert `width` pixels of one row.
    pub fn run(&self, tables: &ConversionTables, src: &[u8], dst: &mut [u8], width: usize) {
        match self {
            Kernel::Convert32To32 => {
                for (s, d) in src.chunks_exact(4).zip(dst.chunks_exact_mut(4)).take(width) {
                    let w = u32::from_le_bytes([s[0], s[1], s[2], s[3]]);
                    d.copy_from_slice(&tables.convert_pixel(w).to_le_bytes());
                }
            }
            Kernel::Convert32To16 => {
                for (s, d) in src.chunks_exact(4).zip(dst.chunks_exact_mut(2)).take(width) {
                    let w = u32::from_le_bytes([s[0], s[1], s[2], s[3]]);
                    d.copy_from_slice(&(tables.convert_pixel(w) as u16).to_le_bytes());
                }
            }
            Kernel::Convert16To32 => {
                for (s, d) in src.chunks_exact(2).zip(dst.chunks_exact_mut(4)).take(width) {
                    let w = u16::from_le_bytes([s[0], s[1]]) as u32;
                    d.copy_from_slice(&tables.convert_pixel(w).to_le_bytes());
                }
            }
            Kernel::Convert16To16 => {
                for (s, d) in src.chunks_exact(2).zip(dst.chunks_exact_mut(2)).take(width) {
                    let w = u16::from_le_bytes([s[0], s[1]]) as u32;
                    d.copy_from_slice(&(tables.convert_pixel(w) as u16).to_le_bytes());
                }
            }
        }
    }
}

/// Geometry of one side of a copy.
#[derive(Debug, Clone, Copy)]
pub struct Plane {
    pub format: PixelFormat,
    pub pitch: usize,
}

/// Copy `width` x `height` pixels, converting when the colour layouts differ.
pub fn convert(
    src: &[u8],
    src_plane: Plane,
    dst: &mut [u8],
    dst_plane: Plane,
    width: usize,
    height: usize,
) -> Result<()> {
    let src_row = width * src_plane.format.bytes_per_pixel();
    let dst_row = width * dst_plane.format.bytes_per_pixel();
    check_extent(src.len(), src_plane.pitch, src_row, height, "source")?;
    check_extent(dst.len(), dst_plane.pitch, dst_row, height, "destination")?;

    if src_plane.format.same_color_layout(&dst_plane.format) {
        copy_rows(src, src_plane.pitch, dst, dst_plane.pitch, src_row, height);
        return Ok(());
    }

    let kernel = Kernel::select(&src_plane.format, &dst_plane.format).ok_or_else(|| {
        SwapchainError::BadConfig(format!(
            "no conversion kernel from {} to {}",
            src_plane.format, dst_plane.format
        ))
    })?;
    let tables = ConversionTables::new(&src_plane.format, &dst_plane.format);
    for y in 0..height {
        let s = &src[y * src_plane.pitch..y * src_plane.pitch + src_row];
        let d = &mut dst[y * dst_plane.pitch..y * dst_plane.pitch + dst_row];
        kernel.run(&tables, s, d, width);
    }
    Ok(())
}

/// Row copy; collapses to one copy when both sides are tightly packed.
pub fn copy_rows(
    src: &[u8],
    src_pitch: usize,
    dst: &mut [u8],
    dst_pitch: usize,
    line_length: usize,
    lines: usize,
) {
    if src_pitch == dst_pitch && line_length == dst_pitch {
        let n = line_length * lines;
        dst[..n].copy_from_slice(&src[..n]);
        return;
    }
    for y in 0..lines {
        let s = &src[y * src_pitch..y * src_pitch + line_length];
        dst[y * dst_pitch..y * dst_pitch + line_length].copy_from_slice(s);
    }
}

fn check_extent(len: usize, pitch: usize, row: usize, height: usize, side: &str) -> Result<()> {
    if height == 0 {
        return Ok(());
    }
    let needed = pitch * (height - 1) + row;
    if row > pitch || needed > len {
        return Err(SwapchainError::BadAttribute(format!(
            "{} buffer too small: need {} bytes, have {}",
            side, needed, len
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanline_argb() -> Vec<u8> {
        let pixels: [u32; 4] = [0xFFFF_FFFF, 0xFFFF_0000, 0xFF00_FF00, 0xFF12_3456];
        pixels.iter().flat_map(|p| p.to_le_bytes()).collect()
    }

    #[test]
    fn test_argb_to_rgb565_and_back_quantizes() {
        let src = scanline_argb();
        let mut mid = vec![0u8; 8];
        convert(
            &src,
            Plane { format: PixelFormat::ARGB8888, pitch: 16 },
            &mut mid,
            Plane { format: PixelFormat::RGB565, pitch: 8 },
            4,
            1,
        )
        .unwrap();
        assert_eq!(PixelFormat::RGB565.read_pixel(&mid, 0), 0xFFFF);
        assert_eq!(PixelFormat::RGB565.read_pixel(&mid, 1), 0xF800);
        assert_eq!(PixelFormat::RGB565.read_pixel(&mid, 2), 0x07E0);

        let mut back = vec![0u8; 16];
        convert(
            &mid,
            Plane { format: PixelFormat::RGB565, pitch: 8 },
            &mut back,
            Plane { format: PixelFormat::ARGB8888, pitch: 16 },
            4,
            1,
        )
        .unwrap();
        // 255 -> 31 -> 248, never 255
        assert_eq!(PixelFormat::ARGB8888.read_pixel(&back, 0), 0x00F8_FCF8);
        assert_eq!(PixelFormat::ARGB8888.read_pixel(&back, 1), 0x00F8_0000);
        assert_eq!(PixelFormat::ARGB8888.read_pixel(&back, 2), 0x0000_FC00);
        // 0x12 -> 2 -> 0x10, 0x34 -> 13 -> 0x34, 0x56 -> 10 -> 0x50
        assert_eq!(PixelFormat::ARGB8888.read_pixel(&back, 3), 0x0010_3450);
    }

    #[test]
    fn test_tables_zero_destination_alpha() {
        let tables = ConversionTables::new(&PixelFormat::RGB565, &PixelFormat::ARGB8888);
        assert_eq!(tables.dst_shift, [16, 8, 0, 0]);
        assert_eq!(tables.dst_size, [8, 8, 8, 0]);
        assert_eq!(tables.src_size, [5, 6, 5, 0]);
    }

    #[test]
    fn test_kernel_selection() {
        assert_eq!(
            Kernel::select(&PixelFormat::ARGB8888, &PixelFormat::ABGR8888),
            Some(Kernel::Convert32To32)
        );
        assert_eq!(
            Kernel::select(&PixelFormat::RGB565, &PixelFormat::ARGB1555),
            Some(Kernel::Convert16To16)
        );
    }

    #[test]
    fn test_32_to_32_swaps_channels() {
        let src = 0xFF11_2233u32.to_le_bytes();
        let mut dst = [0u8; 4];
        convert(
            &src,
            Plane { format: PixelFormat::ARGB8888, pitch: 4 },
            &mut dst,
            Plane { format: PixelFormat::ABGR8888, pitch: 4 },
            1,
            1,
        )
        .unwrap();
        assert_eq!(u32::from_le_bytes(dst), 0x0033_2211);
    }

    #[test]
    fn test_same_layout_copies_rows_with_pitch() {
        let src: Vec<u8> = (0..12).collect();
        let mut dst = vec![0u8; 16];
        convert(
            &src,
            Plane { format: PixelFormat::RGB565, pitch: 6 },
            &mut dst,
            Plane { format: PixelFormat::RGB565, pitch: 8 },
            2,
            2,
        )
        .unwrap();
        assert_eq!(&dst[0..4], &[0, 1, 2, 3]);
        assert_eq!(&dst[8..12], &[6, 7, 8, 9]);
        assert_eq!(&dst[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_rejects_short_buffers() {
        let src = vec![0u8; 4];
        let mut dst = vec![0u8; 4];
        let err = convert(
            &src,
            Plane { format: PixelFormat::ARGB8888, pitch: 4 },
            &mut dst,
            Plane { format: PixelFormat::RGB565, pitch: 4 },
            1,
            2,
        );
        assert!(err.is_err());
    }
}
