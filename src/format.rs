//! Pixel formats shared by render targets, scanout memory and the blit path.
//!
//! A format is described the way the framebuffer device reports it: a pixel
//! size plus an (offset, length) bitfield per channel. Named constants cover
//! the layouts the framebuffer backend knows how to match.

use std::fmt;

/// One colour channel bitfield inside a pixel word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Channel {
    pub offset: u32,
    pub length: u32,
}

impl Channel {
    pub const fn new(offset: u32, length: u32) -> Self {
        Self { offset, length }
    }

    pub const NONE: Channel = Channel::new(0, 0);
}

/// Pixel layout of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub bits_per_pixel: u32,
    pub red: Channel,
    pub green: Channel,
    pub blue: Channel,
    pub alpha: Channel,
}

impl PixelFormat {
    /// R5 G6 B5, red in the top bits.
    pub const RGB565: PixelFormat = PixelFormat {
        bits_per_pixel: 16,
        red: Channel::new(11, 5),
        green: Channel::new(5, 6),
        blue: Channel::new(0, 5),
        alpha: Channel::NONE,
    };

    pub const ARGB4444: PixelFormat = PixelFormat {
        bits_per_pixel: 16,
        red: Channel::new(8, 4),
        green: Channel::new(4, 4),
        blue: Channel::new(0, 4),
        alpha: Channel::new(12, 4),
    };

    pub const ARGB1555: PixelFormat = PixelFormat {
        bits_per_pixel: 16,
        red: Channel::new(10, 5),
        green: Channel::new(5, 5),
        blue: Channel::new(0, 5),
        alpha: Channel::new(15, 1),
    };

    pub const ARGB8888: PixelFormat = PixelFormat {
        bits_per_pixel: 32,
        red: Channel::new(16, 8),
        green: Channel::new(8, 8),
        blue: Channel::new(0, 8),
        alpha: Channel::new(24, 8),
    };

    /// Byte order R, G, B, A in memory.
    pub const ABGR8888: PixelFormat = PixelFormat {
        bits_per_pixel: 32,
        red: Channel::new(0, 8),
        green: Channel::new(8, 8),
        blue: Channel::new(16, 8),
        alpha: Channel::new(24, 8),
    };

    /// Byte order B, G, R, A reversed: red at bit 8, blue at bit 24.
    pub const BGRA8888: PixelFormat = PixelFormat {
        bits_per_pixel: 32,
        red: Channel::new(8, 8),
        green: Channel::new(16, 8),
        blue: Channel::new(24, 8),
        alpha: Channel::new(0, 8),
    };

    pub fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel / 8) as usize
    }

    /// Channel lengths in red, green, blue, alpha order.
    pub fn channel_sizes(&self) -> [u32; 4] {
        [
            self.red.length,
            self.green.length,
            self.blue.length,
            self.alpha.length,
        ]
    }

    /// Channel offsets in red, green, blue, alpha order.
    pub fn channel_shifts(&self) -> [u32; 4] {
        [
            self.red.offset,
            self.green.offset,
            self.blue.offset,
            self.alpha.offset,
        ]
    }

    /// True when the colour channels occupy the same bits. Alpha is ignored,
    /// scanout never displays it.
    pub fn same_color_layout(&self, other: &PixelFormat) -> bool {
        self.bits_per_pixel == other.bits_per_pixel
            && self.red == other.red
            && self.green == other.green
            && self.blue == other.blue
    }

    /// Find the renderable format that matches a display's reported layout.
    ///
    /// Only the layouts the GPU can write back directly are recognised.
    pub fn matching_display_format(display: &PixelFormat) -> Option<PixelFormat> {
        let offsets = (display.red.offset, display.green.offset, display.blue.offset);
        match (display.bits_per_pixel, offsets) {
            (16, (11, 5, 0)) => Some(PixelFormat::RGB565),
            (16, (8, 4, 0)) => Some(PixelFormat::ARGB4444),
            (16, (10, 5, 0)) => Some(PixelFormat::ARGB1555),
            (32, (16, 8, 0)) => Some(PixelFormat::ARGB8888),
            _ => None,
        }
    }

    /// Read pixel `index` from a little-endian row.
    #[inline]
    pub fn read_pixel(&self, row: &[u8], index: usize) -> u32 {
        match self.bits_per_pixel {
            32 => {
                let at = index * 4;
                u32::from_le_bytes([row[at], row[at + 1], row[at + 2], row[at + 3]])
            }
            16 => {
                let at = index * 2;
                u16::from_le_bytes([row[at], row[at + 1]]) as u32
            }
            _ => row[index] as u32,
        }
    }

    /// Write pixel `index` into a little-endian row.
    #[inline]
    pub fn write_pixel(&self, row: &mut [u8], index: usize, value: u32) {
        match self.bits_per_pixel {
            32 => {
                let at = index * 4;
                row[at..at + 4].copy_from_slice(&value.to_le_bytes());
            }
            16 => {
                let at = index * 2;
                row[at..at + 2].copy_from_slice(&(value as u16).to_le_bytes());
            }
            _ => row[index] = value as u8,
        }
    }

    /// Pack 8-bit channels (r, g, b, a) into a pixel word of this format.
    pub fn pack(&self, rgba: [u8; 4]) -> u32 {
        let channels = [self.red, self.green, self.blue, self.alpha];
        channels
            .iter()
            .zip(rgba.iter())
            .filter(|(c, _)| c.length > 0)
            .fold(0u32, |word, (c, &v)| {
                word | (((v as u32) >> (8 - c.length.min(8))) << c.offset)
            })
    }

    /// Unpack a pixel word to 8-bit channels. Narrow channels expand by a
    /// plain left shift, so 5-bit 31 becomes 248.
    pub fn unpack(&self, word: u32) -> [u8; 4] {
        let mut out = [0u8; 4];
        for (slot, c) in out
            .iter_mut()
            .zip([self.red, self.green, self.blue, self.alpha].iter())
        {
            if c.length == 0 {
                continue;
            }
            let mask = (1u32 << c.length) - 1;
            let v = (word >> c.offset) & mask;
            *slot = (v << (8 - c.length.min(8))) as u8;
        }
        out
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}bpp r{}@{} g{}@{} b{}@{} a{}@{}",
            self.bits_per_pixel,
            self.red.length,
            self.red.offset,
            self.green.length,
            self.green.offset,
            self.blue.length,
            self.blue.offset,
            self.alpha.length,
            self.alpha.offset
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_display_format() {
        assert_eq!(
            PixelFormat::matching_display_format(&PixelFormat::RGB565),
            Some(PixelFormat::RGB565)
        );
        assert_eq!(
            PixelFormat::matching_display_format(&PixelFormat::ARGB1555),
            Some(PixelFormat::ARGB1555)
        );
        assert_eq!(
            PixelFormat::matching_display_format(&PixelFormat::ARGB8888),
            Some(PixelFormat::ARGB8888)
        );
        // Reversed byte order is not something the write-back unit produces
        assert_eq!(PixelFormat::matching_display_format(&PixelFormat::BGRA8888), None);
    }

    #[test]
    fn test_pack_unpack_rgb565() {
        let word = PixelFormat::RGB565.pack([255, 255, 255, 255]);
        assert_eq!(word, 0xFFFF);
        assert_eq!(PixelFormat::RGB565.unpack(word), [248, 252, 248, 0]);

        let red = PixelFormat::RGB565.pack([255, 0, 0, 0]);
        assert_eq!(red, 0xF800);
    }

    #[test]
    fn test_pixel_io_little_endian() {
        let mut row = vec![0u8; 8];
        PixelFormat::ARGB8888.write_pixel(&mut row, 1, 0xAABBCCDD);
        assert_eq!(&row[4..8], &[0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(PixelFormat::ARGB8888.read_pixel(&row, 1), 0xAABBCCDD);

        PixelFormat::RGB565.write_pixel(&mut row, 0, 0xF800);
        assert_eq!(PixelFormat::RGB565.read_pixel(&row, 0), 0xF800);
    }

    #[test]
    fn test_same_color_layout_ignores_alpha() {
        let mut no_alpha = PixelFormat::ARGB8888;
        no_alpha.alpha = Channel::NONE;
        assert!(no_alpha.same_color_layout(&PixelFormat::ARGB8888));
        assert!(!PixelFormat::RGB565.same_color_layout(&PixelFormat::ARGB1555));
    }
}
