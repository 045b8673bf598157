//! Hand-written, bit-exact BMP decoder (spec §4.C). No crate in the
//! pack reproduces the bottom-up row flip and truncation-bound checks
//! the spec demands, so this reads the file and DIB headers directly.

use super::{clip_window, DecodeParams, Decoder, PixelFormat, Window};
use crate::error::{Result, ScanError};

fn u16_le(b: &[u8], off: usize) -> Result<u16> {
    b.get(off..off + 2)
        .map(|s| u16::from_le_bytes([s[0], s[1]]))
        .ok_or_else(|| ScanError::Decode("bmp: header truncated".into()))
}

fn u32_le(b: &[u8], off: usize) -> Result<u32> {
    b.get(off..off + 4)
        .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
        .ok_or_else(|| ScanError::Decode("bmp: header truncated".into()))
}

fn i32_le(b: &[u8], off: usize) -> Result<i32> {
    u32_le(b, off).map(|v| v as i32)
}

pub struct BmpDecoder {
    width: u32,
    height_abs: u32,
    bottom_up: bool,
    row_size: usize,
    bytes_per_src_pixel: usize,
    format: PixelFormat,
    pixel_data: Vec<u8>,
    palette: Vec<[u8; 3]>,
    full_window: Window,
    window: Window,
    cursor: u32,
}

impl BmpDecoder {
    pub fn begin(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 14 + 40 || &bytes[0..2] != b"BM" {
            return Err(ScanError::Decode("bmp: bad signature".into()));
        }
        let bf_off_bits = u32_le(bytes, 10)? as usize;
        let dib_size = u32_le(bytes, 14)? as usize;
        if dib_size < 40 {
            return Err(ScanError::Decode("bmp: unsupported DIB header".into()));
        }
        let width = i32_le(bytes, 18)?;
        let height = i32_le(bytes, 22)?;
        let bit_count = u16_le(bytes, 28)?;
        let compression = u32_le(bytes, 30)?;
        let mut clr_used = u32_le(bytes, 46)?;

        if width <= 0 {
            return Err(ScanError::Decode("bmp: non-positive width".into()));
        }
        if compression != 0 {
            return Err(ScanError::Decode("bmp: compressed bitmaps are unsupported".into()));
        }
        if !matches!(bit_count, 8 | 24 | 32) {
            return Err(ScanError::Decode(format!(
                "bmp: unsupported bit count {bit_count}"
            )));
        }

        let width = width as u32;
        let bottom_up = height > 0;
        let height_abs = height.unsigned_abs();

        let row_data_bits = width as u64 * bit_count as u64;
        let row_size = (((row_data_bits + 31) / 32) * 4) as usize;
        let row_data_bytes = ((row_data_bits + 7) / 8) as usize;
        let padding = row_size - row_data_bytes;

        let palette = if bit_count == 8 {
            if clr_used == 0 {
                clr_used = 256;
            }
            let palette_start = 14 + dib_size;
            let mut entries = Vec::with_capacity(clr_used as usize);
            for i in 0..clr_used as usize {
                let off = palette_start + i * 4;
                let b = *bytes
                    .get(off)
                    .ok_or_else(|| ScanError::Decode("bmp: palette truncated".into()))?;
                let g = *bytes
                    .get(off + 1)
                    .ok_or_else(|| ScanError::Decode("bmp: palette truncated".into()))?;
                let r = *bytes
                    .get(off + 2)
                    .ok_or_else(|| ScanError::Decode("bmp: palette truncated".into()))?;
                let _ = b;
                entries.push([r, g, b]);
            }
            entries
        } else {
            clr_used = 0;
            Vec::new()
        };

        let header_size = 14 + dib_size;
        let required = header_size as u64
            + clr_used as u64 * 4
            + height_abs as u64 * row_size as u64
            - padding as u64;
        if required > bytes.len() as u64 {
            return Err(ScanError::Decode("bmp: file truncated".into()));
        }

        let data_start = bf_off_bits.max(header_size + clr_used as usize * 4);
        let data_len = row_size * height_abs as usize;
        let data_end = data_start
            .checked_add(data_len)
            .ok_or_else(|| ScanError::Decode("bmp: pixel data overflows file".into()))?;
        let pixel_data = bytes
            .get(data_start..data_end.min(bytes.len()))
            .ok_or_else(|| ScanError::Decode("bmp: pixel data truncated".into()))?
            .to_vec();
        // A strictly-truncated last row (missing only its padding bytes) is
        // tolerated by the bound above; pad it back out so row indexing
        // below stays a uniform stride.
        let mut pixel_data = pixel_data;
        pixel_data.resize(data_len, 0);

        let format = if bit_count == 8 { PixelFormat::Gray } else { PixelFormat::Rgb };
        let bytes_per_src_pixel = bit_count as usize / 8;

        let full_window = Window { x: 0, y: 0, width, height: height_abs };

        Ok(Self {
            width,
            height_abs,
            bottom_up,
            row_size,
            bytes_per_src_pixel,
            format,
            pixel_data,
            palette,
            full_window,
            window: full_window,
            cursor: 0,
        })
    }

    fn bytes_per_out_pixel(&self) -> usize {
        match self.format {
            PixelFormat::Gray => 1,
            PixelFormat::Rgb => 3,
        }
    }

    fn source_row(&self, output_row: u32) -> u32 {
        if self.bottom_up {
            self.height_abs - 1 - output_row
        } else {
            output_row
        }
    }
}

impl Decoder for BmpDecoder {
    fn params(&self) -> DecodeParams {
        DecodeParams {
            pixels_per_line: self.window.width,
            lines: self.window.height,
            depth: 8,
            format: self.format,
            bytes_per_line: self.window.width * self.bytes_per_out_pixel() as u32,
        }
    }

    fn set_window(&mut self, win: Window) -> Window {
        self.window = clip_window(win, self.full_window.width, self.full_window.height);
        self.cursor = 0;
        self.window
    }

    fn read_line(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.cursor >= self.window.height {
            return Err(ScanError::Eof);
        }
        let src_row = self.source_row(self.window.y + self.cursor);
        let row_start = src_row as usize * self.row_size;
        let row = &self.pixel_data[row_start..row_start + self.row_size];

        let bpp = self.bytes_per_out_pixel();
        let needed = self.window.width as usize * bpp;
        if buf.len() < needed {
            return Err(ScanError::Invalid("read_line buffer too small".into()));
        }

        for col in 0..self.window.width as usize {
            let src_col = self.window.x as usize + col;
            match self.format {
                PixelFormat::Gray => {
                    let idx = self.pixel_data_byte(row, src_col);
                    let gray = self
                        .palette
                        .get(idx as usize)
                        .map(|p| p[0])
                        .unwrap_or(idx);
                    buf[col] = gray;
                }
                PixelFormat::Rgb => {
                    let off = src_col * self.bytes_per_src_pixel;
                    // On-disk order is B,G,R(,A); swap to R,G,B and drop alpha.
                    let b = row[off];
                    let g = row[off + 1];
                    let r = row[off + 2];
                    buf[col * 3] = r;
                    buf[col * 3 + 1] = g;
                    buf[col * 3 + 2] = b;
                }
            }
        }

        self.cursor += 1;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.window = self.full_window;
        self.cursor = 0;
        Ok(())
    }
}

impl BmpDecoder {
    fn pixel_data_byte(&self, row: &[u8], col: usize) -> u8 {
        row[col]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bmp_header(width: i32, height: i32, bit_count: u16, palette: &[[u8; 3]]) -> Vec<u8> {
        let clr_used = if bit_count == 8 { palette.len() as u32 } else { 0 };
        let row_bits = width.unsigned_abs() as u64 * bit_count as u64;
        let row_size = (((row_bits + 31) / 32) * 4) as usize;
        let pixel_len = row_size * height.unsigned_abs() as usize;
        let palette_bytes = clr_used as usize * 4;
        let data_offset = 14 + 40 + palette_bytes;
        let file_size = data_offset + pixel_len;

        let mut out = Vec::new();
        out.extend_from_slice(b"BM");
        out.extend_from_slice(&(file_size as u32).to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&(data_offset as u32).to_le_bytes());
        // DIB header (BITMAPINFOHEADER)
        out.extend_from_slice(&40u32.to_le_bytes());
        out.extend_from_slice(&width.to_le_bytes());
        out.extend_from_slice(&height.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // planes
        out.extend_from_slice(&bit_count.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // compression
        out.extend_from_slice(&(pixel_len as u32).to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&clr_used.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());

        for p in palette {
            out.push(p[2]); // B
            out.push(p[1]); // G
            out.push(p[0]); // R
            out.push(0);
        }
        out
    }

    #[test]
    fn bottom_up_24bit_round_trip_flips_rows() {
        // 2x2, bottom-up, row 0 in file = bottom of image.
        let width = 2i32;
        let height = 2i32; // positive => bottom-up
        let mut bytes = bmp_header(width, height, 24, &[]);
        // File row 0 (bottom of output): (10,20,30),(40,50,60) stored BGR.
        bytes.extend_from_slice(&[30, 20, 10, 60, 50, 40]);
        // File row 1 (top of output): (70,80,90),(100,110,120) stored BGR.
        bytes.extend_from_slice(&[90, 80, 70, 120, 110, 100]);

        let mut dec = BmpDecoder::begin(&bytes).unwrap();
        let params = dec.params();
        assert_eq!(params.pixels_per_line, 2);
        assert_eq!(params.lines, 2);
        assert_eq!(params.format, PixelFormat::Rgb);

        let mut row = vec![0u8; params.bytes_per_line as usize];
        dec.read_line(&mut row).unwrap();
        assert_eq!(row, vec![70, 80, 90, 100, 110, 120], "row 0 of output is file's top row");
        dec.read_line(&mut row).unwrap();
        assert_eq!(row, vec![10, 20, 30, 40, 50, 60], "row 1 of output is file's bottom row");
        assert!(matches!(dec.read_line(&mut row), Err(ScanError::Eof)));
    }

    #[test]
    fn top_down_negative_height_preserves_order() {
        let width = 1i32;
        let height = -2i32;
        let mut bytes = bmp_header(width, height, 24, &[]);
        bytes.extend_from_slice(&[10, 20, 30]); // row 0: R=30,G=20,B=10 -> out (30,20,10)
        bytes.extend_from_slice(&[40, 50, 60]);

        let mut dec = BmpDecoder::begin(&bytes).unwrap();
        let mut row = vec![0u8; 3];
        dec.read_line(&mut row).unwrap();
        assert_eq!(row, vec![30, 20, 10]);
        dec.read_line(&mut row).unwrap();
        assert_eq!(row, vec![60, 50, 40]);
    }

    #[test]
    fn paletted_8bit_decodes_via_palette() {
        let width = 4i32;
        let height = 4i32;
        let palette = [[0, 0, 0], [255, 255, 255]];
        let mut bytes = bmp_header(width, height, 8, &palette);
        // Each 4-pixel row is already 4-byte aligned; four identical rows.
        for _ in 0..4 {
            bytes.extend_from_slice(&[0, 1, 0, 1]);
        }

        let mut dec = BmpDecoder::begin(&bytes).unwrap();
        assert_eq!(dec.params().format, PixelFormat::Gray);
        let mut row = vec![0u8; 4];
        for _ in 0..4 {
            dec.read_line(&mut row).unwrap();
            assert_eq!(row, vec![0, 255, 0, 255]);
        }
    }

    #[test]
    fn rejects_compressed_bitmap() {
        let mut bytes = bmp_header(2, 2, 24, &[]);
        bytes[30] = 1; // biCompression = 1 (RLE8), non-zero
        bytes.extend_from_slice(&[0; 12]);
        assert!(BmpDecoder::begin(&bytes).is_err());
    }

    #[test]
    fn rejects_non_8bit_paletted() {
        let bytes = bmp_header(2, 2, 4, &[]);
        assert!(BmpDecoder::begin(&bytes).is_err());
    }

    #[test]
    fn window_clips_output() {
        let width = 4i32;
        let height = 2i32;
        let mut bytes = bmp_header(width, height, 24, &[]);
        bytes.extend_from_slice(&[0; 12]);
        bytes.extend_from_slice(&[1; 12]);

        let mut dec = BmpDecoder::begin(&bytes).unwrap();
        let applied = dec.set_window(Window { x: 1, y: 0, width: 2, height: 5 });
        assert_eq!(applied, Window { x: 1, y: 0, width: 2, height: 2 });
        assert_eq!(dec.params().pixels_per_line, 2);
    }
}
