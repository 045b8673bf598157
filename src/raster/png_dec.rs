//! PNG decoding built directly on the `png` crate rather than through
//! `image`: only the low-level decoder exposes bit depth, color type
//! and the interlace flag before the pixels are expanded, and spec
//! §4.C needs all three to decide whether to expand or reject.

use png::{ColorType, Transformations};

use super::{clip_window, DecodeParams, Decoder, PixelFormat, Window};
use crate::error::{Result, ScanError};

pub struct PngDecoder {
    width: u32,
    height: u32,
    format: PixelFormat,
    pixels: Vec<u8>,
    stride: usize,
    full_window: Window,
    window: Window,
    cursor: u32,
}

impl PngDecoder {
    pub fn begin(bytes: &[u8]) -> Result<Self> {
        let mut decoder = png::Decoder::new(bytes);
        decoder.set_transformations(
            Transformations::EXPAND | Transformations::STRIP_16 | Transformations::STRIP_ALPHA,
        );
        let mut reader = decoder
            .read_info()
            .map_err(|e| ScanError::Decode(format!("png: {e}")))?;

        if reader.info().interlaced {
            return Err(ScanError::Decode("png: interlaced images are unsupported".into()));
        }

        let mut buf = vec![0u8; reader.output_buffer_size()];
        let output = reader
            .next_frame(&mut buf)
            .map_err(|e| ScanError::Decode(format!("png: {e}")))?;

        let format = match output.color_type {
            ColorType::Grayscale => PixelFormat::Gray,
            ColorType::Rgb => PixelFormat::Rgb,
            other => {
                return Err(ScanError::Decode(format!(
                    "png: unexpected color type {other:?} after expansion"
                )))
            }
        };
        if output.bit_depth as u8 != 8 {
            return Err(ScanError::Decode("png: expected 8-bit output after transform".into()));
        }

        let width = output.width;
        let height = output.height;
        buf.truncate(output.buffer_size());
        let stride = output.line_size;

        let full_window = Window { x: 0, y: 0, width, height };
        Ok(Self {
            width,
            height,
            format,
            pixels: buf,
            stride,
            full_window,
            window: full_window,
            cursor: 0,
        })
    }

    fn bytes_per_pixel(&self) -> usize {
        match self.format {
            PixelFormat::Gray => 1,
            PixelFormat::Rgb => 3,
        }
    }
}

impl Decoder for PngDecoder {
    fn params(&self) -> DecodeParams {
        DecodeParams {
            pixels_per_line: self.window.width,
            lines: self.window.height,
            depth: 8,
            format: self.format,
            bytes_per_line: self.window.width * self.bytes_per_pixel() as u32,
        }
    }

    fn set_window(&mut self, win: Window) -> Window {
        self.window = clip_window(win, self.width, self.height);
        self.cursor = 0;
        self.window
    }

    fn read_line(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.cursor >= self.window.height {
            return Err(ScanError::Eof);
        }
        let bpp = self.bytes_per_pixel();
        let needed = self.window.width as usize * bpp;
        if buf.len() < needed {
            return Err(ScanError::Invalid("read_line buffer too small".into()));
        }

        let src_row = self.window.y + self.cursor;
        let row_start = src_row as usize * self.stride;
        let row = &self.pixels[row_start..row_start + self.stride];
        let col_off = self.window.x as usize * bpp;
        buf[..needed].copy_from_slice(&row[col_off..col_off + needed]);

        self.cursor += 1;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.window = self.full_window;
        self.cursor = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_gray_png(width: u32, height: u32, pixels: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut out, width, height);
            encoder.set_color(ColorType::Grayscale);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header().unwrap();
            writer.write_image_data(pixels).unwrap();
        }
        out
    }

    #[test]
    fn decodes_8bit_grayscale() {
        let png_bytes = encode_gray_png(2, 2, &[10, 20, 30, 40]);
        let mut dec = PngDecoder::begin(&png_bytes).unwrap();
        assert_eq!(dec.params().format, PixelFormat::Gray);
        let mut row = vec![0u8; 2];
        dec.read_line(&mut row).unwrap();
        assert_eq!(row, vec![10, 20]);
        dec.read_line(&mut row).unwrap();
        assert_eq!(row, vec![30, 40]);
        assert!(matches!(dec.read_line(&mut row), Err(ScanError::Eof)));
    }

    #[test]
    fn rejects_corrupt_input() {
        assert!(PngDecoder::begin(b"not a png").is_err());
    }
}
