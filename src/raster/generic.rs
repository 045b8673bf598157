//! JPEG/TIFF decoding via the `image` crate. The spec places no
//! bit-exactness requirement on these two formats beyond the uniform
//! line contract, so a full-image decode-then-serve is sufficient.

use super::{clip_window, DecodeParams, Decoder, PixelFormat, Window};
use crate::error::{Result, ScanError};

pub struct GenericDecoder {
    width: u32,
    height: u32,
    format: PixelFormat,
    pixels: Vec<u8>,
    stride: usize,
    full_window: Window,
    window: Window,
    cursor: u32,
}

impl GenericDecoder {
    pub fn begin(bytes: &[u8], format: image::ImageFormat) -> Result<Self> {
        let dynimg = image::load_from_memory_with_format(bytes, format)
            .map_err(|e| ScanError::Decode(format!("{format:?}: {e}")))?;

        let is_gray = matches!(
            dynimg.color(),
            image::ColorType::L8 | image::ColorType::L16
        );

        let (width, height, pixels, bpp, out_format) = if is_gray {
            let img = dynimg.to_luma8();
            let (w, h) = (img.width(), img.height());
            (w, h, img.into_raw(), 1usize, PixelFormat::Gray)
        } else {
            let img = dynimg.to_rgb8();
            let (w, h) = (img.width(), img.height());
            (w, h, img.into_raw(), 3usize, PixelFormat::Rgb)
        };

        let stride = width as usize * bpp;
        let full_window = Window { x: 0, y: 0, width, height };
        Ok(Self {
            width,
            height,
            format: out_format,
            pixels,
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

impl Decoder for GenericDecoder {
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

    #[test]
    fn rejects_garbage_jpeg() {
        assert!(GenericDecoder::begin(b"not a jpeg", image::ImageFormat::Jpeg).is_err());
    }
}
