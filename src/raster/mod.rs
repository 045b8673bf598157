//! Image decoder dispatch (spec §4.C): format detection, a uniform
//! line-by-line decode contract, and window clipping, over BMP/PNG
//! (hand-written / `png`-backed for bit-exactness) and JPEG/TIFF (the
//! `image` crate, which places no bit-exactness requirement on us).

mod bmp;
mod generic;
mod png_dec;

use crate::error::{Result, ScanError};

/// Output pixel layout. All decoders normalise to one of these two.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PixelFormat {
    Gray,
    Rgb,
}

/// Parameters of the decoded image, as returned by [`Decoder::params`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DecodeParams {
    pub pixels_per_line: u32,
    pub lines: u32,
    pub depth: u8,
    pub format: PixelFormat,
    pub bytes_per_line: u32,
}

/// A requested (or, after `set_window`, actually applied) clip region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Window {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Uniform decode interface (spec §4.C "Image decoder"). A decoder owns
/// its source bytes for its lifetime; `reset` rewinds to just after
/// `begin` without re-parsing headers.
pub trait Decoder: Send {
    fn params(&self) -> DecodeParams;

    /// Clips to `win`, intersected with the image bounds, and returns
    /// the window actually applied.
    fn set_window(&mut self, win: Window) -> Window;

    /// Fills one output row of `get_params().bytes_per_line` bytes.
    /// Returns [`ScanError::Eof`] once `lines` rows (within the current
    /// window) have been produced.
    fn read_line(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Returns to the state immediately after `begin`: window reset to
    /// the full image, cursor reset to row 0.
    fn reset(&mut self) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Magic {
    Bmp,
    Jpeg,
    Png,
    Tiff,
}

fn detect(bytes: &[u8]) -> Option<Magic> {
    if bytes.starts_with(b"BM") {
        Some(Magic::Bmp)
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(Magic::Jpeg)
    } else if bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
        Some(Magic::Png)
    } else if bytes.starts_with(b"II*\0") || bytes.starts_with(b"MM\0*") {
        Some(Magic::Tiff)
    } else {
        None
    }
}

/// Detects the format from magic bytes and builds the matching decoder.
/// Unknown magic fails the scan (spec §4.C).
pub fn open(bytes: &[u8]) -> Result<Box<dyn Decoder>> {
    match detect(bytes) {
        Some(Magic::Bmp) => Ok(Box::new(bmp::BmpDecoder::begin(bytes)?)),
        Some(Magic::Png) => Ok(Box::new(png_dec::PngDecoder::begin(bytes)?)),
        Some(Magic::Jpeg) => Ok(Box::new(generic::GenericDecoder::begin(
            bytes,
            image::ImageFormat::Jpeg,
        )?)),
        Some(Magic::Tiff) => Ok(Box::new(generic::GenericDecoder::begin(
            bytes,
            image::ImageFormat::Tiff,
        )?)),
        None => Err(ScanError::Decode("unrecognized image magic bytes".into())),
    }
}

/// Intersects a requested window with the image's full bounds, as every
/// decoder's `set_window` must (spec §4.C "writes back the actually
/// applied window").
pub(crate) fn clip_window(requested: Window, full_w: u32, full_h: u32) -> Window {
    let x = requested.x.min(full_w);
    let y = requested.y.min(full_h);
    let width = requested.width.min(full_w.saturating_sub(x));
    let height = requested.height.min(full_h.saturating_sub(y));
    Window { x, y, width, height }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_known_magic_bytes() {
        assert_eq!(detect(b"BM\0\0\0\0"), Some(Magic::Bmp));
        assert_eq!(detect(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(Magic::Jpeg));
        assert_eq!(detect(&[0x89, 0x50, 0x4E, 0x47, 0x0D]), Some(Magic::Png));
        assert_eq!(detect(b"II*\0abcd"), Some(Magic::Tiff));
        assert_eq!(detect(b"MM\0*abcd"), Some(Magic::Tiff));
        assert_eq!(detect(b"garbage!"), None);
    }

    #[test]
    fn clip_window_intersects_bounds() {
        let w = clip_window(Window { x: 10, y: 10, width: 1000, height: 1000 }, 100, 50);
        assert_eq!(w, Window { x: 10, y: 10, width: 90, height: 40 });
    }
}
