//! Button rasterization

use crate::model::{ButtonStyle, ControlType};

/// Edge length of a rendered button in pixels
pub const IMAGE_SIZE: usize = 72;

/// Bytes per pixel (RGB)
pub const BYTES_PER_PIXEL: usize = 3;

/// Turns a style into raw image bytes
pub trait Rasterizer: Send + Sync + 'static {
    /// Rasterize one button; output is `IMAGE_SIZE`² RGB pixels, row-major
    fn render(&self, control_type: ControlType, style: &ButtonStyle) -> Vec<u8>;
}

/// Fills the square with the style's background colour
#[derive(Clone, Copy, Debug, Default)]
pub struct SolidRasterizer;

impl Rasterizer for SolidRasterizer {
    fn render(&self, _control_type: ControlType, style: &ButtonStyle) -> Vec<u8> {
        let [_, r, g, b] = style.bgcolor.to_be_bytes();
        [r, g, b].repeat(IMAGE_SIZE * IMAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solid_fill_uses_background() {
        let style = ButtonStyle {
            bgcolor: 0x00ff_8000,
            ..ButtonStyle::default()
        };
        let bytes = SolidRasterizer.render(ControlType::Button, &style);
        assert_eq!(bytes.len(), IMAGE_SIZE * IMAGE_SIZE * BYTES_PER_PIXEL);
        assert_eq!(&bytes[..3], &[0xff, 0x80, 0x00]);
        assert_eq!(&bytes[bytes.len() - 3..], &[0xff, 0x80, 0x00]);
    }
}
