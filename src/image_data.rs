use image::{DynamicImage, GenericImageView};

use crate::errors::{NucleiSegError, Result};

/// Raw samples of a decoded image, interleaved per pixel.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelData {
    U8(Vec<u8>),
    U16(Vec<u16>),
    F32(Vec<f32>),
}

impl PixelData {
    pub fn len(&self) -> usize {
        match self {
            Self::U8(v) => v.len(),
            Self::U16(v) => v.len(),
            Self::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn bit_depth(&self) -> u8 {
        match self {
            Self::U8(_) => 8,
            Self::U16(_) => 16,
            Self::F32(_) => 32,
        }
    }
}

/// An already decoded image handed to the segmentation core.
///
/// The core only ever borrows an `ImageData` immutably; normalization and the
/// fallback path work on their own copies.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageData {
    width: u32,
    height: u32,
    channels: u8,
    data: PixelData,
}

impl ImageData {
    pub fn new(width: u32, height: u32, channels: u8, data: PixelData) -> Result<Self> {
        if width == 0 || height == 0 || channels == 0 {
            return Err(NucleiSegError::UnsupportedImageFormat {
                channels,
                bit_depth: data.bit_depth(),
                reason: format!("empty image {width}x{height}"),
            });
        }

        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(NucleiSegError::UnsupportedImageFormat {
                channels,
                bit_depth: data.bit_depth(),
                reason: format!(
                    "expected {expected} samples for {width}x{height}x{channels}, got {}",
                    data.len()
                ),
            });
        }

        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    pub fn from_rgb8(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        Self::new(width, height, 3, PixelData::U8(data))
    }

    pub fn from_gray8(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        Self::new(width, height, 1, PixelData::U8(data))
    }

    /// Convert any decoded `image` buffer without losing bit depth.
    pub fn from_dynamic(img: &DynamicImage) -> Result<Self> {
        let (width, height) = img.dimensions();
        match img {
            DynamicImage::ImageLuma8(buf) => {
                Self::new(width, height, 1, PixelData::U8(buf.as_raw().clone()))
            }
            DynamicImage::ImageLumaA8(buf) => {
                // Gray+alpha carries no extra colour information; drop alpha.
                let data = buf.pixels().map(|p| p.0[0]).collect();
                Self::new(width, height, 1, PixelData::U8(data))
            }
            DynamicImage::ImageRgb8(buf) => {
                Self::new(width, height, 3, PixelData::U8(buf.as_raw().clone()))
            }
            DynamicImage::ImageRgba8(buf) => {
                Self::new(width, height, 4, PixelData::U8(buf.as_raw().clone()))
            }
            DynamicImage::ImageLuma16(buf) => {
                Self::new(width, height, 1, PixelData::U16(buf.as_raw().clone()))
            }
            DynamicImage::ImageLumaA16(buf) => {
                let data = buf.pixels().map(|p| p.0[0]).collect();
                Self::new(width, height, 1, PixelData::U16(data))
            }
            DynamicImage::ImageRgb16(buf) => {
                Self::new(width, height, 3, PixelData::U16(buf.as_raw().clone()))
            }
            DynamicImage::ImageRgba16(buf) => {
                Self::new(width, height, 4, PixelData::U16(buf.as_raw().clone()))
            }
            DynamicImage::ImageRgb32F(buf) => {
                Self::new(width, height, 3, PixelData::F32(buf.as_raw().clone()))
            }
            DynamicImage::ImageRgba32F(buf) => {
                Self::new(width, height, 4, PixelData::F32(buf.as_raw().clone()))
            }
            other => {
                let color = other.color();
                Err(NucleiSegError::UnsupportedImageFormat {
                    channels: color.channel_count(),
                    bit_depth: (color.bits_per_pixel() / color.channel_count() as u16) as u8,
                    reason: format!("{color:?}"),
                })
            }
        }
    }

    pub const fn width(&self) -> u32 {
        self.width
    }

    pub const fn height(&self) -> u32 {
        self.height
    }

    pub const fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub const fn channels(&self) -> u8 {
        self.channels
    }

    pub const fn bit_depth(&self) -> u8 {
        self.data.bit_depth()
    }

    pub const fn data(&self) -> &PixelData {
        &self.data
    }

    pub const fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}
