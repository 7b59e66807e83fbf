//! Camera frames and where they come from.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::DynamicImage;

use crate::Error;

/// An interleaved 8-bit image: 1 channel (gray), 3 (BGR) or 4 (BGRA).
///
/// Frames are borrowed by the measurement code for the duration of a call
/// and never retained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    width: usize,
    height: usize,
    channels: usize,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap a raw buffer. The buffer must hold exactly
    /// `width * height * channels` bytes.
    pub fn new(width: usize, height: usize, channels: usize, data: Vec<u8>) -> crate::Result<Self> {
        let expected = width * height * channels;
        if channels == 0 {
            return Err(Error::UnsupportedChannels(channels));
        }
        if data.len() != expected {
            return Err(Error::FrameSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// Wrap a single-channel buffer.
    pub fn gray(width: usize, height: usize, data: Vec<u8>) -> crate::Result<Self> {
        Self::new(width, height, 1, data)
    }

    /// Convert a decoded image, reordering color channels to BGR(A).
    pub fn from_image(image: DynamicImage) -> Self {
        let (width, height) = (image.width() as usize, image.height() as usize);
        match image {
            DynamicImage::ImageLuma8(gray) => Self {
                width,
                height,
                channels: 1,
                data: gray.into_raw(),
            },
            image if image.color().has_alpha() => {
                let mut data = image.into_rgba8().into_raw();
                data.chunks_exact_mut(4).for_each(|px| px.swap(0, 2));
                Self {
                    width,
                    height,
                    channels: 4,
                    data,
                }
            }
            image => {
                let mut data = image.into_rgb8().into_raw();
                data.chunks_exact_mut(3).for_each(|px| px.swap(0, 2));
                Self {
                    width,
                    height,
                    channels: 3,
                    data,
                }
            }
        }
    }

    /// Decode an image file.
    pub fn open(path: &Path) -> Result<Self> {
        let image = image::open(path).with_context(|| format!("failed to decode {}", path.display()))?;
        Ok(Self::from_image(image))
    }

    /// Width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Interleaved channels per pixel.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Width times height.
    pub fn area(&self) -> usize {
        self.width * self.height
    }

    /// Raw interleaved bytes, row-major.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Something that can produce a frame on demand, typically a camera.
#[async_trait::async_trait]
pub trait FrameSource: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// Grab one frame.
    async fn capture(&self) -> Result<Frame>;
}

/// A camera that drops its latest exposure into an image file, re-read on
/// every capture.
#[derive(Debug, Clone)]
pub struct ImageFileSource {
    name: String,
    path: PathBuf,
}

impl ImageFileSource {
    /// A source reading `path`.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

#[async_trait::async_trait]
impl FrameSource for ImageFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn capture(&self) -> Result<Frame> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || Frame::open(&path)).await?
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_frame_size_checked() {
        assert!(matches!(
            Frame::new(4, 4, 3, vec![0; 47]),
            Err(Error::FrameSize {
                expected: 48,
                actual: 47
            })
        ));
        assert!(Frame::new(4, 4, 3, vec![0; 48]).is_ok());
        assert!(matches!(Frame::new(4, 4, 0, vec![]), Err(Error::UnsupportedChannels(0))));
    }

    #[test]
    fn test_from_image_swaps_to_bgr() {
        let image = RgbImage::from_pixel(2, 1, Rgb([10, 20, 30]));
        let frame = Frame::from_image(DynamicImage::ImageRgb8(image));

        assert_eq!(frame.channels(), 3);
        assert_eq!(frame.data(), &[30, 20, 10, 30, 20, 10]);
    }

    #[tokio::test]
    async fn test_image_file_source_round_trips_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("top.png");
        image::GrayImage::from_pixel(8, 6, image::Luma([200])).save(&path).unwrap();

        let source = ImageFileSource::new("top", &path);
        let frame = source.capture().await.unwrap();
        assert_eq!(source.name(), "top");
        assert_eq!((frame.width(), frame.height(), frame.channels()), (8, 6, 1));
        assert!(frame.data().iter().all(|&v| v == 200));
    }

    #[tokio::test]
    async fn test_image_file_source_missing_file() {
        let source = ImageFileSource::new("side", "/nonexistent/side.png");
        assert!(source.capture().await.is_err());
    }
}
