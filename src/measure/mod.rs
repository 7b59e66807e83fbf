//! Finding the part in a camera frame.
//!
//! A frame is reduced to a [BinaryMask] by [ImageMeasurer::binarize], then
//! [ImageMeasurer::find_largest_object] picks the dominant foreground blob
//! and returns its axis-aligned [BoundingRegion] in frame pixels. The pixel
//! work runs on OpenCV's `imgproc`.

use opencv::{
    core::{self, Mat, Point, Rect, Size, Vector},
    imgproc,
    prelude::*,
};
use parse_display::{Display, FromStr};
use serde::{Deserialize, Serialize};

use crate::{frame::Frame, Error, Result};

/// Smallest object the search will ever accept, in pixels.
pub const MIN_AREA_FLOOR: f64 = 500.0;

/// Side of the square structuring element used to close gaps in the mask.
const CLOSE_KERNEL: i32 = 5;

fn default_blur_kernel() -> usize {
    3
}

fn default_clahe_clip_limit() -> f64 {
    3.5
}

fn default_clahe_tiles() -> usize {
    4
}

fn default_adaptive_block() -> usize {
    31
}

fn default_adaptive_c() -> f64 {
    5.0
}

/// How the grayscale image is split into foreground and background.
#[derive(Debug, Copy, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ThresholdMode {
    /// Global automatic level (Otsu).
    #[default]
    Otsu,
    /// Fixed global level.
    Manual {
        /// Pixels strictly above this are foreground.
        level: u8,
    },
    /// Per-pixel level from a Gaussian-weighted neighbourhood mean.
    Adaptive {
        /// Neighbourhood side; forced odd and at least 3.
        #[serde(default = "default_adaptive_block")]
        block_size: usize,
        /// Subtracted from the local mean.
        #[serde(default = "default_adaptive_c")]
        c: f64,
    },
}

/// Preprocessing and threshold settings.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct BinarizeOptions {
    /// Gaussian kernel side; 0 disables, even sizes are bumped to odd.
    #[serde(default = "default_blur_kernel")]
    pub blur_kernel: usize,

    /// Apply local contrast equalization before thresholding.
    #[serde(default)]
    pub clahe: bool,

    /// CLAHE clip limit; non-positive values fall back to the default.
    #[serde(default = "default_clahe_clip_limit")]
    pub clahe_clip_limit: f64,

    /// CLAHE grid side, in tiles.
    #[serde(default = "default_clahe_tiles")]
    pub clahe_tiles: usize,

    /// Threshold strategy.
    #[serde(default)]
    pub threshold: ThresholdMode,

    /// Swap foreground and background after thresholding.
    #[serde(default)]
    pub invert: bool,
}

impl Default for BinarizeOptions {
    fn default() -> Self {
        Self {
            blur_kernel: default_blur_kernel(),
            clahe: false,
            clahe_clip_limit: default_clahe_clip_limit(),
            clahe_tiles: default_clahe_tiles(),
            threshold: ThresholdMode::default(),
            invert: false,
        }
    }
}

/// Minimum object size policy.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MinArea {
    /// Absolute pixel count.
    Pixels(f64),
    /// Percentage of the frame area.
    PercentOfFrame(f64),
}

impl Default for MinArea {
    fn default() -> Self {
        MinArea::PercentOfFrame(2.0)
    }
}

impl MinArea {
    /// Resolve to pixels for a frame of `frame_area` pixels, never below
    /// [MIN_AREA_FLOOR].
    pub fn resolve(&self, frame_area: usize) -> f64 {
        let pixels = match *self {
            MinArea::Pixels(pixels) => pixels,
            MinArea::PercentOfFrame(pct) => (frame_area.max(1) as f64 * pct.max(0.0) / 100.0).round(),
        };
        pixels.max(MIN_AREA_FLOOR)
    }
}

/// Which mask polarity is treated as the object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize, Serialize, Display, FromStr)]
#[serde(rename_all = "snake_case")]
#[display(style = "snake_case")]
pub enum Polarity {
    /// If more than half the mask is white, the background is white: invert.
    #[default]
    MajorityVote,
    /// Search both polarities and keep the qualifying object covering more
    /// pixels.
    BestOfBoth,
}

/// Everything [ImageMeasurer] needs to know.
#[derive(Debug, Copy, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct MeasureOptions {
    /// Preprocessing and thresholding.
    #[serde(default)]
    pub binarize: BinarizeOptions,
    /// Minimum object size.
    #[serde(default)]
    pub min_area: MinArea,
    /// Polarity policy.
    #[serde(default)]
    pub polarity: Polarity,
}

/// A single-channel 0/255 image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinaryMask {
    width: usize,
    height: usize,
    data: Vec<u8>,
}

impl BinaryMask {
    /// Build from raw bytes; any non-zero byte counts as foreground.
    pub fn new(width: usize, height: usize, mut data: Vec<u8>) -> Result<Self> {
        if data.len() != width * height {
            return Err(Error::FrameSize {
                expected: width * height,
                actual: data.len(),
            });
        }
        data.iter_mut().filter(|v| **v != 0).for_each(|v| *v = 255);
        Ok(Self { width, height, data })
    }

    fn from_mat(mat: &Mat) -> Result<Self> {
        Self::new(mat.cols() as usize, mat.rows() as usize, mat.data_bytes()?.to_vec())
    }

    fn to_mat(&self) -> Result<Mat> {
        plane_to_mat(&self.data, 1, self.height)
    }

    /// Width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Row-major 0/255 bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of 255 pixels.
    pub fn count_foreground(&self) -> usize {
        self.data.iter().filter(|v| **v != 0).count()
    }
}

/// An axis-aligned box in frame pixels. Empty (zero width or height) means
/// nothing was found.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct BoundingRegion {
    /// Left edge.
    pub x: usize,
    /// Top edge.
    pub y: usize,
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
}

impl BoundingRegion {
    /// Whether the region holds an object.
    pub fn is_found(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Area in pixels.
    pub fn area(&self) -> usize {
        self.width * self.height
    }

    /// Clip to a `frame_width`x`frame_height` frame.
    pub fn clipped(self, frame_width: usize, frame_height: usize) -> Self {
        let x = self.x.min(frame_width);
        let y = self.y.min(frame_height);
        Self {
            x,
            y,
            width: self.width.min(frame_width - x),
            height: self.height.min(frame_height - y),
        }
    }

    /// Grow by `pad` on every side, clipped to the frame. For display only;
    /// measurements always use the tight box.
    pub fn inflate(self, pad: usize, frame_width: usize, frame_height: usize) -> Self {
        let x = self.x.saturating_sub(pad);
        let y = self.y.saturating_sub(pad);
        Self {
            x,
            y,
            width: (self.x + self.width + pad).min(frame_width) - x,
            height: (self.y + self.height + pad).min(frame_height) - y,
        }
        .clipped(frame_width, frame_height)
    }
}

/// Binarizes frames and locates the dominant object.
#[derive(Debug, Copy, Clone, Default)]
pub struct ImageMeasurer {
    options: MeasureOptions,
}

impl ImageMeasurer {
    /// A measurer with the given options.
    pub fn new(options: MeasureOptions) -> Self {
        Self { options }
    }

    /// The options in use.
    pub fn options(&self) -> &MeasureOptions {
        &self.options
    }

    /// Grayscale, blur, equalize and threshold `frame` into a 0/255 mask.
    ///
    /// # Errors
    ///
    /// Returns [Error::UnsupportedChannels] for frames that are not 1, 3 or
    /// 4 channel, and [Error::Vision] if OpenCV rejects the image.
    pub fn binarize(&self, frame: &Frame) -> Result<BinaryMask> {
        let opts = &self.options.binarize;
        let mut gray = grayscale(frame)?;

        let blur = normalize_kernel(opts.blur_kernel);
        if blur >= 3 {
            let mut blurred = Mat::default();
            imgproc::gaussian_blur_def(&gray, &mut blurred, Size::new(blur, blur), 0.0)?;
            gray = blurred;
        }

        if opts.clahe {
            let clip = if opts.clahe_clip_limit > 0.0 {
                opts.clahe_clip_limit
            } else {
                default_clahe_clip_limit()
            };
            let tiles = opts.clahe_tiles.max(1) as i32;
            let mut clahe = imgproc::create_clahe(clip, Size::new(tiles, tiles))?;
            let mut equalized = Mat::default();
            clahe.apply(&gray, &mut equalized)?;
            gray = equalized;
        }

        let mut binary = Mat::default();
        match opts.threshold {
            ThresholdMode::Otsu => {
                imgproc::threshold(
                    &gray,
                    &mut binary,
                    0.0,
                    255.0,
                    imgproc::THRESH_BINARY | imgproc::THRESH_OTSU,
                )?;
            }
            ThresholdMode::Manual { level } => {
                imgproc::threshold(&gray, &mut binary, f64::from(level), 255.0, imgproc::THRESH_BINARY)?;
            }
            ThresholdMode::Adaptive { block_size, c } => {
                imgproc::adaptive_threshold(
                    &gray,
                    &mut binary,
                    255.0,
                    imgproc::ADAPTIVE_THRESH_GAUSSIAN_C,
                    imgproc::THRESH_BINARY,
                    normalize_block(block_size),
                    c,
                )?;
            }
        }

        if opts.invert {
            binary = invert(&binary)?;
        }
        BinaryMask::from_mat(&binary)
    }

    /// Bounding box of the largest object in `mask` whose contour area is
    /// at least `min_area` (never below [MIN_AREA_FLOOR]), using the
    /// configured polarity policy.
    ///
    /// # Errors
    ///
    /// Returns [Error::Vision] if OpenCV rejects the mask.
    pub fn find_largest_object(&self, mask: &BinaryMask, min_area: f64) -> Result<Option<BoundingRegion>> {
        let min_area = min_area.max(MIN_AREA_FLOOR);
        let mat = mask.to_mat()?;

        match self.options.polarity {
            Polarity::MajorityVote => {
                let work = if mask.count_foreground() > mask.data.len() / 2 {
                    invert(&mat)?
                } else {
                    mat
                };
                Ok(largest_object(&work, min_area)?.map(|(region, _)| region))
            }
            Polarity::BestOfBoth => {
                let as_is = largest_object(&mat, min_area)?;
                let flipped = largest_object(&invert(&mat)?, min_area)?;
                Ok(match (as_is, flipped) {
                    (Some(a), Some(b)) => Some(if b.1 > a.1 { b.0 } else { a.0 }),
                    (a, b) => a.or(b).map(|(region, _)| region),
                })
            }
        }
    }

    /// Binarize `frame` and find its dominant object with the configured
    /// minimum area.
    ///
    /// # Errors
    ///
    /// Returns an error only for unsupported frames; "nothing found" is
    /// `Ok(None)`.
    pub fn measure(&self, frame: &Frame) -> Result<Option<BoundingRegion>> {
        let mask = self.binarize(frame)?;
        let min_area = self.options.min_area.resolve(frame.area());
        self.find_largest_object(&mask, min_area)
    }
}

/// Kernel side for the Gaussian blur: 0 or 1 disables it, even sizes are
/// bumped to the next odd size.
fn normalize_kernel(size: usize) -> i32 {
    match size {
        0 | 1 => 0,
        s if s % 2 == 0 => s as i32 + 1,
        s => s as i32,
    }
}

/// Adaptive block side: odd and at least 3.
fn normalize_block(size: usize) -> i32 {
    let size = size.max(3) as i32;
    if size % 2 == 0 {
        size + 1
    } else {
        size
    }
}

/// Wrap `data` as a `rows`-row matrix of `channels` interleaved bytes.
fn plane_to_mat(data: &[u8], channels: i32, rows: usize) -> Result<Mat> {
    let flat = Mat::from_slice(data)?;
    Ok(flat.reshape(channels, rows as i32)?.try_clone()?)
}

/// Luma from 1, 3 (BGR) or 4 (BGRA) channel frames.
fn grayscale(frame: &Frame) -> Result<Mat> {
    let code = match frame.channels() {
        1 => return plane_to_mat(frame.data(), 1, frame.height()),
        3 => imgproc::COLOR_BGR2GRAY,
        4 => imgproc::COLOR_BGRA2GRAY,
        other => return Err(Error::UnsupportedChannels(other)),
    };
    let color = plane_to_mat(frame.data(), frame.channels() as i32, frame.height())?;
    let mut gray = Mat::default();
    imgproc::cvt_color_def(&color, &mut gray, code)?;
    Ok(gray)
}

fn invert(mask: &Mat) -> Result<Mat> {
    let mut inverted = Mat::default();
    core::bitwise_not(mask, &mut inverted, &core::no_array())?;
    Ok(inverted)
}

/// Largest external contour of white objects in `work` after closing, if
/// it clears `min_area`, along with the foreground pixels inside its box.
fn largest_object(work: &Mat, min_area: f64) -> Result<Option<(BoundingRegion, i32)>> {
    let kernel = imgproc::get_structuring_element(
        imgproc::MORPH_RECT,
        Size::new(CLOSE_KERNEL, CLOSE_KERNEL),
        Point::new(-1, -1),
    )?;
    let mut closed = Mat::default();
    imgproc::morphology_ex_def(work, &mut closed, imgproc::MORPH_CLOSE, &kernel)?;

    let mut contours = Vector::<Vector<Point>>::new();
    imgproc::find_contours(
        &closed,
        &mut contours,
        imgproc::RETR_EXTERNAL,
        imgproc::CHAIN_APPROX_SIMPLE,
        Point::new(0, 0),
    )?;

    let mut best: Option<(f64, Vector<Point>)> = None;
    for contour in contours.iter() {
        let area = imgproc::contour_area(&contour, false)?;
        if best.as_ref().is_none_or(|(top, _)| area > *top) {
            best = Some((area, contour));
        }
    }
    let Some((area, contour)) = best else {
        return Ok(None);
    };
    if area < min_area {
        tracing::trace!(area, min_area, "largest object below minimum area");
        return Ok(None);
    }

    let rect = imgproc::bounding_rect(&contour)?;
    let pixels = core::count_non_zero(&*Mat::roi(&closed, rect)?)?;
    let region = to_region(rect).clipped(work.cols() as usize, work.rows() as usize);
    Ok(region.is_found().then_some((region, pixels)))
}

fn to_region(rect: Rect) -> BoundingRegion {
    BoundingRegion {
        x: rect.x.max(0) as usize,
        y: rect.y.max(0) as usize,
        width: rect.width.max(0) as usize,
        height: rect.height.max(0) as usize,
    }
}
