//! Data Augmentation Module for Thumbnail Classification
//!
//! On-the-fly augmentations applied to training samples only. Thumbnails are
//! renders of 3D models, so the transforms imitate camera variation: a small
//! rotation, a shift of the subject, a zoom, a mirror and a lighting change.
//!
//! # Augmentation Strategy
//!
//! - **Training**: one random draw per sample per epoch
//! - **Validation / Inference**: no augmentation
//!
//! The geometric transforms are composed into a single affine warp sampled
//! bilinearly, with out-of-range coordinates clamped to the nearest edge pixel.

use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Configuration for data augmentation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    /// Maximum rotation angle in degrees (applies ±rotation_degrees)
    pub rotation_degrees: f32,
    /// Maximum horizontal shift as a fraction of the width
    pub width_shift: f32,
    /// Maximum vertical shift as a fraction of the height
    pub height_shift: f32,
    /// Zoom factors are drawn from [1 - zoom_range, 1 + zoom_range]
    pub zoom_range: f32,
    /// Probability of mirroring the image horizontally
    pub horizontal_flip_prob: f32,
    /// Multiplicative brightness range (min, max)
    pub brightness_range: (f32, f32),
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            rotation_degrees: 20.0,
            width_shift: 0.2,
            height_shift: 0.2,
            zoom_range: 0.15,
            horizontal_flip_prob: 0.5,
            brightness_range: (0.8, 1.2),
        }
    }
}

impl AugmentationConfig {
    /// Disable all augmentations
    pub fn none() -> Self {
        Self {
            rotation_degrees: 0.0,
            width_shift: 0.0,
            height_shift: 0.0,
            zoom_range: 0.0,
            horizontal_flip_prob: 0.0,
            brightness_range: (1.0, 1.0),
        }
    }

    /// Check ranges before a run starts
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=180.0).contains(&self.rotation_degrees) {
            return Err("rotation_degrees must be in [0, 180]".to_string());
        }
        if !(0.0..1.0).contains(&self.width_shift) || !(0.0..1.0).contains(&self.height_shift) {
            return Err("width_shift and height_shift must be in [0, 1)".to_string());
        }
        if !(0.0..1.0).contains(&self.zoom_range) {
            return Err("zoom_range must be in [0, 1)".to_string());
        }
        if !(0.0..=1.0).contains(&self.horizontal_flip_prob) {
            return Err("horizontal_flip_prob must be in [0, 1]".to_string());
        }
        let (lo, hi) = self.brightness_range;
        if lo <= 0.0 || hi < lo {
            return Err("brightness_range must satisfy 0 < min <= max".to_string());
        }
        Ok(())
    }
}

/// One concrete draw of augmentation parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentationParams {
    pub angle_degrees: f32,
    /// Shift as a fraction of the width (positive moves content right)
    pub shift_x: f32,
    /// Shift as a fraction of the height (positive moves content down)
    pub shift_y: f32,
    /// Zoom factors; values above 1 zoom out
    pub zoom_x: f32,
    pub zoom_y: f32,
    pub flip: bool,
    pub brightness: f32,
}

impl AugmentationParams {
    /// Parameters that leave the image untouched
    pub fn identity() -> Self {
        Self {
            angle_degrees: 0.0,
            shift_x: 0.0,
            shift_y: 0.0,
            zoom_x: 1.0,
            zoom_y: 1.0,
            flip: false,
            brightness: 1.0,
        }
    }

    fn is_geometric_identity(&self) -> bool {
        self.angle_degrees == 0.0
            && self.shift_x == 0.0
            && self.shift_y == 0.0
            && self.zoom_x == 1.0
            && self.zoom_y == 1.0
    }
}

/// Image augmenter that resizes, transforms and converts thumbnails
#[derive(Clone, Debug)]
pub struct Augmenter {
    config: AugmentationConfig,
    image_size: u32,
}

impl Augmenter {
    /// Create a new augmenter with the given configuration
    pub fn new(config: AugmentationConfig, image_size: u32) -> Self {
        Self { config, image_size }
    }

    /// Create an augmenter that only resizes and converts (validation/inference)
    pub fn no_augmentation(image_size: u32) -> Self {
        Self::new(AugmentationConfig::none(), image_size)
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// Draw an independent set of parameters
    pub fn sample_params(&self, rng: &mut ChaCha8Rng) -> AugmentationParams {
        let c = &self.config;
        AugmentationParams {
            angle_degrees: symmetric(rng, c.rotation_degrees),
            shift_x: symmetric(rng, c.width_shift),
            shift_y: symmetric(rng, c.height_shift),
            zoom_x: 1.0 + symmetric(rng, c.zoom_range),
            zoom_y: 1.0 + symmetric(rng, c.zoom_range),
            flip: c.horizontal_flip_prob > 0.0 && rng.gen::<f32>() < c.horizontal_flip_prob,
            brightness: if c.brightness_range.1 > c.brightness_range.0 {
                rng.gen_range(c.brightness_range.0..=c.brightness_range.1)
            } else {
                c.brightness_range.0
            },
        }
    }

    /// Apply a random draw to an image
    pub fn augment(&self, img: RgbImage, rng: &mut ChaCha8Rng) -> RgbImage {
        let params = self.sample_params(rng);
        self.apply(img, &params)
    }

    /// Apply a specific set of parameters
    pub fn apply(&self, img: RgbImage, params: &AugmentationParams) -> RgbImage {
        let mut result = if params.is_geometric_identity() {
            img
        } else {
            self.warp(&img, params)
        };

        if params.flip {
            image::imageops::flip_horizontal_in_place(&mut result);
        }

        if params.brightness != 1.0 {
            scale_brightness(&mut result, params.brightness);
        }

        result
    }

    /// Rotation, zoom and shift composed into one inverse mapping
    fn warp(&self, img: &RgbImage, params: &AugmentationParams) -> RgbImage {
        let (width, height) = img.dimensions();
        let cx = (width as f32 - 1.0) / 2.0;
        let cy = (height as f32 - 1.0) / 2.0;

        let angle = params.angle_degrees.to_radians();
        let (sin_a, cos_a) = angle.sin_cos();
        let tx = params.shift_x * width as f32;
        let ty = params.shift_y * height as f32;

        let mut output = RgbImage::new(width, height);

        for y in 0..height {
            for x in 0..width {
                let dx = x as f32 - cx - tx;
                let dy = y as f32 - cy - ty;

                let rx = (cos_a * dx + sin_a * dy) * params.zoom_x;
                let ry = (-sin_a * dx + cos_a * dy) * params.zoom_y;

                let pixel = bilinear_sample(img, rx + cx, ry + cy);
                output.put_pixel(x, y, pixel);
            }
        }

        output
    }

    /// Resize to the target square resolution
    pub fn resize(&self, img: &DynamicImage) -> RgbImage {
        img.resize_exact(self.image_size, self.image_size, FilterType::Triangle)
            .to_rgb8()
    }

    /// Convert image to CHW float data rescaled to [0, 1]
    pub fn to_tensor_data(&self, img: &RgbImage) -> Vec<f32> {
        let (width, height) = img.dimensions();
        let plane = (width * height) as usize;
        let mut data = vec![0.0f32; 3 * plane];

        for (x, y, pixel) in img.enumerate_pixels() {
            let offset = (y * width + x) as usize;
            for c in 0..3 {
                data[c * plane + offset] = pixel[c] as f32 / 255.0;
            }
        }

        data
    }

    /// Full preprocessing pipeline: resize, augment (optional), convert to tensor data
    pub fn preprocess(&self, img: &DynamicImage, rng: Option<&mut ChaCha8Rng>) -> Vec<f32> {
        let mut result = self.resize(img);

        if let Some(rng) = rng {
            result = self.augment(result, rng);
        }

        self.to_tensor_data(&result)
    }
}

fn symmetric(rng: &mut ChaCha8Rng, limit: f32) -> f32 {
    if limit > 0.0 {
        rng.gen_range(-limit..=limit)
    } else {
        0.0
    }
}

/// Bilinear sample with nearest-edge fill outside the image
fn bilinear_sample(img: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    let x = x.clamp(0.0, (width - 1) as f32);
    let y = y.clamp(0.0, (height - 1) as f32);

    let x0 = x.floor() as u32;
    let y0 = y.floor() as u32;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = img.get_pixel(x0, y0);
    let p10 = img.get_pixel(x1, y0);
    let p01 = img.get_pixel(x0, y1);
    let p11 = img.get_pixel(x1, y1);

    let mut result = [0u8; 3];
    for c in 0..3 {
        let v = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + p10[c] as f32 * fx * (1.0 - fy)
            + p01[c] as f32 * (1.0 - fx) * fy
            + p11[c] as f32 * fx * fy;
        result[c] = v.round().clamp(0.0, 255.0) as u8;
    }

    Rgb(result)
}

fn scale_brightness(img: &mut RgbImage, factor: f32) {
    for pixel in img.pixels_mut() {
        for c in 0..3 {
            pixel[c] = (pixel[c] as f32 * factor).round().clamp(0.0, 255.0) as u8;
        }
    }
}
