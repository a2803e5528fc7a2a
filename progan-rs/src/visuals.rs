//! Converting sample tensors back to images.

use std::path::{Path, PathBuf};

use candle_core::{DType, Tensor};
use image::{DynamicImage, GrayImage, RgbImage};

use crate::error::{ProGanError, Result};

/// Map a `(B, C, H, W)` batch in `[-1, 1]` to images. `C` must be 1 or 3.
pub fn tensor_to_images(batch: &Tensor) -> Result<Vec<DynamicImage>> {
    let (b, c, h, w) = batch.dims4()?;
    if c != 1 && c != 3 {
        return Err(ProGanError::training(format!(
            "cannot convert {c} channels to an image"
        )));
    }

    let pixels = ((batch.to_dtype(DType::F32)?.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?
        .round()?
        .permute((0, 2, 3, 1))?
        .flatten_all()?
        .to_vec1::<f32>()?;

    let per_image = h * w * c;
    let mut images = Vec::with_capacity(b);
    for chunk in pixels.chunks(per_image) {
        let raw: Vec<u8> = chunk.iter().map(|v| *v as u8).collect();
        let image = if c == 3 {
            RgbImage::from_raw(w as u32, h as u32, raw).map(DynamicImage::ImageRgb8)
        } else {
            GrayImage::from_raw(w as u32, h as u32, raw).map(DynamicImage::ImageLuma8)
        };
        images.push(image.ok_or_else(|| ProGanError::training("image buffer size mismatch"))?);
    }
    Ok(images)
}

/// Write every image of `batch` to `dir` as `<prefix>_<index>.png`.
pub fn save_images(batch: &Tensor, dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::new();
    for (i, image) in tensor_to_images(batch)?.into_iter().enumerate() {
        let path = dir.join(format!("{prefix}_{i:03}.png"));
        image.save(&path)?;
        written.push(path);
    }
    Ok(written)
}
