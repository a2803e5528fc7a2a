//! Image folder loading.

use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{DatasetConfig, ModelConfig};
use crate::error::{ProGanError, Result};

/// File extensions picked up by [`ImageFolderDataset`].
pub const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "webp"];

/// A batch of full resolution real samples.
#[derive(Debug, Clone)]
pub struct ImageBatch {
    /// `(B, C, S, S)` in `[-1, 1]`.
    pub images: Tensor,
    /// Where each sample came from.
    pub paths: Vec<PathBuf>,
}

impl ImageBatch {
    /// Number of samples.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// True if the batch holds no samples.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Anything that can hand out batches of real samples.
pub trait DataSource {
    /// Number of samples.
    fn len(&self) -> usize;

    /// True if there is nothing to train on.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load the samples at `indices` onto `device`.
    fn load_batch(&mut self, indices: &[usize], device: &Device) -> Result<ImageBatch>;
}

/// Every image under a directory, resized and cropped to `crop_size`.
///
/// # Example
///
/// ```no_run
/// use candle_core::Device;
/// use progan_rs::dataset::{DataSource, ImageFolderDataset};
/// use progan_rs::ProGanConfig;
///
/// # fn main() -> progan_rs::Result<()> {
/// let config = ProGanConfig::from_preset("tiny")?;
/// let mut dataset = ImageFolderDataset::open(&config.dataset, &config.model, config.seed)?;
/// let batch = dataset.load_batch(&[0, 1], &Device::Cpu)?;
/// assert_eq!(batch.images.dims()[2], config.model.crop_size);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ImageFolderDataset {
    paths: Vec<PathBuf>,
    crop_size: u32,
    input_nc: usize,
    flip: bool,
    rng: StdRng,
}

impl ImageFolderDataset {
    /// Scan `config.path` recursively for images.
    ///
    /// # Errors
    ///
    /// Returns a dataset error if the directory does not exist or holds no images.
    pub fn open(config: &DatasetConfig, model: &ModelConfig, seed: u64) -> Result<Self> {
        let root = Path::new(&config.path);
        if !root.is_dir() {
            return Err(ProGanError::dataset(format!(
                "{} is not a valid directory",
                root.display()
            )));
        }

        let mut paths = Vec::new();
        collect_images(root, &mut paths)?;
        paths.sort();
        if let Some(max) = config.max_dataset_size {
            paths.truncate(max);
        }
        if paths.is_empty() {
            return Err(ProGanError::dataset(format!(
                "no images found under {}",
                root.display()
            )));
        }

        tracing::info!("Loaded {} images from {}", paths.len(), root.display());

        Ok(Self {
            paths,
            crop_size: model.crop_size as u32,
            input_nc: model.input_nc,
            flip: !config.no_flip,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Paths of every sample, in index order.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    fn load_image(&mut self, path: &Path) -> Result<Vec<f32>> {
        let img = image::open(path)?;
        let img = img.resize_to_fill(self.crop_size, self.crop_size, FilterType::Triangle);
        let img = if self.flip && self.rng.gen_bool(0.5) {
            img.fliph()
        } else {
            img
        };
        Ok(image_to_chw(&img, self.input_nc))
    }
}

impl DataSource for ImageFolderDataset {
    fn len(&self) -> usize {
        self.paths.len()
    }

    fn load_batch(&mut self, indices: &[usize], device: &Device) -> Result<ImageBatch> {
        if indices.is_empty() {
            return Err(ProGanError::dataset("empty batch requested"));
        }

        let size = self.crop_size as usize;
        let mut data = Vec::with_capacity(indices.len() * self.input_nc * size * size);
        let mut paths = Vec::with_capacity(indices.len());
        for &index in indices {
            let path = self
                .paths
                .get(index)
                .cloned()
                .ok_or_else(|| ProGanError::dataset(format!("index {index} out of range")))?;
            data.extend(self.load_image(&path)?);
            paths.push(path);
        }

        let images = Tensor::from_vec(data, (indices.len(), self.input_nc, size, size), device)?;
        Ok(ImageBatch { images, paths })
    }
}

/// Channel-major pixels scaled to `[-1, 1]`.
fn image_to_chw(img: &DynamicImage, channels: usize) -> Vec<f32> {
    let (width, height) = (img.width() as usize, img.height() as usize);
    let raw: Vec<u8> = if channels == 1 {
        img.to_luma8().into_raw()
    } else {
        img.to_rgb8().into_raw()
    };

    let mut out = vec![0f32; raw.len()];
    for (i, value) in raw.iter().enumerate() {
        let pixel = i / channels;
        let channel = i % channels;
        out[channel * width * height + pixel] = *value as f32 / 127.5 - 1.0;
    }
    out
}

fn collect_images(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_images(&path, out)?;
        } else if is_image(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn write_images(dir: &Path, count: usize, size: u32) {
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        for i in 0..count {
            let img = RgbImage::from_fn(size, size, |x, _| {
                if x < size / 2 {
                    Rgb([255, 0, 0])
                } else {
                    Rgb([0, 0, 255])
                }
            });
            let sub = if i % 2 == 0 { dir.to_path_buf() } else { dir.join("nested") };
            img.save(sub.join(format!("img_{i}.png"))).unwrap();
        }
        std::fs::write(dir.join("notes.txt"), "not an image").unwrap();
    }

    fn configs(path: &Path, no_flip: bool) -> (DatasetConfig, ModelConfig) {
        let dataset = DatasetConfig {
            path: path.to_string_lossy().into_owned(),
            no_flip,
            max_dataset_size: None,
        };
        let model = ModelConfig {
            z_dim: 4,
            max_stages: 1,
            ngf: 4,
            ndf: 4,
            input_nc: 3,
            crop_size: 8,
        };
        (dataset, model)
    }

    #[test]
    fn test_open_scans_recursively() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), 4, 20);
        let (dataset, model) = configs(dir.path(), true);
        let ds = ImageFolderDataset::open(&dataset, &model, 0).unwrap();
        assert_eq!(ds.len(), 4);
        assert!(ds.paths().iter().all(|p| is_image(p)));
    }

    #[test]
    fn test_batch_shape_and_range() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), 3, 16);
        let (dataset, model) = configs(dir.path(), true);
        let mut ds = ImageFolderDataset::open(&dataset, &model, 0).unwrap();
        let batch = ds.load_batch(&[0, 2], &Device::Cpu).unwrap();
        assert_eq!(batch.images.dims(), &[2, 3, 8, 8]);
        assert_eq!(batch.len(), 2);

        let values = batch.images.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (-1.0..=1.0).contains(v)));
        // red channel of the left-most pixel
        assert!((values[0] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_max_dataset_size() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), 5, 8);
        let (mut dataset, model) = configs(dir.path(), false);
        dataset.max_dataset_size = Some(2);
        let ds = ImageFolderDataset::open(&dataset, &model, 0).unwrap();
        assert_eq!(ds.len(), 2);
    }

    #[test]
    fn test_missing_directory() {
        let (dataset, model) = configs(Path::new("/nonexistent/images"), false);
        let err = ImageFolderDataset::open(&dataset, &model, 0).unwrap_err();
        assert!(matches!(err, ProGanError::Dataset(_)));
    }

    #[test]
    fn test_out_of_range_index() {
        let dir = tempfile::tempdir().unwrap();
        write_images(dir.path(), 1, 8);
        let (dataset, model) = configs(dir.path(), true);
        let mut ds = ImageFolderDataset::open(&dataset, &model, 0).unwrap();
        assert!(ds.load_batch(&[3], &Device::Cpu).is_err());
    }

    #[test]
    fn test_grayscale_conversion() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([255, 255, 255])));
        let chw = image_to_chw(&img, 1);
        assert_eq!(chw.len(), 4);
        assert!(chw.iter().all(|v| (*v - 1.0).abs() < 1e-5));
    }
}
