use density_util::candle_core::{DType, Device, Tensor};
use density_util::candle_data_loader::{DensityDataSource, DensityPair};
use density_util::density_map::resize_bilinear;

use image::imageops::FilterType;
use indicatif::ParallelProgressIterator;
use log::info;
use ndarray::Array2;
use rayon::prelude::*;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Images under `{root}/{split}/images` with density maps under
/// `{root}/{split}/ground_truth`
pub struct CrowdDataDirs {
    pub images: PathBuf,
    pub ground_truth: PathBuf,
}

impl CrowdDataDirs {
    pub fn train(root: &str) -> Self {
        Self::split(root, "train_data")
    }

    pub fn test(root: &str) -> Self {
        Self::split(root, "test_data")
    }

    fn split(root: &str, split: &str) -> Self {
        let base = Path::new(root).join(split);
        Self {
            images: base.join("images"),
            ground_truth: base.join("ground_truth"),
        }
    }
}

///
/// Crowd images paired with `.npy` density maps of the same stem.
///
/// Each image is resized so that both sides are multiples of
/// `downsample`; the density map is resized to the model output
/// resolution and rescaled so that its total count is kept.
///
pub struct CrowdDataset {
    image_files: Vec<PathBuf>,
    ground_truth_files: Vec<PathBuf>,
    downsample: usize,
    preloaded: Option<Vec<DensityPair>>,
}

impl CrowdDataset {
    pub fn open(dirs: &CrowdDataDirs, downsample: usize, preload: bool) -> anyhow::Result<Self> {
        if downsample == 0 {
            return Err(anyhow::anyhow!("downsample factor must be positive"));
        }

        let mut image_files = std::fs::read_dir(&dirs.images)
            .map_err(|e| anyhow::anyhow!("{}: {}", dirs.images.display(), e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && is_image_file(path))
            .collect::<Vec<_>>();
        image_files.sort();

        let ground_truth_files = image_files
            .iter()
            .map(|img| {
                let stem = img
                    .file_stem()
                    .ok_or_else(|| anyhow::anyhow!("no file name: {}", img.display()))?;
                let gt = dirs
                    .ground_truth
                    .join(format!("{}.npy", stem.to_string_lossy()));
                if gt.is_file() {
                    Ok(gt)
                } else {
                    Err(anyhow::anyhow!("missing ground truth: {}", gt.display()))
                }
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        info!("{} images in {}", image_files.len(), dirs.images.display());

        let mut ret = Self {
            image_files,
            ground_truth_files,
            downsample,
            preloaded: None,
        };

        if preload {
            ret.preload()?;
        }

        Ok(ret)
    }

    /// Decode every pair into memory, in parallel
    fn preload(&mut self) -> anyhow::Result<()> {
        let ntot = self.image_files.len();
        let pairs = self
            .image_files
            .par_iter()
            .zip(self.ground_truth_files.par_iter())
            .progress_count(ntot as u64)
            .map(|(img, gt)| read_crowd_pair(img, gt, self.downsample))
            .collect::<anyhow::Result<Vec<_>>>()?;
        self.preloaded = Some(pairs);
        Ok(())
    }
}

impl DensityDataSource for CrowdDataset {
    fn density_pair(&self, index: usize, target_device: &Device) -> anyhow::Result<DensityPair> {
        if index >= self.len() {
            return Err(anyhow::anyhow!("index {} out of {}", index, self.len()));
        }

        let pair = match &self.preloaded {
            Some(pairs) => pairs[index].to_device(target_device)?,
            None => read_crowd_pair(
                &self.image_files[index],
                &self.ground_truth_files[index],
                self.downsample,
            )?
            .to_device(target_device)?,
        };
        Ok(pair)
    }

    fn len(&self) -> usize {
        self.image_files.len()
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Read one (image, density map) pair on cpu
///
/// * image: 3 x (rows/d * d) x (cols/d * d), raw pixel values
/// * density: 1 x rows/d x cols/d, scaled by d^2
///
pub fn read_crowd_pair(
    image_file: &Path,
    ground_truth_file: &Path,
    downsample: usize,
) -> anyhow::Result<DensityPair> {
    let img = image::open(image_file)
        .map_err(|e| anyhow::anyhow!("{}: {}", image_file.display(), e))?
        .to_rgb8();

    let d = downsample as u32;
    let (width, height) = img.dimensions();
    let (ds_rows, ds_cols) = (height / d, width / d);

    if ds_rows == 0 || ds_cols == 0 {
        return Err(anyhow::anyhow!(
            "{} is smaller than {} pixels",
            image_file.display(),
            downsample
        ));
    }

    let img = if (ds_cols * d, ds_rows * d) != (width, height) {
        image::imageops::resize(&img, ds_cols * d, ds_rows * d, FilterType::Triangle)
    } else {
        img
    };

    let (width, height) = img.dimensions();
    let chw: Vec<f32> = (0..3)
        .flat_map(|c| img.pixels().map(move |p| p.0[c] as f32))
        .collect();
    let image = Tensor::from_vec(chw, (3, height as usize, width as usize), &Device::Cpu)?;

    let gt = read_density_npy(ground_truth_file)?;
    let scale = (downsample * downsample) as f32;
    let gt = if downsample > 1 {
        resize_bilinear(&gt, ds_rows as usize, ds_cols as usize) * scale
    } else {
        gt
    };

    let (rows, cols) = gt.dim();
    let (values, _) = gt.into_raw_vec_and_offset();
    let density = Tensor::from_vec(values, (1, rows, cols), &Device::Cpu)?;

    Ok(DensityPair { image, density })
}

/// Read a 2d density map from `.npy`
fn read_density_npy(file: &Path) -> anyhow::Result<Array2<f32>> {
    let t = Tensor::read_npy(file)
        .map_err(|e| anyhow::anyhow!("{}: {}", file.display(), e))?
        .to_dtype(DType::F32)?;
    let (rows, cols) = t.dims2()?;
    Ok(Array2::from_shape_vec(
        (rows, cols),
        t.flatten_all()?.to_vec1::<f32>()?,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_example(dirs: &CrowdDataDirs, stem: &str, w: u32, h: u32) -> anyhow::Result<()> {
        std::fs::create_dir_all(&dirs.images)?;
        std::fs::create_dir_all(&dirs.ground_truth)?;

        let img = image::RgbImage::from_fn(w, h, |x, y| image::Rgb([x as u8, y as u8, 200]));
        img.save(dirs.images.join(format!("{}.png", stem)))?;

        // one person spread uniformly
        let n = (w * h) as usize;
        let gt = Tensor::from_vec(
            vec![1f32 / n as f32; n],
            (h as usize, w as usize),
            &Device::Cpu,
        )?;
        gt.write_npy(dirs.ground_truth.join(format!("{}.npy", stem)))?;
        Ok(())
    }

    #[test]
    fn pairs_are_downsampled_and_keep_counts() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let root_str = root.path().to_str().unwrap();
        let dirs = CrowdDataDirs::train(root_str);
        write_example(&dirs, "IMG_2", 10, 9)?;
        write_example(&dirs, "IMG_1", 8, 8)?;

        for preload in [false, true] {
            let data = CrowdDataset::open(&dirs, 4, preload)?;
            assert_eq!(data.len(), 2);

            let pair = data.density_pair(1, &Device::Cpu)?;
            assert_eq!(pair.image.dims(), &[3, 8, 8]);
            assert_eq!(pair.density.dims(), &[1, 2, 2]);
            // uniform map stays uniform, so the count is the area ratio
            approx::assert_abs_diff_eq!(pair.count()?, 64. / 90., epsilon = 1e-5);

            let pair = data.density_pair(0, &Device::Cpu)?;
            approx::assert_abs_diff_eq!(pair.count()?, 1., epsilon = 1e-5);
            let blue = pair.image.narrow(0, 2, 1)?.flatten_all()?.to_vec1::<f32>()?;
            assert!(blue.iter().all(|&b| b == 200.));

            assert!(data.density_pair(2, &Device::Cpu).is_err());
        }
        Ok(())
    }

    #[test]
    fn missing_ground_truth_is_an_error() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let dirs = CrowdDataDirs::test(root.path().to_str().unwrap());
        write_example(&dirs, "a", 8, 8)?;
        std::fs::remove_file(dirs.ground_truth.join("a.npy"))?;

        assert!(CrowdDataset::open(&dirs, 4, false).is_err());
        Ok(())
    }

    #[test]
    fn tiny_images_are_rejected() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let dirs = CrowdDataDirs::test(root.path().to_str().unwrap());
        write_example(&dirs, "small", 3, 8)?;

        let data = CrowdDataset::open(&dirs, 4, false)?;
        assert!(data.density_pair(0, &Device::Cpu).is_err());
        Ok(())
    }
}
