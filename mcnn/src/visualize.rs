use density_util::candle_core::DType;
use density_util::candle_density_inference::{DensitySnapshot, EpochMetrics, TrainObserverT};

use image::{GrayImage, RgbImage};
use ndarray::Array2;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Serialize)]
struct LinePlot<'a> {
    title: &'a str,
    x: Vec<usize>,
    y: Vec<f32>,
}

#[derive(Serialize)]
struct SnapshotInfo {
    epoch: usize,
    index: usize,
    img: &'static str,
    gt_dmap: String,
    et_dmap: String,
}

///
/// Visualization board kept in a directory. Every epoch overwrites
/// the same files:
///
/// - `train_loss.json`, `test_error.json` line plots
/// - `img.png`, `gt_dmap.png`, `et_dmap.png` of a random test image
/// - `snapshot.json` titles of the three images
///
pub struct FileBoardObserver {
    dir: PathBuf,
}

impl FileBoardObserver {
    pub fn new<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn write_line(
        &self,
        title: &str,
        history: &[EpochMetrics],
        y: fn(&EpochMetrics) -> f32,
    ) -> anyhow::Result<()> {
        let plot = LinePlot {
            title,
            x: history.iter().map(|m| m.epoch).collect(),
            y: history.iter().map(y).collect(),
        };
        let file = std::fs::File::create(self.dir.join(format!("{}.json", title)))?;
        serde_json::to_writer(std::io::BufWriter::new(file), &plot)?;
        Ok(())
    }
}

impl TrainObserverT for FileBoardObserver {
    fn on_epoch_end(&mut self, history: &[EpochMetrics]) -> anyhow::Result<()> {
        self.write_line("train_loss", history, |m| m.train_loss)?;
        self.write_line("test_error", history, |m| m.test_error)
    }

    fn on_density_snapshot(&mut self, snapshot: &DensitySnapshot) -> anyhow::Result<()> {
        image_to_rgb(snapshot)?.save(self.dir.join("img.png"))?;
        density_to_gray(&snapshot.ground_truth_normalized())?.save(self.dir.join("gt_dmap.png"))?;
        density_to_gray(&snapshot.predicted_normalized())?.save(self.dir.join("et_dmap.png"))?;

        let info = SnapshotInfo {
            epoch: snapshot.epoch,
            index: snapshot.index,
            img: "img",
            gt_dmap: snapshot.ground_truth_title(),
            et_dmap: snapshot.predicted_title(),
        };
        let file = std::fs::File::create(self.dir.join("snapshot.json"))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &info)?;
        Ok(())
    }
}

/// 3 x h x w tensor of raw pixel values to an rgb image
fn image_to_rgb(snapshot: &DensitySnapshot) -> anyhow::Result<RgbImage> {
    let (c, h, w) = snapshot.image.dims3()?;
    if c != 3 {
        return Err(anyhow::anyhow!("expected 3 channels, got {}", c));
    }
    let chw = snapshot
        .image
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    let plane = h * w;

    Ok(RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let k = y as usize * w + x as usize;
        image::Rgb([
            to_u8(chw[k]),
            to_u8(chw[plane + k]),
            to_u8(chw[2 * plane + k]),
        ])
    }))
}

/// map already scaled to [0, 255] to a grayscale image
fn density_to_gray(map: &Array2<f32>) -> anyhow::Result<GrayImage> {
    let (rows, cols) = map.dim();
    if rows == 0 || cols == 0 {
        return Err(anyhow::anyhow!("empty density map"));
    }
    Ok(GrayImage::from_fn(cols as u32, rows as u32, |x, y| {
        image::Luma([to_u8(map[[y as usize, x as usize]])])
    }))
}

fn to_u8(x: f32) -> u8 {
    x.round().clamp(0., 255.) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use density_util::candle_core::{Device, Tensor};
    use ndarray::array;

    #[test]
    fn board_writes_plots_and_images() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut board = FileBoardObserver::new(dir.path().join("vis"))?;

        let history = vec![
            EpochMetrics {
                epoch: 0,
                train_loss: 3.,
                test_error: 2.,
                improved: true,
            },
            EpochMetrics {
                epoch: 1,
                train_loss: 1.5,
                test_error: 2.5,
                improved: false,
            },
        ];
        board.on_epoch_end(&history)?;

        let text = std::fs::read_to_string(dir.path().join("vis/test_error.json"))?;
        let plot: serde_json::Value = serde_json::from_str(&text)?;
        assert_eq!(plot["title"], "test_error");
        assert_eq!(plot["x"], serde_json::json!([0, 1]));
        assert_eq!(plot["y"], serde_json::json!([2.0, 2.5]));

        let snapshot = DensitySnapshot {
            epoch: 1,
            index: 0,
            image: Tensor::ones((3, 8, 4), DType::F32, &Device::Cpu)?,
            ground_truth: array![[0f32, 1.], [1., 2.]],
            predicted: Array2::zeros((2, 2)),
        };
        board.on_density_snapshot(&snapshot)?;

        let img = image::open(dir.path().join("vis/img.png"))?.to_rgb8();
        assert_eq!(img.dimensions(), (4, 8));
        let gt = image::open(dir.path().join("vis/gt_dmap.png"))?.to_luma8();
        assert_eq!(gt.get_pixel(1, 1).0, [255]);
        assert_eq!(gt.get_pixel(1, 0).0, [128]);

        let text = std::fs::read_to_string(dir.path().join("vis/snapshot.json"))?;
        let info: serde_json::Value = serde_json::from_str(&text)?;
        assert_eq!(info["gt_dmap"], "gt_dmap(4)");
        assert_eq!(info["et_dmap"], "et_dmap(0)");
        Ok(())
    }
}
