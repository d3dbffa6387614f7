use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

/// An image and its ground-truth density map
pub struct DensityPair {
    /// image (3 x h x w)
    pub image: Tensor,
    /// density map (1 x h/r x w/r)
    pub density: Tensor,
}

impl DensityPair {
    pub fn to_device(&self, target_device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            image: self.image.to_device(target_device)?,
            density: self.density.to_device(target_device)?,
        })
    }

    /// total count of the ground truth
    pub fn count(&self) -> candle_core::Result<f32> {
        self.density.sum_all()?.to_scalar::<f32>()
    }
}

/// Indexable source of (image, density map) pairs
pub trait DensityDataSource {
    fn density_pair(&self, index: usize, target_device: &Device) -> anyhow::Result<DensityPair>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Visiting order for one epoch with batch size 1
pub fn shuffled_indices<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<usize> {
    let mut samples: Vec<usize> = (0..n).collect();
    samples.shuffle(rng);
    samples
}

///
/// A simple data source for in-memory pairs. The number of samples
/// is the number of images.
///
pub struct InMemoryDensityData {
    pairs: Vec<DensityPair>,
}

impl InMemoryDensityData {
    ///
    /// Create a data source from matching lists of images and
    /// density maps
    ///
    pub fn new(images: Vec<Tensor>, densities: Vec<Tensor>) -> anyhow::Result<Self> {
        if images.len() != densities.len() {
            return Err(anyhow::anyhow!(
                "{} images vs. {} density maps",
                images.len(),
                densities.len()
            ));
        }

        let pairs = images
            .into_iter()
            .zip(densities)
            .map(|(image, density)| DensityPair { image, density })
            .collect();

        Ok(Self { pairs })
    }
}

impl DensityDataSource for InMemoryDensityData {
    fn density_pair(&self, index: usize, target_device: &Device) -> anyhow::Result<DensityPair> {
        let pair = self
            .pairs
            .get(index)
            .ok_or_else(|| anyhow::anyhow!("index {} out of {}", index, self.pairs.len()))?;
        Ok(pair.to_device(target_device)?)
    }

    fn len(&self) -> usize {
        self.pairs.len()
    }
}
