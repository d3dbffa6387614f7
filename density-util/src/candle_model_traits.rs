use candle_core::{Result, Tensor};

/// Two-state switch of a model: training or evaluation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Train,
    Eval,
}

pub trait DensityModuleT {
    /// A regressor that spits out a density map
    ///
    /// # Arguments
    /// * `x_nchw` - image batch (n x 3 x h x w)
    /// * `phase` - whether to use training-only behaviour (dropout/batchnorm)
    ///
    /// # Returns `y_nchw`
    /// * `y_nchw` - density map batch (n x 1 x h/r x w/r), `r = downsample()`
    fn forward_t(&self, x_nchw: &Tensor, phase: Phase) -> Result<Tensor>;

    /// spatial downsampling factor between input and output
    fn downsample(&self) -> usize;
}
