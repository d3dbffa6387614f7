use crate::candle_checkpoint::save_parameters;
use crate::candle_data_loader::*;
use crate::candle_inference::TrainConfig;
use crate::candle_loss_functions::{count_absolute_error, sum_squared_error};
use crate::candle_model_traits::{DensityModuleT, Phase};
use crate::candle_sgd_momentum::SgdMomentum;
use crate::density_map::{normalize_density, tensor_to_density_map, total_count};

use candle_core::{Device, Tensor};
use candle_nn::{Optimizer, VarMap};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{info, warn};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// What happened in one epoch
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    /// average sum-squared error over the training pairs
    pub train_loss: f32,
    /// average absolute count error over the test pairs
    pub test_error: f32,
    /// whether this epoch wrote a new best checkpoint
    pub improved: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BestCheckpoint {
    pub epoch: usize,
    pub test_error: f32,
}

/// Lowest test error seen so far
#[derive(Clone, Copy, Debug, Default)]
pub struct MinErrorTracker {
    best: Option<BestCheckpoint>,
}

impl MinErrorTracker {
    /// Record `test_error` of `epoch`; true iff it is strictly lower
    /// than every error seen before.
    pub fn update(&mut self, epoch: usize, test_error: f32) -> bool {
        let improved = match self.best {
            Some(best) => test_error < best.test_error,
            None => !test_error.is_nan(),
        };
        if improved {
            self.best = Some(BestCheckpoint { epoch, test_error });
        }
        improved
    }

    pub fn best(&self) -> Option<BestCheckpoint> {
        self.best
    }
}

pub struct TrainSummary {
    pub history: Vec<EpochMetrics>,
    pub best: Option<BestCheckpoint>,
}

/// One randomly chosen test example with its prediction
pub struct DensitySnapshot {
    pub epoch: usize,
    pub index: usize,
    /// image (3 x h x w) on cpu
    pub image: Tensor,
    pub ground_truth: Array2<f32>,
    pub predicted: Array2<f32>,
}

impl DensitySnapshot {
    pub fn ground_truth_title(&self) -> String {
        format!("gt_dmap({})", total_count(&self.ground_truth))
    }

    pub fn predicted_title(&self) -> String {
        format!("et_dmap({})", total_count(&self.predicted))
    }

    /// ground truth scaled to [0, 255]
    pub fn ground_truth_normalized(&self) -> Array2<f32> {
        normalize_density(&self.ground_truth)
    }

    /// prediction scaled to [0, 255]
    pub fn predicted_normalized(&self) -> Array2<f32> {
        normalize_density(&self.predicted)
    }
}

/// Side channel watching the training. Errors are reported but
/// never stop the training.
pub trait TrainObserverT {
    /// called after each epoch with the whole history so far
    fn on_epoch_end(&mut self, history: &[EpochMetrics]) -> anyhow::Result<()>;

    /// called after each epoch with one random test example
    fn on_density_snapshot(&mut self, snapshot: &DensitySnapshot) -> anyhow::Result<()>;
}

pub struct DensityTrainer<'a, M>
where
    M: DensityModuleT,
{
    pub model: &'a M,
    pub variable_map: &'a VarMap,
}

impl<'a, M> DensityTrainer<'a, M>
where
    M: DensityModuleT,
{
    pub fn new(model: &'a M, variable_map: &'a VarMap) -> Self {
        Self {
            model,
            variable_map,
        }
    }

    /// Train the density regressor, evaluate after each epoch and
    /// keep the parameters of the lowest test error in
    /// `train_config.checkpoint_file`
    ///
    /// * `train_data` - visited in a new random order every epoch
    /// * `test_data` - visited in order
    /// * `train_config` - training configuration
    /// * `observer` - optional visualization
    pub fn train<TrainD, TestD>(
        &self,
        train_data: &TrainD,
        test_data: &TestD,
        train_config: &TrainConfig,
        mut observer: Option<&mut dyn TrainObserverT>,
    ) -> anyhow::Result<TrainSummary>
    where
        TrainD: DensityDataSource,
        TestD: DensityDataSource,
    {
        let device = &train_config.device;

        if train_config.num_epochs > 0 {
            if train_data.is_empty() {
                return Err(anyhow::anyhow!("no training data"));
            }
            if test_data.is_empty() {
                return Err(anyhow::anyhow!("no test data"));
            }
        }

        let mut optimizer = SgdMomentum::new_lr_momentum(
            self.variable_map.all_vars(),
            train_config.learning_rate,
            train_config.momentum,
        )?;

        let (mut shuffle_rng, mut snapshot_rng) = match train_config.seed {
            Some(seed) => (
                StdRng::seed_from_u64(seed),
                StdRng::seed_from_u64(seed.wrapping_add(1)),
            ),
            None => (StdRng::from_os_rng(), StdRng::from_os_rng()),
        };

        let pb = ProgressBar::new(train_config.num_epochs as u64);

        if !train_config.show_progress {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut history: Vec<EpochMetrics> = vec![];
        let mut tracker = MinErrorTracker::default();

        for epoch in 0..train_config.num_epochs {
            let order = shuffled_indices(train_data.len(), &mut shuffle_rng);
            let train_loss = self.train_epoch(train_data, &order, &mut optimizer, device)?;

            let test_error = self.evaluate(test_data, device)?;

            let improved = tracker.update(epoch, test_error);
            if improved {
                save_parameters(self.variable_map, &train_config.checkpoint_file)?;
            }

            history.push(EpochMetrics {
                epoch,
                train_loss,
                test_error,
                improved,
            });

            let (min_mae, min_epoch) = tracker
                .best()
                .map(|b| (b.test_error, b.epoch))
                .unwrap_or((f32::INFINITY, 0));

            info!(
                "epoch:{} error:{} min_mae:{} min_epoch:{}",
                epoch, test_error, min_mae, min_epoch
            );

            if let Some(obs) = observer.as_deref_mut() {
                if let Err(err) = obs.on_epoch_end(&history) {
                    warn!("visualization failed at epoch {}: {}", epoch, err);
                }
                match self.density_snapshot(test_data, epoch, &mut snapshot_rng, device) {
                    Ok(snapshot) => {
                        if let Err(err) = obs.on_density_snapshot(&snapshot) {
                            warn!("visualization failed at epoch {}: {}", epoch, err);
                        }
                    }
                    Err(err) => warn!("no snapshot at epoch {}: {}", epoch, err),
                }
            }

            pb.inc(1);
        } // each epoch

        pb.finish_and_clear();

        Ok(TrainSummary {
            history,
            best: tracker.best(),
        })
    }

    /// One pass over `data` in the given `order`, one optimizer step
    /// per pair. Returns the average loss.
    pub fn train_epoch<D, Opt>(
        &self,
        data: &D,
        order: &[usize],
        optimizer: &mut Opt,
        device: &Device,
    ) -> anyhow::Result<f32>
    where
        D: DensityDataSource,
        Opt: Optimizer,
    {
        if order.is_empty() {
            return Err(anyhow::anyhow!("empty epoch"));
        }

        let mut loss_tot = 0f32;

        for &i in order {
            let pair = data.density_pair(i, device)?;
            let x_nchw = pair.image.unsqueeze(0)?;
            let y_nchw = pair.density.unsqueeze(0)?;

            let y_hat = self.model.forward_t(&x_nchw, Phase::Train)?;
            let loss = sum_squared_error(&y_hat, &y_nchw)?;
            loss_tot += loss.to_scalar::<f32>()?;
            optimizer.backward_step(&loss)?;
        }

        Ok(loss_tot / order.len() as f32)
    }

    /// Average absolute count error over all pairs of `data`
    pub fn evaluate<D>(&self, data: &D, device: &Device) -> anyhow::Result<f32>
    where
        D: DensityDataSource,
    {
        if data.is_empty() {
            return Err(anyhow::anyhow!("nothing to evaluate"));
        }

        let mut err_tot = 0f32;
        for i in 0..data.len() {
            let pair = data.density_pair(i, device)?;
            let y_hat = self.predict(&pair.image)?;
            err_tot += count_absolute_error(&y_hat, &pair.density)?;
        }
        Ok(err_tot / data.len() as f32)
    }

    /// Density map of a single image (3 x h x w) in evaluation mode
    pub fn predict(&self, image: &Tensor) -> candle_core::Result<Tensor> {
        let y_hat = self.model.forward_t(&image.unsqueeze(0)?, Phase::Eval)?;
        Ok(y_hat.squeeze(0)?.detach())
    }

    fn density_snapshot<D, R>(
        &self,
        data: &D,
        epoch: usize,
        rng: &mut R,
        device: &Device,
    ) -> anyhow::Result<DensitySnapshot>
    where
        D: DensityDataSource,
        R: Rng,
    {
        let index = rng.random_range(0..data.len());
        let pair = data.density_pair(index, device)?;
        let y_hat = self.predict(&pair.image)?;

        Ok(DensitySnapshot {
            epoch,
            index,
            image: pair.image.to_device(&Device::Cpu)?,
            ground_truth: tensor_to_density_map(&pair.density)?,
            predicted: tensor_to_density_map(&y_hat)?,
        })
    }
}
