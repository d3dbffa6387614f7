use crate::crowd_input::*;
use crate::visualize::FileBoardObserver;

use clap::{Args, ValueEnum};
use density_util::candle_checkpoint::{init_parameters, load_parameters};
use density_util::candle_core::{DType, Device};
use density_util::candle_density_inference::{DensityTrainer, TrainObserverT};
use density_util::candle_inference::TrainConfig;
use density_util::candle_model_mcnn::{Mcnn, McnnArgs};
use density_util::candle_model_traits::DensityModuleT;
use density_util::candle_nn::{VarBuilder, VarMap};
use log::{info, warn};
use std::path::Path;

pub const BEST_CHECKPOINT_FILE: &str = "best.safetensors";

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[arg(
        long,
        required = true,
        help = "Dataset root",
        long_help = "Dataset root directory containing\n\
		     - {dataset}/train_data/images, {dataset}/train_data/ground_truth\n\
		     - {dataset}/test_data/images, {dataset}/test_data/ground_truth\n\
		     Each image `x.jpg` comes with a density map `x.npy`."
    )]
    pub dataset: Box<str>,

    #[arg(
        long,
        default_value = "",
        help = "Pretrained model",
        long_help = "Warm start from the parameters of a previous run.\n\
		     Either `.safetensors` or a PyTorch state dict (`.pth`).\n\
		     Epochs are still counted from zero."
    )]
    pub pretrained: Box<str>,

    #[arg(
        long,
        default_value_t = 2000,
        help = "Number of epochs",
        long_help = "Number of passes over the training images.\n\
		     With 0 nothing is trained or evaluated."
    )]
    pub epoch: usize,

    #[arg(
        long,
        default_value_t = false,
        help = "Deactivate visualization",
        long_help = "Do not write line plots and density map images\n\
		     to the visualization directory."
    )]
    pub novis: bool,

    #[arg(
        long,
        default_value_t = 1e-6,
        help = "Learning rate",
        long_help = "Learning rate of SGD.\n\
		     Controls the step size for parameter updates."
    )]
    pub learning_rate: f64,

    #[arg(
        long,
        default_value_t = 0.95,
        help = "SGD momentum",
        long_help = "Momentum of SGD.\n\
		     Weight of the previous update direction."
    )]
    pub momentum: f64,

    #[arg(
        long,
        help = "Random seed",
        long_help = "Random seed for initialization, shuffling and\n\
		     picking the visualized test image.\n\
		     If not given, the seed comes from the OS."
    )]
    pub seed: Option<u64>,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Candle device",
        long_help = "Candle device to use for computation.\n\
		     Options: cpu, cuda, metal."
    )]
    pub device: ComputeDevice,

    #[arg(
        long,
        default_value_t = 0,
        help = "A device for cuda",
        long_help = "For cuda or metal, we may want to choose a different device."
    )]
    pub device_no: usize,

    #[arg(
        long,
        default_value = "checkpoints",
        help = "Checkpoint directory",
        long_help = "Directory for the best parameters:\n\
		     - {checkpoint_dir}/best.safetensors\n\
		     Created if missing."
    )]
    pub checkpoint_dir: Box<str>,

    #[arg(
        long,
        default_value = "visuals",
        help = "Visualization directory",
        long_help = "Directory of the visualization board:\n\
		     - train_loss.json, test_error.json\n\
		     - img.png, gt_dmap.png, et_dmap.png, snapshot.json"
    )]
    pub vis_dir: Box<str>,

    #[arg(
        long,
        default_value_t = 4,
        help = "Ground truth downsampling",
        long_help = "Ratio between image and density map resolution.\n\
		     Must match the model output (4 for MCNN)."
    )]
    pub gt_downsample: usize,

    #[arg(
        long,
        default_value_t = false,
        help = "Preload all images",
        long_help = "Decode all the images and density maps into memory\n\
		     before training, instead of reading them every epoch."
    )]
    pub preload: bool,

    #[arg(long, default_value_t = false, help = "Show progress bar")]
    pub progress: bool,
}

impl TrainArgs {
    pub fn pretrained_file(&self) -> Option<&str> {
        if self.pretrained.is_empty() {
            None
        } else {
            Some(&*self.pretrained)
        }
    }
}

pub fn fit_mcnn(args: &TrainArgs) -> anyhow::Result<()> {
    let dev = match args.device {
        ComputeDevice::Metal => Device::new_metal(args.device_no)?,
        ComputeDevice::Cuda => Device::new_cuda(args.device_no)?,
        _ => Device::Cpu,
    };
    info!("Using device: {:?}", dev);

    // 1. model
    let parameters = VarMap::new();
    let param_builder = VarBuilder::from_varmap(&parameters, DType::F32, &dev);
    let model = Mcnn::new(McnnArgs::default(), param_builder)?;

    if model.downsample() != args.gt_downsample {
        return Err(anyhow::anyhow!(
            "model output is 1/{} of the input, but ground truth is downsampled by {}",
            model.downsample(),
            args.gt_downsample
        ));
    }

    init_parameters(&parameters, args.seed.unwrap_or_else(rand::random))?;

    if let Some(pretrained) = args.pretrained_file() {
        info!("Load pretrained model {}", pretrained);
        load_parameters(&parameters, pretrained, &dev)?;
    }

    // 2. data
    let train_data = CrowdDataset::open(
        &CrowdDataDirs::train(&args.dataset),
        args.gt_downsample,
        args.preload,
    )?;
    let test_data = CrowdDataset::open(
        &CrowdDataDirs::test(&args.dataset),
        args.gt_downsample,
        args.preload,
    )?;

    // 3. training
    std::fs::create_dir_all(&*args.checkpoint_dir)?;
    let checkpoint_file = Path::new(&*args.checkpoint_dir).join(BEST_CHECKPOINT_FILE);

    let train_config = TrainConfig {
        learning_rate: args.learning_rate,
        momentum: args.momentum,
        num_epochs: args.epoch,
        device: dev,
        checkpoint_file,
        seed: args.seed,
        show_progress: args.progress,
    };

    let mut board = if args.novis {
        None
    } else {
        match FileBoardObserver::new(&*args.vis_dir) {
            Ok(board) => Some(board),
            Err(err) => {
                warn!("visualization disabled: {}", err);
                None
            }
        }
    };

    let trainer = DensityTrainer::new(&model, &parameters);
    let summary = trainer.train(
        &train_data,
        &test_data,
        &train_config,
        board.as_mut().map(|b| b as &mut dyn TrainObserverT),
    )?;

    match summary.best {
        Some(best) => info!(
            "best error {} at epoch {} -> {}",
            best.test_error,
            best.epoch,
            train_config.checkpoint_file.display()
        ),
        None => info!("no checkpoint written"),
    }

    Ok(())
}
