use std::path::PathBuf;

pub struct TrainConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub num_epochs: usize,
    pub device: candle_core::Device,
    /// where the best parameters are written
    pub checkpoint_file: PathBuf,
    /// shuffling and snapshot selection; `None` draws from the OS
    pub seed: Option<u64>,
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-6,
            momentum: 0.95,
            num_epochs: 2000,
            device: candle_core::Device::Cpu,
            checkpoint_file: PathBuf::from("checkpoints/best.safetensors"),
            seed: None,
            show_progress: false,
        }
    }
}
