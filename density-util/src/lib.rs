pub mod candle_aux_layers;
pub mod candle_checkpoint;
pub mod candle_data_loader;
pub mod candle_density_inference;
pub mod candle_inference;
pub mod candle_loss_functions;
pub mod candle_model_mcnn;
pub mod candle_model_traits;
pub mod candle_sgd_momentum;
pub mod density_map;

pub use candle_core;
pub use candle_nn;
