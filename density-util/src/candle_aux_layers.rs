use candle_core::{Result, Tensor};
use candle_nn::{Activation, Module};

/// build a stack of `M` layers, each followed by an optional
/// activation and an optional max pooling
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    activation_layers: Vec<Option<Activation>>,
    pool_sizes: Vec<Option<usize>>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for ((module, activation), pool) in self
            .module_layers
            .iter()
            .zip(self.activation_layers.iter())
            .zip(self.pool_sizes.iter())
        {
            x = module.forward(&x)?;
            if let Some(activation) = activation {
                x = activation.forward(&x)?;
            }
            if let Some(sz) = pool {
                x = x.max_pool2d(*sz)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            activation_layers: Vec::new(),
            pool_sizes: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_act(&mut self, layer: M, activation: Activation) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
        self.pool_sizes.push(None);
    }

    /// Appends a layer, its activation and `sz x sz` max pooling.
    pub fn push_with_act_pool(&mut self, layer: M, activation: Activation, sz: usize) {
        self.module_layers.push(layer);
        self.activation_layers.push(Some(activation));
        self.pool_sizes.push(Some(sz));
    }

    /// overall spatial reduction by the pooling layers
    pub fn downsample(&self) -> usize {
        self.pool_sizes.iter().flatten().product()
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}
