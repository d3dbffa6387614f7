use crate::candle_aux_layers::StackLayers;
use crate::candle_model_traits::{DensityModuleT, Phase};

use candle_core::{Result, Tensor};
use candle_nn::{conv2d, Activation, Conv2d, Conv2dConfig, Module, VarBuilder};

/// (output channels, kernel size) of the four conv layers in each column
const COLUMN_SPECS: [[(usize, usize); 4]; 3] = [
    [(16, 9), (32, 7), (16, 7), (8, 7)],
    [(20, 7), (40, 5), (20, 5), (10, 5)],
    [(24, 5), (48, 3), (24, 3), (12, 3)],
];

/// positions of the conv layers within a column, counting
/// activation and pooling the way `torch.nn.Sequential` does
const COLUMN_LAYER_NAMES: [&str; 4] = ["0", "3", "6", "8"];

const POOL_SIZE: usize = 2;

/// Multi-column CNN for crowd density regression
///
/// Three columns with different receptive fields run on the same
/// image; their feature maps are concatenated and fused by a 1x1
/// convolution into a single density channel at 1/4 resolution.
pub struct Mcnn {
    columns: Vec<StackLayers<Conv2d>>,
    fuse: Conv2d,
}

pub struct McnnArgs {
    pub in_channels: usize,
}

impl Default for McnnArgs {
    fn default() -> Self {
        Self { in_channels: 3 }
    }
}

impl Mcnn {
    /// Create a model whose variables are registered under
    /// `branch{1,2,3}.{0,3,6,8}` and `fuse.0`
    pub fn new(args: McnnArgs, vb: VarBuilder) -> Result<Self> {
        let mut columns = Vec::with_capacity(COLUMN_SPECS.len());
        let mut fused_channels = 0;

        for (j, spec) in COLUMN_SPECS.iter().enumerate() {
            let vb_col = vb.pp(format!("branch{}", j + 1));
            let mut column = StackLayers::<Conv2d>::new();
            let mut d_prev = args.in_channels;

            for (l, (&(d_out, kernel), name)) in
                spec.iter().zip(COLUMN_LAYER_NAMES.iter()).enumerate()
            {
                let config = Conv2dConfig {
                    padding: kernel / 2,
                    ..Default::default()
                };
                let layer = conv2d(d_prev, d_out, kernel, config, vb_col.pp(*name))?;
                if l < 2 {
                    column.push_with_act_pool(layer, Activation::Relu, POOL_SIZE);
                } else {
                    column.push_with_act(layer, Activation::Relu);
                }
                d_prev = d_out;
            }

            fused_channels += d_prev;
            columns.push(column);
        }

        let fuse = conv2d(
            fused_channels,
            1,
            1,
            Conv2dConfig::default(),
            vb.pp("fuse").pp("0"),
        )?;

        Ok(Self { columns, fuse })
    }
}

impl DensityModuleT for Mcnn {
    fn forward_t(&self, x_nchw: &Tensor, _phase: Phase) -> Result<Tensor> {
        // no dropout or batchnorm, so both phases share the same graph
        let features = self
            .columns
            .iter()
            .map(|col| col.forward(x_nchw))
            .collect::<Result<Vec<_>>>()?;
        let h_nchw = Tensor::cat(&features, 1)?;
        self.fuse.forward(&h_nchw)
    }

    fn downsample(&self) -> usize {
        self.columns.first().map(|c| c.downsample()).unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn mcnn_output_is_quarter_resolution() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = Mcnn::new(McnnArgs::default(), vb)?;

        let x = Tensor::rand(0f32, 255f32, (2, 3, 16, 24), &dev)?;
        let y = model.forward_t(&x, Phase::Eval)?;

        assert_eq!(model.downsample(), 4);
        assert_eq!(y.dims(), &[2, 1, 4, 6]);
        Ok(())
    }

    #[test]
    fn mcnn_variables_follow_sequential_names() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let _model = Mcnn::new(McnnArgs::default(), vb)?;

        let data = varmap.data().lock().expect("varmap lock");
        assert_eq!(data.len(), 26);
        assert_eq!(data["branch1.0.weight"].dims(), &[16, 3, 9, 9]);
        assert_eq!(data["branch2.3.weight"].dims(), &[40, 20, 5, 5]);
        assert_eq!(data["branch3.8.bias"].dims(), &[12]);
        assert_eq!(data["fuse.0.weight"].dims(), &[1, 30, 1, 1]);
        Ok(())
    }
}
