use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use candle_nn::Optimizer;

#[derive(Clone, Copy, Debug)]
pub struct ParamsSgdMomentum {
    pub lr: f64,
    pub momentum: f64,
}

impl Default for ParamsSgdMomentum {
    fn default() -> Self {
        Self {
            lr: 1e-6,
            momentum: 0.95,
        }
    }
}

/// Stochastic gradient descent with a velocity buffer per variable
///
/// v <- momentum * v + g
/// w <- w - lr * v
///
/// The velocity starts at zero, so the first step is a plain
/// gradient step.
pub struct SgdMomentum {
    vars: Vec<(Var, Option<Tensor>)>,
    params: ParamsSgdMomentum,
}

impl Optimizer for SgdMomentum {
    type Config = ParamsSgdMomentum;

    fn new(vars: Vec<Var>, params: ParamsSgdMomentum) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| (var, None))
            .collect();
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let lr = self.params.lr;
        let mu = self.params.momentum;

        for (var, velocity) in self.vars.iter_mut() {
            if let Some(g) = grads.get(var.as_tensor()) {
                let v_next = match velocity.take() {
                    Some(v) => v.affine(mu, 0.)?.add(g)?,
                    None => g.clone(),
                };
                var.set(&var.as_tensor().sub(&v_next.affine(lr, 0.)?)?)?;
                *velocity = Some(v_next.detach());
            }
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

impl SgdMomentum {
    pub fn new_lr_momentum(vars: Vec<Var>, lr: f64, momentum: f64) -> Result<Self> {
        <Self as Optimizer>::new(vars, ParamsSgdMomentum { lr, momentum })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn momentum_accumulates_velocity() -> Result<()> {
        let dev = Device::Cpu;
        let w = Var::new(&[1f32, -2.], &dev)?;
        let mut sgd = SgdMomentum::new_lr_momentum(vec![w.clone()], 0.1, 0.5)?;

        // loss = sum w^2, so g = 2w
        // step 1: v = [2, -4], w = [0.8, -1.6]
        sgd.backward_step(&w.as_tensor().sqr()?.sum_all()?)?;
        let w1 = w.as_tensor().to_vec1::<f32>()?;
        approx::assert_abs_diff_eq!(w1[0], 0.8, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(w1[1], -1.6, epsilon = 1e-6);

        // step 2: g = [1.6, -3.2], v = [2.6, -5.2], w = [0.54, -1.08]
        sgd.backward_step(&w.as_tensor().sqr()?.sum_all()?)?;
        let w2 = w.as_tensor().to_vec1::<f32>()?;
        approx::assert_abs_diff_eq!(w2[0], 0.54, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(w2[1], -1.08, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn zero_learning_rate_keeps_weights() -> Result<()> {
        let dev = Device::Cpu;
        let w = Var::new(&[3f32, 4.], &dev)?;
        let mut sgd = SgdMomentum::new_lr_momentum(vec![w.clone()], 0., 0.95)?;
        for _ in 0..3 {
            sgd.backward_step(&w.as_tensor().sqr()?.sum_all()?)?;
        }
        assert_eq!(w.as_tensor().to_vec1::<f32>()?, vec![3., 4.]);
        Ok(())
    }
}
