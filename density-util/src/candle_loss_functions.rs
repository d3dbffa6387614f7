use candle_core::{Result, Tensor};

/// Sum-reduced squared error between two density maps
///
/// loss = sum_ij (y_hat(i,j) - y(i,j))^2
///
/// * `y_hat` - predicted density map
/// * `y` - ground-truth density map of the same shape
///
pub fn sum_squared_error(y_hat: &Tensor, y: &Tensor) -> Result<Tensor> {
    y_hat.sub(y)?.sqr()?.sum_all()
}

/// Absolute difference of total counts
///
/// err = | sum_ij y_hat(i,j) - sum_ij y(i,j) |
///
/// The average of this over a test set is what we call "MAE".
///
pub fn count_absolute_error(y_hat: &Tensor, y: &Tensor) -> Result<f32> {
    let predicted = y_hat.sum_all()?.to_scalar::<f32>()?;
    let observed = y.sum_all()?.to_scalar::<f32>()?;
    Ok((predicted - observed).abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn squared_error_is_summed_not_averaged() -> Result<()> {
        let dev = Device::Cpu;
        let y_hat = Tensor::new(&[[1f32, 2.], [3., 4.]], &dev)?;
        let y = Tensor::new(&[[0f32, 2.], [1., 7.]], &dev)?;

        let loss = sum_squared_error(&y_hat, &y)?.to_scalar::<f32>()?;
        approx::assert_abs_diff_eq!(loss, 1. + 0. + 4. + 9.);
        Ok(())
    }

    #[test]
    fn count_error_compares_totals_only() -> Result<()> {
        let dev = Device::Cpu;
        // same totals, different layout
        let y_hat = Tensor::new(&[[5f32, 0.], [0., 0.]], &dev)?;
        let y = Tensor::new(&[[1f32, 1.], [1., 2.]], &dev)?;
        approx::assert_abs_diff_eq!(count_absolute_error(&y_hat, &y)?, 0.);

        let y = Tensor::new(&[[1f32, 1.], [1., 4.5]], &dev)?;
        approx::assert_abs_diff_eq!(count_absolute_error(&y_hat, &y)?, 2.5);
        Ok(())
    }
}
