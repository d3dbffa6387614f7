use candle_core::{DType, Tensor};
use ndarray::Array2;

/// Copy a density tensor `(.., h, w)` with singleton leading
/// dimensions into a `h x w` array
pub fn tensor_to_density_map(t: &Tensor) -> anyhow::Result<Array2<f32>> {
    let dims = t.dims();
    if dims.len() < 2 || dims[..dims.len() - 2].iter().any(|&d| d != 1) {
        return Err(anyhow::anyhow!("not a single density map: {:?}", dims));
    }
    let (rows, cols) = (dims[dims.len() - 2], dims[dims.len() - 1]);
    let values = t
        .to_device(&candle_core::Device::Cpu)?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    Ok(Array2::from_shape_vec((rows, cols), values)?)
}

/// Sum of all cells
pub fn total_count(map: &Array2<f32>) -> f32 {
    map.sum()
}

/// Scale a map into `[0, 255]` by its own maximum. A map without a
/// positive maximum is mapped to zeros.
pub fn normalize_density(map: &Array2<f32>) -> Array2<f32> {
    let max = map.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max.is_finite() && max > 0. {
        map.mapv(|x| x / max * 255.)
    } else {
        Array2::zeros(map.raw_dim())
    }
}

/// Bilinear resampling with half-pixel centres
///
/// src = (dst + 0.5) * (n_src / n_dst) - 0.5, clamped to the border
///
pub fn resize_bilinear(map: &Array2<f32>, rows: usize, cols: usize) -> Array2<f32> {
    let (src_rows, src_cols) = map.dim();
    if src_rows == 0 || src_cols == 0 {
        return Array2::zeros((rows, cols));
    }

    let row_taps = bilinear_taps(src_rows, rows);
    let col_taps = bilinear_taps(src_cols, cols);

    Array2::from_shape_fn((rows, cols), |(i, j)| {
        let (i0, i1, wi) = row_taps[i];
        let (j0, j1, wj) = col_taps[j];
        let top = map[[i0, j0]] * (1. - wj) + map[[i0, j1]] * wj;
        let bottom = map[[i1, j0]] * (1. - wj) + map[[i1, j1]] * wj;
        top * (1. - wi) + bottom * wi
    })
}

/// (lower index, upper index, upper weight) for each output position
fn bilinear_taps(n_src: usize, n_dst: usize) -> Vec<(usize, usize, f32)> {
    let scale = n_src as f32 / n_dst as f32;
    (0..n_dst)
        .map(|d| {
            let s = ((d as f32 + 0.5) * scale - 0.5).max(0.);
            let lo = (s.floor() as usize).min(n_src - 1);
            let hi = (lo + 1).min(n_src - 1);
            (lo, hi, s - lo as f32)
        })
        .collect()
}
