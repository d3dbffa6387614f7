use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;
use std::path::Path;

/// standard deviation of the initial convolution weights
pub const INIT_WEIGHT_STD: f64 = 0.01;

/// Write every variable of `parameters` as safetensors
pub fn save_parameters<P: AsRef<Path>>(parameters: &VarMap, path: P) -> anyhow::Result<()> {
    let path = path.as_ref();
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    parameters.save(path)?;
    Ok(())
}

/// Read named tensors from a checkpoint file
///
/// * `.safetensors` - safetensors
/// * `.pth`, `.pt`, `.bin` - pickled PyTorch state dict
///
pub fn read_checkpoint<P: AsRef<Path>>(
    path: P,
    device: &Device,
) -> anyhow::Result<HashMap<String, Tensor>> {
    let path = path.as_ref();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "safetensors" => Ok(candle_core::safetensors::load(path, device)?),
        "pth" | "pt" | "bin" => candle_core::pickle::read_all(path)?
            .into_iter()
            .map(|(name, t)| -> anyhow::Result<(String, Tensor)> {
                Ok((name, t.to_device(device)?))
            })
            .collect(),
        _ => Err(anyhow::anyhow!(
            "unknown checkpoint format: {}",
            path.display()
        )),
    }
}

/// Overwrite every variable of `parameters` by the tensor of the
/// same name in the checkpoint file. Extra tensors in the file are
/// ignored; a missing one is an error.
pub fn load_parameters<P: AsRef<Path>>(
    parameters: &VarMap,
    path: P,
    device: &Device,
) -> anyhow::Result<()> {
    let path = path.as_ref();
    let stored = read_checkpoint(path, device)?;

    let vars = parameters
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("parameter map lock"))?;

    for (name, var) in vars.iter() {
        let t = stored
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("{} not found in {}", name, path.display()))?;
        var.set(&t.to_dtype(var.dtype())?)
            .map_err(|e| anyhow::anyhow!("{}: {}", name, e))?;
    }

    info!("loaded {} parameters from {}", vars.len(), path.display());
    Ok(())
}

/// Re-initialize: `*.weight` ~ N(0, 0.01^2), everything else zero.
///
/// Variables are visited in sorted name order so that the same
/// `seed` always gives the same parameters.
pub fn init_parameters(parameters: &VarMap, seed: u64) -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0., INIT_WEIGHT_STD).map_err(|e| anyhow::anyhow!("{}", e))?;

    let vars = parameters
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("parameter map lock"))?;

    let mut names: Vec<&String> = vars.keys().collect();
    names.sort();

    for name in names {
        let var = &vars[name];
        let t = if name.ends_with("weight") {
            let values: Vec<f32> = (0..var.elem_count())
                .map(|_| normal.sample(&mut rng) as f32)
                .collect();
            Tensor::from_vec(values, var.dims(), var.device())?.to_dtype(var.dtype())?
        } else {
            var.zeros_like()?
        };
        var.set(&t)?;
    }
    Ok(())
}

/// Copy of every variable by name, detached from the graph
pub fn snapshot_parameters(parameters: &VarMap) -> anyhow::Result<HashMap<String, Tensor>> {
    let vars = parameters
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("parameter map lock"))?;

    vars.iter()
        .map(|(name, var)| -> anyhow::Result<(String, Tensor)> {
            Ok((name.clone(), var.as_tensor().detach().copy()?))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{Init, VarBuilder};

    fn tiny_varmap(dev: &Device) -> anyhow::Result<VarMap> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        vb.get_with_hints((2, 3), "layer.weight", Init::Const(1.))?;
        vb.get_with_hints(2, "layer.bias", Init::Const(1.))?;
        Ok(varmap)
    }

    #[test]
    fn init_is_seeded() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let a = tiny_varmap(&dev)?;
        let b = tiny_varmap(&dev)?;
        init_parameters(&a, 11)?;
        init_parameters(&b, 11)?;

        let (a, b) = (snapshot_parameters(&a)?, snapshot_parameters(&b)?);
        assert_eq!(
            a["layer.weight"].to_vec2::<f32>()?,
            b["layer.weight"].to_vec2::<f32>()?
        );
        assert_eq!(a["layer.bias"].to_vec1::<f32>()?, vec![0., 0.]);
        Ok(())
    }

    #[test]
    fn unknown_extension_is_rejected() {
        assert!(read_checkpoint("model.ckpt", &Device::Cpu).is_err());
    }

    #[test]
    fn missing_variable_is_an_error() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("partial.safetensors");

        let small = VarMap::new();
        VarBuilder::from_varmap(&small, DType::F32, &dev).get_with_hints(
            2,
            "layer.bias",
            Init::Const(0.),
        )?;
        save_parameters(&small, &file)?;

        let full = tiny_varmap(&dev)?;
        assert!(load_parameters(&full, &file, &dev).is_err());
        Ok(())
    }
}
