//! Reproducible parameter initialization.
//!
//! candle's CPU backend cannot seed its generator, so [`SeededVarMap`]
//! samples missing variables on the host from a seeded [`XorShiftRng`] and
//! uploads them. Every [`Init`] variant keeps the distribution candle gives
//! it; only the source of randomness changes.

use std::sync::{Arc, Mutex, PoisonError};

use candle_core::{DType, Device, Shape, Tensor, Var};
use candle_nn::init::NormalOrUniform;
use candle_nn::var_builder::SimpleBackend;
use candle_nn::{Init, VarBuilder, VarMap};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};
use rand_xorshift::XorShiftRng;

/// A [`VarMap`] whose missing variables are drawn from a seeded generator.
///
/// Two maps with the same seed, filled by the same model constructor, hold
/// identical parameters.
#[derive(Clone)]
pub struct SeededVarMap {
    varmap: VarMap,
    rng: Arc<Mutex<XorShiftRng>>,
}

impl SeededVarMap {
    pub fn new(seed: u64) -> Self {
        Self {
            varmap: VarMap::new(),
            rng: Arc::new(Mutex::new(XorShiftRng::seed_from_u64(seed))),
        }
    }

    /// Underlying store, for the optimizer and checkpointing.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn all_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Builder whose variables land in this map.
    pub fn var_builder(&self, dtype: DType, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_backend(Box::new(self.clone()), dtype, device.clone())
    }

    fn sample(&self, shape: &Shape, init: Init) -> candle_core::Result<Vec<f64>> {
        let n = shape.elem_count();
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let values = match init {
            Init::Const(v) => vec![v; n],
            Init::Uniform { lo, up } => draw(uniform(lo, up)?, n, &mut rng),
            Init::Randn { mean, stdev } => draw(normal(mean, stdev)?, n, &mut rng),
            Init::Kaiming {
                dist,
                fan,
                non_linearity,
            } => {
                let std = non_linearity.gain() / (fan.for_shape(shape) as f64).sqrt();
                match dist {
                    NormalOrUniform::Uniform => {
                        let bound = 3f64.sqrt() * std;
                        draw(uniform(-bound, bound)?, n, &mut rng)
                    }
                    NormalOrUniform::Normal => draw(normal(0.0, std)?, n, &mut rng),
                }
            }
        };
        Ok(values)
    }
}

fn draw<D: Distribution<f64>>(dist: D, n: usize, rng: &mut XorShiftRng) -> Vec<f64> {
    (0..n).map(|_| dist.sample(&mut *rng)).collect()
}

fn uniform(lo: f64, up: f64) -> candle_core::Result<Uniform<f64>> {
    Uniform::new(lo, up).map_err(|e| candle_core::Error::msg(format!("uniform({lo}, {up}): {e}")))
}

fn normal(mean: f64, stdev: f64) -> candle_core::Result<Normal<f64>> {
    Normal::new(mean, stdev)
        .map_err(|e| candle_core::Error::msg(format!("normal({mean}, {stdev}): {e}")))
}

impl SimpleBackend for SeededVarMap {
    fn get(
        &self,
        s: Shape,
        name: &str,
        h: Init,
        dtype: DType,
        dev: &Device,
    ) -> candle_core::Result<Tensor> {
        let mut data = self
            .varmap
            .data()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(var) = data.get(name) {
            if var.shape() != &s {
                candle_core::bail!("shape mismatch on {name}: {s:?} <> {:?}", var.shape());
            }
            return Ok(var.as_tensor().clone());
        }

        let values = self.sample(&s, h)?;
        let tensor = Tensor::from_vec(values, s, dev)?.to_dtype(dtype)?;
        let var = Var::from_tensor(&tensor)?;
        let out = var.as_tensor().clone();
        data.insert(name.to_string(), var);
        Ok(out)
    }

    fn contains_tensor(&self, name: &str) -> bool {
        self.varmap
            .data()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}
