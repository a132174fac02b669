//! The student's trainable variables.
//!
//! Frozen weights never live here: they are plain tensors inside
//! [`FrozenParameterSet`](crate::loader::FrozenParameterSet), so anything that
//! holds only a `TrainableParameterSet` cannot reach them.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{CoreError, CoreResult};

/// Named student variables backed by a [`VarMap`].
///
/// Cloning is shallow: clones share the same variables.
#[derive(Clone)]
pub struct TrainableParameterSet {
    varmap: VarMap,
    device: Device,
}

impl std::fmt::Debug for TrainableParameterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainableParameterSet")
            .field("device", &self.device)
            .field("len", &self.len())
            .finish()
    }
}

impl TrainableParameterSet {
    pub fn new(device: &Device) -> Self {
        Self { varmap: VarMap::new(), device: device.clone() }
    }

    /// A builder that registers new variables in this set.
    pub fn var_builder(&self) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, DType::F32, &self.device)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// All variables sorted by name. The order is stable for the lifetime of
    /// the set and identical across replicas built from the same config.
    pub fn named_vars(&self) -> CoreResult<Vec<(String, Var)>> {
        let data = self.varmap.data().lock().map_err(|_| CoreError::Poisoned)?;
        let mut vars: Vec<(String, Var)> =
            data.iter().map(|(name, var)| (name.clone(), var.clone())).collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }

    pub fn len(&self) -> usize {
        self.varmap.data().lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of scalar parameters.
    pub fn element_count(&self) -> CoreResult<usize> {
        Ok(self.named_vars()?.iter().map(|(_, v)| v.elem_count()).sum())
    }

    /// Deterministically re-initialise every variable from `seed`.
    ///
    /// Rank-1 tensors (biases) are zeroed; everything else is drawn from
    /// `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`, visiting variables in name order.
    pub fn initialize(&self, seed: u64) -> CoreResult<()> {
        let mut rng = StdRng::seed_from_u64(seed);
        for (_, var) in self.named_vars()? {
            let dims = var.dims().to_vec();
            let n = var.elem_count();
            let values: Vec<f32> = if dims.len() <= 1 {
                vec![0.0; n]
            } else {
                let fan_in = (n / dims[0]).max(1);
                let bound = (1.0 / fan_in as f32).sqrt();
                let dist = Uniform::new_inclusive(-bound, bound);
                (0..n).map(|_| dist.sample(&mut rng)).collect()
            };
            let init = Tensor::from_vec(values, dims.as_slice(), &self.device)?;
            var.set(&init)?;
        }
        Ok(())
    }

    /// Deep copy of every variable's current value.
    pub fn snapshot(&self) -> CoreResult<BTreeMap<String, Tensor>> {
        self.named_vars()?
            .into_iter()
            .map(|(name, var)| Ok((name, var.as_tensor().copy()?)))
            .collect()
    }

    /// Overwrite one variable in place.
    pub fn assign(&self, name: &str, value: &Tensor) -> CoreResult<()> {
        let data = self.varmap.data().lock().map_err(|_| CoreError::Poisoned)?;
        let var = data
            .get(name)
            .ok_or_else(|| CoreError::config(name, "no such trainable parameter"))?;
        let value = value.to_device(&self.device)?.to_dtype(var.dtype())?;
        if value.dims() != var.dims() {
            return Err(CoreError::config(
                name,
                format!("shape mismatch: expected {:?}, got {:?}", var.dims(), value.dims()),
            ));
        }
        var.set(&value)?;
        Ok(())
    }

    /// Copy every value of `source` into this set (used to broadcast the main
    /// replica's parameters to the other devices).
    pub fn copy_from(&self, source: &TrainableParameterSet) -> CoreResult<()> {
        for (name, var) in source.named_vars()? {
            self.assign(&name, var.as_tensor())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_param_set(seed: u64) -> TrainableParameterSet {
        let params = TrainableParameterSet::new(&Device::Cpu);
        let vb = params.var_builder();
        vb.get((3, 4), "layer.weight").unwrap();
        vb.get(3, "layer.bias").unwrap();
        params.initialize(seed).unwrap();
        params
    }

    fn values(params: &TrainableParameterSet) -> Vec<Vec<f32>> {
        params
            .snapshot()
            .unwrap()
            .values()
            .map(|t| t.flatten_all().unwrap().to_vec1::<f32>().unwrap())
            .collect()
    }

    #[test]
    fn test_named_vars_sorted() {
        let params = two_param_set(0);
        let names: Vec<String> = params.named_vars().unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["layer.bias".to_string(), "layer.weight".to_string()]);
        assert_eq!(params.element_count().unwrap(), 15);
    }

    #[test]
    fn test_initialize_is_deterministic() {
        assert_eq!(values(&two_param_set(7)), values(&two_param_set(7)));
        assert_ne!(values(&two_param_set(7)), values(&two_param_set(8)));
    }

    #[test]
    fn test_bias_zero_weight_bounded() {
        let params = two_param_set(1);
        let v = values(&params);
        assert!(v[0].iter().all(|x| *x == 0.0));
        let bound = 0.5f32;
        assert!(v[1].iter().all(|x| x.abs() <= bound));
    }

    #[test]
    fn test_copy_from_and_snapshot_independence() {
        let a = two_param_set(1);
        let b = two_param_set(2);
        let before = a.snapshot().unwrap();
        b.copy_from(&a).unwrap();
        assert_eq!(values(&a), values(&b));

        a.initialize(3).unwrap();
        let after: Vec<f32> = before["layer.weight"].flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(after, values(&b)[1], "snapshot must not alias live storage");
    }

    #[test]
    fn test_assign_rejects_unknown_and_misshapen() {
        let params = two_param_set(0);
        let t = Tensor::zeros(5, DType::F32, &Device::Cpu).unwrap();
        assert!(params.assign("missing", &t).is_err());
        assert!(params.assign("layer.bias", &t).is_err());
    }
}
