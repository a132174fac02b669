use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};

/// Pretrained, read-only weights of one subgraph (encoder or teacher).
///
/// Tensors are plain values, not variables: they never take part in an
/// optimizer update and no code path can mutate them in place.
#[derive(Debug, Clone)]
pub struct FrozenParameterSet {
    prefix: String,
    tensors: HashMap<String, Tensor>,
}

impl FrozenParameterSet {
    /// Load every tensor stored under `<prefix>.` in a safetensors artifact.
    ///
    /// The prefix is stripped so the result can be handed straight to a
    /// module constructor. A missing file or an empty prefix match is fatal.
    pub fn load(path: &Path, prefix: &str, device: &Device) -> CoreResult<Self> {
        if !path.is_file() {
            return Err(CoreError::MissingPretrained {
                prefix: prefix.to_string(),
                path: path.display().to_string(),
            });
        }

        let all = candle_core::safetensors::load(path, device).map_err(|e| {
            CoreError::UnreadablePretrained { path: path.display().to_string(), reason: e.to_string() }
        })?;

        let needle = format!("{prefix}.");
        let tensors: HashMap<String, Tensor> = all
            .into_iter()
            .filter_map(|(name, t)| name.strip_prefix(&needle).map(|rest| (rest.to_string(), t)))
            .collect();

        if tensors.is_empty() {
            return Err(CoreError::MissingPretrained {
                prefix: prefix.to_string(),
                path: path.display().to_string(),
            });
        }

        info!(
            path = %path.display(),
            prefix,
            tensors = tensors.len(),
            "Loaded frozen parameters"
        );
        Ok(Self { prefix: prefix.to_string(), tensors })
    }

    pub fn from_tensors(prefix: &str, tensors: HashMap<String, Tensor>) -> Self {
        Self { prefix: prefix.to_string(), tensors }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn tensors(&self) -> &HashMap<String, Tensor> {
        &self.tensors
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Read-only copy resident on `device`.
    pub fn to_device(&self, device: &Device) -> CoreResult<Self> {
        let tensors = self
            .tensors
            .iter()
            .map(|(name, t)| Ok((name.clone(), t.to_device(device)?)))
            .collect::<CoreResult<HashMap<_, _>>>()?;
        debug!(prefix = %self.prefix, ?device, "Replicated frozen parameters");
        Ok(Self { prefix: self.prefix.clone(), tensors })
    }

    /// A builder that resolves names against these tensors only; asking for a
    /// name that is not present is an error rather than a fresh variable.
    pub fn var_builder(&self, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_tensors(self.tensors.clone(), DType::F32, device)
    }
}
