//! Marshalling between the model's var map and the wire representation.
//!
//! Parameters travel as an ordered list of flattened f32 arrays with explicit
//! dims, one per learnable tensor, in stable name order. Both sides of the
//! exchange sort by name, so the order the coordinator aggregates in always
//! matches the order the client loads in.

use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

/// One tensor on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TensorPayload {
    pub name: String,
    pub dims: Vec<usize>,
    pub values: Vec<f32>,
}

/// Ordered model parameters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelParams {
    pub tensors: Vec<TensorPayload>,
}

impl ModelParams {
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// Read the model's current parameters. Pure read, no side effect.
pub fn get_parameters(varmap: &VarMap) -> Result<ModelParams> {
    let data = varmap.data().lock().unwrap();
    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    let mut tensors = Vec::with_capacity(names.len());
    for name in names {
        let var = &data[name];
        tensors.push(TensorPayload {
            name: name.clone(),
            dims: var.dims().to_vec(),
            values: var.as_tensor().flatten_all()?.to_vec1::<f32>()?,
        });
    }
    Ok(ModelParams { tensors })
}

/// Load `params` into the var map, in stable name order.
///
/// Count, name or shape mismatches are errors, with one documented special
/// case: a zero-dimensional incoming array is loaded as a single zero
/// element. Some producers emit scalar bookkeeping tensors (batch-norm step
/// counters) where the model expects a one-element tensor; the coercion
/// covers exactly that, it is not a general contract.
pub fn set_parameters(varmap: &VarMap, params: &ModelParams, device: &Device) -> Result<()> {
    let data = varmap.data().lock().unwrap();
    if params.tensors.len() != data.len() {
        bail!(
            "parameter count mismatch: model has {} tensors, received {}",
            data.len(),
            params.tensors.len()
        );
    }

    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    for (name, payload) in names.iter().zip(&params.tensors) {
        if payload.name != **name {
            bail!(
                "parameter order mismatch: expected tensor {name}, received {}",
                payload.name
            );
        }
        let var = &data[name.as_str()];
        let tensor = if payload.dims.is_empty() {
            // Scalar-shape coercion, see above.
            Tensor::from_vec(vec![0f32], 1, device)?
        } else {
            Tensor::from_vec(payload.values.clone(), payload.dims.clone(), device)?
        };
        var.set(&tensor)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::{init, VarBuilder};

    fn small_varmap() -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get_with_hints((4, 3), "weight", init::DEFAULT_KAIMING_NORMAL)
            .unwrap();
        vb.get_with_hints(4, "bias", init::ZERO).unwrap();
        vb.get_with_hints(1, "steps", init::ZERO).unwrap();
        varmap
    }

    #[test]
    fn round_trip_preserves_shapes_and_values() {
        let varmap = small_varmap();
        let before = get_parameters(&varmap).unwrap();
        // Stable name order
        let names: Vec<&str> = before.tensors.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["bias", "steps", "weight"]);

        set_parameters(&varmap, &before, &Device::Cpu).unwrap();
        let after = get_parameters(&varmap).unwrap();
        for (a, b) in before.tensors.iter().zip(&after.tensors) {
            assert_eq!(a.dims, b.dims);
            assert_eq!(a.values, b.values);
        }
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let varmap = small_varmap();
        let mut params = get_parameters(&varmap).unwrap();
        params.tensors.pop();
        assert!(set_parameters(&varmap, &params, &Device::Cpu).is_err());
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let varmap = small_varmap();
        let mut params = get_parameters(&varmap).unwrap();
        params.tensors[0].dims = vec![2, 2];
        params.tensors[0].values = vec![0.0; 4];
        assert!(set_parameters(&varmap, &params, &Device::Cpu).is_err());
    }

    #[test]
    fn scalar_payload_is_coerced_to_one_zero() {
        let varmap = small_varmap();
        let mut params = get_parameters(&varmap).unwrap();
        // "steps" is the [1]-shaped tensor; hand it over as a scalar.
        let steps = params
            .tensors
            .iter_mut()
            .find(|t| t.name == "steps")
            .unwrap();
        steps.dims = vec![];
        steps.values = vec![42.0];
        set_parameters(&varmap, &params, &Device::Cpu).unwrap();

        let after = get_parameters(&varmap).unwrap();
        let steps = after.tensors.iter().find(|t| t.name == "steps").unwrap();
        assert_eq!(steps.dims, vec![1]);
        assert_eq!(steps.values, vec![0.0]);
    }
}
