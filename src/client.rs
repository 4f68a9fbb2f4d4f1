//! The per-client training/evaluation unit.
//!
//! One model instance, one device binding, two fixed dataset partitions. The
//! coordinator drives it through `fit` and `evaluate`; both load the pushed
//! global parameters first and run synchronously, blocking their caller for
//! the duration. Errors propagate unhandled; retries and fault handling are
//! the coordinator's problem.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use candle_core::{DType, Device};
use candle_nn::{ModuleT, VarBuilder, VarMap};
use tracing::info;

use crate::data::{self, ClientData};
use crate::model::{self, MobileNetV3, TrainSettings};
use crate::params::{self, ModelParams};
use crate::protocol::{EvaluateResponse, FitConfig, FitResponse};
use crate::util::{self, PARTITION_SEED};

/// Local optimizer settings, fixed across rounds.
const LEARNING_RATE: f64 = 0.01;
const MOMENTUM: f64 = 0.9;

pub struct ClientUnit {
    varmap: VarMap,
    net: Box<dyn ModuleT + Send>,
    device: Device,
    data: ClientData,
}

impl ClientUnit {
    /// Build the unit for client `cid` of `num_clients`. Fails on an
    /// out-of-range `cid` before loading any data.
    pub fn new(data_dir: &Path, cid: usize, num_clients: usize) -> Result<Self> {
        data::check_cid(cid, num_clients)?;
        let device = util::best_device();
        let data =
            data::load_client_partition(data_dir, cid, num_clients, PARTITION_SEED, &device)?;
        info!(
            cid,
            num_train = data.num_train(),
            num_val = data.num_val(),
            "partition loaded"
        );

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let net = MobileNetV3::small(data::NUM_CLASSES, vb)?;
        Ok(Self::from_parts(varmap, Box::new(net), device, data))
    }

    fn from_parts(
        varmap: VarMap,
        net: Box<dyn ModuleT + Send>,
        device: Device,
        data: ClientData,
    ) -> Self {
        Self {
            varmap,
            net,
            device,
            data,
        }
    }

    /// Current model parameters in stable order. Pure read.
    pub fn get_parameters(&self) -> Result<ModelParams> {
        params::get_parameters(&self.varmap)
    }

    /// Load parameters into the model in its fixed order.
    pub fn set_parameters(&self, incoming: &ModelParams) -> Result<()> {
        params::set_parameters(&self.varmap, incoming, &self.device)
    }

    /// Load the pushed parameters, train locally for the configured epochs
    /// and batch size, and return the updated parameters together with the
    /// number of training examples used. Mutates the in-process weights.
    pub fn fit(&self, incoming: &ModelParams, config: FitConfig) -> Result<FitResponse> {
        info!(
            epochs = config.epochs,
            batch_size = config.batch_size,
            "sampled for fit"
        );
        self.set_parameters(incoming)?;
        let settings = TrainSettings {
            epochs: config.epochs,
            batch_size: config.batch_size,
            lr: LEARNING_RATE,
            momentum: MOMENTUM,
        };
        let mut rng = rand::thread_rng();
        model::train(
            &*self.net,
            &self.varmap,
            &self.data.train_images,
            &self.data.train_labels,
            &settings,
            &mut rng,
        )?;
        Ok(FitResponse {
            params: self.get_parameters()?,
            num_examples: self.data.num_train(),
            metrics: HashMap::new(),
        })
    }

    /// Load the pushed parameters and run a forward-only pass over the
    /// validation partition.
    pub fn evaluate(&self, incoming: &ModelParams) -> Result<EvaluateResponse> {
        info!("sampled for evaluate");
        self.set_parameters(incoming)?;
        let report = model::evaluate(
            &*self.net,
            &self.data.val_images,
            &self.data.val_labels,
        )?;
        let mut metrics = HashMap::new();
        metrics.insert("accuracy".to_string(), report.accuracy());
        Ok(EvaluateResponse {
            loss: report.loss,
            num_examples: report.total,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Module, Tensor};
    use candle_nn::{linear, Linear};

    struct FlatNet {
        fc: Linear,
    }

    impl Module for FlatNet {
        fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
            self.fc.forward(&xs.flatten_from(1)?)
        }
    }

    fn synthetic_unit(num_train: usize, num_val: usize) -> ClientUnit {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let net = FlatNet {
            fc: linear(3 * 8 * 8, data::NUM_CLASSES, vb.pp("fc")).unwrap(),
        };

        let images = |n: usize| Tensor::zeros((n, 3, 8, 8), DType::F32, &device).unwrap();
        let labels = |n: usize| {
            Tensor::from_vec(
                (0..n).map(|i| (i % data::NUM_CLASSES) as u32).collect(),
                n,
                &device,
            )
            .unwrap()
        };
        let data = ClientData {
            train_images: images(num_train),
            train_labels: labels(num_train),
            val_images: images(num_val),
            val_labels: labels(num_val),
        };
        ClientUnit::from_parts(varmap, Box::new(net), device, data)
    }

    #[test]
    fn fit_reports_train_subset_size() {
        let unit = synthetic_unit(6, 2);
        let global = unit.get_parameters().unwrap();
        let response = unit
            .fit(
                &global,
                FitConfig {
                    epochs: 1,
                    batch_size: 2,
                },
            )
            .unwrap();
        assert_eq!(response.num_examples, 6);
        assert!(response.metrics.is_empty());
        assert_eq!(response.params.len(), global.len());
    }

    #[test]
    fn evaluate_reports_val_subset_size_and_bounded_accuracy() {
        let unit = synthetic_unit(6, 4);
        let global = unit.get_parameters().unwrap();
        let response = unit.evaluate(&global).unwrap();
        assert_eq!(response.num_examples, 4);
        let accuracy = response.metrics["accuracy"];
        assert!((0.0..=1.0).contains(&accuracy));
        assert!(response.loss.is_finite());
    }

    #[test]
    fn out_of_range_cid_fails_before_touching_data() {
        // The path does not exist; a bad cid must be rejected first.
        let err = ClientUnit::new(Path::new("/nonexistent"), 5, 2);
        assert!(err.is_err());
        let err = ClientUnit::new(Path::new("/nonexistent"), 2, 2);
        assert!(err.is_err());
    }
}
