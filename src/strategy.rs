//! FedAvg strategy configuration and aggregation arithmetic.

use std::collections::HashMap;

use thiserror::Error;

use crate::params::ModelParams;
use crate::protocol::FitConfig;

#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("no client results to aggregate")]
    NoResults,
    #[error("parameter tensor count mismatch across clients: expected {expected}, got {got}")]
    TensorCountMismatch { expected: usize, got: usize },
    #[error("shape mismatch for tensor {name}")]
    ShapeMismatch { name: String },
    #[error("clients reported zero examples in total")]
    ZeroExamples,
}

/// Per-round fit-config callback.
pub type FitConfigFn = Box<dyn Fn(usize) -> FitConfig + Send + Sync>;

/// Metrics-aggregation callback over `(num_examples, metrics)` pairs.
pub type MetricsAggregationFn = fn(&[(usize, HashMap<String, f64>)]) -> HashMap<String, f64>;

/// Aggregation policy: thresholds plus the two callbacks. The round loop in
/// the server binary consumes this; the strategy itself holds no state.
pub struct FedAvg {
    pub num_rounds: usize,
    pub fraction_fit: f64,
    pub fraction_evaluate: f64,
    pub min_fit_clients: usize,
    pub min_evaluate_clients: usize,
    pub min_available_clients: usize,
    pub on_fit_config: FitConfigFn,
    pub evaluate_metrics_aggregation: MetricsAggregationFn,
}

impl FedAvg {
    pub fn num_fit_clients(&self, available: usize) -> usize {
        sample_size(available, self.fraction_fit, self.min_fit_clients)
    }

    pub fn num_evaluate_clients(&self, available: usize) -> usize {
        sample_size(available, self.fraction_evaluate, self.min_evaluate_clients)
    }
}

/// The fraction of available clients, floored, raised to the phase minimum,
/// capped at what is actually available.
fn sample_size(available: usize, fraction: f64, minimum: usize) -> usize {
    let by_fraction = (available as f64 * fraction).floor() as usize;
    by_fraction.max(minimum).min(available)
}

/// Example-count-weighted FedAvg over the wire parameter arrays.
pub fn aggregate_fit(results: &[(usize, ModelParams)]) -> Result<ModelParams, StrategyError> {
    let Some((_, first)) = results.first() else {
        return Err(StrategyError::NoResults);
    };
    let total: usize = results.iter().map(|(n, _)| *n).sum();
    if total == 0 {
        return Err(StrategyError::ZeroExamples);
    }

    let mut out = first.clone();
    for tensor in &mut out.tensors {
        tensor.values.iter_mut().for_each(|v| *v = 0.0);
    }

    for (num_examples, params) in results {
        if params.tensors.len() != out.tensors.len() {
            return Err(StrategyError::TensorCountMismatch {
                expected: out.tensors.len(),
                got: params.tensors.len(),
            });
        }
        let weight = *num_examples as f32 / total as f32;
        for (acc, tensor) in out.tensors.iter_mut().zip(&params.tensors) {
            if acc.dims != tensor.dims {
                return Err(StrategyError::ShapeMismatch {
                    name: acc.name.clone(),
                });
            }
            for (a, v) in acc.values.iter_mut().zip(&tensor.values) {
                *a += weight * v;
            }
        }
    }
    Ok(out)
}

/// Example-count-weighted mean of the `accuracy` metric reported by
/// evaluating clients. Clients that do not report the key are left out of
/// both the numerator and the denominator; if none report it, the result is
/// empty rather than a deflated zero.
pub fn weighted_average(metrics: &[(usize, HashMap<String, f64>)]) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    let mut weighted_sum = 0f64;
    let mut total = 0usize;
    for (num_examples, m) in metrics {
        if let Some(accuracy) = m.get("accuracy") {
            weighted_sum += *num_examples as f64 * accuracy;
            total += num_examples;
        }
    }
    if total > 0 {
        out.insert("accuracy".to_string(), weighted_sum / total as f64);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::TensorPayload;

    fn one_tensor(values: Vec<f32>) -> ModelParams {
        ModelParams {
            tensors: vec![TensorPayload {
                name: "weight".to_string(),
                dims: vec![values.len()],
                values,
            }],
        }
    }

    #[test]
    fn weighted_average_of_accuracies() {
        let metrics = vec![
            (10, HashMap::from([("accuracy".to_string(), 0.5)])),
            (30, HashMap::from([("accuracy".to_string(), 0.9)])),
        ];
        let out = weighted_average(&metrics);
        assert!((out["accuracy"] - 0.8).abs() < 1e-12);
    }

    #[test]
    fn weighted_average_of_nothing_is_empty() {
        assert!(weighted_average(&[]).is_empty());
    }

    #[test]
    fn weighted_average_skips_clients_without_the_metric() {
        let metrics = vec![
            (10, HashMap::from([("accuracy".to_string(), 0.5)])),
            (1000, HashMap::new()),
        ];
        let out = weighted_average(&metrics);
        assert!((out["accuracy"] - 0.5).abs() < 1e-12);

        let silent = vec![(10, HashMap::new()), (30, HashMap::new())];
        assert!(weighted_average(&silent).is_empty());
    }

    #[test]
    fn aggregate_weights_by_example_count() {
        let results = vec![(10, one_tensor(vec![1.0, 2.0])), (30, one_tensor(vec![3.0, 4.0]))];
        let out = aggregate_fit(&results).unwrap();
        // (10*1 + 30*3) / 40 = 2.5; (10*2 + 30*4) / 40 = 3.5
        assert_eq!(out.tensors[0].values, vec![2.5, 3.5]);
    }

    #[test]
    fn aggregate_rejects_mismatches() {
        assert!(matches!(aggregate_fit(&[]), Err(StrategyError::NoResults)));
        let mismatched = vec![(1, one_tensor(vec![1.0])), (1, one_tensor(vec![1.0, 2.0]))];
        assert!(matches!(
            aggregate_fit(&mismatched),
            Err(StrategyError::ShapeMismatch { .. })
        ));
        let zero = vec![(0, one_tensor(vec![1.0]))];
        assert!(matches!(
            aggregate_fit(&zero),
            Err(StrategyError::ZeroExamples)
        ));
    }

    #[test]
    fn sampling_honors_fraction_and_minimums() {
        let strategy = FedAvg {
            num_rounds: 5,
            fraction_fit: 0.5,
            fraction_evaluate: 0.25,
            min_fit_clients: 2,
            min_evaluate_clients: 1,
            min_available_clients: 2,
            on_fit_config: Box::new(|_| FitConfig {
                epochs: 3,
                batch_size: 16,
            }),
            evaluate_metrics_aggregation: weighted_average,
        };
        assert_eq!(strategy.num_fit_clients(10), 5);
        assert_eq!(strategy.num_fit_clients(3), 2); // raised to the minimum
        assert_eq!(strategy.num_fit_clients(1), 1); // capped at available
        assert_eq!(strategy.num_evaluate_clients(8), 2);
        assert_eq!(strategy.num_evaluate_clients(2), 1);

        let config = (strategy.on_fit_config)(1);
        assert_eq!(config.epochs, 3);
        assert_eq!(config.batch_size, 16);
    }
}
