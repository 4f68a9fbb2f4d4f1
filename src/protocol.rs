//! Wire types exchanged between the coordinator and the clients.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::params::ModelParams;

/// Hyperparameters the coordinator pushes with every fit call.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FitConfig {
    pub epochs: usize,
    pub batch_size: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub client_url: String,
    pub cid: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub ok: bool,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParametersResponse {
    pub params: ModelParams,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FitRequest {
    pub params: ModelParams,
    pub config: FitConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FitResponse {
    pub params: ModelParams,
    pub num_examples: usize,
    pub metrics: HashMap<String, f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvaluateRequest {
    pub params: ModelParams,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvaluateResponse {
    pub loss: f64,
    pub num_examples: usize,
    pub metrics: HashMap<String, f64>,
}
