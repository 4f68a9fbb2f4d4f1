//! Federated averaging over CIFAR-10 partitions.
//!
//! A coordinator and many clients jointly train a MobileNetV3-small
//! classifier. Each client owns one disjoint, deterministically assigned
//! slice of the training set and exposes three HTTP operations the
//! coordinator drives: `GET /parameters`, `POST /fit` and `POST /evaluate`.
//! The coordinator samples a fraction of the registered clients every round,
//! broadcasts the global parameters, and averages the returned updates
//! weighted by each client's reported example count (FedAvg).

pub mod client;
pub mod data;
pub mod model;
pub mod params;
pub mod protocol;
pub mod strategy;
pub mod util;
