//! CIFAR-10 loading and deterministic client partitioning.

use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_datasets::vision::cifar;
use rand::seq::SliceRandom;

use crate::util::seeded;

pub const NUM_CLASSES: usize = 10;

/// Share of each client partition held out for validation.
pub const VAL_RATIO: f64 = 0.1;

/// Per-channel normalization constants (ImageNet statistics).
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// One client's exclusive slice of the shared training set, as indices into
/// the full dataset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    pub train: Vec<usize>,
    pub val: Vec<usize>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.train.len() + self.val.len()
    }

    pub fn is_empty(&self) -> bool {
        self.train.is_empty() && self.val.is_empty()
    }
}

pub fn check_cid(cid: usize, num_clients: usize) -> Result<()> {
    if cid >= num_clients {
        bail!("client id {cid} out of range, expected a value below {num_clients}");
    }
    Ok(())
}

/// Split `total` example indices into `num_clients` disjoint partitions.
///
/// One seeded permutation of the index space is cut into equal chunks of
/// `total / num_clients`; any remainder is dropped. Each chunk is then
/// re-shuffled with the same seed and split 90/10 into train and validation
/// (validation size floored). Calling this twice with the same arguments
/// yields identical assignments.
pub fn partition_indices(total: usize, num_clients: usize, seed: u64) -> Result<Vec<Partition>> {
    if num_clients == 0 {
        bail!("cannot partition a dataset across zero clients");
    }
    let per_client = total / num_clients;
    if per_client == 0 {
        bail!("dataset of {total} examples is too small for {num_clients} clients");
    }

    let mut order: Vec<usize> = (0..total).collect();
    order.shuffle(&mut seeded(seed));

    let num_val = (VAL_RATIO * per_client as f64).floor() as usize;
    let num_train = per_client - num_val;

    let mut partitions = Vec::with_capacity(num_clients);
    for chunk in order.chunks_exact(per_client).take(num_clients) {
        let mut local = chunk.to_vec();
        local.shuffle(&mut seeded(seed));
        partitions.push(Partition {
            train: local[..num_train].to_vec(),
            val: local[num_train..].to_vec(),
        });
    }
    Ok(partitions)
}

/// Normalize `[N, 3, H, W]` images channel-wise.
pub fn normalize(images: &Tensor) -> Result<Tensor> {
    let device = images.device();
    let mean = Tensor::from_slice(&MEAN, (3, 1, 1), device)?;
    let std = Tensor::from_slice(&STD, (3, 1, 1), device)?;
    Ok(images.broadcast_sub(&mean)?.broadcast_div(&std)?)
}

/// One client's partition, materialized as tensors on the training device.
pub struct ClientData {
    pub train_images: Tensor,
    pub train_labels: Tensor,
    pub val_images: Tensor,
    pub val_labels: Tensor,
}

impl ClientData {
    pub fn num_train(&self) -> usize {
        self.train_images.dims()[0]
    }

    pub fn num_val(&self) -> usize {
        self.val_images.dims()[0]
    }
}

fn select(images: &Tensor, labels: &Tensor, idxs: &[usize]) -> Result<(Tensor, Tensor)> {
    let device = images.device();
    let idxs_t = Tensor::from_vec(
        idxs.iter().map(|&i| i as i64).collect::<Vec<_>>(),
        idxs.len(),
        device,
    )?;
    Ok((
        images.index_select(&idxs_t, 0)?,
        labels.index_select(&idxs_t, 0)?,
    ))
}

/// Load CIFAR-10 and carve out the partition owned by `cid`.
///
/// If `data_dir` holds the binary batches (`cifar-10-batches-bin`) they are
/// read from disk, otherwise the dataset is fetched from the hub on first
/// use. Fails before touching the dataset when `cid` is out of range.
pub fn load_client_partition(
    data_dir: &Path,
    cid: usize,
    num_clients: usize,
    seed: u64,
    device: &Device,
) -> Result<ClientData> {
    check_cid(cid, num_clients)?;

    let local = data_dir.join("cifar-10-batches-bin");
    let ds = if local.is_dir() {
        cifar::load_dir(&local).with_context(|| format!("reading CIFAR-10 from {local:?}"))?
    } else {
        cifar::load().context("downloading CIFAR-10")?
    };

    let images = normalize(&ds.train_images.to_device(device)?)?;
    let labels = ds.train_labels.to_dtype(DType::U32)?.to_device(device)?;

    let total = images.dims()[0];
    let partitions = partition_indices(total, num_clients, seed)?;
    let partition = &partitions[cid];

    let (train_images, train_labels) = select(&images, &labels, &partition.train)?;
    let (val_images, val_labels) = select(&images, &labels, &partition.val)?;
    Ok(ClientData {
        train_images,
        train_labels,
        val_images,
        val_labels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;
    use std::collections::HashSet;

    #[test]
    fn partitions_are_disjoint_and_sized() {
        let total = 103;
        let clients = 10;
        let partitions = partition_indices(total, clients, 7).unwrap();
        assert_eq!(partitions.len(), clients);

        let mut seen = HashSet::new();
        for p in &partitions {
            // 103 / 10 = 10 per client, val = floor(0.1 * 10) = 1
            assert_eq!(p.len(), 10);
            assert_eq!(p.val.len(), 1);
            assert_eq!(p.train.len(), 9);
            for &i in p.train.iter().chain(&p.val) {
                assert!(i < total);
                assert!(seen.insert(i), "index {i} assigned twice");
            }
        }
        // 3 remainder examples are dropped
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn partitions_are_reproducible() {
        let a = partition_indices(500, 7, 2023).unwrap();
        let b = partition_indices(500, 7, 2023).unwrap();
        assert_eq!(a, b);

        let c = partition_indices(500, 7, 2024).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn degenerate_partitions_are_rejected() {
        assert!(partition_indices(100, 0, 0).is_err());
        assert!(partition_indices(3, 10, 0).is_err());
    }

    #[test]
    fn cid_must_be_below_client_count() {
        assert!(check_cid(0, 2).is_ok());
        assert!(check_cid(1, 2).is_ok());
        assert!(check_cid(2, 2).is_err());
        assert!(check_cid(50, 50).is_err());
    }

    #[test]
    fn normalize_shifts_channels() {
        let images = Tensor::ones((2, 3, 4, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        let normed = normalize(&images).unwrap();
        assert_eq!(normed.dims(), &[2, 3, 4, 4]);
        let v = normed
            .i((0, 0, 0, 0))
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((v - (1.0 - 0.485) / 0.229).abs() < 1e-5);
    }
}
