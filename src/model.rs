//! MobileNetV3-small classifier and the local training/evaluation loops.
//!
//! The network is the standard small variant with one change for CIFAR-sized
//! inputs: the stem convolution keeps stride 1, since a 32x32 image cannot
//! afford the reference stride-2 stem.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{DType, IndexOp, Tensor, Var, D};
use candle_nn::{
    batch_norm, conv2d, conv2d_no_bias, linear, loss, BatchNorm, Conv2d, Conv2dConfig, Linear,
    Module, ModuleT, Optimizer, VarBuilder, VarMap,
};
use rand::seq::SliceRandom;
use rand::Rng;

/// Batch size used for every forward-only evaluation pass.
pub const EVAL_BATCH_SIZE: usize = 64;

fn hard_sigmoid(xs: &Tensor) -> candle_core::Result<Tensor> {
    (xs + 3.0)?.clamp(0f32, 6f32)? / 6.0
}

fn hard_swish(xs: &Tensor) -> candle_core::Result<Tensor> {
    xs.mul(&hard_sigmoid(xs)?)
}

/// Round a channel count to the nearest multiple of `divisor`, never going
/// below 90% of the requested value.
fn make_divisible(v: usize, divisor: usize) -> usize {
    let rounded = ((v + divisor / 2) / divisor * divisor).max(divisor);
    if (rounded as f64) < 0.9 * v as f64 {
        rounded + divisor
    } else {
        rounded
    }
}

#[derive(Clone, Copy, Debug)]
enum Act {
    Relu,
    HardSwish,
}

impl Act {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Act::Relu => xs.relu(),
            Act::HardSwish => hard_swish(xs),
        }
    }
}

struct ConvBn {
    conv: Conv2d,
    bn: BatchNorm,
    act: Option<Act>,
}

impl ConvBn {
    fn new(
        in_c: usize,
        out_c: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
        act: Option<Act>,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let cfg = Conv2dConfig {
            padding: kernel / 2,
            stride,
            groups,
            ..Default::default()
        };
        let conv = conv2d_no_bias(in_c, out_c, kernel, cfg, vb.pp("conv"))?;
        let bn = batch_norm(out_c, 1e-3, vb.pp("bn"))?;
        Ok(Self { conv, bn, act })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.conv.forward(xs)?;
        let xs = self.bn.forward_t(&xs, train)?;
        match self.act {
            Some(act) => act.forward(&xs),
            None => Ok(xs),
        }
    }
}

struct SqueezeExcite {
    fc1: Conv2d,
    fc2: Conv2d,
}

impl SqueezeExcite {
    fn new(channels: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let squeeze = make_divisible(channels / 4, 8);
        let fc1 = conv2d(channels, squeeze, 1, Default::default(), vb.pp("fc1"))?;
        let fc2 = conv2d(squeeze, channels, 1, Default::default(), vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let scale = xs.mean_keepdim(D::Minus1)?.mean_keepdim(D::Minus2)?;
        let scale = self.fc1.forward(&scale)?.relu()?;
        let scale = hard_sigmoid(&self.fc2.forward(&scale)?)?;
        xs.broadcast_mul(&scale)
    }
}

struct InvertedResidual {
    expand: Option<ConvBn>,
    depthwise: ConvBn,
    se: Option<SqueezeExcite>,
    project: ConvBn,
    residual: bool,
}

impl InvertedResidual {
    #[allow(clippy::too_many_arguments)]
    fn new(
        in_c: usize,
        exp: usize,
        out_c: usize,
        kernel: usize,
        stride: usize,
        use_se: bool,
        act: Act,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let expand = if exp != in_c {
            Some(ConvBn::new(in_c, exp, 1, 1, 1, Some(act), vb.pp("expand"))?)
        } else {
            None
        };
        let depthwise = ConvBn::new(exp, exp, kernel, stride, exp, Some(act), vb.pp("depthwise"))?;
        let se = if use_se {
            Some(SqueezeExcite::new(exp, vb.pp("se"))?)
        } else {
            None
        };
        let project = ConvBn::new(exp, out_c, 1, 1, 1, None, vb.pp("project"))?;
        Ok(Self {
            expand,
            depthwise,
            se,
            project,
            residual: stride == 1 && in_c == out_c,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut ys = match &self.expand {
            Some(expand) => expand.forward_t(xs, train)?,
            None => xs.clone(),
        };
        ys = self.depthwise.forward_t(&ys, train)?;
        if let Some(se) = &self.se {
            ys = se.forward(&ys)?;
        }
        ys = self.project.forward_t(&ys, train)?;
        if self.residual {
            ys = (ys + xs)?;
        }
        Ok(ys)
    }
}

/// MobileNetV3-small bottleneck table:
/// (kernel, expansion, out channels, squeeze-excite, activation, stride).
const SMALL_BLOCKS: [(usize, usize, usize, bool, Act, usize); 11] = [
    (3, 16, 16, true, Act::Relu, 2),
    (3, 72, 24, false, Act::Relu, 2),
    (3, 88, 24, false, Act::Relu, 1),
    (5, 96, 40, true, Act::HardSwish, 2),
    (5, 240, 40, true, Act::HardSwish, 1),
    (5, 240, 40, true, Act::HardSwish, 1),
    (5, 120, 48, true, Act::HardSwish, 1),
    (5, 144, 48, true, Act::HardSwish, 1),
    (5, 288, 96, true, Act::HardSwish, 2),
    (5, 576, 96, true, Act::HardSwish, 1),
    (5, 576, 96, true, Act::HardSwish, 1),
];

pub struct MobileNetV3 {
    stem: ConvBn,
    blocks: Vec<InvertedResidual>,
    head: ConvBn,
    fc1: Linear,
    fc2: Linear,
}

impl MobileNetV3 {
    pub fn small(num_classes: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        // Stride 1 stem for small inputs.
        let stem = ConvBn::new(3, 16, 3, 1, 1, Some(Act::HardSwish), vb.pp("stem"))?;

        let mut blocks = Vec::with_capacity(SMALL_BLOCKS.len());
        let mut in_c = 16;
        for (i, (kernel, exp, out_c, use_se, act, stride)) in SMALL_BLOCKS.into_iter().enumerate() {
            blocks.push(InvertedResidual::new(
                in_c,
                exp,
                out_c,
                kernel,
                stride,
                use_se,
                act,
                vb.pp(format!("block{i}")),
            )?);
            in_c = out_c;
        }

        let head = ConvBn::new(in_c, 576, 1, 1, 1, Some(Act::HardSwish), vb.pp("head"))?;
        let fc1 = linear(576, 1024, vb.pp("fc1"))?;
        let fc2 = linear(1024, num_classes, vb.pp("fc2"))?;
        Ok(Self {
            stem,
            blocks,
            head,
            fc1,
            fc2,
        })
    }
}

impl ModuleT for MobileNetV3 {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut ys = self.stem.forward_t(xs, train)?;
        for block in &self.blocks {
            ys = block.forward_t(&ys, train)?;
        }
        let ys = self.head.forward_t(&ys, train)?;
        // Global average pool, [N, C, H, W] -> [N, C]
        let ys = ys.mean(D::Minus1)?.mean(D::Minus1)?;
        let ys = hard_swish(&self.fc1.forward(&ys)?)?;
        self.fc2.forward(&ys)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ParamsSgdM {
    pub lr: f64,
    pub momentum: f64,
}

impl Default for ParamsSgdM {
    fn default() -> Self {
        Self {
            lr: 0.01,
            momentum: 0.9,
        }
    }
}

/// SGD with momentum; candle-nn only ships the vanilla variant.
pub struct SgdM {
    vars: Vec<Var>,
    velocity: Vec<Option<Tensor>>,
    params: ParamsSgdM,
}

impl Optimizer for SgdM {
    type Config = ParamsSgdM;

    fn new(vars: Vec<Var>, params: ParamsSgdM) -> candle_core::Result<Self> {
        let velocity = vec![None; vars.len()];
        Ok(Self {
            vars,
            velocity,
            params,
        })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        for (var, velocity) in self.vars.iter().zip(self.velocity.iter_mut()) {
            if let Some(grad) = grads.get(var) {
                let v = match velocity.take() {
                    Some(prev) => ((prev * self.params.momentum)? + grad)?,
                    None => grad.clone(),
                };
                var.set(&var.sub(&(&v * self.params.lr)?)?)?;
                *velocity = Some(v);
            }
        }
        Ok(())
    }
}

/// Local training hyperparameters for one fit call.
#[derive(Clone, Copy, Debug)]
pub struct TrainSettings {
    pub epochs: usize,
    pub batch_size: usize,
    pub lr: f64,
    pub momentum: f64,
}

/// Run `epochs` single passes of cross-entropy SGD over `images`/`labels`,
/// re-shuffling the batch order every epoch. Gradients are computed fresh for
/// every batch. Mutates the vars in `varmap` in place.
pub fn train(
    net: &(impl ModuleT + ?Sized),
    varmap: &VarMap,
    images: &Tensor,
    labels: &Tensor,
    settings: &TrainSettings,
    rng: &mut impl Rng,
) -> Result<()> {
    let n = images.dims()[0];
    let batch_size = settings.batch_size.max(1);
    let mut sgd = SgdM::new(
        varmap.all_vars(),
        ParamsSgdM {
            lr: settings.lr,
            momentum: settings.momentum,
        },
    )?;

    for _ in 0..settings.epochs {
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(rng);
        let order_t = Tensor::from_vec(
            order.iter().map(|&i| i as i64).collect::<Vec<_>>(),
            n,
            images.device(),
        )?;
        let x_shuf = images.index_select(&order_t, 0)?;
        let y_shuf = labels.index_select(&order_t, 0)?;

        for start in (0..n).step_by(batch_size) {
            let end = (start + batch_size).min(n);
            let xb = x_shuf.i(start..end)?;
            let yb = y_shuf.i(start..end)?;
            let logits = net.forward_t(&xb, true)?;
            let loss = loss::cross_entropy(&logits, &yb)?;
            sgd.backward_step(&loss)?;
        }
    }
    Ok(())
}

/// Outcome of one forward-only pass over a validation split.
#[derive(Clone, Copy, Debug)]
pub struct EvalReport {
    /// Sum of per-batch mean losses.
    pub loss: f64,
    pub correct: usize,
    pub total: usize,
}

impl EvalReport {
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

/// Forward-only pass at [`EVAL_BATCH_SIZE`], accumulating summed loss and the
/// count of correct top-1 predictions.
pub fn evaluate(
    net: &(impl ModuleT + ?Sized),
    images: &Tensor,
    labels: &Tensor,
) -> Result<EvalReport> {
    let n = images.dims()[0];
    let mut loss_sum = 0f64;
    let mut correct = 0usize;

    for start in (0..n).step_by(EVAL_BATCH_SIZE) {
        let end = (start + EVAL_BATCH_SIZE).min(n);
        let xb = images.i(start..end)?;
        let yb = labels.i(start..end)?;
        let logits = net.forward_t(&xb, false)?;
        loss_sum += loss::cross_entropy(&logits, &yb)?.to_scalar::<f32>()? as f64;
        let predictions = logits.argmax(D::Minus1)?;
        correct += predictions
            .eq(&yb)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()? as usize;
    }
    Ok(EvalReport {
        loss: loss_sum,
        correct,
        total: n,
    })
}
