//! Parameter allocation from [`InitializerKind`].

use burn::module::Param;
use burn::nn::Initializer;
use burn::prelude::Backend;
use burn::tensor::{Distribution, ElementConversion, Tensor};
use vision_types::InitializerKind;

const SQRT_2: f64 = std::f64::consts::SQRT_2;

/// Redraw rounds before the remaining out-of-range samples are clipped.
const MAX_REDRAWS: usize = 32;

/// Maps an initializer onto Burn's built-in initializers.
///
/// Returns `None` for [`InitializerKind::TruncatedNormal`], which Burn has
/// no direct equivalent for.
#[must_use]
pub fn burn_initializer(kind: InitializerKind) -> Option<Initializer> {
    let init = match kind {
        InitializerKind::Zeros => Initializer::Zeros,
        InitializerKind::Ones => Initializer::Ones,
        InitializerKind::Constant { value } => Initializer::Constant { value },
        InitializerKind::GlorotUniform => Initializer::XavierUniform { gain: 1.0 },
        InitializerKind::GlorotNormal => Initializer::XavierNormal { gain: 1.0 },
        InitializerKind::HeUniform => Initializer::KaimingUniform {
            gain: SQRT_2,
            fan_out_only: false,
        },
        InitializerKind::HeNormal => Initializer::KaimingNormal {
            gain: SQRT_2,
            fan_out_only: false,
        },
        InitializerKind::RandomNormal { mean, stddev } => Initializer::Normal { mean, std: stddev },
        InitializerKind::RandomUniform { min, max } => Initializer::Uniform { min, max },
        InitializerKind::TruncatedNormal { .. } => return None,
    };
    Some(init)
}

/// Allocates a parameter of the given shape.
///
/// `fan_in`/`fan_out` are only consulted by the Glorot and He families.
/// Truncated normal samples beyond two standard deviations are redrawn.
pub fn init_param<B: Backend, const D: usize>(
    kind: InitializerKind,
    shape: [usize; D],
    fan_in: usize,
    fan_out: usize,
    device: &B::Device,
) -> Param<Tensor<B, D>> {
    match burn_initializer(kind) {
        Some(init) => {
            let fans = kind.needs_fan();
            init.init_with(
                shape,
                fans.then_some(fan_in),
                fans.then_some(fan_out),
                device,
            )
        }
        None => {
            let (mean, stddev) = match kind {
                InitializerKind::TruncatedNormal { mean, stddev } => (mean, stddev),
                _ => (0.0, 0.05),
            };
            Param::from_tensor(truncated_normal(shape, mean, stddev, device))
        }
    }
}

/// Normal samples restricted to `mean ± 2 * stddev` by rejection.
pub fn truncated_normal<B: Backend, const D: usize>(
    shape: [usize; D],
    mean: f64,
    stddev: f64,
    device: &B::Device,
) -> Tensor<B, D> {
    let distribution = Distribution::Normal(mean, stddev);
    let bound = 2.0 * stddev;
    let mut samples = Tensor::<B, D>::random(shape, distribution, device);
    for _ in 0..MAX_REDRAWS {
        let outside = samples.clone().sub_scalar(mean).abs().greater_elem(bound);
        let remaining: i64 = outside.clone().int().sum().into_scalar().elem();
        if remaining == 0 {
            break;
        }
        let fresh = Tensor::<B, D>::random(shape, distribution, device);
        samples = samples.mask_where(outside, fresh);
    }
    samples.clamp(mean - bound, mean + bound)
}
