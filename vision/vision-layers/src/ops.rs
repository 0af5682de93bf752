//! Tensor helpers shared by the blocks: activations and layout changes.

use burn::prelude::Backend;
use burn::tensor::Tensor;
use burn::tensor::activation;
use vision_types::{ActivationKind, Nhwc, TensorShape};

use crate::error::{LayerError, Result};

/// Applies an activation.
pub fn activate<B: Backend, const D: usize>(
    x: Tensor<B, D>,
    kind: ActivationKind,
    leaky_alpha: f64,
) -> Tensor<B, D> {
    match kind {
        ActivationKind::Linear => x,
        ActivationKind::Relu => activation::relu(x),
        ActivationKind::Leaky => activation::leaky_relu(x, leaky_alpha),
        ActivationKind::Mish => activation::mish(x),
        ActivationKind::Swish => activation::silu(x),
        ActivationKind::Sigmoid => activation::sigmoid(x),
    }
}

/// `[b, h, w, c]` -> `[b, c, h, w]`.
pub fn to_channels_first<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    x.permute([0, 3, 1, 2])
}

/// `[b, c, h, w]` -> `[b, h, w, c]`.
pub fn to_channels_last<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    x.permute([0, 2, 3, 1])
}

/// Observed shape of a channels-last tensor.
pub fn nhwc_of<B: Backend>(x: &Tensor<B, 4>) -> Nhwc {
    let [batch, height, width, channels] = x.dims();
    Nhwc::new(batch, height, width, channels)
}

/// Reinterprets a tensor of any rank as a channels-last batch.
///
/// # Errors
///
/// Returns a shape error unless the tensor has rank 4.
pub fn expect_rank4<B: Backend, const D: usize>(x: Tensor<B, D>) -> Result<Tensor<B, 4>> {
    let shape = TensorShape::new(x.dims().to_vec()).nhwc()?;
    Ok(x.reshape(shape.to_array()))
}

/// Adds up optional scalar penalties; `None` if every term is `None`.
pub fn sum_losses<B: Backend>(
    losses: impl IntoIterator<Item = Option<Tensor<B, 1>>>,
) -> Option<Tensor<B, 1>> {
    losses
        .into_iter()
        .flatten()
        .reduce(|total, loss| total + loss)
}

/// Checks an input against the shape a block was materialized for.
///
/// Batch and spatial extents may vary between calls; the channel count
/// fixes the parameter shapes and must match.
///
/// # Errors
///
/// Returns [`LayerError::ShapeMismatch`] on a channel mismatch.
pub fn check_channels(expected: Nhwc, actual: Nhwc) -> Result<()> {
    if expected.channels == actual.channels {
        Ok(())
    } else {
        Err(LayerError::shape_mismatch(expected, actual))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn device() -> <TestBackend as Backend>::Device {
        <TestBackend as Backend>::Device::default()
    }

    #[test]
    fn layout_round_trip_dims() {
        let x = Tensor::<TestBackend, 4>::zeros([2, 5, 7, 3], &device());
        let cf = to_channels_first(x);
        assert_eq!(cf.dims(), [2, 3, 5, 7]);
        let cl = to_channels_last(cf);
        assert_eq!(nhwc_of(&cl), Nhwc::new(2, 5, 7, 3));
    }

    #[test]
    fn layout_preserves_values() {
        let x = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0, 2.0, 3.0, 4.0, 5.0], &device())
            .reshape([1, 1, 2, 3]);
        let back = to_channels_last(to_channels_first(x.clone()));
        let a = x.into_data().to_vec::<f32>().unwrap_or_default();
        let b = back.into_data().to_vec::<f32>().unwrap_or_default();
        assert_eq!(a, b);
    }

    #[test]
    fn activations() {
        let x = Tensor::<TestBackend, 1>::from_floats([-2.0, 0.0, 3.0], &device());
        let relu = activate(x.clone(), ActivationKind::Relu, 0.1)
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default();
        assert_eq!(relu, vec![0.0, 0.0, 3.0]);

        let leaky = activate(x.clone(), ActivationKind::Leaky, 0.1)
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default();
        assert!((leaky[0] + 0.2).abs() < 1e-6);

        let linear = activate(x, ActivationKind::Linear, 0.1)
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default();
        assert_eq!(linear, vec![-2.0, 0.0, 3.0]);
    }

    #[test]
    fn expect_rank4_rejects_rank3() {
        let x = Tensor::<TestBackend, 3>::zeros([8, 8, 3], &device());
        assert!(matches!(expect_rank4(x), Err(LayerError::Shape(_))));

        let x = Tensor::<TestBackend, 4>::zeros([1, 8, 8, 3], &device());
        assert!(expect_rank4(x).is_ok());
    }

    #[test]
    fn losses_sum_skips_missing() {
        let one = Tensor::<TestBackend, 1>::from_floats([1.0], &device());
        let two = Tensor::<TestBackend, 1>::from_floats([2.0], &device());
        let total = sum_losses([Some(one), None, Some(two)]).map(|t| t.into_scalar());
        assert_eq!(total, Some(3.0));
        assert!(sum_losses::<TestBackend>([None, None]).is_none());
    }

    #[test]
    fn channel_check() {
        let a = Nhwc::new(1, 8, 8, 16);
        assert!(check_channels(a, Nhwc::new(4, 2, 2, 16)).is_ok());
        assert!(check_channels(a, Nhwc::new(1, 8, 8, 15)).is_err());
    }
}
