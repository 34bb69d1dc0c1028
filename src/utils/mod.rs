//! Scalar activation kernels and small numeric helpers.

use ndarray::{ArrayBase, Data, Dimension};

/// Activation function: identity (for linear output layers).
#[inline]
pub fn identity(x: f32) -> f32 {
    x
}

/// Derivative of identity activation.
#[inline]
pub fn d_identity(_x: f32) -> f32 {
    1.0
}

/// Activation function: tanh.
#[inline]
pub fn tanh(x: f32) -> f32 {
    x.tanh()
}

/// Derivative of tanh activation.
#[inline]
pub fn d_tanh(x: f32) -> f32 {
    let t = x.tanh();
    1.0 - t * t
}

/// Activation function: rectified linear unit.
#[inline]
pub fn relu(x: f32) -> f32 {
    x.max(0.0)
}

/// Derivative of ReLU. The kink at zero takes the left derivative.
#[inline]
pub fn d_relu(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        0.0
    }
}

/// Activation function: logistic sigmoid.
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Derivative of the logistic sigmoid.
#[inline]
pub fn d_sigmoid(x: f32) -> f32 {
    let s = sigmoid(x);
    s * (1.0 - s)
}

const GELU_C: f32 = 0.797_884_6; // sqrt(2 / pi)
const GELU_K: f32 = 0.044_715;

/// Activation function: GELU, tanh approximation.
#[inline]
pub fn gelu(x: f32) -> f32 {
    let inner = GELU_C * (x + GELU_K * x * x * x);
    0.5 * x * (1.0 + inner.tanh())
}

/// Derivative of the tanh-approximated GELU.
#[inline]
pub fn d_gelu(x: f32) -> f32 {
    let inner = GELU_C * (x + GELU_K * x * x * x);
    let t = inner.tanh();
    let d_inner = GELU_C * (1.0 + 3.0 * GELU_K * x * x);
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * d_inner
}

/// Mean squared error between two equally shaped arrays.
///
/// Returns `0.0` for empty inputs.
#[allow(clippy::cast_precision_loss)]
pub fn mse<S1, S2, D>(a: &ArrayBase<S1, D>, b: &ArrayBase<S2, D>) -> f32
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
    D: Dimension,
{
    let n = a.len();
    if n == 0 {
        return 0.0;
    }
    let sum: f32 = a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
    sum / n as f32
}

/// Sum of absolute values, used for gradient magnitude summaries.
pub fn abs_sum<S, D>(a: &ArrayBase<S, D>) -> f32
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    a.iter().map(|v| v.abs()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_identity() {
        assert_eq!(identity(3.0), 3.0);
        assert_eq!(d_identity(0.0), 1.0);
    }

    #[test]
    fn test_tanh() {
        let x = 0.5;
        let y = tanh(x);
        assert!(y > 0.0 && y < x);
        assert!(d_tanh(x) > 0.0);
    }

    #[test]
    fn test_relu() {
        assert_eq!(relu(2.0), 2.0);
        assert_eq!(relu(-1.0), 0.0);
        assert_eq!(d_relu(2.0), 1.0);
        assert_eq!(d_relu(-1.0), 0.0);
    }

    #[test]
    fn test_sigmoid_midpoint() {
        assert_abs_diff_eq!(sigmoid(0.0), 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(d_sigmoid(0.0), 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_gelu_derivative_matches_finite_difference() {
        let h = 1e-3;
        for &x in &[-2.0f32, -0.5, 0.0, 0.7, 1.8] {
            let numeric = (gelu(x + h) - gelu(x - h)) / (2.0 * h);
            assert_abs_diff_eq!(d_gelu(x), numeric, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_mse() {
        let a = ndarray::arr2(&[[1.0, 2.0], [3.0, 4.0]]);
        let b = ndarray::arr2(&[[1.0, 0.0], [3.0, 6.0]]);
        assert_abs_diff_eq!(mse(&a, &b), 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(abs_sum(&(&a - &b)), 4.0, epsilon = 1e-6);
    }
}
