use ndarray::{Array1, Array2};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::Rng;

/// Affine map `y = W x + b` between two consecutive nodes.
///
/// `weights` has shape `(out_dim, in_dim)`, `bias` has shape `(out_dim)`.
/// Stateless apart from its own tensors, which only the w optimizer writes.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Layer {
    /// Uniform initialisation in `[-1/sqrt(in_dim), 1/sqrt(in_dim)]` for both
    /// weights and bias.
    pub fn new<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, rng: &mut R) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let limit = 1.0 / (in_dim.max(1) as f32).sqrt();
        let dist = Uniform::new_inclusive(-limit, limit);
        Self {
            weights: Array2::random_using((out_dim, in_dim), dist, rng),
            bias: Array1::random_using(out_dim, dist, rng),
        }
    }

    pub fn from_parts(weights: Array2<f32>, bias: Array1<f32>) -> Self {
        Self { weights, bias }
    }

    pub fn in_dim(&self) -> usize {
        self.weights.ncols()
    }

    pub fn out_dim(&self) -> usize {
        self.weights.nrows()
    }

    /// Apply to a batch: `(batch, in_dim) -> (batch, out_dim)`.
    pub fn apply(&self, input: &Array2<f32>) -> Array2<f32> {
        let mut out = input.dot(&self.weights.t());
        out += &self.bias;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_init_shapes_and_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let layer = Layer::new(4, 8, &mut rng);
        assert_eq!(layer.weights.dim(), (8, 4));
        assert_eq!(layer.bias.len(), 8);
        assert!(layer.weights.iter().all(|w| w.abs() <= 0.5));
        assert!(layer.bias.iter().all(|b| b.abs() <= 0.5));
    }

    #[test]
    fn test_seeded_init_is_reproducible() {
        let a = Layer::new(3, 2, &mut StdRng::seed_from_u64(1));
        let b = Layer::new(3, 2, &mut StdRng::seed_from_u64(1));
        assert_eq!(a, b);
    }

    #[test]
    fn test_apply_batch() {
        let layer = Layer::from_parts(
            arr2(&[[1.0, 0.0], [0.0, 2.0], [1.0, 1.0]]),
            arr1(&[0.5, 0.0, -1.0]),
        );
        let out = layer.apply(&arr2(&[[1.0, 2.0], [0.0, 0.0]]));
        assert_eq!(out, arr2(&[[1.5, 4.0, 2.0], [0.5, 0.0, -1.0]]));
    }
}
