use ndarray::Array2;

use super::{PCNError, PCNResult};

/// A state-bearing unit of the graph.
///
/// Holds, for every example in the batch (one row each):
/// - `activation` (x): the latent state, moved by relaxation
/// - `prediction` (u): what the upstream layer predicted on the last forward pass
///
/// Both start empty. The prediction cache is overwritten by every forward
/// pass; the activation survives forward passes and is only reset by
/// [`Node::clear`].
#[derive(Debug, Clone, Default)]
pub struct Node {
    activation: Option<Array2<f32>>,
    prediction: Option<Array2<f32>>,
    /// Pre-nonlinearity drive that produced `prediction`, if any.
    drive: Option<Array2<f32>>,
    frozen: bool,
}

impl Node {
    pub fn new() -> Self {
        Self::default()
    }

    /// A node whose activation is never touched by the x optimizer.
    pub fn frozen() -> Self {
        Self {
            frozen: true,
            ..Self::default()
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn activation(&self) -> Option<&Array2<f32>> {
        self.activation.as_ref()
    }

    pub fn prediction(&self) -> Option<&Array2<f32>> {
        self.prediction.as_ref()
    }

    pub(crate) fn drive(&self) -> Option<&Array2<f32>> {
        self.drive.as_ref()
    }

    pub(crate) fn activation_mut(&mut self) -> Option<&mut Array2<f32>> {
        self.activation.as_mut()
    }

    /// Number of examples currently held, if initialised.
    pub fn batch_size(&self) -> Option<usize> {
        self.activation.as_ref().map(|x| x.nrows())
    }

    /// Explicitly assign the latent state.
    pub fn set_activation(&mut self, value: Array2<f32>) {
        self.activation = Some(value);
    }

    /// Store a fresh prediction. On first touch the activation starts at the
    /// prediction.
    ///
    /// # Errors
    /// `ShapeMismatch` if the prediction does not match an existing activation.
    pub(crate) fn cache_prediction(
        &mut self,
        prediction: Array2<f32>,
        drive: Option<Array2<f32>>,
    ) -> PCNResult<()> {
        match self.activation.as_ref().map(|x| x.dim()) {
            Some((rows, cols)) if (rows, cols) != prediction.dim() => {
                return Err(PCNError::shape(
                    "node prediction",
                    &[rows, cols],
                    prediction.shape(),
                ));
            }
            Some(_) => {}
            None => self.activation = Some(prediction.clone()),
        }
        self.prediction = Some(prediction);
        self.drive = drive;
        Ok(())
    }

    /// `(x, u)` pair, or `StateNotReady` if either is missing.
    pub(crate) fn state(&self, index: usize) -> PCNResult<(&Array2<f32>, &Array2<f32>)> {
        match (&self.activation, &self.prediction) {
            (Some(x), Some(u)) => Ok((x, u)),
            (None, _) => Err(PCNError::StateNotReady(format!(
                "node {index} has no activation"
            ))),
            (_, None) => Err(PCNError::StateNotReady(format!(
                "node {index} has no cached prediction; run forward first"
            ))),
        }
    }

    /// Energy of this node summed over the batch: `0.5 * ||u - x||²`.
    pub(crate) fn energy(&self, index: usize) -> PCNResult<f32> {
        let (x, u) = self.state(index)?;
        let sq: f32 = x.iter().zip(u.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
        Ok(0.5 * sq)
    }

    /// Drop the prediction cache.
    pub fn clear_cache(&mut self) {
        self.prediction = None;
        self.drive = None;
    }

    /// Drop the latent state and the prediction cache.
    pub fn clear(&mut self) {
        self.activation = None;
        self.clear_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn test_first_touch_initialises_activation() {
        let mut node = Node::new();
        node.cache_prediction(arr2(&[[1.0, 2.0]]), None).unwrap();
        assert_eq!(node.activation(), Some(&arr2(&[[1.0, 2.0]])));

        // later predictions leave the activation alone
        node.cache_prediction(arr2(&[[5.0, 5.0]]), None).unwrap();
        assert_eq!(node.activation(), Some(&arr2(&[[1.0, 2.0]])));
        assert!((node.energy(0).unwrap() - 12.5).abs() < 1e-6);
    }

    #[test]
    fn test_energy_before_forward_fails() {
        let mut node = Node::new();
        node.set_activation(arr2(&[[1.0]]));
        assert!(matches!(node.energy(0), Err(PCNError::StateNotReady(_))));
    }

    #[test]
    fn test_batch_change_is_rejected() {
        let mut node = Node::new();
        node.set_activation(arr2(&[[1.0, 2.0]]));
        let err = node.cache_prediction(arr2(&[[1.0, 2.0], [3.0, 4.0]]), None);
        assert!(matches!(err, Err(PCNError::ShapeMismatch(_))));
    }

    #[test]
    fn test_clear() {
        let mut node = Node::frozen();
        node.cache_prediction(arr2(&[[1.0]]), None).unwrap();
        node.clear();
        assert!(node.is_frozen());
        assert!(node.activation().is_none());
        assert!(node.prediction().is_none());
    }
}
