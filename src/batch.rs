//! Per-example map over the batch axis.
//!
//! Every example in a batch is relaxed independently: gradients for one row
//! never read another row's latent state. [`map_examples`] runs such a
//! per-example function across Rayon's work-stealing pool and returns the
//! results in example order, so reductions over them are deterministic.

use rayon::prelude::*;

use crate::core::PCNResult;

/// Apply `f` to every example index in `0..batch_size`, in parallel.
///
/// The closure only gets shared access to whatever it captures, so there is
/// no cross-example mutable state. If several examples fail, one of their
/// errors is returned.
///
/// # Errors
/// Propagates the error of the failing example.
pub fn map_examples<T, F>(batch_size: usize, f: F) -> PCNResult<Vec<T>>
where
    T: Send,
    F: Fn(usize) -> PCNResult<T> + Sync + Send,
{
    (0..batch_size).into_par_iter().map(f).collect()
}
