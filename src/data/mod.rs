//! Dataset loading and batching.
//!
//! Examples are rows of an `Array2<f32>`. Training consumes fixed-size
//! batches; the ragged tail of a dataset is dropped so every batch matches the
//! batch size the optimizers were built for.

use std::path::Path;

use ndarray::{Array2, Axis, Slice};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::core::{PCNError, PCNResult};

/// Load examples from a JSON array of equal-length number arrays.
///
/// # Errors
/// `Io`/`Json` on unreadable input, `InvalidConfig` for ragged or empty rows.
pub fn load_examples(path: &Path) -> PCNResult<Array2<f32>> {
    let text = std::fs::read_to_string(path)?;
    let rows: Vec<Vec<f32>> = serde_json::from_str(&text)?;
    rows_to_array(&rows)
}

/// Stack equal-length rows into a matrix.
///
/// # Errors
/// `InvalidConfig` if rows differ in length or are empty.
pub fn rows_to_array(rows: &[Vec<f32>]) -> PCNResult<Array2<f32>> {
    let ncols = rows.first().map_or(0, Vec::len);
    if ncols == 0 {
        return Err(PCNError::InvalidConfig("dataset has no features".to_string()));
    }
    if let Some(i) = rows.iter().position(|r| r.len() != ncols) {
        return Err(PCNError::InvalidConfig(format!(
            "row {i} has {} values, expected {ncols}",
            rows[i].len()
        )));
    }
    let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Array2::from_shape_vec((rows.len(), ncols), flat)
        .map_err(|e| PCNError::InvalidConfig(format!("failed to build dataset: {e}")))
}

/// Scalar mean and standard deviation over every value.
#[allow(clippy::cast_precision_loss)]
pub fn mean_std(data: &Array2<f32>) -> (f32, f32) {
    let n = data.len();
    if n == 0 {
        return (0.0, 1.0);
    }
    let mean = data.sum() / n as f32;
    let var = data.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
    (mean, var.sqrt())
}

/// Shift and scale in place: `(v - mean) / std`. A zero `std` only shifts.
pub fn standardize(data: &mut Array2<f32>, mean: f32, std: f32) {
    let scale = if std > 0.0 { 1.0 / std } else { 1.0 };
    data.mapv_inplace(|v| (v - mean) * scale);
}

/// Split off the last `eval_fraction` of the rows for evaluation.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn train_eval_split(data: &Array2<f32>, eval_fraction: f32) -> (Array2<f32>, Array2<f32>) {
    let n = data.nrows();
    let eval_count = ((n as f32) * eval_fraction.clamp(0.0, 1.0)) as usize;
    let train_count = n - eval_count.min(n);

    let train = data
        .slice_axis(Axis(0), Slice::from(..train_count))
        .to_owned();
    let eval = data.slice_axis(Axis(0), Slice::from(train_count..)).to_owned();
    (train, eval)
}

/// Copy of `data` with its rows permuted by `rng`.
pub fn shuffle_rows<R: Rng + ?Sized>(data: &Array2<f32>, rng: &mut R) -> Array2<f32> {
    let mut order: Vec<usize> = (0..data.nrows()).collect();
    order.shuffle(rng);
    data.select(Axis(0), &order)
}

/// Consecutive `batch_size`-row batches; a final partial batch is dropped.
///
/// # Errors
/// `InvalidConfig` for a zero batch size.
pub fn fixed_batches(data: &Array2<f32>, batch_size: usize) -> PCNResult<Vec<Array2<f32>>> {
    if batch_size == 0 {
        return Err(PCNError::InvalidConfig("batch size must be positive".to_string()));
    }
    Ok(data
        .axis_chunks_iter(Axis(0), batch_size)
        .filter(|chunk| chunk.nrows() == batch_size)
        .map(|chunk| chunk.to_owned())
        .collect())
}
