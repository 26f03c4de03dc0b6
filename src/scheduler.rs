//! Training step and evaluation scheduling
//!
//! Each step submits the pre-recorded sequence for the slot filled on the
//! previous step, then records and submits the upload for the other slot.
//! Compute and transfer overlap inside the step; a single queue wait
//! closes it. Evaluation pushes batches through the dedicated third slot,
//! which the training cadence never touches.

use crate::error::NnError;
use crate::graph::{Network, EVAL_SLOT};

/// Number of batches pushed through the eval slot per split.
const EVAL_BATCHES: usize = 10;

/// Fraction of rows where the prediction argmax matches the label argmax.
pub fn accuracy(output: &[f32], labels: &[f32], width: usize) -> f32 {
    if width == 0 || output.len() != labels.len() || output.len() % width != 0 {
        return 0.0;
    }
    let rows = output.len() / width;
    if rows == 0 {
        return 0.0;
    }
    let argmax = |row: &[f32]| {
        row.iter()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |best, (i, &v)| {
                if v > best.1 {
                    (i, v)
                } else {
                    best
                }
            })
            .0
    };
    let mut matched = 0usize;
    for row in 0..rows {
        let span = row * width..(row + 1) * width;
        if argmax(&output[span.clone()]) == argmax(&labels[span]) {
            matched += 1;
        }
    }
    matched as f32 / rows as f32
}

impl Network {
    /// Run one training step and return the mean loss over the batch.
    ///
    /// Trains on the slot filled last step while uploading the next batch
    /// into the other slot.
    pub fn step(&mut self) -> Result<f32, NnError> {
        let slot = self.flip_swap_index();
        self.context().submit(self.train_cmd(slot))?;
        self.submit_fill(slot ^ 1, false)?;
        self.context().wait_idle()?;

        let mut losses = vec![0f32; self.batch_size() as usize];
        self.loss_output().read_to(0, &mut losses)?;
        self.check_finite()?;
        Ok(losses.iter().sum::<f32>() / losses.len() as f32)
    }

    /// Mean accuracy over fresh batches from each split.
    ///
    /// Returns `(train_accuracy, eval_accuracy)`.
    pub fn evaluate(&mut self) -> Result<(f32, f32), NnError> {
        let mut results = [0f32; 2];
        let width = self.label_width() as usize;
        let len = width * self.batch_size() as usize;
        let mut output = vec![0f32; len];
        let mut labels = vec![0f32; len];

        for (split, result) in results.iter_mut().enumerate() {
            let from_eval = split == 1;
            let mut total = 0f32;
            for _ in 0..EVAL_BATCHES {
                self.fill_slot(EVAL_SLOT, from_eval)?;
                self.context().submit(self.eval_cmd())?;
                self.context().wait_idle()?;
                self.eval_output().read_to(0, &mut output)?;
                self.eval_labels().read_to(&mut labels)?;
                total += accuracy(&output, &labels, width);
            }
            *result = total / EVAL_BATCHES as f32;
        }
        Ok((results[0], results[1]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accuracy_all_match() {
        let output = [0.1, 0.9, 0.8, 0.2];
        let labels = [0.0, 1.0, 1.0, 0.0];
        assert_eq!(accuracy(&output, &labels, 2), 1.0);
    }

    #[test]
    fn test_accuracy_half_match() {
        let output = [0.1, 0.9, 0.8, 0.2];
        let labels = [0.0, 1.0, 0.0, 1.0];
        assert_eq!(accuracy(&output, &labels, 2), 0.5);
    }

    #[test]
    fn test_accuracy_ties_resolve_to_first() {
        // Equal scores pick the lowest index on both sides
        let output = [0.5, 0.5];
        let labels = [1.0, 0.0];
        assert_eq!(accuracy(&output, &labels, 2), 1.0);
    }

    #[test]
    fn test_accuracy_rejects_mismatched_lengths() {
        assert_eq!(accuracy(&[0.0, 1.0], &[1.0], 2), 0.0);
        assert_eq!(accuracy(&[0.0, 1.0, 0.5], &[1.0, 0.0, 0.5], 2), 0.0);
        assert_eq!(accuracy(&[], &[], 2), 0.0);
    }
}
