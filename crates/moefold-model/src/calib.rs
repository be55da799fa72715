//! Pre-tokenized calibration batches.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One batch of token-id sequences with an attention mask.
///
/// Calibration data arrives already tokenized; positions with mask 0 are
/// padding and never produce token rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibBatch {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u8>>,
}

impl CalibBatch {
    /// Batch with a full attention mask.
    pub fn dense(input_ids: Vec<Vec<u32>>) -> Self {
        let attention_mask = input_ids.iter().map(|s| vec![1u8; s.len()]).collect();
        Self {
            input_ids,
            attention_mask,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_ids.len() != self.attention_mask.len() {
            return Err(Error::InvalidBatch(format!(
                "{} sequences but {} masks",
                self.input_ids.len(),
                self.attention_mask.len()
            )));
        }
        for (ids, mask) in self.input_ids.iter().zip(&self.attention_mask) {
            if ids.len() != mask.len() {
                return Err(Error::InvalidBatch(format!(
                    "sequence length {} but mask length {}",
                    ids.len(),
                    mask.len()
                )));
            }
        }
        Ok(())
    }

    pub fn num_sequences(&self) -> usize {
        self.input_ids.len()
    }

    /// Count of positions with a set attention mask.
    pub fn num_attended_tokens(&self) -> usize {
        self.attention_mask
            .iter()
            .map(|m| m.iter().filter(|&&b| b != 0).count())
            .sum()
    }

    /// Attended token ids in sequence order.
    pub fn attended_ids(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.num_attended_tokens());
        for (ids, mask) in self.input_ids.iter().zip(&self.attention_mask) {
            for (&id, &m) in ids.iter().zip(mask) {
                if m != 0 {
                    out.push(id);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_masks_everything() {
        let b = CalibBatch::dense(vec![vec![1, 2, 3], vec![4, 5]]);
        b.validate().unwrap();
        assert_eq!(b.num_sequences(), 2);
        assert_eq!(b.num_attended_tokens(), 5);
        assert_eq!(b.attended_ids(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn padding_is_skipped() {
        let b = CalibBatch {
            input_ids: vec![vec![1, 2, 0, 0]],
            attention_mask: vec![vec![1, 1, 0, 0]],
        };
        b.validate().unwrap();
        assert_eq!(b.num_attended_tokens(), 2);
        assert_eq!(b.attended_ids(), vec![1, 2]);
    }

    #[test]
    fn mismatched_lengths_rejected() {
        let b = CalibBatch {
            input_ids: vec![vec![1, 2]],
            attention_mask: vec![vec![1]],
        };
        assert!(b.validate().is_err());
    }
}
