// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A fixed length history of per-epoch drop counts.
//!
//! The history always holds `DROP_HISTORY_LEN` entries, ordered from the
//! oldest (index 0) to the newest (last index). Pushing a new entry evicts
//! the oldest one, so the length never changes.

/// Number of epochs kept in the history.
pub const DROP_HISTORY_LEN: usize = 8;

#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct DropHistory {
    /// Per-epoch samples, oldest first.
    samples: [f64; DROP_HISTORY_LEN],
}

impl DropHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evict the oldest sample and append `value` as the newest one.
    pub fn push(&mut self, value: f64) {
        self.samples.rotate_left(1);
        self.samples[DROP_HISTORY_LEN - 1] = value;
    }

    /// Weighted sum of the history. `weights[0]` applies to the oldest slot.
    pub fn weighted_sum(&self, weights: &[f64; DROP_HISTORY_LEN]) -> f64 {
        self.samples
            .iter()
            .zip(weights.iter())
            .map(|(s, w)| s * w)
            .sum()
    }

    /// Samples ordered from the oldest to the newest.
    pub fn as_slice(&self) -> &[f64] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}
