use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Warm-up scaling applied to each merge delta.
///
/// Early updates computed from a barely-trained model are noisy; damping them
/// keeps the shared value from being dragged around before the workers settle.
/// The factor is a pure function of the iteration count and always lies in
/// `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecaySchedule {
    /// No damping: every delta is pushed at full strength.
    #[default]
    None,
    /// Rises from `coefficient` to 1 over the first `window` iterations.
    Linear {
        coefficient: f32,
        window: NonZeroU64,
    },
    /// Steps from `coefficient` up by `coefficient` every `window` iterations.
    Staircase {
        coefficient: f32,
        window: NonZeroU64,
    },
}

impl DecaySchedule {
    /// The delta scaling factor at `iteration`.
    ///
    /// # Arguments
    /// * `iteration` - The synchronization counter, starting at 1 for the
    ///   first merge.
    ///
    /// # Returns
    /// A factor in `[0, 1]`; `Linear` is non-decreasing in `iteration`.
    pub fn factor(&self, iteration: u64) -> f32 {
        let raw = match *self {
            DecaySchedule::None => 1.0,
            DecaySchedule::Linear {
                coefficient,
                window,
            } => coefficient + (1.0 - coefficient) * (iteration as f32 / window.get() as f32),
            DecaySchedule::Staircase {
                coefficient,
                window,
                // Integer division: the factor is constant within each window.
            } => coefficient * (iteration / window.get()).saturating_add(1) as f32,
        };

        raw.clamp(0.0, 1.0)
    }

    /// Checks that the variant's coefficient lies in `[0, 1]`.
    ///
    /// # Returns
    /// A `CoefficientOutOfRange` error when it does not.
    pub fn validate(&self) -> Result<()> {
        let coefficient = match *self {
            DecaySchedule::None => return Ok(()),
            DecaySchedule::Linear { coefficient, .. }
            | DecaySchedule::Staircase { coefficient, .. } => coefficient,
        };

        if (0.0..=1.0).contains(&coefficient) {
            Ok(())
        } else {
            Err(SyncError::CoefficientOutOfRange { got: coefficient })
        }
    }
}
