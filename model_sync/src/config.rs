use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::decay::DecaySchedule;
use crate::error::Result;

/// Immutable synchronization policy for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Whether merges run in the background on a second buffer slot.
    ///
    /// When `false` every synchronization merges inline and the local model
    /// never trails the shared value.
    async_buffered: bool,
    decay: DecaySchedule,
    /// Number of workers attached to the cluster, used to average the
    /// initial model.
    worker_count: NonZeroUsize,
}

impl SyncConfig {
    /// Creates a new synchronization configuration.
    ///
    /// # Args
    /// * `async_buffered` - Run merges in the background on a spare slot.
    /// * `decay` - Warm-up scaling applied to pushed deltas.
    /// * `worker_count` - Workers attached to the cluster.
    ///
    /// # Returns
    /// A `SyncConfig` instance.
    pub fn new(async_buffered: bool, decay: DecaySchedule, worker_count: NonZeroUsize) -> Self {
        Self {
            async_buffered,
            decay,
            worker_count,
        }
    }

    pub fn async_buffered(&self) -> bool {
        self.async_buffered
    }

    pub fn decay(&self) -> DecaySchedule {
        self.decay
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count.get()
    }

    /// Number of parameter buffer slots the engine cycles through.
    ///
    /// # Returns
    /// 2 when merges run in the background, 1 when they run inline.
    pub fn buffer_count(&self) -> usize {
        if self.async_buffered { 2 } else { 1 }
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.decay.validate()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            async_buffered: true,
            decay: DecaySchedule::None,
            worker_count: NonZeroUsize::MIN,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU64;

    use super::*;

    #[test]
    fn buffer_count_follows_mode() {
        let cfg = SyncConfig::default();
        assert!(cfg.async_buffered());
        assert_eq!(cfg.buffer_count(), 2);

        let inline = SyncConfig::new(false, DecaySchedule::None, NonZeroUsize::MIN);
        assert_eq!(inline.buffer_count(), 1);
    }

    #[test]
    fn validate_rejects_bad_decay() {
        let cfg = SyncConfig::new(
            true,
            DecaySchedule::Linear {
                coefficient: -0.1,
                window: NonZeroU64::MIN,
            },
            NonZeroUsize::MIN,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg = SyncConfig::new(
            false,
            DecaySchedule::Staircase {
                coefficient: 0.3,
                window: NonZeroU64::new(100).unwrap(),
            },
            NonZeroUsize::new(4).unwrap(),
        );

        let text = serde_json::to_string(&cfg).unwrap();
        let back: SyncConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.worker_count(), 4);
        assert_eq!(back.buffer_count(), 1);
        assert_eq!(back.decay(), cfg.decay());
    }
}
