use std::time::Duration;

#[derive(Debug, Default, Clone)]
pub struct SyncMetrics {
    /// Time spent waiting for an outstanding merge to finish.
    pub join_wait: Duration,
    pub stage_time: Duration,
    pub merge_time: Duration,

    pub syncs: u64,
    pub merges_spawned: u64,
    pub merges_inline: u64,
}

impl SyncMetrics {
    #[inline]
    pub fn bump_sync(&mut self) {
        self.syncs += 1;
    }

    #[inline]
    pub fn bump_spawned(&mut self) {
        self.merges_spawned += 1;
    }

    #[inline]
    pub fn bump_inline(&mut self) {
        self.merges_inline += 1;
    }

    #[inline]
    pub fn add_join_wait(&mut self, elapsed: Duration) {
        self.join_wait += elapsed;
    }

    #[inline]
    pub fn add_stage_time(&mut self, elapsed: Duration) {
        self.stage_time += elapsed;
    }

    #[inline]
    pub fn add_merge_time(&mut self, elapsed: Duration) {
        self.merge_time += elapsed;
    }
}
