use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use ps_client::ParameterServer;
use rayon::prelude::*;
use tokio::task;

use crate::buffers::BufferSlot;
use crate::device::DeviceRuntime;
use crate::error::{Result, SyncError};
use crate::registry::TableRegistry;

/// Everything one merge needs, owned outright.
///
/// The job moves into its task with the slot and the staging buffer, so the
/// scheduler cannot touch either until the outcome hands them back.
pub(crate) struct MergeJob<S, R: DeviceRuntime> {
    pub slot_index: usize,
    /// The slot whose snapshot this merge diffs against and then refreshes.
    pub slot: BufferSlot<R>,
    /// The freshly staged local model (host engines) or scratch space for
    /// the mirror download (mirrored engines).
    pub staging: Vec<f32>,
    pub factor: f32,
    pub registry: Arc<TableRegistry>,
    pub server: Arc<S>,
    pub runtime: Option<Arc<R>>,
}

/// What a finished merge hands back to the scheduler.
pub(crate) struct MergeOutcome<R: DeviceRuntime> {
    pub slot_index: usize,
    pub slot: BufferSlot<R>,
    pub staging: Vec<f32>,
    pub elapsed: Duration,
}

impl<S, R> MergeJob<S, R>
where
    S: ParameterServer + Send + Sync + 'static,
    R: DeviceRuntime,
{
    /// Pushes the scaled local delta and refetches the shared value.
    ///
    /// On return the slot's snapshot holds the shared value as of this
    /// merge, and on mirrored engines the slot's mirrors hold it too.
    ///
    /// # Errors
    /// Returns the first server or device failure; the slot is lost with the
    /// job in that case and the engine surfaces the error on the next call.
    pub(crate) async fn run(mut self) -> Result<MergeOutcome<R>> {
        let started = Instant::now();
        debug_assert_eq!(self.staging.len(), self.registry.total_len());
        debug_assert_eq!(self.slot.snapshot.len(), self.registry.total_len());

        // Mirrored engines staged the model on the device; bring it down.
        if let Some(runtime) = &self.runtime {
            for (entry, mirror) in self.registry.entries().iter().zip(&self.slot.mirrors) {
                runtime.download(mirror, &mut self.staging[entry.range()])?;
            }
            runtime.synchronize()?;
        }

        // delta = (local - snapshot) * factor, in place on the staging
        // buffer. CPU-bound, so it runs on the blocking pool; the buffers
        // move out and back to satisfy `'static` without cloning.
        let factor = self.factor;
        let snapshot = std::mem::take(&mut self.slot.snapshot);
        let mut staging = std::mem::take(&mut self.staging);
        let (snapshot, staging) = task::spawn_blocking(move || {
            staging
                .par_iter_mut()
                .zip(snapshot.par_iter())
                .for_each(|(delta, snap)| *delta = (*delta - *snap) * factor);
            (snapshot, staging)
        })
        .await
        .map_err(|e| SyncError::MergePanicked {
            detail: format!("delta compute: {e}"),
        })?;
        self.slot.snapshot = snapshot;
        self.staging = staging;

        // Add the delta and read the merged value back, one table at a time.
        for entry in self.registry.entries() {
            let range = entry.range();
            self.server
                .add(entry.handle(), &self.staging[range.clone()])
                .await?;
            self.server
                .get(entry.handle(), &mut self.slot.snapshot[range])
                .await?;
        }

        // The merged value goes back up so the read-out stays on the device.
        if let Some(runtime) = &self.runtime {
            for (entry, mirror) in self.registry.entries().iter().zip(&mut self.slot.mirrors) {
                runtime.upload(&self.slot.snapshot[entry.range()], mirror)?;
            }
            runtime.synchronize()?;
        }

        let elapsed = started.elapsed();
        debug!(slot = self.slot_index, elapsed_ms = elapsed.as_millis() as u64; "merge finished");

        Ok(MergeOutcome {
            slot_index: self.slot_index,
            slot: self.slot,
            staging: self.staging,
            elapsed,
        })
    }
}
