use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use ps_client::ParameterServer;
use tokio::task;

use crate::buffers::{BufferPool, BufferSlot};
use crate::config::SyncConfig;
use crate::device::{DeviceRuntime, HostRuntime};
use crate::error::{Result, SyncError};
use crate::merge::{MergeJob, MergeOutcome};
use crate::metrics::SyncMetrics;
use crate::registry::TableRegistry;
use crate::state::{Phase, SyncState};
use crate::tensor::ParamTensor;

/// Orchestrates asynchronous model synchronization for one worker.
///
/// Design:
/// - Keeps the model's flat layout in a `TableRegistry` shared with merges.
/// - Rotates parameter snapshots through an owned `BufferPool`.
/// - Hands each merge its slot and the staging buffer by value; they come
///   home when the next call joins the task.
///
/// Concurrency note:
/// - At most one merge is ever in flight, so the model a caller reads back
///   is one synchronization behind the shared value, never more.
/// - The delta arithmetic is CPU-bound and runs on Tokio's blocking pool
///   inside the merge task.
pub struct ModelSync<S, R: DeviceRuntime = HostRuntime> {
    cfg: SyncConfig,
    server: Arc<S>,
    runtime: Option<Arc<R>>,
    inner: EngineState<R>,
    metrics: SyncMetrics,
}

enum EngineState<R: DeviceRuntime> {
    Uninitialized,
    Ready(Ready<R>),
    Faulted,
    Closed,
}

impl<R: DeviceRuntime> EngineState<R> {
    fn phase(&self) -> Phase {
        match self {
            EngineState::Uninitialized => Phase::Uninitialized,
            EngineState::Ready(_) => Phase::Ready,
            EngineState::Faulted => Phase::Faulted,
            EngineState::Closed => Phase::Closed,
        }
    }
}

/// Everything an initialized engine owns.
struct Ready<R: DeviceRuntime> {
    registry: Arc<TableRegistry>,
    pool: BufferPool<R>,
    merge: MergeState<R>,
    state: SyncState,
}

/// Where the staging buffer currently lives.
///
/// Exactly one of the two holds it: the pool's spare capacity between calls,
/// or the merge task while one is in flight.
enum MergeState<R: DeviceRuntime> {
    Idle { staging: Vec<f32> },
    Running(task::JoinHandle<Result<MergeOutcome<R>>>),
}

impl<R: DeviceRuntime> Ready<R> {
    /// Waits out the merge in flight, if any, and pools its slot again.
    ///
    /// Leaves `self.merge` holding an empty placeholder; the caller decides
    /// whether the returned staging buffer goes back idle or into a new job.
    async fn join_merge(&mut self, metrics: &mut SyncMetrics) -> Result<Vec<f32>> {
        let parked = MergeState::Idle {
            staging: Vec::new(),
        };
        match std::mem::replace(&mut self.merge, parked) {
            MergeState::Running(handle) => {
                let waited = Instant::now();
                let outcome = handle.await.map_err(|e| SyncError::MergePanicked {
                    detail: e.to_string(),
                })??;
                metrics.add_join_wait(waited.elapsed());
                metrics.add_merge_time(outcome.elapsed);
                self.pool.restore_from_merge(outcome.slot_index, outcome.slot)?;
                Ok(outcome.staging)
            }
            MergeState::Idle { staging } => Ok(staging),
        }
    }
}

impl<S> ModelSync<S>
where
    S: ParameterServer + Send + Sync + 'static,
{
    /// Creates a host-memory engine.
    ///
    /// # Errors
    /// Rejects configurations whose decay coefficient lies outside `[0, 1]`.
    pub fn new(cfg: SyncConfig, server: S) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            server: Arc::new(server),
            runtime: None,
            inner: EngineState::Uninitialized,
            metrics: SyncMetrics::default(),
        })
    }
}

impl<S, R> ModelSync<S, R>
where
    S: ParameterServer + Send + Sync + 'static,
    R: DeviceRuntime,
{
    /// Creates an engine whose tensors live on a device.
    ///
    /// Stage-in and read-out become device-to-device copies against per-slot
    /// mirrors; only the merge task touches host memory.
    ///
    /// # Errors
    /// Rejects configurations whose decay coefficient lies outside `[0, 1]`.
    pub fn mirrored(cfg: SyncConfig, server: S, runtime: R) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            server: Arc::new(server),
            runtime: Some(Arc::new(runtime)),
            inner: EngineState::Uninitialized,
            metrics: SyncMetrics::default(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.inner.phase()
    }

    /// Completed synchronization calls so far.
    pub fn iteration(&self) -> u64 {
        match &self.inner {
            EngineState::Ready(ready) => ready.state.iteration,
            _ => 0,
        }
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    /// Registers the model and seeds the cluster with its average.
    ///
    /// Every worker contributes `1/worker_count` of its local values; after
    /// the registration barrier each one reads the same averaged model back
    /// into its tensors, and every buffer slot starts from that snapshot.
    ///
    /// # Arguments
    /// * `tensors` - The model's parameter tensors, in a fixed order every
    ///   later call must repeat.
    ///
    /// # Errors
    /// `AlreadyInitialized` when the engine holds a model, `EmptyModel` or
    /// `InvalidShape` for unusable tensors, `MirrorUnsupported` when a
    /// mirrored engine is given a tensor without device storage.
    pub async fn init_model<T: ParamTensor<R>>(&mut self, tensors: &mut [T]) -> Result<()> {
        match &self.inner {
            EngineState::Uninitialized => {}
            EngineState::Ready(_) => return Err(SyncError::AlreadyInitialized),
            other => return Err(SyncError::NotReady {
                phase: other.phase(),
            }),
        }

        if self.runtime.is_some() {
            for (table, tensor) in tensors.iter().enumerate() {
                if tensor.device_storage().is_none() {
                    return Err(SyncError::MirrorUnsupported { table });
                }
            }
        }

        let shapes: Vec<(usize, usize)> = tensors.iter().map(|t| (t.rows(), t.cols())).collect();
        let registry = Arc::new(TableRegistry::register(self.server.as_ref(), &shapes).await?);

        // Pull the local model down to a flat host buffer.
        let mut staging = vec![0.0; registry.total_len()];
        match self.runtime.as_deref() {
            None => stage_host(&registry, tensors, &mut staging),
            Some(rt) => {
                for (table, (tensor, entry)) in
                    tensors.iter().zip(registry.entries()).enumerate()
                {
                    let storage = tensor
                        .device_storage()
                        .ok_or(SyncError::MirrorUnsupported { table })?;
                    rt.download(storage, &mut staging[entry.range()])?;
                }
                rt.synchronize()?;
            }
        }

        // Each worker adds its share; after the barrier the shared value is
        // the average of all initial models.
        let workers = self.cfg.worker_count();
        if workers > 1 {
            let scale = 1.0 / workers as f32;
            for value in &mut staging {
                *value *= scale;
            }
        }
        for entry in registry.entries() {
            self.server.add(entry.handle(), &staging[entry.range()]).await?;
        }
        self.server.barrier().await?;
        for entry in registry.entries() {
            self.server
                .get(entry.handle(), &mut staging[entry.range()])
                .await?;
        }

        let table_lens: Vec<usize> = registry.entries().iter().map(|e| e.len()).collect();
        let mut slots = Vec::with_capacity(self.cfg.buffer_count());
        for _ in 0..self.cfg.buffer_count() {
            let mut slot = match self.runtime.as_deref() {
                None => BufferSlot::host(registry.total_len()),
                Some(rt) => BufferSlot::mirrored(registry.total_len(), rt, &table_lens)?,
            };
            slot.snapshot.copy_from_slice(&staging);
            if let Some(rt) = self.runtime.as_deref() {
                for (mirror, entry) in slot.mirrors.iter_mut().zip(registry.entries()) {
                    rt.upload(&staging[entry.range()], mirror)?;
                }
                rt.synchronize()?;
            }
            slots.push(slot);
        }

        write_tensors(self.runtime.as_deref(), &registry, &staging, tensors)?;

        info!(
            tables = registry.table_count(),
            values = registry.total_len(),
            slots = self.cfg.buffer_count();
            "model initialized"
        );
        self.inner = EngineState::Ready(Ready {
            registry,
            pool: BufferPool::new(slots),
            merge: MergeState::Idle { staging },
            state: SyncState::new(),
        });
        Ok(())
    }

    /// Pushes the local progress and pulls a recent shared model.
    ///
    /// Joins the previous merge, rotates the slot pool, stages the current
    /// model and hands it to a new merge. With background merges the tensors
    /// come back holding the shared value the previous merge fetched, one
    /// synchronization behind; with inline merges they hold the shared value
    /// as of this call.
    ///
    /// # Errors
    /// `NotReady` before `init_model` or after a failure; tensor mismatches
    /// are rejected before any state changes. A server or device failure
    /// inside the cycle faults the engine.
    pub async fn push_and_pull<T: ParamTensor<R>>(&mut self, tensors: &mut [T]) -> Result<()> {
        let mirrored = self.runtime.is_some();
        {
            let (ready, _) = self.ready_parts()?;
            check_tensors(&ready.registry, tensors, mirrored)?;
        }
        match self.sync_core(tensors).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner = EngineState::Faulted;
                Err(e)
            }
        }
    }

    async fn sync_core<T: ParamTensor<R>>(&mut self, tensors: &mut [T]) -> Result<()> {
        let decay = self.cfg.decay();
        let async_buffered = self.cfg.async_buffered();
        let server = Arc::clone(&self.server);
        let runtime = self.runtime.clone();

        let (ready, metrics) = self.ready_parts()?;
        ready.state.inc_iteration();
        metrics.bump_sync();
        let factor = decay.factor(ready.state.iteration);

        let staging = ready.join_merge(metrics).await?;

        ready.state.active = ready.pool.swap_index(ready.state.active);
        let active = ready.state.active;
        let read_index = ready.pool.swap_index(active);
        debug!(
            iteration = ready.state.iteration,
            slot = active,
            factor = factor as f64;
            "sync step"
        );

        // Stage the local model for the merge.
        let staged = Instant::now();
        let mut staging = staging;
        match runtime.as_deref() {
            None => stage_host(&ready.registry, tensors, &mut staging),
            Some(rt) => stage_mirrored(rt, tensors, ready.pool.slot_mut(active)?)?,
        }
        metrics.add_stage_time(staged.elapsed());

        let job = MergeJob {
            slot_index: active,
            slot: ready.pool.take_for_merge(active)?,
            staging,
            factor,
            registry: Arc::clone(&ready.registry),
            server,
            runtime: runtime.clone(),
        };

        if async_buffered {
            ready.merge = MergeState::Running(task::spawn(job.run()));
            metrics.bump_spawned();
            // Read the value the previous merge fetched while the new one
            // runs.
            read_out(
                runtime.as_deref(),
                &ready.registry,
                ready.pool.slot(read_index)?,
                tensors,
            )?;
        } else {
            let outcome = job.run().await?;
            metrics.add_merge_time(outcome.elapsed);
            metrics.bump_inline();
            ready.pool.restore_from_merge(outcome.slot_index, outcome.slot)?;
            ready.merge = MergeState::Idle {
                staging: outcome.staging,
            };
            read_out(
                runtime.as_deref(),
                &ready.registry,
                ready.pool.slot(read_index)?,
                tensors,
            )?;
        }

        Ok(())
    }

    /// Pushes the local progress without touching the caller's tensors.
    ///
    /// Runs a full inline merge against the active slot using the current
    /// iteration's decay factor; the iteration counter does not advance.
    /// Every slot snapshot is then reset to the value the merge fetched
    /// back, so later deltas measure progress from this flush.
    pub async fn push_model<T: ParamTensor<R>>(&mut self, tensors: &[T]) -> Result<()> {
        let mirrored = self.runtime.is_some();
        {
            let (ready, _) = self.ready_parts()?;
            check_tensors(&ready.registry, tensors, mirrored)?;
        }
        match self.push_core(tensors).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner = EngineState::Faulted;
                Err(e)
            }
        }
    }

    async fn push_core<T: ParamTensor<R>>(&mut self, tensors: &[T]) -> Result<()> {
        let decay = self.cfg.decay();
        let server = Arc::clone(&self.server);
        let runtime = self.runtime.clone();

        let (ready, metrics) = self.ready_parts()?;
        let factor = decay.factor(ready.state.iteration);
        let mut staging = ready.join_merge(metrics).await?;

        let active = ready.state.active;
        match runtime.as_deref() {
            None => stage_host(&ready.registry, tensors, &mut staging),
            Some(rt) => stage_mirrored(rt, tensors, ready.pool.slot_mut(active)?)?,
        }

        let job = MergeJob {
            slot_index: active,
            slot: ready.pool.take_for_merge(active)?,
            staging,
            factor,
            registry: Arc::clone(&ready.registry),
            server,
            runtime: runtime.clone(),
        };
        let outcome = job.run().await?;
        metrics.add_merge_time(outcome.elapsed);
        metrics.bump_inline();
        ready.pool.restore_from_merge(outcome.slot_index, outcome.slot)?;

        // The merge refreshed only the active slot. Reset the others to the
        // same fetched value so the next delta measures from this flush.
        let mut staging = outcome.staging;
        staging.copy_from_slice(&ready.pool.slot(active)?.snapshot);
        reseed_slots(runtime.as_deref(), &ready.registry, &mut ready.pool, &staging)?;

        ready.merge = MergeState::Idle { staging };
        Ok(())
    }

    /// Overwrites the caller's tensors with the current shared model.
    ///
    /// Joins any merge in flight first, then fetches every table and resets
    /// all slot snapshots to the fetched value, so later deltas measure
    /// progress from this point.
    pub async fn pull_model<T: ParamTensor<R>>(&mut self, tensors: &mut [T]) -> Result<()> {
        let mirrored = self.runtime.is_some();
        {
            let (ready, _) = self.ready_parts()?;
            check_tensors(&ready.registry, tensors, mirrored)?;
        }
        match self.pull_core(tensors).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner = EngineState::Faulted;
                Err(e)
            }
        }
    }

    async fn pull_core<T: ParamTensor<R>>(&mut self, tensors: &mut [T]) -> Result<()> {
        let server = Arc::clone(&self.server);
        let runtime = self.runtime.clone();

        let (ready, metrics) = self.ready_parts()?;
        let mut staging = ready.join_merge(metrics).await?;

        for entry in ready.registry.entries() {
            server.get(entry.handle(), &mut staging[entry.range()]).await?;
        }

        reseed_slots(runtime.as_deref(), &ready.registry, &mut ready.pool, &staging)?;

        write_tensors(runtime.as_deref(), &ready.registry, &staging, tensors)?;
        ready.merge = MergeState::Idle { staging };
        Ok(())
    }

    /// Waits out the merge in flight, leaving the engine quiescent.
    ///
    /// Useful before checkpointing the model, when no buffer may be owned
    /// by a background task.
    pub async fn drain(&mut self) -> Result<()> {
        self.ready_parts()?;
        match self.drain_core().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner = EngineState::Faulted;
                Err(e)
            }
        }
    }

    async fn drain_core(&mut self) -> Result<()> {
        let (ready, metrics) = self.ready_parts()?;
        let staging = ready.join_merge(metrics).await?;
        ready.merge = MergeState::Idle { staging };
        Ok(())
    }

    /// Lines this worker up with every other one on the cluster barrier.
    pub async fn barrier(&self) -> Result<()> {
        match self.inner.phase() {
            Phase::Uninitialized | Phase::Ready => {
                self.server.barrier().await?;
                Ok(())
            }
            phase => Err(SyncError::NotReady { phase }),
        }
    }

    /// Joins any merge in flight, lines up on the barrier and disconnects.
    ///
    /// The engine is `Closed` afterwards and rejects every further call.
    ///
    /// # Errors
    /// `NotReady` when the engine is already closed or faulted. A failure
    /// while winding down faults the engine instead of closing it.
    pub async fn shutdown(&mut self) -> Result<()> {
        match &self.inner {
            EngineState::Uninitialized => {
                self.server.shutdown().await?;
                self.inner = EngineState::Closed;
                return Ok(());
            }
            EngineState::Ready(_) => {}
            other => return Err(SyncError::NotReady {
                phase: other.phase(),
            }),
        }

        match self.shutdown_core().await {
            Ok(()) => {
                self.inner = EngineState::Closed;
                info!("engine shut down");
                Ok(())
            }
            Err(e) => {
                self.inner = EngineState::Faulted;
                Err(e)
            }
        }
    }

    async fn shutdown_core(&mut self) -> Result<()> {
        let (ready, metrics) = self.ready_parts()?;
        let staging = ready.join_merge(metrics).await?;
        ready.merge = MergeState::Idle { staging };

        self.server.barrier().await?;
        self.server.shutdown().await?;
        Ok(())
    }

    fn ready_parts(&mut self) -> Result<(&mut Ready<R>, &mut SyncMetrics)> {
        match &mut self.inner {
            EngineState::Ready(ready) => Ok((ready, &mut self.metrics)),
            other => Err(SyncError::NotReady {
                phase: other.phase(),
            }),
        }
    }
}

impl<S, R: DeviceRuntime> Drop for ModelSync<S, R> {
    fn drop(&mut self) {
        if let EngineState::Ready(ready) = &self.inner {
            if matches!(ready.merge, MergeState::Running(_)) {
                warn!("engine dropped with a merge still in flight");
            }
        }
    }
}

fn check_tensors<R: DeviceRuntime, T: ParamTensor<R>>(
    registry: &TableRegistry,
    tensors: &[T],
    mirrored: bool,
) -> Result<()> {
    if tensors.len() != registry.table_count() {
        return Err(SyncError::TensorCountMismatch {
            got: tensors.len(),
            expected: registry.table_count(),
        });
    }
    for (table, (tensor, entry)) in tensors.iter().zip(registry.entries()).enumerate() {
        if tensor.element_count() != entry.len() {
            return Err(SyncError::TensorSizeMismatch {
                table,
                got: tensor.element_count(),
                expected: entry.len(),
            });
        }
        if mirrored && tensor.device_storage().is_none() {
            return Err(SyncError::MirrorUnsupported { table });
        }
    }
    Ok(())
}

/// Copies every tensor into its slice of a flat host buffer.
fn stage_host<R: DeviceRuntime, T: ParamTensor<R>>(
    registry: &TableRegistry,
    tensors: &[T],
    staging: &mut [f32],
) {
    for (tensor, entry) in tensors.iter().zip(registry.entries()) {
        tensor.read_into(&mut staging[entry.range()]);
    }
}

/// Copies every tensor's device storage into the slot's mirrors.
fn stage_mirrored<R: DeviceRuntime, T: ParamTensor<R>>(
    runtime: &R,
    tensors: &[T],
    slot: &mut BufferSlot<R>,
) -> Result<()> {
    for (table, (tensor, mirror)) in tensors.iter().zip(&mut slot.mirrors).enumerate() {
        let storage = tensor
            .device_storage()
            .ok_or(SyncError::MirrorUnsupported { table })?;
        runtime.transfer(storage, mirror)?;
    }
    runtime.synchronize()?;
    Ok(())
}

/// Hands a slot's model back to the tensors, from snapshot or mirrors.
fn read_out<R: DeviceRuntime, T: ParamTensor<R>>(
    runtime: Option<&R>,
    registry: &TableRegistry,
    slot: &BufferSlot<R>,
    tensors: &mut [T],
) -> Result<()> {
    match runtime {
        None => {
            for (tensor, entry) in tensors.iter_mut().zip(registry.entries()) {
                tensor.write_from(&slot.snapshot[entry.range()]);
            }
        }
        Some(rt) => {
            for (table, (tensor, mirror)) in tensors.iter_mut().zip(&slot.mirrors).enumerate() {
                let storage = tensor
                    .device_storage_mut()
                    .ok_or(SyncError::MirrorUnsupported { table })?;
                rt.transfer(mirror, storage)?;
            }
            rt.synchronize()?;
        }
    }
    Ok(())
}

/// Resets every slot's snapshot, and its mirrors, to one shared value.
fn reseed_slots<R: DeviceRuntime>(
    runtime: Option<&R>,
    registry: &TableRegistry,
    pool: &mut BufferPool<R>,
    value: &[f32],
) -> Result<()> {
    for index in 0..pool.slot_count() {
        let slot = pool.slot_mut(index)?;
        slot.snapshot.copy_from_slice(value);
        if let Some(rt) = runtime {
            for (mirror, entry) in slot.mirrors.iter_mut().zip(registry.entries()) {
                rt.upload(&value[entry.range()], mirror)?;
            }
            rt.synchronize()?;
        }
    }
    Ok(())
}

/// Writes a flat host buffer into the tensors, uploading on mirrored engines.
fn write_tensors<R: DeviceRuntime, T: ParamTensor<R>>(
    runtime: Option<&R>,
    registry: &TableRegistry,
    source: &[f32],
    tensors: &mut [T],
) -> Result<()> {
    match runtime {
        None => {
            for (tensor, entry) in tensors.iter_mut().zip(registry.entries()) {
                tensor.write_from(&source[entry.range()]);
            }
        }
        Some(rt) => {
            for (table, (tensor, entry)) in
                tensors.iter_mut().zip(registry.entries()).enumerate()
            {
                let storage = tensor
                    .device_storage_mut()
                    .ok_or(SyncError::MirrorUnsupported { table })?;
                rt.upload(&source[entry.range()], storage)?;
            }
            rt.synchronize()?;
        }
    }
    Ok(())
}
