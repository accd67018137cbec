use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use log::debug;
use parking_lot::Mutex;
use tokio::sync::Barrier;

use crate::{
    client::ParameterServer,
    error::{PsError, Result},
    handle::TableHandle,
};

/// One shared table: fixed shape, value cells behind a lock.
#[derive(Debug)]
struct TableState {
    rows: usize,
    cols: usize,
    cells: Mutex<Vec<f32>>,
}

impl TableState {
    fn len(&self) -> usize {
        self.rows * self.cols
    }
}

#[derive(Debug)]
struct ClusterShared {
    workers: usize,
    barrier: Barrier,
    tables: Mutex<Vec<Arc<TableState>>>,
}

/// An in-process parameter-server cluster.
///
/// All workers of one training job share a `LocalCluster`; each worker talks
/// to it through its own [`LocalClient`] endpoint. Tables are owned by the
/// cluster and addressed by creation order, so every worker must create its
/// tables in the same order with the same shapes.
#[derive(Debug, Clone)]
pub struct LocalCluster {
    shared: Arc<ClusterShared>,
}

impl LocalCluster {
    /// Creates a cluster for `workers` participants.
    ///
    /// # Arguments
    /// * `workers` - How many endpoints will join every `barrier` call.
    ///
    /// # Returns
    /// A new `LocalCluster` instance.
    pub fn new(workers: NonZeroUsize) -> Self {
        debug!(workers = workers.get(); "local cluster created");

        Self {
            shared: Arc::new(ClusterShared {
                workers: workers.get(),
                barrier: Barrier::new(workers.get()),
                tables: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Creates one worker endpoint.
    ///
    /// The cluster's barrier waits for exactly `workers` endpoints; handing
    /// out more than that leaves every `barrier` call permanently short.
    ///
    /// # Returns
    /// A new `LocalClient` connected to this cluster.
    pub fn client(&self) -> LocalClient {
        LocalClient {
            shared: Arc::clone(&self.shared),
            next_table: AtomicUsize::new(0),
            connected: AtomicBool::new(true),
        }
    }

    /// The number of workers this cluster was sized for.
    pub fn workers(&self) -> usize {
        self.shared.workers
    }
}

/// One worker's endpoint into a [`LocalCluster`].
#[derive(Debug)]
pub struct LocalClient {
    shared: Arc<ClusterShared>,
    next_table: AtomicUsize,
    connected: AtomicBool,
}

impl LocalClient {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(PsError::Disconnected)
        }
    }

    fn table(&self, handle: TableHandle) -> Result<Arc<TableState>> {
        let tables = self.shared.tables.lock();

        tables
            .get(handle.index())
            .cloned()
            .ok_or(PsError::UnknownTable {
                table: handle.index(),
            })
    }

    fn check_len(table: &TableState, index: usize, got: usize) -> Result<()> {
        if got == table.len() {
            Ok(())
        } else {
            Err(PsError::SizeMismatch {
                table: index,
                got,
                expected: table.len(),
            })
        }
    }
}

impl ParameterServer for LocalClient {
    async fn create_table(&self, rows: usize, cols: usize) -> Result<TableHandle> {
        self.ensure_connected()?;

        let index = self.next_table.fetch_add(1, Ordering::Relaxed);
        let mut tables = self.shared.tables.lock();

        match tables.get(index) {
            // Another worker created this slot first: attach, shapes must agree.
            Some(existing) => {
                if (existing.rows, existing.cols) != (rows, cols) {
                    return Err(PsError::ShapeMismatch {
                        table: index,
                        got: (rows, cols),
                        expected: (existing.rows, existing.cols),
                    });
                }
            }
            None if index == tables.len() => {
                debug!(table = index, rows = rows, cols = cols; "table created");

                tables.push(Arc::new(TableState {
                    rows,
                    cols,
                    cells: Mutex::new(vec![0.0; rows * cols]),
                }));
            }
            None => return Err(PsError::UnknownTable { table: index }),
        }

        Ok(TableHandle::new(index))
    }

    async fn add(&self, table: TableHandle, delta: &[f32]) -> Result<()> {
        self.ensure_connected()?;

        let state = self.table(table)?;
        Self::check_len(&state, table.index(), delta.len())?;

        state
            .cells
            .lock()
            .iter_mut()
            .zip(delta)
            .for_each(|(cell, d)| *cell += d);

        Ok(())
    }

    async fn get(&self, table: TableHandle, out: &mut [f32]) -> Result<()> {
        self.ensure_connected()?;

        let state = self.table(table)?;
        Self::check_len(&state, table.index(), out.len())?;

        out.copy_from_slice(&state.cells.lock());
        Ok(())
    }

    async fn barrier(&self) -> Result<()> {
        self.ensure_connected()?;
        self.shared.barrier.wait().await;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::AcqRel) {
            Ok(())
        } else {
            Err(PsError::Disconnected)
        }
    }
}
