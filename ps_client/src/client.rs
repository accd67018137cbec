use crate::{error::Result, handle::TableHandle};

/// The contract a worker consumes from the parameter-server cluster.
///
/// A `ParameterServer` endpoint belongs to exactly one worker. Tables are
/// created once, in the same order on every worker, and addressed through the
/// returned handles afterwards. `add` accumulates into the shared value and
/// `get` fetches it; neither interprets the data.
#[trait_variant::make(ParameterServer: Send)]
pub trait ParameterServerTemplate {
    /// Creates (or attaches to) the next table in creation order.
    ///
    /// # Arguments
    /// * `rows` - The table's row count.
    /// * `cols` - The table's column count.
    ///
    /// # Returns
    /// A handle addressing the table in later `add`/`get` calls, or a
    /// `ShapeMismatch` if another worker already created this slot with a
    /// different shape.
    async fn create_table(&self, rows: usize, cols: usize) -> Result<TableHandle>;

    /// Accumulates `delta` element-wise into the shared value of `table`.
    ///
    /// Returns once the cluster has acknowledged the update.
    ///
    /// # Arguments
    /// * `table` - The target table.
    /// * `delta` - One element per table cell, in row-major order.
    async fn add(&self, table: TableHandle, delta: &[f32]) -> Result<()>;

    /// Fetches the current shared value of `table` into `out`.
    ///
    /// # Arguments
    /// * `table` - The source table.
    /// * `out` - Receives one element per table cell, in row-major order.
    async fn get(&self, table: TableHandle, out: &mut [f32]) -> Result<()>;

    /// Blocks until every worker of the cluster has reached the barrier.
    async fn barrier(&self) -> Result<()>;

    /// Disconnects this worker from the cluster.
    ///
    /// Any later call on this endpoint fails with `Disconnected`.
    async fn shutdown(&self) -> Result<()>;
}
