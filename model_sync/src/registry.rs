use std::ops::Range;

use ps_client::{ParameterServer, TableHandle};

use crate::error::{Result, SyncError};

/// One server table and its slice of the flat parameter buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    handle: TableHandle,
    rows: usize,
    cols: usize,
    offset: usize,
}

impl TableEntry {
    pub fn handle(&self) -> TableHandle {
        self.handle
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of `f32` values the table holds.
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The table's slice of the flat buffer.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len()
    }
}

/// Maps the flat parameter buffer into per-tensor server tables.
///
/// Tables are created on the server in tensor order and packed back to back,
/// so every flat buffer used by the engine shares one layout. Built once at
/// initialization and never changed afterwards.
#[derive(Debug)]
pub struct TableRegistry {
    entries: Vec<TableEntry>,
    total_len: usize,
}

impl TableRegistry {
    /// Creates one server table per shape and records their flat offsets.
    ///
    /// # Arguments
    /// * `server` - The parameter server cluster to create tables on.
    /// * `shapes` - `(rows, cols)` per tensor, in model order.
    ///
    /// # Returns
    /// The registry, or an error when a shape has a zero dimension, the
    /// model is empty, or the server rejects a table.
    pub async fn register<S: ParameterServer>(
        server: &S,
        shapes: &[(usize, usize)],
    ) -> Result<Self> {
        if shapes.is_empty() {
            return Err(SyncError::EmptyModel);
        }

        let mut entries = Vec::with_capacity(shapes.len());
        let mut total_len = 0;
        for (table, &(rows, cols)) in shapes.iter().enumerate() {
            if rows == 0 || cols == 0 {
                return Err(SyncError::InvalidShape { table, rows, cols });
            }

            let handle = server.create_table(rows, cols).await?;
            entries.push(TableEntry {
                handle,
                rows,
                cols,
                offset: total_len,
            });
            total_len += rows * cols;
        }

        Ok(Self { entries, total_len })
    }

    /// Total number of `f32` values across all tables.
    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn table_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[TableEntry] {
        &self.entries
    }
}
