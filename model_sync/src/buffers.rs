use std::fmt;

use crate::device::{DeviceError, DeviceRuntime, HostRuntime};
use crate::error::{Result, SyncError};

/// Who currently holds a buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// The slot sits in the pool.
    Free,
    /// The slot was handed to a merge and has not been restored yet.
    MergeOwned,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotState::Free => "free",
            SlotState::MergeOwned => "owned by the merge task",
        };
        f.write_str(name)
    }
}

/// One double-buffering slot: a host snapshot plus optional device mirrors.
///
/// `snapshot` always holds the last server state fetched for this slot; a
/// merge rewrites it right after its add/get round. Mirrored engines also
/// keep one device copy of the model per table so stage-in stays on the
/// device; `mirrors` is empty on host-only engines.
pub struct BufferSlot<R: DeviceRuntime = HostRuntime> {
    /// Last server snapshot fetched for this slot (flat).
    pub snapshot: Vec<f32>,

    /// Per-table device copies of the model, mirrored engines only.
    pub mirrors: Vec<R::Buf>,
}

impl<R: DeviceRuntime> BufferSlot<R> {
    /// A host-only slot for `len` flat values.
    pub fn host(len: usize) -> Self {
        Self {
            snapshot: vec![0.0; len],
            mirrors: Vec::new(),
        }
    }

    /// A slot with one device mirror per table.
    pub fn mirrored(
        len: usize,
        runtime: &R,
        table_lens: &[usize],
    ) -> std::result::Result<Self, DeviceError> {
        let mut mirrors = Vec::with_capacity(table_lens.len());
        for &table_len in table_lens {
            mirrors.push(runtime.alloc(table_len)?);
        }

        Ok(Self {
            snapshot: vec![0.0; len],
            mirrors,
        })
    }
}

enum Cell<R: DeviceRuntime> {
    Occupied(BufferSlot<R>),
    Lent,
}

/// The engine's slot pool, tracking which stage owns each slot.
///
/// Slots leave the pool only by value, so a merge task owns its slot
/// outright and nothing else can touch the slot until it is restored.
pub struct BufferPool<R: DeviceRuntime = HostRuntime> {
    cells: Vec<Cell<R>>,
}

impl<R: DeviceRuntime> BufferPool<R> {
    pub fn new(slots: Vec<BufferSlot<R>>) -> Self {
        let cells = slots.into_iter().map(Cell::Occupied).collect();
        Self { cells }
    }

    pub fn slot_count(&self) -> usize {
        self.cells.len()
    }

    /// The slot index following `index` in rotation order.
    pub fn swap_index(&self, index: usize) -> usize {
        (index + 1) % self.cells.len()
    }

    pub fn state(&self, index: usize) -> SlotState {
        match self.cells[index] {
            Cell::Occupied(_) => SlotState::Free,
            Cell::Lent => SlotState::MergeOwned,
        }
    }

    /// Borrows a pooled slot.
    pub fn slot(&self, index: usize) -> Result<&BufferSlot<R>> {
        match &self.cells[index] {
            Cell::Occupied(slot) => Ok(slot),
            Cell::Lent => Err(SyncError::SlotUnavailable {
                slot: index,
                state: SlotState::MergeOwned,
            }),
        }
    }

    /// Borrows a pooled slot mutably.
    pub fn slot_mut(&mut self, index: usize) -> Result<&mut BufferSlot<R>> {
        match &mut self.cells[index] {
            Cell::Occupied(slot) => Ok(slot),
            Cell::Lent => Err(SyncError::SlotUnavailable {
                slot: index,
                state: SlotState::MergeOwned,
            }),
        }
    }

    /// Moves a slot out of the pool for a merge.
    pub fn take_for_merge(&mut self, index: usize) -> Result<BufferSlot<R>> {
        match std::mem::replace(&mut self.cells[index], Cell::Lent) {
            Cell::Occupied(slot) => Ok(slot),
            Cell::Lent => Err(SyncError::SlotUnavailable {
                slot: index,
                state: SlotState::MergeOwned,
            }),
        }
    }

    /// Returns a slot the merge finished with.
    pub fn restore_from_merge(&mut self, index: usize, slot: BufferSlot<R>) -> Result<()> {
        match self.cells[index] {
            Cell::Lent => {
                self.cells[index] = Cell::Occupied(slot);
                Ok(())
            }
            Cell::Occupied(_) => Err(SyncError::SlotUnavailable {
                slot: index,
                state: SlotState::Free,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_pool(slots: usize, len: usize) -> BufferPool {
        BufferPool::new((0..slots).map(|_| BufferSlot::host(len)).collect())
    }

    #[test]
    fn swap_index_rotates() {
        let two = host_pool(2, 4);
        assert_eq!(two.swap_index(0), 1);
        assert_eq!(two.swap_index(1), 0);

        let one = host_pool(1, 4);
        assert_eq!(one.swap_index(0), 0);
    }

    #[test]
    fn lend_and_restore_round_trip() {
        let mut pool = host_pool(2, 3);

        let mut slot = pool.take_for_merge(0).unwrap();
        assert_eq!(pool.state(0), SlotState::MergeOwned);
        assert_eq!(pool.state(1), SlotState::Free);

        slot.snapshot[0] = 5.0;
        pool.restore_from_merge(0, slot).unwrap();
        assert_eq!(pool.slot(0).unwrap().snapshot[0], 5.0);
    }

    #[test]
    fn double_lend_is_rejected() {
        let mut pool = host_pool(2, 3);
        let _slot = pool.take_for_merge(0).unwrap();

        let Err(err) = pool.take_for_merge(0) else {
            panic!("second lend must fail");
        };
        assert!(matches!(
            err,
            SyncError::SlotUnavailable {
                slot: 0,
                state: SlotState::MergeOwned
            }
        ));
        assert!(pool.slot(0).is_err());
        assert!(pool.slot(1).is_ok());
    }

    #[test]
    fn restore_needs_a_lent_slot() {
        let mut pool = host_pool(1, 2);
        let err = pool
            .restore_from_merge(0, BufferSlot::host(2))
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::SlotUnavailable {
                slot: 0,
                state: SlotState::Free
            }
        ));
    }

    #[test]
    fn mirrored_slot_allocates_per_table() {
        let slot: BufferSlot = BufferSlot::mirrored(10, &HostRuntime::new(), &[4, 6]).unwrap();
        assert_eq!(slot.mirrors.len(), 2);
        assert_eq!(slot.mirrors[0].len(), 4);
        assert_eq!(slot.mirrors[1].len(), 6);
        assert_eq!(slot.snapshot.len(), 10);
    }
}
