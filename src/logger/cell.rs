//! One cell of the log buffer ring.

/// Fill state of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CellStatus {
    /// The cell can still accept log lines.
    Free,
    /// The cell is sealed and waiting for, or undergoing, persistence.
    Full,
}

/// A fixed-capacity byte region linked into the circular buffer list.
///
/// `data.len()` is the used length and `data.capacity()` the fixed total;
/// the cell never reallocates. `prev`/`next` are slab keys of the ring
/// neighbors.
#[derive(Debug)]
pub(crate) struct CellBuffer {
    pub(crate) data: Vec<u8>,
    pub(crate) status: CellStatus,
    pub(crate) prev: usize,
    pub(crate) next: usize,
}

impl CellBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            status: CellStatus::Free,
            prev: 0,
            next: 0,
        }
    }

    /// Bytes still available for appending.
    pub(crate) fn avail(&self) -> usize {
        self.data.capacity() - self.data.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Appends a line; the caller has already checked `avail`.
    pub(crate) fn append(&mut self, line: &[u8]) {
        if self.avail() >= line.len() {
            self.data.extend_from_slice(line);
        }
    }

    /// Empties the cell and reopens it for the producer.
    pub(crate) fn clear(&mut self) {
        self.data.clear();
        self.status = CellStatus::Free;
    }
}
