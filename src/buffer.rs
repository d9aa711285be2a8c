//! Growable scratch buffer shared by every raw query of a session.

use tracing::trace;

/// Baseline size and growth step used when no configuration says otherwise.
pub const DEFAULT_INCREMENT: usize = 8192;

/// An exclusively owned byte buffer that is allocated on first use and only
/// ever grows.
///
/// Contents are not preserved across [`ScratchBuffer::grow`]; a caller that
/// grows the buffer must re-issue its query.
#[derive(Debug)]
pub struct ScratchBuffer {
    data: Vec<u8>,
    increment: usize,
}

impl ScratchBuffer {
    /// Create an unallocated buffer growing by `increment` bytes at a time.
    pub fn new(increment: usize) -> Self {
        Self {
            data: Vec::new(),
            increment: increment.max(1),
        }
    }

    /// Allocate on first use and make sure capacity is at least `min_size`.
    ///
    /// The first call always allocates at least one increment, so capacity is
    /// never zero once the buffer has been used.
    pub fn ensure(&mut self, min_size: usize) -> usize {
        if self.data.is_empty() || self.data.len() < min_size {
            let size = min_size.max(self.increment).max(self.data.len());
            self.data = vec![0; size];
        }
        self.data.len()
    }

    /// Grow by one increment and return the new capacity.
    pub fn grow(&mut self) -> usize {
        let size = self.data.len() + self.increment;
        trace!(old = self.data.len(), new = size, "growing scratch buffer");
        self.data.resize(size, 0);
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn is_allocated(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Default for ScratchBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_INCREMENT)
    }
}
