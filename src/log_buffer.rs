use std::collections::VecDeque;

use crate::error::SupervisorError;

/*
    @@@
    @LogBuffer;
    . Fixed-capacity ring of the most recent output lines of one service.
    . Appending to a full buffer evicts the oldest line first.
    . Capacity is chosen at creation and never changes.
*/
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Result<Self, SupervisorError> {
        if capacity == 0 {
            return Err(SupervisorError::InvalidLogCapacity { capacity });
        }
        Ok(Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        })
    }

    pub fn append(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    /// Copy of the buffered lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
