use std::sync::{Mutex, PoisonError};

/// Append-only accumulator for a task's output.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    data: Mutex<Vec<u8>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, bytes: &[u8]) {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of everything after `offset`; empty if nothing new.
    pub fn read_from(&self, offset: usize) -> Vec<u8> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.get(offset..).map(<[u8]>::to_vec).unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.read_from(0)
    }
}
