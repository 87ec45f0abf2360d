use std::collections::VecDeque;

/// Bounded FIFO of frames received before the schema is ready.
#[derive(Debug)]
pub(crate) struct Backlog {
    frames: VecDeque<Vec<u8>>,
    capacity: usize,
}

impl Backlog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Queues a frame. Hands it back when the backlog is full.
    pub(crate) fn push(&mut self, frame: Vec<u8>) -> Result<(), Vec<u8>> {
        if self.frames.len() >= self.capacity {
            return Err(frame);
        }
        self.frames.push_back(frame);
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    /// Takes every queued frame, oldest first.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.frames.drain(..)
    }
}
