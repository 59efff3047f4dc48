//! Buffer policies for repeaters.
//!
//! A buffer holds values a producer has pushed but no consumer has pulled yet.
//! The policy decides what happens once the buffer is at capacity:
//! - `FixedBuffer`: further adds are rejected, the producer waits
//! - `SlidingBuffer`: the oldest value is evicted
//! - `DroppingBuffer`: the new value is discarded

use std::collections::VecDeque;
use thiserror::Error;

/// Error from a buffer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    /// `add` on a full fixed buffer.
    #[error("buffer is full")]
    Full,

    /// `remove` on an empty buffer.
    #[error("buffer is empty")]
    Empty,
}

/// A bounded queue of pending values.
pub trait Buffer<T>: Send {
    /// Appends a value, applying the buffer's overflow policy.
    fn add(&mut self, value: T) -> Result<(), BufferError>;

    /// Removes the oldest value.
    fn remove(&mut self) -> Result<T, BufferError>;

    /// Returns the number of buffered values.
    fn len(&self) -> usize;

    /// Returns the configured capacity.
    fn capacity(&self) -> usize;

    /// Returns true if no value is buffered.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the buffer holds `capacity` values.
    fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }
}

/// A buffer that rejects values once full.
#[derive(Debug, Clone)]
pub struct FixedBuffer<T> {
    capacity: usize,
    values: VecDeque<T>,
}

impl<T> FixedBuffer<T> {
    /// Creates a fixed buffer with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
        }
    }
}

impl<T: Send> Buffer<T> for FixedBuffer<T> {
    fn add(&mut self, value: T) -> Result<(), BufferError> {
        if self.values.len() >= self.capacity {
            return Err(BufferError::Full);
        }
        self.values.push_back(value);
        Ok(())
    }

    fn remove(&mut self) -> Result<T, BufferError> {
        self.values.pop_front().ok_or(BufferError::Empty)
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A buffer that evicts the oldest value to make room for a new one.
///
/// A sliding buffer never reports itself as full, so a producer pushing into
/// it is never suspended.
#[derive(Debug, Clone)]
pub struct SlidingBuffer<T> {
    capacity: usize,
    values: VecDeque<T>,
}

impl<T> SlidingBuffer<T> {
    /// Creates a sliding buffer with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
        }
    }
}

impl<T: Send> Buffer<T> for SlidingBuffer<T> {
    fn add(&mut self, value: T) -> Result<(), BufferError> {
        if self.capacity == 0 {
            return Ok(());
        }
        while self.values.len() >= self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
        Ok(())
    }

    fn remove(&mut self) -> Result<T, BufferError> {
        self.values.pop_front().ok_or(BufferError::Empty)
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn is_full(&self) -> bool {
        false
    }
}

/// A buffer that discards new values while full.
///
/// Like [`SlidingBuffer`], it never reports itself as full.
#[derive(Debug, Clone)]
pub struct DroppingBuffer<T> {
    capacity: usize,
    values: VecDeque<T>,
}

impl<T> DroppingBuffer<T> {
    /// Creates a dropping buffer with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
        }
    }
}

impl<T: Send> Buffer<T> for DroppingBuffer<T> {
    fn add(&mut self, value: T) -> Result<(), BufferError> {
        if self.values.len() < self.capacity {
            self.values.push_back(value);
        }
        Ok(())
    }

    fn remove(&mut self) -> Result<T, BufferError> {
        self.values.pop_front().ok_or(BufferError::Empty)
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn is_full(&self) -> bool {
        false
    }
}

/// Buffer selection for a repeater.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "policy", content = "capacity", rename_all = "snake_case"))]
pub enum BufferPolicy {
    /// [`FixedBuffer`] with the given capacity. `Fixed(0)` hands values off
    /// directly to waiting consumers and queues everything else.
    Fixed(usize),
    /// [`SlidingBuffer`] with the given capacity.
    Sliding(usize),
    /// [`DroppingBuffer`] with the given capacity.
    Dropping(usize),
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self::Fixed(0)
    }
}

impl BufferPolicy {
    /// Builds an empty buffer for this policy.
    #[must_use]
    pub fn build<T: Send + 'static>(self) -> Box<dyn Buffer<T>> {
        match self {
            Self::Fixed(capacity) => Box::new(FixedBuffer::new(capacity)),
            Self::Sliding(capacity) => Box::new(SlidingBuffer::new(capacity)),
            Self::Dropping(capacity) => Box::new(DroppingBuffer::new(capacity)),
        }
    }

    /// Returns the configured capacity.
    #[must_use]
    pub fn capacity(self) -> usize {
        match self {
            Self::Fixed(capacity) | Self::Sliding(capacity) | Self::Dropping(capacity) => capacity,
        }
    }
}
