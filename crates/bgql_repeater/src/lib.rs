//! Async iteration primitives for Better GraphQL.
//!
//! This crate provides the building blocks incremental delivery runs on:
//! - `buffer`: Fixed, sliding and dropping buffer policies
//! - `repeater`: Cancellable async iterator fed by a producer routine
//! - `flatten`: Flattening a stream of streams into one ordered stream
//!
//! Repeaters spawn their producer on the ambient tokio runtime the first
//! time they are pulled.

pub mod buffer;
pub mod flatten;
pub mod repeater;

pub use buffer::{Buffer, BufferError, BufferPolicy, DroppingBuffer, FixedBuffer, SlidingBuffer};
pub use flatten::{flatten, Nested};
pub use repeater::{
    Iteration, Pull, Push, Pushed, Repeater, RepeaterOverflowError, RepeaterState, Stop,
    MAX_QUEUE_LENGTH,
};
