//! Publish/subscribe message bus for Maestro.
//!
//! # Main types
//!
//! - [`MessageBus`]: topic-addressed publish/subscribe contract.
//! - [`InMemoryBus`]: in-process implementation with per-subscriber queues.
//! - [`Envelope`]: a [`maestro_core::BusMessage`] plus delivery metadata.
//! - [`topics`]: topic naming helpers.

/// Bus contract and in-process implementation.
pub mod bus;
/// Topic naming.
pub mod topics;

pub use bus::{Envelope, InMemoryBus, MessageBus, Subscription};
