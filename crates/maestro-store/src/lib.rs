//! State persistence for Maestro.
//!
//! Provides the [`StateStore`] contract (key/value with per-key etags), an
//! in-memory and a file-backed implementation, the key layout, and the two
//! typed views built on top of it: the [`AgentRegistry`] and per-agent
//! [`AgentConversationState`].

/// Per-agent conversation history.
pub mod conversation;
/// File-backed store.
pub mod file;
/// Failure-injecting store wrapper.
#[cfg(any(test, feature = "testing"))]
pub mod flaky;
/// Key layout.
pub mod keys;
/// In-memory store.
pub mod memory;
/// Agent registry.
pub mod registry;
/// The store contract and typed helpers.
pub mod store;

pub use conversation::{AgentConversationState, ConversationStore};
pub use file::FileStateStore;
pub use memory::MemoryStateStore;
pub use registry::{AgentMetadata, AgentRegistry};
#[cfg(any(test, feature = "testing"))]
pub use flaky::FlakyStore;
pub use store::{get_json, put_json, update_json, StateStore, StoreEntry};
