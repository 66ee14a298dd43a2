//! # State Store
//!
//! Durable storage of the single [`PersistedState`] record. The record is
//! the only thing a resumed bootstrap attempt trusts after a restart.

mod store;
mod types;

pub use store::{FileStateStore, MemoryStateStore, StateStore};
pub use types::{PersistedState, Phase, StateUpdate};
