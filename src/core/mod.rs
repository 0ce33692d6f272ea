//! Core primitives shared by the game and network layers.

pub mod hash;

// Re-export core types
pub use hash::{compute_state_hash, hash_with_domain, StateHash, StateHasher};
