//! Shared library modules for the lottery event listener.
//!
//! The binary in `main.rs` only wires these together; everything that
//! touches chain logs or the projection lives here so it can be tested
//! without a node or a Valkey instance.

pub mod config;
pub mod onchain;
pub mod reconciler;
pub mod store;
pub mod upkeep;

#[cfg(test)]
pub(crate) mod testing;
