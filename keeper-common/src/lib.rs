// keeper-common - Shared types and configuration for the Keeper cache stack
//
// This crate defines how a backing store is addressed and how pools are sized

pub mod address;
pub mod config;
pub mod error;

// Re-export for convenience
pub use address::*;
pub use config::*;
pub use error::*;
