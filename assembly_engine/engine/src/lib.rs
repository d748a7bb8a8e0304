//! Assembly Engine Core Library
//!
//! Anonymous harvesting of questions and answers among the members of an assembly:
//! identity proofs, fixed-length ballots, the commit/validate/reveal exchange and the
//! presence/consent state machine that decides when a harvest may start.

pub mod assembly;
pub mod audit;
pub mod ballot;
pub mod config;
pub mod crypto;
pub mod error;
pub mod harvest;
pub mod identity;
pub mod logging;
pub mod membership;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;
pub mod store;
pub mod types;

pub use error::{AssemblyError, Result};

#[cfg(test)]
mod tests;
