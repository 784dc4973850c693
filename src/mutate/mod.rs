//! Mutation subsystem: byte-level strategies (§4.3), the structure-aware
//! mutator (§4.4), and the hybrid engine that dispatches between them (§4.5).

pub mod byte;
pub mod engine;
pub mod structure;

pub use byte::ByteMutator;
pub use engine::MutationEngine;
