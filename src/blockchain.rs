// Thin re-export module: implementation is in `blockchain/core.rs`, split into
// block entities, the fork-aware tree, chain state orchestration and
// stateless validation.

pub mod core;
pub use core::*;
