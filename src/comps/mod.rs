//! Comparable-property scoring core
//!
//! Filter, extract features, score, rank and explain. The [`engine`] module
//! wires the stages together behind a swappable context.

pub mod adjust;
pub mod embedding;
pub mod engine;
pub mod explain;
pub mod features;
pub mod filter;
pub mod rank;
pub mod scorer;
pub mod types;

pub use engine::{CompEngine, ContextSummary, EngineContext, Recommender};
pub use types::*;
