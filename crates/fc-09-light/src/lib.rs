//! # Light Chain
//!
//! A canonical chain that stores headers only, ruled by the same
//! greatest-total-difficulty rule as the full chain. Bodies, receipts and
//! state come on demand from full peers; locally the light chain answers
//! header queries and tracks the head.

pub mod lightchain;

pub use lightchain::LightChain;
