//! Key material, the DNSSEC state engine, and the policy reconciler.

pub mod engine;
pub mod factory;
pub mod reconciler;
