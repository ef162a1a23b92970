//! Integration test entry point for stratus-node.
//!
//! Run with: cargo test --test integration

mod harness;
mod deploy;
mod driver;
mod mesh;
