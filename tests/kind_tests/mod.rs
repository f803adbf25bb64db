//! Integration tests for InstaScale
//!
//! These tests run the reconciler against a real API server and tell the story
//! of how batch users get machines for their workloads.
//!
//! # Test Organization
//!
//! - `scale_out`: Stories about an AppWrapper growing a MachineSet and giving
//!   the capacity back once it finishes
//!
//! # Running These Tests
//!
//! ```bash
//! cargo test --test kind -- --ignored --nocapture
//! ```

mod helpers;
mod scale_out;
