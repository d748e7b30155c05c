//! End-to-end tests for the updates core.
//!
//! Every test drives the public API against an in-process update server
//! (no network) and a host that records relaunches:
//!
//! - `update_flow`: check, download, relaunch and the state machine around them
//! - `code_signing`: signed, tampered and mis-keyed manifests
//! - `store_recovery`: restarts, launch failures, roll-backs and cleanup

#![allow(dead_code)]

mod harness;

mod code_signing;
mod store_recovery;
mod update_flow;

pub use harness::{HarnessOptions, Published, TestHarness, TestServer};
