//! # Framelock Testing
//!
//! Test doubles and harness for exercising whole Framelock clusters in
//! one process: a deterministic [`bridge::InMemoryBridge`] standing in
//! for the engine, and thread-per-node drivers in [`harness`].

pub mod bridge;
pub mod harness;

pub use bridge::{EngineSnapshot, History, InMemoryBridge};
pub use harness::{drive, init_tracing, spawn_driver, test_udp_config, DriveReport};
