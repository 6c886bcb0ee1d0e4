//! Shared test utilities for genstore crates.
//!
//! - [`StoreDir`] - Temporary store root with generation file fixtures
//! - [`assert_eventually`] / [`wait_until`] - Poll a condition until it's true or timeout
//! - [`test_store_config`] - Store configuration with small, fast test values
//! - [`SyntheticGen`] - Deterministic description of a data generation
//! - [`IoFaultInjector`] - Short, interrupted and failed transfers on demand
//! - [`strategies`] - Proptest generators for handles and payloads

#![deny(unsafe_code)]
#![cfg_attr(test, allow(clippy::disallowed_methods))]

mod store_dir;
pub use store_dir::StoreDir;

mod assertions;
pub use assertions::{assert_eventually, wait_until};

mod config;
pub use config::{SyntheticGen, test_store_config};

mod io_fault;
pub use io_fault::{FaultPoint, IoFault, IoFaultInjector};

pub mod strategies;
